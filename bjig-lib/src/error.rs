use std::array::TryFromSliceError;
use std::io;
use thiserror::Error;

/// The primary error type for the `bjig-lib` library.
#[derive(Error, Debug)]
pub enum BjigError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Serial link lost: {0}")]
    LinkLost(String),

    #[error("Connection attempt already in progress")]
    AlreadyConnecting,

    #[error("Not connected to a BraveJIG router")]
    NotConnected,

    #[error("Unknown command '{command}' for module '{module}'")]
    UnknownCommand { module: String, command: String },

    #[error("Command '{0}' requires a data payload")]
    MissingRequiredData(String),

    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("DFU block 0x{sequence:04X} rejected with result 0x{result:02X} ({unsent} blocks not sent)")]
    DfuBlockRejected { sequence: u16, result: u8, unsent: usize },

    #[error("Command 0x{cmd:02X} rejected with result 0x{result:02X}")]
    CommandRejected { cmd: u8, result: u8 },

    #[error("Timed out after {0:?} waiting for a reply")]
    TimedOut(std::time::Duration),

    #[error("Fell behind the packet stream; {0} packets were dropped unseen")]
    RepliesMissed(u64),

    #[error("Router refused the firmware update with result 0x{0:02X}")]
    DfuRefused(u8),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Module configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl BjigError {
    /// Failures of a single command that leave the link usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BjigError::TimedOut(_)
                | BjigError::RepliesMissed(_)
                | BjigError::DfuBlockRejected { .. }
                | BjigError::DfuRefused(_)
                | BjigError::CommandRejected { .. }
        )
    }
}

impl From<TryFromSliceError> for BjigError {
    fn from(_: TryFromSliceError) -> Self {
        BjigError::MalformedPacket("Failed to convert slice to array".to_string())
    }
}
