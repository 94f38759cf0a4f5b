pub mod constants;
pub mod device_id;
pub mod dfu;
pub mod error;
pub mod framer;
pub mod link;
pub mod message;
pub mod module;
pub mod packet;
pub mod router;
pub mod transport;


pub use device_id::DeviceId;
pub use error::BjigError;
pub use link::{ConnectionState, LinkManager, LinkObserver};
pub use message::Packet;
pub use module::{CommandOutcome, CommandOverrides, Dispatcher, ModuleRegistry};
