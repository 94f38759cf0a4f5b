use anyhow::{Context, Result, bail};
use bjig_lib::constants::DEFAULT_BAUD_RATE;
use bjig_lib::dfu::RouterFirmware;
use bjig_lib::module::ModuleRegistry;
use bjig_lib::router::{self, RouterReply};
use bjig_lib::transport::SerialSettings;
use bjig_lib::{CommandOverrides, Dispatcher, LinkManager};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde_json::json;
use std::fs::File;
use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ROUTER_TIMEOUT: Duration = Duration::from_secs(10);
/// Exit status after Ctrl-C, as a shell reports SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Host tool for BraveJIG routers and the sensor modules paired with them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port the router is attached to
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,
    /// Baud rate (8N1)
    #[arg(short, long, default_value_t = 38400)]
    baud: u32,
    /// Optional path to a file to write logs to, in addition to the console
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command of the built-in router table (e.g. get_version)
    Router {
        #[command(subcommand)]
        action: RouterAction,
    },
    /// Run a named module command against one device
    Module {
        /// Module name, e.g. illuminance
        name: String,
        /// Command name, e.g. instant_uplink
        command: String,
        /// Device id: 16 hex digits, 0x-prefixed hex or decimal
        #[arg(short, long)]
        device: String,
        /// Payload as hex, replacing the table's default
        #[arg(long, conflicts_with = "settings")]
        data: Option<String>,
        /// JSON object of settings to change, e.g. '{"uplink_interval_s":300}'.
        /// The current settings are read first and only the named fields change.
        #[arg(long)]
        settings: Option<String>,
        /// Firmware image for sensor_dfu
        #[arg(long)]
        firmware: Option<PathBuf>,
        /// Reply timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,
    },
    /// List the registered modules and their commands
    Modules,
    /// Print every packet the router sends
    Monitor {
        /// Stop after this many seconds; runs until Ctrl-C otherwise
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum RouterAction {
    /// Read the device id registered at an index
    GetDeviceId {
        #[arg(short, long, default_value_t = 0)]
        index: u8,
    },
    /// Remove the device id registered at an index
    RemoveDeviceId {
        #[arg(short, long)]
        index: u8,
    },
    /// Update the router firmware (requires 38400 baud)
    Dfu {
        /// Firmware image
        #[arg(short, long)]
        firmware: PathBuf,
        /// Seconds to wait for the router to accept the update
        #[arg(short, long, default_value_t = 10.0)]
        timeout: f64,
    },
    /// Any command of the router table, by name
    #[command(external_subcommand)]
    Named(Vec<String>),
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // Results go to stdout as JSON, so logs stay on stderr
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {path:?}"))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let registry = Arc::new(ModuleRegistry::with_builtin_modules()?);
    if let Command::Modules = cli.command {
        print_modules(&registry);
        return Ok(());
    }

    let settings = SerialSettings::new(&cli.port).with_baud_rate(cli.baud);
    let link = Arc::new(LinkManager::serial(settings));
    link.open()
        .with_context(|| format!("Failed to open {} at {} baud", cli.port, cli.baud))?;
    let dispatcher = Dispatcher::new(Arc::clone(&link), registry);

    let result = match cli.command {
        // The monitor treats Ctrl-C as its normal stop
        command @ Command::Monitor { .. } => Some(run(&dispatcher, command, cli.baud).await),
        command => until_interrupted(run(&dispatcher, command, cli.baud), ctrl_c()).await,
    };
    link.close();
    match result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => {
            error!("{e:#}");
            process::exit(1);
        }
        None => {
            warn!("Interrupted; link closed");
            process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// Drive `work` unless `interrupt` completes first, in which case `work` is
/// dropped mid-flight and `None` is returned.
async fn until_interrupted<T>(work: impl Future<Output = T>, interrupt: impl Future<Output = ()>) -> Option<T> {
    tokio::select! {
        output = work => Some(output),
        () = interrupt => None,
    }
}

/// Completes on Ctrl-C; never, if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {e}");
        std::future::pending::<()>().await;
    }
}

async fn run(dispatcher: &Dispatcher, command: Command, baud: u32) -> Result<()> {
    match command {
        Command::Router { action } => run_router(dispatcher, action, baud).await,
        Command::Module {
            name,
            command,
            device,
            data,
            settings,
            firmware,
            timeout,
        } => {
            let mut overrides = CommandOverrides::default();
            if let Some(data) = data {
                let compact: String = data.split_whitespace().collect();
                overrides.payload = Some(hex::decode(compact).context("--data is not valid hex")?.into());
            }
            if let Some(settings) = settings {
                overrides.settings = Some(serde_json::from_str(&settings).context("--settings is not valid JSON")?);
            }
            if let Some(path) = firmware {
                let image = std::fs::read(&path).with_context(|| format!("Failed to read firmware {path:?}"))?;
                overrides.firmware = Some(image.into());
            }
            if let Some(seconds) = timeout {
                overrides.timeout =
                    Some(Duration::try_from_secs_f64(seconds).context("--timeout must be a positive number")?);
            }
            let outcome = dispatcher.execute_command(&name, &command, &device, overrides).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Monitor { duration } => monitor(dispatcher, duration.map(Duration::from_secs)).await,
        Command::Modules => {
            print_modules(dispatcher.registry());
            Ok(())
        }
    }
}

async fn run_router(dispatcher: &Dispatcher, action: RouterAction, baud: u32) -> Result<()> {
    let cmd = match action {
        RouterAction::GetDeviceId { index } => router::get_device_id_cmd(index)?,
        RouterAction::RemoveDeviceId { index } => router::remove_device_id_cmd(index)?,
        RouterAction::Dfu { firmware, timeout } => {
            if baud != DEFAULT_BAUD_RATE {
                bail!("router DFU runs at {DEFAULT_BAUD_RATE} baud; pass --baud {DEFAULT_BAUD_RATE}");
            }
            let image = std::fs::read(&firmware).with_context(|| format!("Failed to read firmware {firmware:?}"))?;
            let image = RouterFirmware::new(image)?;
            let timeout = Duration::try_from_secs_f64(timeout).context("--timeout must be a positive number")?;
            let outcome = dispatcher.execute_router_dfu(&image, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            return Ok(());
        }
        RouterAction::Named(args) => {
            let [name] = args.as_slice() else {
                bail!("expected exactly one router command name, got {args:?}");
            };
            let outcome = dispatcher
                .execute_command("router", &name.replace('-', "_"), "", CommandOverrides::default())
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            return Ok(());
        }
    };

    let response = dispatcher.execute_jig_info(cmd, DEFAULT_ROUTER_TIMEOUT).await?;
    let reply = RouterReply::parse(&response).ok();
    let output = json!({
        "command": response.command_name(),
        "response": response,
        "reply": reply,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn monitor(dispatcher: &Dispatcher, duration: Option<Duration>) -> Result<()> {
    let mut packets = dispatcher.link().subscribe();
    let mut state = dispatcher.link().watch_state();
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    info!("Monitoring; press Ctrl-C to stop");

    loop {
        tokio::select! {
            received = packets.recv() => match received {
                Ok(packet) => println!("{}", serde_json::to_string(&packet)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    error!("Monitor fell behind; {skipped} packets skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() || !dispatcher.link().is_connected() {
                    bail!("router link lost");
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let stats = dispatcher.link().stats();
    info!(
        "{} packets, {} bytes received, {} decode errors",
        stats.packets_received, stats.bytes_received, stats.decode_errors
    );
    Ok(())
}

fn print_modules(registry: &ModuleRegistry) {
    for name in registry.module_names() {
        let module = registry.resolve(&name);
        let config = module.config();
        match &config.description {
            Some(description) => println!("{name} (sensor 0x{:04X}): {description}", config.sensor_id),
            None => println!("{name} (sensor 0x{:04X})", config.sensor_id),
        }
        for command in config.command_names() {
            let Some(spec) = config.command(command) else {
                continue;
            };
            println!(
                "  {command:<28} cmd 0x{:02X}  {}",
                spec.cmd,
                spec.description.as_deref().unwrap_or("")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bjig_lib::link::ConnectionState;
    use bjig_lib::transport::memory_link;

    #[tokio::test]
    async fn interrupt_abandons_a_pending_command() {
        let (connector, _router) = memory_link();
        let link = Arc::new(LinkManager::new(connector));
        link.open().unwrap();
        let registry = Arc::new(ModuleRegistry::with_builtin_modules().unwrap());
        let dispatcher = Dispatcher::new(Arc::clone(&link), registry);

        // Nobody answers, so only the interrupt can end this
        let work = dispatcher.execute_command(
            "illuminance",
            "instant_uplink",
            "2468800203400004",
            CommandOverrides::default(),
        );
        let started = std::time::Instant::now();
        let result = until_interrupted(work, tokio::time::sleep(Duration::from_millis(50))).await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(link.state(), ConnectionState::Connected);
        link.close();
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn finished_work_wins_over_a_later_interrupt() {
        let result = until_interrupted(async { 7 }, std::future::pending::<()>()).await;
        assert_eq!(result, Some(7));
    }

    #[test]
    fn router_dfu_arguments_parse() {
        let cli = Cli::try_parse_from(["bjig", "router", "dfu", "--firmware", "router.bin"]).unwrap();
        let Command::Router {
            action: RouterAction::Dfu { firmware, timeout },
        } = cli.command
        else {
            panic!("expected router dfu");
        };
        assert_eq!(firmware, PathBuf::from("router.bin"));
        assert_eq!(timeout, 10.0);
    }

    #[test]
    fn data_and_settings_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "bjig",
            "module",
            "illuminance",
            "set_parameter",
            "--device",
            "2468800203400004",
            "--data",
            "00",
            "--settings",
            "{}",
        ]);
        assert!(parsed.is_err());
    }
}
