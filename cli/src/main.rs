mod events;
mod proxies;
mod status;

use crate::events::event_handler;
use crate::status::{attributes_handler, config_handler, devices_handler, version_handler};
use clap::{Parser, Subcommand, arg, command};
use log::{debug, error};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "slotctl")]
#[command(bin_name = "slotctl")]
struct Cli {
    #[arg(
        long = "device",
        help = r#"slotd device to be used for operations, by configured name or
chip_id:endpoint:function. Defaults to the first device attached by the daemon."#
    )]
    device: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached devices, their slot usage and reserved slots
    Devices,
    /// Show the configuration the daemon is running with
    Config,
    /// Show the driver version
    Version,
    /// Read device attributes
    Attributes {
        /// A single attribute, e.g. `temperature`. All attributes when omitted.
        name: Option<String>,
    },
    #[command(flatten)]
    Event(EventSubcommand),
}

#[derive(Subcommand, Debug)]
enum EventSubcommand {
    /// Signal a slot's completion event by hand
    Complete { slot: u32 },
    /// Re-arm a slot's completion event
    Reset { slot: u32 },
    /// Wait for a slot's completion event
    Wait {
        slot: u32,
        /// Give up after this many milliseconds, 0 waits forever
        #[arg(long, default_value_t = 0)]
        timeout_ms: u32,
        /// Return immediately instead of waiting
        #[arg(long)]
        poll: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");
    let result = match &cli.command {
        Commands::Devices => devices_handler().await,
        Commands::Config => config_handler().await,
        Commands::Version => version_handler().await,
        Commands::Attributes { name } => attributes_handler(&cli.device, name).await,
        Commands::Event(sub_command) => event_handler(&cli.device, sub_command).await,
    };
    match result {
        Ok(msg) => {
            println!("{msg}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
