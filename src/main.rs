//! suota-updater: flash Dialog/Renesas SUOTA devices from the command line.
//!
//! ```bash
//! suota-updater inspect app.img
//! suota-updater config init
//! suota-updater scan                               # feature "btleplug"
//! suota-updater flash "DA14585" app.img            # feature "btleplug"
//! ```

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use suota_updater::suota::config::{DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
#[cfg(feature = "btleplug")]
use suota_updater::suota::{ImageBank, MemoryType};

#[derive(Parser, Debug)]
#[command(name = "suota-updater")]
#[command(author, version, about = "SUOTA firmware updater for Dialog/Renesas BLE devices")]
struct Args {
    /// Config file (defaults to ./suota_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show header, checksum and segmentation of a firmware image
    Inspect {
        /// Image file or .zip package
        path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List advertising Bluetooth LE devices
    #[cfg(feature = "btleplug")]
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value_t = 5)]
        secs: u64,
        #[arg(long)]
        json: bool,
    },

    /// Upload firmware to a device
    #[cfg(feature = "btleplug")]
    Flash {
        /// Advertised name or address of the device
        device: String,
        /// Image file or .zip package
        firmware: PathBuf,
        /// How long to look for the device, in seconds
        #[arg(long, default_value_t = 10)]
        scan_secs: u64,
        /// Overrides defaultMemoryType
        #[arg(long, value_enum)]
        memory: Option<MemoryArg>,
        /// Overrides defaultImageBank
        #[arg(long, value_enum)]
        bank: Option<BankArg>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective config
    Show,
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[cfg(feature = "btleplug")]
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum MemoryArg {
    Spi,
    I2c,
}

#[cfg(feature = "btleplug")]
impl From<MemoryArg> for MemoryType {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Spi => MemoryType::Spi,
            MemoryArg::I2c => MemoryType::I2c,
        }
    }
}

#[cfg(feature = "btleplug")]
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum BankArg {
    Oldest,
    #[value(name = "1")]
    Bank1,
    #[value(name = "2")]
    Bank2,
}

#[cfg(feature = "btleplug")]
impl From<BankArg> for ImageBank {
    fn from(arg: BankArg) -> Self {
        match arg {
            BankArg::Oldest => ImageBank::Oldest,
            BankArg::Bank1 => ImageBank::Bank1,
            BankArg::Bank2 => ImageBank::Bank2,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("suota_updater={log_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), String> {
    let config_manager = commands::config_manager(args.config.as_deref());

    match args.command {
        Command::Inspect {
            path,
            block_size,
            chunk_size,
            json,
        } => commands::inspect::run(&path, block_size, chunk_size, json),
        Command::Config { action } => match action {
            ConfigAction::Show => commands::config::show(&config_manager),
            ConfigAction::Init { force } => commands::config::init(&config_manager, force),
        },
        #[cfg(feature = "btleplug")]
        Command::Scan { secs, json } => {
            commands::device::scan(std::time::Duration::from_secs(secs), json).await
        }
        #[cfg(feature = "btleplug")]
        Command::Flash {
            device,
            firmware,
            scan_secs,
            memory,
            bank,
            json,
        } => {
            let config = config_manager
                .load()
                .map_err(|e| format!("Failed to load config: {}", e))?;
            let options = commands::flash::FlashOptions {
                device,
                firmware,
                scan_timeout: std::time::Duration::from_secs(scan_secs),
                memory_type: memory.map(MemoryType::from),
                image_bank: bank.map(ImageBank::from),
                json,
            };
            commands::flash::run(config, options).await
        }
    }
}
