use std::{
    error::Error,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use selfinstall::{
    AdbSession, IdentityStore, PairingRequest, Settings,
    adb::{
        cli::{AdbCliConnector, adb_key_path},
        discovery::PairingPortWatcher,
    },
    identity::{JsonFileStore, KEYS_NAMESPACE},
    logging::setup_logging,
    settings::SettingsHandler,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const APP_DIR_NAME: &str = "selfinstall";
/// Home directory handed to `adb`, holding the exported key
const ADB_HOME_DIR: &str = "adb";

/// Installs packages onto this device through its own wireless debugging
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Console verbosity, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Directory holding settings, keys and logs
    #[arg(long, env = "SELFINSTALL_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the connection status
    Status {
        /// Probe even if a recent status is known
        #[arg(long)]
        force: bool,
    },
    /// Pair using the code from "Pair device with pairing code"
    Pair {
        code: String,
        /// Pairing port shown in the dialog, discovered over mDNS when omitted
        #[arg(long)]
        port: Option<i64>,
        /// How long to wait for the pairing service to show up
        #[arg(long, default_value_t = 30_000)]
        wait_ms: u64,
    },
    /// Check that the daemon accepts this device's key
    Test,
    /// Install a package file
    Install { path: PathBuf },
    /// Print the signing identity
    Identity,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let app_dir = match app_dir(cli.data_dir.clone()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match setup_logging(&app_dir, cli.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to setup logging: {e:#}");
            None
        }
    };

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(panic = %format!("{panic_info}\n{backtrace}"), "Rust panic");
        original_hook(panic_info);
    }));

    info!(version = env!("CARGO_PKG_VERSION"), app_dir = %app_dir.display(), "Starting selfinstall");

    match run(cli.command, &app_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = e.as_ref() as &dyn Error, "Command failed");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn app_dir(configured: Option<PathBuf>) -> Result<PathBuf> {
    let app_dir = match configured {
        Some(dir) => dir,
        None => dirs::data_dir().context("Failed to get data directory")?.join(APP_DIR_NAME),
    };
    fs_err::create_dir_all(&app_dir).context("Failed to create app directory")?;
    Ok(app_dir)
}

async fn run(command: Command, app_dir: &Path) -> Result<()> {
    let settings = SettingsHandler::new(app_dir).load_or_default();
    let identity = IdentityStore::new(
        Arc::new(JsonFileStore::new(app_dir, KEYS_NAMESPACE)),
        settings.device_label.clone(),
    );

    match command {
        Command::Status { force } => {
            let status = open_session(&settings, identity, app_dir).connection_status(force).await;
            println!("{status}");
        }
        Command::Pair { code, port, wait_ms } => {
            PairingRequest::validate_code(&code)?;
            let port = match port {
                Some(port) => port,
                None => {
                    let watcher = PairingPortWatcher::start()?;
                    eprintln!("Waiting for the pairing service, open \"Pair device with pairing code\"");
                    i64::from(watcher.wait_for_port(Duration::from_millis(wait_ms)).await?)
                }
            };
            open_session(&settings, identity, app_dir).pair(&code, port).await?;
            println!("Paired successfully");
        }
        Command::Test => {
            open_session(&settings, identity, app_dir).test_connection().await?;
            println!("Connection authorized");
        }
        Command::Install { path } => {
            let message = open_session(&settings, identity, app_dir).install(&path).await?;
            println!("{message}");
        }
        Command::Identity => print_identity(&identity, app_dir).await?,
    }
    Ok(())
}

fn open_session(settings: &Settings, identity: Arc<IdentityStore>, app_dir: &Path) -> Arc<AdbSession> {
    let connector = AdbCliConnector::new(
        Some(settings.adb_path.clone()),
        app_dir.join(ADB_HOME_DIR),
        settings.adb_server_port,
    );
    AdbSession::new(identity, Arc::new(connector), settings.timeouts)
}

async fn print_identity(store: &IdentityStore, app_dir: &Path) -> Result<()> {
    let identity = store.identity().await?;
    println!("Subject:     {}", identity.subject());
    println!("Serial:      {}", identity.serial_number());
    println!("Not before:  {}", format_time(identity.not_before())?);
    println!("Not after:   {}", format_time(identity.not_after())?);
    if let Some(ski) = identity.subject_key_identifier() {
        println!("Key id:      {ski}");
    }
    println!("ADB key:     {}", adb_key_path(&app_dir.join(ADB_HOME_DIR)).display());
    Ok(())
}

fn format_time(time: SystemTime) -> Result<String> {
    OffsetDateTime::from(time).format(&Rfc3339).context("Failed to format time")
}
