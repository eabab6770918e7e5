//! drift-send - Background daemon for paced media publication
//!
//! Watches a library directory for media files and drip-feeds them to a
//! social platform with human-like pacing, durable crash-safe state and
//! an append-only outcome history.

use clap::Parser;
use libdriftpost::logging::{LogFormat, LoggingConfig};
use libdriftpost::uploader::{ExecUploader, MockUploader, Uploader};
use libdriftpost::vault::{CredentialVault, Credentials, VaultKey};
use libdriftpost::{Command, Config, DriftError, Result, UploadWorker};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "drift-send")]
#[command(version)]
#[command(about = "Background daemon for paced media publication")]
#[command(long_about = "\
drift-send - Background daemon for paced media publication

DESCRIPTION:
    drift-send is a long-running daemon that watches a media library
    directory and publishes its files one at a time, spaced by a random
    cooldown, to a social platform through a pluggable upload adapter.

    State survives crashes: the queue, schedule table and pacing record
    are committed atomically, and every outcome lands in an append-only
    history file that doubles as the deduplication index.

USAGE:
    # Run in foreground (logs to stderr)
    drift-send

    # Run with a custom poll interval
    drift-send --poll-interval 30s

    # Dry run against the built-in mock adapter
    drift-send --dry-run --once

    # Store platform credentials (username then password on stdin)
    printf 'alice\\nhunter22-but-better\\n' | drift-send --init-credentials

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current upload)

CONFIGURATION:
    Configuration file: ~/.config/driftpost/config.toml
    (override with DRIFTPOST_CONFIG or --config)

    Credentials are age-encrypted with the passphrase in
    DRIFTPOST_VAULT_KEY. Logging honors DRIFTPOST_LOG_FORMAT
    (text|json|pretty) and DRIFTPOST_LOG_LEVEL.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Authentication rejected
    3 - Invalid input
")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// How often to rescan the library and poll for due work
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process at most one upload and exit (for testing)
    #[arg(long)]
    once: bool,

    /// Use the built-in mock adapter instead of the configured command
    #[arg(long)]
    dry_run: bool,

    /// Read username and password from stdin and store them encrypted
    #[arg(long)]
    init_credentials: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(interval) = cli.poll_interval {
        config.worker.poll_interval_secs = interval.as_secs().max(1);
    }

    if cli.init_credentials {
        return init_credentials(&config);
    }

    let (uploader, credentials, session_key) = build_adapter(&config, cli.dry_run)?;

    info!(
        adapter = uploader.name(),
        poll_interval_secs = config.worker.poll_interval_secs,
        "drift-send starting"
    );

    let worker = UploadWorker::new(config, uploader, credentials, session_key)?;
    setup_signal_handlers(&worker)?;

    if cli.once {
        run_once(worker).await
    } else {
        worker.run().await
    }
}

/// Pick the upload adapter, its credentials and the session-file key.
fn build_adapter(
    config: &Config,
    dry_run: bool,
) -> Result<(Box<dyn Uploader>, Credentials, Option<VaultKey>)> {
    if dry_run {
        // No vault needed; nothing leaves the machine and the session is
        // not persisted
        return Ok((
            Box::new(MockUploader::success()),
            Credentials::new("dry-run".to_string(), "dry-run-password".to_string()),
            None,
        ));
    }

    let vault = CredentialVault::from_env(config.credentials_file())?;
    let credentials = vault.load()?;
    let session_key = Some(vault.key().clone());

    match ExecUploader::from_config(&config.uploader) {
        Some(exec) => Ok((Box::new(exec), credentials, session_key)),
        None => {
            warn!("no uploader.command configured; falling back to the mock adapter");
            Ok((Box::new(MockUploader::success()), credentials, session_key))
        }
    }
}

/// Store credentials read from stdin (first line username, second password).
fn init_credentials(config: &Config) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    let username = lines
        .next()
        .transpose()?
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| DriftError::InvalidInput("expected username on stdin".to_string()))?;
    let password = lines
        .next()
        .transpose()?
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| DriftError::InvalidInput("expected password on stdin".to_string()))?;

    let vault = CredentialVault::from_env(config.credentials_file())?;
    vault.store(&Credentials::new(username, password))?;

    info!(path = %config.credentials_file().display(), "credentials stored");
    Ok(())
}

/// Forward SIGINT/SIGTERM to the worker as a shutdown command.
fn setup_signal_handlers(worker: &UploadWorker) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| DriftError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    let inbox = worker.inbox();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    inbox.push(Command::Shutdown);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Single-shot mode: recover, scan, attempt at most one upload.
async fn run_once(mut worker: UploadWorker) -> Result<()> {
    use libdriftpost::worker::StepOutcome;

    let now = chrono::Utc::now().timestamp();
    worker.startup(now)?;

    match worker.step(now).await? {
        StepOutcome::Dispatched => info!("processed one upload, exiting"),
        StepOutcome::Idle { wake_at: Some(at) } => {
            info!(next_due_at = at, "nothing due yet, exiting")
        }
        StepOutcome::Idle { wake_at: None } => info!("library is empty, exiting"),
        StepOutcome::Shutdown => {}
    }
    Ok(())
}

/// Initialize logging based on verbosity level, honoring the
/// DRIFTPOST_LOG_FORMAT and DRIFTPOST_LOG_LEVEL environment variables.
fn init_logging(verbose: bool) {
    let format = std::env::var("DRIFTPOST_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("DRIFTPOST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    LoggingConfig::new(format, level, verbose).init();
}
