//! clinic-vault: operator commands for keys, backups and the plaintext migration.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use clinic_vault::migration::create_snapshot;
use clinic_vault::{
    KeyManager, MigrationCoordinator, RecordStore, ScratchDir, SqliteRecordStore, VaultConfig,
};

/// Key management and encryption migration for clinic records
#[derive(Parser)]
#[command(name = "clinic-vault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "CLINIC_VAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encryption counts for the clinic database
    Status,

    /// Key store overview (no key material)
    KeyInfo,

    /// Retire the current key and create a new one
    Rotate,

    /// Write a password-protected backup of all keys
    BackupKeys {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        /// At least 12 characters
        #[arg(long, env = "CLINIC_VAULT_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Replace the key set with a backup
    RestoreKeys {
        #[arg(long, value_name = "FILE")]
        from: PathBuf,

        #[arg(long, env = "CLINIC_VAULT_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Snapshot the database and data directory
    Snapshot {
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },

    /// Snapshot, then encrypt all records and files
    Migrate {
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Snapshot, then encrypt up to LIMIT unencrypted files
    EncryptPending {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Encrypt the files of one appointment
    EncryptAppointment {
        #[arg(long)]
        id: i64,
    },

    /// Decrypt the files of one appointment into the scratch directory
    DecryptAppointment {
        #[arg(long)]
        id: i64,

        /// Write next to each .enc file instead
        #[arg(long)]
        in_place: bool,
    },

    /// Remove stale decrypted files from the scratch directory
    Sweep,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VaultConfig::default(),
    };

    match cli.command {
        Commands::Status => {
            let coordinator = coordinator(&config)?;
            print(&coordinator.check_status()?)
        }
        Commands::KeyInfo => print(&open_keys(&config)?.key_info()),
        Commands::Rotate => {
            let key_id = open_keys(&config)?.force_key_rotation()?;
            print(&json!({ "current_key_id": key_id }))
        }
        Commands::BackupKeys { out, password } => {
            open_keys(&config)?
                .backup_keys(&out, &password)
                .with_context(|| format!("writing key backup {}", out.display()))?;
            print(&json!({ "backup": out }))
        }
        Commands::RestoreKeys { from, password } => {
            let keys = open_keys(&config)?;
            keys.restore_keys(&from, &password)
                .with_context(|| format!("restoring keys from {}", from.display()))?;
            print(&keys.key_info())
        }
        Commands::Snapshot { out } => {
            let store = open_store(&config.migration.database_path)?;
            let info = create_snapshot(
                &store,
                &config.migration.data_dir,
                &out,
                &[config.migration.snapshot_root.as_path()],
                Utc::now(),
            )
            .with_context(|| format!("creating snapshot {}", out.display()))?;
            print(&info)
        }
        Commands::Migrate { batch_size } => {
            if let Some(batch_size) = batch_size {
                config.migration.batch_size = batch_size;
            }
            let report = coordinator(&config)?.run_full()?;
            let success = report.success;
            print(&report)?;
            if !success {
                anyhow::bail!("{}", report.message);
            }
            Ok(())
        }
        Commands::EncryptPending { limit } => {
            let coordinator = coordinator(&config)?;
            let snapshot = coordinator.create_backup().context("creating snapshot")?;
            let report = coordinator.encrypt_pending_files(limit)?;
            print(&json!({ "snapshot": snapshot, "files": report }))
        }
        Commands::EncryptAppointment { id } => {
            print(&coordinator(&config)?.encrypt_appointment_files(id)?)
        }
        Commands::DecryptAppointment { id, in_place } => {
            let scratch = if in_place {
                None
            } else {
                Some(ScratchDir::new(&config.scratch)?)
            };
            let report = coordinator(&config)?.decrypt_appointment_files(id, scratch.as_ref())?;
            print(&report)
        }
        Commands::Sweep => print(&ScratchDir::new(&config.scratch)?.sweep()),
    }
}

fn open_keys(config: &VaultConfig) -> Result<KeyManager> {
    KeyManager::open(config.keys.clone())
        .with_context(|| format!("opening key store {}", config.keys.store_path.display()))
}

fn open_store(path: &Path) -> Result<SqliteRecordStore> {
    SqliteRecordStore::open(path).with_context(|| format!("opening database {}", path.display()))
}

fn coordinator(config: &VaultConfig) -> Result<MigrationCoordinator> {
    let keys = Arc::new(open_keys(config)?);
    let store: Arc<dyn RecordStore> = Arc::new(open_store(&config.migration.database_path)?);
    Ok(MigrationCoordinator::new(keys, store, config.migration.clone()))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
