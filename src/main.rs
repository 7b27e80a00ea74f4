use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jsonstore::{BackupCadence, Database, Formatting, StoreOptions};
use serde_json::Value;
use tracing::info;

#[derive(Parser)]
#[command(name = "jsonstore")]
#[command(about = "Read and write a JSON file as a dotted-path key-value store.")]
#[command(version)]
struct Cli {
    /// Store file
    file: PathBuf,

    /// Options file (JSON); flags below override its values
    #[arg(long)]
    options: Option<PathBuf>,

    /// compact or expanded
    #[arg(short, long)]
    formatting: Option<String>,

    /// Snapshot cadence: debug, every-half-minute, every-minute, hourly, daily, weekly, monthly
    #[arg(short, long)]
    backups: Option<String>,

    /// Where snapshots are written (default: ./backups next to the store file)
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Refuse to write 0, false, "" or null
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value at a dotted path
    Get { path: String },
    /// Print whether a dotted path holds a truthy value
    Exists { path: String },
    /// Set a dotted path; the value is parsed as JSON, or taken as a string
    Set { path: String, value: String },
    /// Remove top-level keys
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Empty the store
    Clear,
    /// Print the whole store
    Dump,
    /// Take a snapshot now
    Backup,
    /// List snapshot files for this store
    Backups,
    /// Run scheduled snapshots until Ctrl-C
    Watch,
}

impl Cli {
    fn store_options(&self) -> anyhow::Result<StoreOptions> {
        let mut options = match &self.options {
            Some(path) => StoreOptions::load(path)?,
            None => StoreOptions::default(),
        };
        if let Some(formatting) = &self.formatting {
            options.formatting = formatting.parse::<Formatting>()?;
        }
        if let Some(backups) = &self.backups {
            options.backups = Some(backups.parse::<BackupCadence>()?);
        }
        if let Some(dir) = &self.backup_dir {
            options.backup_directory = Some(dir.clone());
        }
        if self.strict {
            options.reject_falsy_values = true;
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let options = cli.store_options()?;
    let mut db = Database::open(&cli.file, options)
        .with_context(|| format!("opening {}", cli.file.display()))?;

    match &cli.command {
        Commands::Get { path } => {
            let value = db.read(path)?.unwrap_or(Value::Null);
            println!("{}", db.options().formatting.render(&value)?);
        }
        Commands::Exists { path } => {
            println!("{}", db.exists(path));
        }
        Commands::Set { path, value } => {
            let value = serde_json::from_str::<Value>(value)
                .unwrap_or_else(|_| Value::String(value.clone()));
            db.write(path, value)
                .with_context(|| format!("writing {}", path))?;
        }
        Commands::Delete { keys } => {
            db.delete(keys.clone())?;
        }
        Commands::Clear => {
            db.clear()?;
        }
        Commands::Dump => {
            println!("{}", db.options().formatting.render(&db.value()?)?);
        }
        Commands::Backup => {
            let path = db.snapshot_now()?;
            println!("{}", path.display());
        }
        Commands::Backups => {
            for path in db.list_backups()? {
                println!("{}", path.display());
            }
        }
        Commands::Watch => {
            watch(&db).await?;
        }
    }

    db.close()?;
    Ok(())
}

async fn watch(db: &Database) -> anyhow::Result<()> {
    let scheduler = db
        .spawn_backups()?
        .context("no backup cadence configured; pass --backups")?;
    info!(
        store = db.name(),
        cadence = %scheduler.cadence(),
        dir = %db.backup_directory().display(),
        "watching; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;

    let taken = scheduler.snapshots_taken();
    let failed = scheduler.failures();
    scheduler.shutdown().await?;
    println!("{} snapshot(s) taken, {} failed", taken, failed);
    Ok(())
}
