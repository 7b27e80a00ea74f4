use std::time::Duration;

use jsonstore::{BackupCadence, Database, Formatting, StoreOptions};
use tempfile::TempDir;

/// Opens a store with the `debug` cadence, writes a few keys and lets the
/// scheduler take snapshots for a while.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let tmp_dir = TempDir::new()?;
    let location = tmp_dir.path().join("settings.json");
    let options = StoreOptions::default()
        .with_formatting(Formatting::Expanded)
        .with_backups(BackupCadence::Debug);

    let mut db = Database::open(&location, options)?;
    db.write("app.theme", "dark")?;
    db.write("app.window.width", 1280)?;
    db.write("app.window.height", 800)?;

    let scheduler = db.spawn_backups()?.expect("cadence configured");
    println!("Snapshot cadence: {} ({:?})", scheduler.cadence(), scheduler.cadence().interval());

    for i in 0..3 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        db.write("app.counter", i)?;
        println!("Snapshots so far: {}", scheduler.snapshots_taken());
    }

    scheduler.shutdown().await?;

    println!("\nStore file {}:", location.display());
    println!("{}", std::fs::read_to_string(&location)?);
    println!("\nSnapshots in {}:", db.backup_directory().display());
    for path in db.list_backups()? {
        println!("  {}", path.display());
    }

    db.close()?;
    Ok(())
}
