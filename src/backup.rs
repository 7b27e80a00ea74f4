//! Timed snapshots of a store.
//!
//! A snapshot stamps the tree's `LAST_BACKUP` key with the current unix time
//! in milliseconds, persists the store, and writes a full copy of the tree to
//! `{store}_BACKUP_{millis}.json` in the backup directory.
//!
//! [`BackupScheduler`] repeats that on a fixed cadence from a tokio task. On
//! start it looks at `LAST_BACKUP`: if a full interval has already passed (or
//! no snapshot was ever taken) it snapshots right away, otherwise it waits out
//! the remainder of the interval first.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::BackupCadence;
use crate::error::StoreError;
use crate::storage::{StoreCore, LAST_BACKUP_KEY};

const BACKUP_MARKER: &str = "_BACKUP_";

/// `{stem}_BACKUP_{millis}.json`, where `stem` is the store file name
/// without its extension.
pub fn backup_file_name(store_name: &str, timestamp_ms: i64) -> String {
    format!("{}{}{}.json", store_stem(store_name), BACKUP_MARKER, timestamp_ms)
}

fn store_stem(store_name: &str) -> &str {
    Path::new(store_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(store_name)
}

/// Snapshot files for `store_name` in `dir`, oldest first.
pub fn list_backups(dir: &Path, store_name: &str) -> crate::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}{}", store_stem(store_name), BACKUP_MARKER);
    let pattern = format!(
        "{}{}{}*.json",
        glob::Pattern::escape(&dir.to_string_lossy()),
        std::path::MAIN_SEPARATOR,
        glob::Pattern::escape(&prefix)
    );

    let entries = glob::glob(&pattern).map_err(|e| StoreError::Backup(e.to_string()))?;
    let mut backups: Vec<(i64, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let stamp = path
                .file_name()?
                .to_str()?
                .strip_prefix(prefix.as_str())?
                .strip_suffix(".json")?
                .parse::<i64>()
                .ok()?;
            Some((stamp, path))
        })
        .collect();
    backups.sort_by_key(|(stamp, _)| *stamp);
    Ok(backups.into_iter().map(|(_, path)| path).collect())
}

/// `LAST_BACKUP` may be stored as an integer or as a numeric string.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// How long to wait before the first snapshot. Zero means "now".
pub fn initial_delay(last_backup_ms: Option<i64>, now_ms: i64, interval: Duration) -> Duration {
    let Some(last) = last_backup_ms else {
        return Duration::ZERO;
    };
    let interval_ms = interval.as_millis() as i64;
    let elapsed = now_ms.saturating_sub(last);
    if elapsed >= interval_ms {
        Duration::ZERO
    } else if elapsed < 0 {
        // last snapshot is in the future (clock moved back): wait a full interval
        interval
    } else {
        Duration::from_millis((interval_ms - elapsed) as u64)
    }
}

pub fn is_due(last_backup_ms: Option<i64>, now_ms: i64, interval: Duration) -> bool {
    initial_delay(last_backup_ms, now_ms, interval).is_zero()
}

/// Record the snapshot time in the tree, persist the store, and write the
/// copy. Runs under the store's write lock; on failure `LAST_BACKUP` keeps
/// its previous value.
pub(crate) fn take_snapshot(core: &StoreCore) -> crate::Result<PathBuf> {
    let dir = core.backup_dir().to_path_buf();
    fs::create_dir_all(&dir).map_err(|e| {
        StoreError::Backup(format!(
            "Cannot create backup directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    if !dir.is_dir() {
        return Err(StoreError::Backup(format!(
            "Backup directory {} is not a directory",
            dir.display()
        )));
    }

    let target = core.with_write(|tree| {
        let previous = tree.get(LAST_BACKUP_KEY).cloned();
        // keep stamps strictly increasing so file names never collide
        let mut now = Utc::now().timestamp_millis();
        if let Some(last) = previous.as_ref().and_then(parse_timestamp) {
            now = now.max(last + 1);
        }
        tree.insert(LAST_BACKUP_KEY.to_string(), Value::from(now));

        let restore = |tree: &mut crate::path::Tree| match &previous {
            Some(value) => {
                tree.insert(LAST_BACKUP_KEY.to_string(), value.clone());
            }
            None => {
                tree.shift_remove(LAST_BACKUP_KEY);
            }
        };

        let target = dir.join(backup_file_name(core.name(), now));
        let data = match core.options().formatting.render(tree) {
            Ok(data) => data,
            Err(e) => {
                restore(tree);
                return Err(e);
            }
        };
        if let Err(e) = fs::write(&target, data) {
            restore(tree);
            return Err(StoreError::Backup(format!(
                "Cannot write snapshot {}: {}",
                target.display(),
                e
            )));
        }
        if let Err(e) = core.persist(tree) {
            restore(tree);
            let _ = fs::remove_file(&target);
            return Err(e);
        }
        Ok(target)
    })??;

    info!(store = core.name(), path = %target.display(), "snapshot written");
    Ok(target)
}

#[derive(Default)]
struct SchedulerStats {
    snapshots: AtomicU64,
    failures: AtomicU64,
}

/// Handle to the background snapshot task.
///
/// Dropping the handle aborts the task; [`BackupScheduler::shutdown`] stops
/// it and waits for it to finish.
pub struct BackupScheduler {
    cadence: BackupCadence,
    stats: Arc<SchedulerStats>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl BackupScheduler {
    pub(crate) fn start(core: Arc<StoreCore>, cadence: BackupCadence) -> crate::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            StoreError::Backup(format!("Backup scheduler needs a tokio runtime: {}", e))
        })?;

        let interval = cadence.interval();
        let stats = Arc::new(SchedulerStats::default());
        let now = Utc::now().timestamp_millis();
        let delay = initial_delay(core.last_backup()?, now, interval);

        // An overdue snapshot is taken here so a bad backup directory is
        // reported to the caller instead of only being logged.
        let first_wait = if delay.is_zero() {
            take_snapshot(&core)?;
            stats.snapshots.fetch_add(1, Ordering::Relaxed);
            interval
        } else {
            debug!(
                store = core.name(),
                delay_ms = delay.as_millis() as u64,
                "next snapshot scheduled"
            );
            delay
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(run_cycle(
            core.clone(),
            stats.clone(),
            first_wait,
            interval,
            shutdown_rx,
        ));
        info!(store = core.name(), %cadence, "backup scheduler started");

        Ok(Self {
            cadence,
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn cadence(&self) -> BackupCadence {
        self.cadence
    }

    /// Successful snapshots taken by this scheduler, including the one at start.
    pub fn snapshots_taken(&self) -> u64 {
        self.stats.snapshots.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub async fn shutdown(mut self) -> crate::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| StoreError::Backup(format!("Backup task failed: {}", e)))?;
        }
        info!(cadence = %self.cadence, "backup scheduler stopped");
        Ok(())
    }
}

impl fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("cadence", &self.cadence)
            .field("snapshots", &self.snapshots_taken())
            .field("failures", &self.failures())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_cycle(
    core: Arc<StoreCore>,
    stats: Arc<SchedulerStats>,
    first_wait: Duration,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut wait = first_wait;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown_rx => break,
        }
        // file writes and the std lock stay off the async workers
        let snapshot_core = core.clone();
        let outcome = tokio::task::spawn_blocking(move || take_snapshot(&snapshot_core))
            .await
            .unwrap_or_else(|e| Err(StoreError::Backup(format!("Snapshot task failed: {}", e))));
        match outcome {
            Ok(_) => {
                stats.snapshots.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(store = core.name(), error = %e, "scheduled snapshot failed");
            }
        }
        wait = interval;
    }
}
