use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// How the tree is laid out when written to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Formatting {
    /// No whitespace at all.
    #[default]
    Compact,
    /// Two-space indentation.
    Expanded,
}

impl Formatting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Formatting::Compact => "compact",
            Formatting::Expanded => "expanded",
        }
    }

    pub fn render<T: Serialize + ?Sized>(&self, value: &T) -> crate::Result<String> {
        let text = match self {
            Formatting::Compact => serde_json::to_string(value)?,
            Formatting::Expanded => serde_json::to_string_pretty(value)?,
        };
        Ok(text)
    }
}

impl FromStr for Formatting {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compact" => Ok(Formatting::Compact),
            "expanded" => Ok(Formatting::Expanded),
            other => Err(StoreError::Config(format!(
                "Invalid formatting type '{}', expected 'compact' or 'expanded'",
                other
            ))),
        }
    }
}

impl fmt::Display for Formatting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named snapshot frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupCadence {
    Debug,
    EveryHalfMinute,
    EveryMinute,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

// name -> cadence
static CADENCE_TABLE: Lazy<HashMap<&'static str, BackupCadence>> = Lazy::new(|| {
    BackupCadence::ALL
        .iter()
        .map(|cadence| (cadence.name(), *cadence))
        .collect()
});

impl BackupCadence {
    pub const ALL: [BackupCadence; 7] = [
        BackupCadence::Debug,
        BackupCadence::EveryHalfMinute,
        BackupCadence::EveryMinute,
        BackupCadence::Hourly,
        BackupCadence::Daily,
        BackupCadence::Weekly,
        BackupCadence::Monthly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackupCadence::Debug => "debug",
            BackupCadence::EveryHalfMinute => "every-half-minute",
            BackupCadence::EveryMinute => "every-minute",
            BackupCadence::Hourly => "hourly",
            BackupCadence::Daily => "daily",
            BackupCadence::Weekly => "weekly",
            BackupCadence::Monthly => "monthly",
        }
    }

    pub fn interval_secs(&self) -> u64 {
        match self {
            BackupCadence::Debug => 5,
            BackupCadence::EveryHalfMinute => 30,
            BackupCadence::EveryMinute => 60,
            BackupCadence::Hourly => 3_600,
            BackupCadence::Daily => 86_400,
            BackupCadence::Weekly => 604_800,
            BackupCadence::Monthly => 2_592_000,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs())
    }

    pub fn interval_millis(&self) -> i64 {
        self.interval_secs() as i64 * 1000
    }
}

impl FromStr for BackupCadence {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CADENCE_TABLE.get(s).copied().ok_or_else(|| {
            let known: Vec<&str> = BackupCadence::ALL.iter().map(|c| c.name()).collect();
            StoreError::Config(format!(
                "Invalid backup option '{}', expected one of: {}",
                s,
                known.join(", ")
            ))
        })
    }
}

impl fmt::Display for BackupCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options accepted when opening a [`crate::Database`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreOptions {
    pub formatting: Formatting,
    /// Absent means no scheduled snapshots.
    pub backups: Option<BackupCadence>,
    /// Defaults to a `backups` directory next to the store file.
    pub backup_directory: Option<PathBuf>,
    /// Legacy behaviour: refuse to write `0`, `false`, `""` or `null`.
    pub reject_falsy_values: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_formatting(mut self, formatting: Formatting) -> Self {
        self.formatting = formatting;
        self
    }

    pub fn with_backups(mut self, cadence: BackupCadence) -> Self {
        self.backups = Some(cadence);
        self
    }

    pub fn with_backup_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_directory = Some(dir.into());
        self
    }

    pub fn with_reject_falsy_values(mut self, reject: bool) -> Self {
        self.reject_falsy_values = reject;
        self
    }

    /// Parse an options document such as
    /// `{"formatting": "expanded", "backups": "daily", "backupDirectory": "./snapshots"}`.
    pub fn from_json_str(data: &str) -> crate::Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| StoreError::Config(format!("Invalid store options: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("Cannot read options file {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&data)
    }

    /// Where snapshots of the store at `location` are written.
    pub fn resolve_backup_directory(&self, location: &Path) -> PathBuf {
        match &self.backup_directory {
            Some(dir) => dir.clone(),
            None => location
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
                .join("backups"),
        }
    }
}
