pub mod backup;
pub mod config;
pub mod error;
pub mod path;
pub mod storage;

pub use backup::BackupScheduler;
pub use config::{BackupCadence, Formatting, StoreOptions};
pub use error::StoreError;
pub use path::{DottedPath, Tree};
pub use storage::{Database, KeySelection, LAST_BACKUP_KEY};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, StoreError>;
