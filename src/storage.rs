use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backup::{self, BackupScheduler};
use crate::config::StoreOptions;
use crate::error::StoreError;
use crate::path::{assign, ensure_assignable, is_truthy, resolve, DottedPath, Tree};

/// Reserved top-level key holding the unix time (ms) of the last snapshot.
pub const LAST_BACKUP_KEY: &str = "LAST_BACKUP";

/// State shared between a [`Database`] handle and its backup scheduler.
pub(crate) struct StoreCore {
    location: PathBuf,
    name: String,
    options: StoreOptions,
    backup_dir: PathBuf,
    tree: RwLock<Tree>,
}

impl StoreCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(crate) fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    // Helper to run read-only closures against the tree
    pub(crate) fn with_read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&Tree) -> R,
    {
        let guard = self.tree.read().map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(f(&guard))
    }

    // Helper to run write closures against the tree. The write lock is held
    // for the whole closure, so mutate-then-persist is never interleaved with
    // a snapshot.
    pub(crate) fn with_write<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut Tree) -> R,
    {
        let mut guard = self.tree.write().map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(f(&mut guard))
    }

    /// Serialize the full tree and overwrite the backing file.
    pub(crate) fn persist(&self, tree: &Tree) -> crate::Result<()> {
        let data = self.options.formatting.render(tree)?;
        atomic_write(&self.location, data.as_bytes())?;
        debug!(
            location = %self.location.display(),
            bytes = data.len(),
            "persisted store"
        );
        Ok(())
    }

    pub(crate) fn last_backup(&self) -> crate::Result<Option<i64>> {
        self.with_read(|tree| tree.get(LAST_BACKUP_KEY).and_then(backup::parse_timestamp))
    }
}

/// Keys accepted by [`Database::delete`]: a single top-level key or a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    One(String),
    Many(Vec<String>),
}

impl KeySelection {
    fn into_keys(self) -> crate::Result<Vec<String>> {
        let keys = match self {
            KeySelection::One(key) => vec![key],
            KeySelection::Many(keys) => keys,
        };
        if keys.iter().any(|k| k.is_empty()) {
            return Err(StoreError::Key(
                "Please send a valid key to delete".to_string(),
            ));
        }
        Ok(keys)
    }
}

impl From<&str> for KeySelection {
    fn from(key: &str) -> Self {
        KeySelection::One(key.to_string())
    }
}

impl From<String> for KeySelection {
    fn from(key: String) -> Self {
        KeySelection::One(key)
    }
}

impl From<Vec<String>> for KeySelection {
    fn from(keys: Vec<String>) -> Self {
        KeySelection::Many(keys)
    }
}

impl From<Vec<&str>> for KeySelection {
    fn from(keys: Vec<&str>) -> Self {
        KeySelection::Many(keys.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for KeySelection {
    fn from(keys: &[&str]) -> Self {
        KeySelection::Many(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for KeySelection {
    fn from(keys: [&str; N]) -> Self {
        KeySelection::Many(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// A JSON document on disk, mirrored in memory and addressed by dotted paths.
///
/// Every mutation rewrites the whole file before returning.
pub struct Database {
    core: Arc<StoreCore>,
}

impl Database {
    /// Open (or create) the store at `location`.
    ///
    /// A missing or unparseable file is not an error: the store starts empty
    /// and the file is immediately rewritten in canonical form.
    pub fn open(location: impl AsRef<Path>, options: StoreOptions) -> crate::Result<Self> {
        let location = location.as_ref();
        if location.as_os_str().is_empty() {
            return Err(StoreError::Config(
                "Argument missing. Please put a location when creating a database.".to_string(),
            ));
        }
        let name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "Location {} does not name a file",
                    location.display()
                ))
            })?;

        let tree = load_tree(location);
        let backup_dir = options.resolve_backup_directory(location);
        let core = Arc::new(StoreCore {
            location: location.to_path_buf(),
            name,
            options,
            backup_dir,
            tree: RwLock::new(tree),
        });
        core.with_read(|tree| core.persist(tree))??;

        debug!(location = %location.display(), "opened store");
        Ok(Self { core })
    }

    /// Final component of the store's location, e.g. `db.json`.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn location(&self) -> &Path {
        &self.core.location
    }

    pub fn options(&self) -> &StoreOptions {
        self.core.options()
    }

    pub fn backup_directory(&self) -> &Path {
        self.core.backup_dir()
    }

    /// Value at `path`, or `None` when anything along the way is missing.
    pub fn read(&self, path: &str) -> crate::Result<Option<Value>> {
        let path = DottedPath::parse(path)?;
        self.core.with_read(|tree| resolve(tree, &path).cloned())
    }

    /// Whether `path` resolves to a truthy value. A key holding `0`, `false`,
    /// `""` or `null` reports `false`, exactly like a missing key.
    pub fn exists(&self, path: &str) -> bool {
        let Ok(path) = DottedPath::parse(path) else {
            return false;
        };
        self.core
            .with_read(|tree| resolve(tree, &path).map(is_truthy).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Set `path` to `value`, creating intermediate objects, and persist.
    pub fn write(&mut self, path: &str, value: impl Into<Value>) -> crate::Result<()> {
        let path = DottedPath::parse(path)?;
        let value = value.into();
        if self.core.options.reject_falsy_values && !is_truthy(&value) {
            return Err(StoreError::Key(
                "Please send a valid key and a value to set.".to_string(),
            ));
        }

        // a write that is going to be rejected must not trigger a snapshot
        self.core.with_read(|tree| ensure_assignable(tree, &path))??;

        if let Some(cadence) = self.core.options.backups {
            let last = self.core.last_backup()?;
            if backup::is_due(last, Utc::now().timestamp_millis(), cadence.interval()) {
                backup::take_snapshot(&self.core)?;
            }
        }

        self.core.with_write(|tree| {
            // everything assign can touch lives under this top-level key
            let root = path.segments()[0];
            let saved = tree.get(root).cloned();
            assign(tree, &path, value)?;
            if let Err(e) = self.core.persist(tree) {
                // keep memory and disk in agreement
                match saved {
                    Some(entry) => {
                        tree.insert(root.to_string(), entry);
                    }
                    None => {
                        tree.shift_remove(root);
                    }
                }
                return Err(e);
            }
            Ok(())
        })??;
        debug!(path = path.as_str(), "wrote key");
        Ok(())
    }

    /// A copy of the whole tree.
    pub fn value(&self) -> crate::Result<Tree> {
        self.core.with_read(|tree| tree.clone())
    }

    /// Replace the tree with an empty object and persist.
    pub fn clear(&mut self) -> crate::Result<()> {
        self.core.with_write(|tree| {
            tree.clear();
            self.core.persist(tree)
        })??;
        debug!(location = %self.core.location.display(), "cleared store");
        Ok(())
    }

    /// Remove one or more top-level keys and persist. Dots in a key are not
    /// treated as a path: `delete("a.b")` only removes a top-level `"a.b"`.
    pub fn delete(&mut self, keys: impl Into<KeySelection>) -> crate::Result<()> {
        let keys = keys.into().into_keys()?;
        self.core.with_write(|tree| {
            for key in &keys {
                tree.shift_remove(key);
            }
            self.core.persist(tree)
        })??;
        debug!(?keys, "deleted keys");
        Ok(())
    }

    /// Rewrite the backing file from memory.
    pub fn flush(&self) -> crate::Result<()> {
        self.core.with_read(|tree| self.core.persist(tree))?
    }

    /// Flush and release the handle. A running scheduler keeps its own
    /// reference and should be shut down separately.
    pub fn close(self) -> crate::Result<()> {
        self.flush()
    }

    /// Timestamp (unix ms) of the last recorded snapshot.
    pub fn last_backup(&self) -> crate::Result<Option<i64>> {
        self.core.last_backup()
    }

    /// Take a snapshot regardless of cadence; returns the file written.
    pub fn snapshot_now(&self) -> crate::Result<PathBuf> {
        backup::take_snapshot(&self.core)
    }

    /// Snapshot files already present for this store, oldest first.
    pub fn list_backups(&self) -> crate::Result<Vec<PathBuf>> {
        backup::list_backups(self.core.backup_dir(), self.core.name())
    }

    /// Start the background snapshot cycle if a cadence is configured.
    /// Must be called from inside a tokio runtime.
    pub fn spawn_backups(&self) -> crate::Result<Option<BackupScheduler>> {
        match self.core.options.backups {
            Some(cadence) => BackupScheduler::start(self.core.clone(), cadence).map(Some),
            None => Ok(None),
        }
    }
}

fn load_tree(location: &Path) -> Tree {
    let data = match fs::read_to_string(location) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(location = %location.display(), "no existing store file, starting empty");
            return Tree::new();
        }
        Err(e) => {
            warn!(location = %location.display(), error = %e, "cannot read store file, starting empty");
            return Tree::new();
        }
    };
    match serde_json::from_str::<Value>(&data) {
        Ok(Value::Object(tree)) => tree,
        Ok(_) => {
            warn!(location = %location.display(), "store file is not a JSON object, starting empty");
            Tree::new()
        }
        Err(e) => {
            warn!(location = %location.display(), error = %e, "store file is malformed, starting empty");
            Tree::new()
        }
    }
}

// Write to a temporary file next to `path` and rename it into place, so an
// interrupted write never leaves a truncated store behind on the same filesystem.
fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Persistence(format!("Invalid path {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| StoreError::Persistence(e.to_string()))?;

    use rand::{thread_rng, Rng};
    let suffix: u64 = thread_rng().gen();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, suffix));

    fs::write(&tmp, bytes).map_err(|e| StoreError::Persistence(e.to_string()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Persistence(e.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupCadence, Formatting};
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Database {
        Database::open(dir.path().join("db.json"), StoreOptions::default()).unwrap()
    }

    fn on_disk(db: &Database) -> Value {
        serde_json::from_str(&fs::read_to_string(db.location()).unwrap()).unwrap()
    }

    #[test]
    fn test_open_requires_location() {
        let result = Database::open("", StoreOptions::default());
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_open_creates_file() {
        let tmp_dir = TempDir::new().unwrap();
        let db = open(&tmp_dir);
        assert_eq!(fs::read_to_string(db.location()).unwrap(), "{}");
        assert_eq!(db.name(), "db.json");
        assert!(db.value().unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_missing_parent_directory() {
        let tmp_dir = TempDir::new().unwrap();
        let location = tmp_dir.path().join("nested/dir/db.json");
        let db = Database::open(&location, StoreOptions::default()).unwrap();
        assert!(location.exists());
        assert_eq!(db.backup_directory(), tmp_dir.path().join("nested/dir/backups"));
    }

    #[test]
    fn test_malformed_file_is_reset() {
        let tmp_dir = TempDir::new().unwrap();
        let location = tmp_dir.path().join("db.json");
        fs::write(&location, "{not json").unwrap();

        let db = Database::open(&location, StoreOptions::default()).unwrap();
        assert!(db.value().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&location).unwrap(), "{}");
    }

    #[test]
    fn test_non_object_file_is_reset() {
        let tmp_dir = TempDir::new().unwrap();
        let location = tmp_dir.path().join("db.json");
        fs::write(&location, "[1, 2, 3]").unwrap();

        let db = Database::open(&location, StoreOptions::default()).unwrap();
        assert!(db.value().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&location).unwrap(), "{}");
    }

    #[test]
    fn test_write_then_read() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);

        db.write("site", "example.org").unwrap();
        db.write("test.status", "success").unwrap();
        db.write("limits.max", 10).unwrap();
        db.write("nested.list", json!([1, "two", null])).unwrap();

        assert_eq!(db.read("site").unwrap(), Some(json!("example.org")));
        assert_eq!(db.read("test.status").unwrap(), Some(json!("success")));
        assert_eq!(db.read("limits.max").unwrap(), Some(json!(10)));
        assert_eq!(db.read("nested.list").unwrap(), Some(json!([1, "two", null])));
        assert_eq!(db.read("test").unwrap(), Some(json!({"status": "success"})));
    }

    #[test]
    fn test_falsy_values_are_accepted_by_default() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);

        db.write("zero", 0).unwrap();
        db.write("flag", false).unwrap();
        db.write("empty", "").unwrap();

        assert_eq!(db.read("zero").unwrap(), Some(json!(0)));
        assert_eq!(db.read("flag").unwrap(), Some(json!(false)));
        assert_eq!(db.read("empty").unwrap(), Some(json!("")));
    }

    #[test]
    fn test_strict_mode_rejects_falsy_values() {
        let tmp_dir = TempDir::new().unwrap();
        let options = StoreOptions::default().with_reject_falsy_values(true);
        let mut db = Database::open(tmp_dir.path().join("db.json"), options).unwrap();

        for value in [json!(0), json!(false), json!(""), json!(null)] {
            let result = db.write("key", value);
            assert!(matches!(result, Err(StoreError::Key(_))));
        }
        assert_eq!(db.read("key").unwrap(), None);

        db.write("key", 1).unwrap();
        assert_eq!(db.read("key").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_read_missing_is_none() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("a.b", "leaf").unwrap();

        assert_eq!(db.read("missing").unwrap(), None);
        assert_eq!(db.read("a.c").unwrap(), None);
        assert_eq!(db.read("a.b.c").unwrap(), None);
    }

    #[test]
    fn test_invalid_paths_are_key_errors() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);

        assert!(matches!(db.read(""), Err(StoreError::Key(_))));
        assert!(matches!(db.read("a..b"), Err(StoreError::Key(_))));
        assert!(matches!(db.write("", 1), Err(StoreError::Key(_))));
        assert!(matches!(db.write("a.", 1), Err(StoreError::Key(_))));
    }

    #[test]
    fn test_write_through_scalar_is_rejected() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("a", 5).unwrap();

        assert!(matches!(db.write("a.b", 1), Err(StoreError::Key(_))));
        assert_eq!(db.read("a").unwrap(), Some(json!(5)));
        assert_eq!(on_disk(&db), json!({"a": 5}));
    }

    #[test]
    fn test_exists_follows_truthiness() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("name", "store").unwrap();
        db.write("count", 0).unwrap();
        db.write("enabled", false).unwrap();
        db.write("nested.empty", json!({})).unwrap();

        assert!(db.exists("name"));
        assert!(db.exists("nested"));
        assert!(db.exists("nested.empty"));
        assert!(!db.exists("count"));
        assert!(!db.exists("enabled"));
        assert!(!db.exists("missing"));
        assert!(!db.exists(""));
        assert!(!db.exists("a..b"));
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);

        db.write("a.b", 1).unwrap();
        assert_eq!(on_disk(&db), json!({"a": {"b": 1}}));

        db.write("c", "x").unwrap();
        assert_eq!(on_disk(&db), json!({"a": {"b": 1}, "c": "x"}));

        db.delete("a").unwrap();
        assert_eq!(on_disk(&db), json!({"c": "x"}));

        db.clear().unwrap();
        assert_eq!(on_disk(&db), json!({}));
    }

    #[test]
    fn test_reopen_sees_previous_writes() {
        let tmp_dir = TempDir::new().unwrap();
        let location = tmp_dir.path().join("db.json");
        {
            let mut db = Database::open(&location, StoreOptions::default()).unwrap();
            db.write("user.name", "ada").unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&location, StoreOptions::default()).unwrap();
        assert_eq!(db.read("user.name").unwrap(), Some(json!("ada")));
    }

    #[test]
    fn test_clear() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("a", 1).unwrap();
        db.write("b.c", 2).unwrap();

        db.clear().unwrap();
        assert!(db.value().unwrap().is_empty());
        assert_eq!(db.read("a").unwrap(), None);
    }

    #[test]
    fn test_delete_top_level_only() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("door", "open").unwrap();
        db.write("window", "closed").unwrap();
        db.write("roof.tiles", 40).unwrap();
        db.write("keep", true).unwrap();

        db.delete("door").unwrap();
        assert_eq!(db.read("door").unwrap(), None);

        // dotted keys are not paths for delete
        db.delete("roof.tiles").unwrap();
        assert_eq!(db.read("roof.tiles").unwrap(), Some(json!(40)));

        db.delete(["window", "roof"]).unwrap();
        assert_eq!(db.read("window").unwrap(), None);
        assert_eq!(db.read("roof").unwrap(), None);
        assert_eq!(Value::Object(db.value().unwrap()), json!({"keep": true}));

        // unknown keys are ignored
        db.delete(vec!["nope".to_string()]).unwrap();
    }

    #[test]
    fn test_delete_rejects_empty_keys() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        assert!(matches!(db.delete(""), Err(StoreError::Key(_))));
        assert!(matches!(db.delete(["a", ""]), Err(StoreError::Key(_))));
        db.delete(Vec::<String>::new()).unwrap();
    }

    #[test]
    fn test_formatting_on_disk() {
        let tmp_dir = TempDir::new().unwrap();
        let compact_path = tmp_dir.path().join("compact.json");
        let expanded_path = tmp_dir.path().join("expanded.json");

        let mut compact = Database::open(&compact_path, StoreOptions::default()).unwrap();
        compact.write("a.b", 1).unwrap();
        assert_eq!(fs::read_to_string(&compact_path).unwrap(), r#"{"a":{"b":1}}"#);

        let options = StoreOptions::default().with_formatting(Formatting::Expanded);
        let mut expanded = Database::open(&expanded_path, options).unwrap();
        expanded.write("a.b", 1).unwrap();
        assert_eq!(
            fs::read_to_string(&expanded_path).unwrap(),
            "{\n  \"a\": {\n    \"b\": 1\n  }\n}"
        );
    }

    #[test]
    fn test_insertion_order_preserved() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("zeta", 1).unwrap();
        db.write("alpha", 2).unwrap();
        db.write("mid", 3).unwrap();
        let keys: Vec<String> = db.value().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_write_takes_snapshot_when_due() {
        let tmp_dir = TempDir::new().unwrap();
        let options = StoreOptions::default()
            .with_backups(BackupCadence::Hourly)
            .with_backup_directory(tmp_dir.path().join("snaps"));
        let mut db = Database::open(tmp_dir.path().join("db.json"), options).unwrap();

        db.write("first", 1).unwrap();
        let last = db.last_backup().unwrap().expect("snapshot recorded");
        assert_eq!(db.list_backups().unwrap().len(), 1);

        // next write is inside the hour
        db.write("second", 2).unwrap();
        assert_eq!(db.last_backup().unwrap(), Some(last));
        assert_eq!(db.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_persist_rolls_back_memory() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("keep", 1).unwrap();
        db.write("n", json!(null)).unwrap();
        db.write("obj.inner", "x").unwrap();

        // a non-empty directory where the store file was makes the rename fail
        fs::remove_file(db.location()).unwrap();
        fs::create_dir(db.location()).unwrap();
        fs::write(db.location().join("occupant"), "x").unwrap();

        let before = db.value().unwrap();
        for (path, value) in [
            ("x.y.z", json!(1)),
            ("n.child", json!(2)),
            ("obj.inner", json!("changed")),
            ("obj.extra.deep", json!(3)),
        ] {
            assert!(matches!(db.write(path, value), Err(StoreError::Persistence(_))));
            assert_eq!(db.value().unwrap(), before, "after writing {}", path);
        }
        let keys: Vec<String> = db.value().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["keep", "n", "obj"]);
    }

    #[test]
    fn test_rejected_write_takes_no_snapshot() {
        let tmp_dir = TempDir::new().unwrap();
        let location = tmp_dir.path().join("db.json");
        {
            let mut db = Database::open(&location, StoreOptions::default()).unwrap();
            db.write("a", 5).unwrap();
        }
        let options = StoreOptions::default()
            .with_backups(BackupCadence::Hourly)
            .with_backup_directory(tmp_dir.path().join("snaps"));
        let mut db = Database::open(&location, options).unwrap();

        assert!(matches!(db.write("a.b", 1), Err(StoreError::Key(_))));
        assert_eq!(db.last_backup().unwrap(), None);
        assert!(db.list_backups().unwrap().is_empty());
    }

    #[test]
    fn test_write_without_cadence_takes_no_snapshot() {
        let tmp_dir = TempDir::new().unwrap();
        let mut db = open(&tmp_dir);
        db.write("a", 1).unwrap();
        assert_eq!(db.last_backup().unwrap(), None);
        assert!(!db.backup_directory().exists());
    }
}
