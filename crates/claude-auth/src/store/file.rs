//! JSON file token store
//!
//! One JSON document maps provider keys to records. Writes are atomic
//! (temp file, fsync, rename) and serialised across processes by an
//! advisory lock on a sibling `.lock` file; a tokio mutex serialises them
//! within the process. Every write re-reads the document first so two
//! proxy instances sharing one file never clobber each other's keys.
//!
//! Lock acquisition polls with `try_lock` plus a short sleep instead of a
//! blocking `flock`, so a contended lock never parks a runtime worker.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Result, StoreError, TokenStore, validate_key};
use crate::record::TokenRecord;

/// Current storage document version.
const STORAGE_VERSION: u32 = 1;

/// How long to poll for the advisory lock before giving up.
const LOCK_DEADLINE: Duration = Duration::from_secs(10);

/// Sleep between lock attempts.
const LOCK_RETRY: Duration = Duration::from_millis(25);

/// On-disk document layout.
#[derive(Debug, Serialize, Deserialize)]
struct StorageDoc {
    version: u32,
    #[serde(default)]
    providers: HashMap<String, TokenRecord>,
}

impl Default for StorageDoc {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            providers: HashMap::new(),
        }
    }
}

/// Token store backed by a JSON file plus a sibling `.lock` file.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// `Some` while an explicit `lock()` is outstanding. Doubles as the
    /// in-process writer mutex: every operation holds it while touching
    /// the document, so per-op flocks and explicit locks cannot deadlock
    /// on a second handle to the same lock file.
    held: Mutex<Option<File>>,
}

/// Releases a per-operation flock on drop. `None` means an explicit
/// `lock()` already covers the operation and there is nothing to release.
struct FlockGuard(Option<File>);

impl Drop for FlockGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.0 {
            let _ = fs2::FileExt::unlock(file);
        }
    }
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "auth.json".into());
        let lock_path = path.with_file_name(format!("{name}.lock"));
        Self {
            path,
            lock_path,
            held: Mutex::new(None),
        }
    }

    /// Path of the storage document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<()> {
        let Some(dir) = self.path.parent() else {
            return Err(StoreError::Io("storage path has no parent directory".into()));
        };
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Io(format!("creating {}: {e}", dir.display())))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(dir, perms)
                    .map_err(|e| StoreError::Io(format!("chmod {}: {e}", dir.display())))?;
            }
        }
        Ok(())
    }

    /// Acquire the advisory lock, polling until `LOCK_DEADLINE`.
    async fn acquire_flock(&self, exclusive: bool) -> Result<File> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| StoreError::Io(format!("opening {}: {e}", self.lock_path.display())))?;

        let deadline = Instant::now() + LOCK_DEADLINE;
        loop {
            let attempt = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(file),
                Err(_) if Instant::now() < deadline => tokio::time::sleep(LOCK_RETRY).await,
                Err(e) => {
                    return Err(StoreError::Io(format!(
                        "timed out waiting for storage lock {}: {e}",
                        self.lock_path.display()
                    )));
                }
            }
        }
    }

    /// Per-operation flock, skipped when an explicit `lock()` is in force.
    async fn op_flock(&self, already_held: bool, exclusive: bool) -> Result<FlockGuard> {
        if already_held {
            Ok(FlockGuard(None))
        } else {
            Ok(FlockGuard(Some(self.acquire_flock(exclusive).await?)))
        }
    }

    fn read_document(&self) -> Result<StorageDoc> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Corrupt(format!("{}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StorageDoc::default()),
            Err(e) => Err(StoreError::Io(format!(
                "reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Write the document atomically: temp file with mode 0600, fsync,
    /// rename over the target.
    fn write_document(&self, doc: &StorageDoc) -> Result<()> {
        self.ensure_parent()?;
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Io(format!("encoding storage document: {e}")))?;

        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "auth.json".into());
        let tmp = self.path.with_file_name(format!("{name}.tmp"));

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts
            .open(&tmp)
            .map_err(|e| StoreError::Io(format!("opening {}: {e}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| StoreError::Io(format!("writing {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| StoreError::Io(format!("fsync {}: {e}", tmp.display())))?;
        drop(file);

        std::fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::Io(format!("renaming over {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "persisted credentials");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<TokenRecord>> {
        validate_key(key)?;
        let held = self.held.lock().await;
        let _flock = self.op_flock(held.is_some(), false).await?;
        Ok(self.read_document()?.providers.get(key).cloned())
    }

    async fn set(&self, key: &str, record: TokenRecord) -> Result<()> {
        validate_key(key)?;
        let held = self.held.lock().await;
        let _flock = self.op_flock(held.is_some(), true).await?;
        let mut doc = self.read_document()?;
        doc.providers.insert(key.to_string(), record);
        self.write_document(&doc)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let held = self.held.lock().await;
        let _flock = self.op_flock(held.is_some(), true).await?;
        let mut doc = self.read_document()?;
        if doc.providers.remove(key).is_some() {
            info!(key, "credential removed");
            self.write_document(&doc)?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let held = self.held.lock().await;
        let _flock = self.op_flock(held.is_some(), false).await?;
        Ok(self.read_document()?.providers.keys().cloned().collect())
    }

    async fn lock(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.is_none() {
            *held = Some(self.acquire_flock(true).await?);
        }
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        if let Some(file) = held.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn oauth_record(suffix: &str) -> TokenRecord {
        TokenRecord::Oauth {
            access_token: format!("at_{suffix}"),
            refresh_token: format!("rt_{suffix}"),
            expires_at: 1760000000,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(dir.path().join("auth.json"))
    }

    #[tokio::test]
    async fn set_then_get_returns_equal_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("anthropic", oauth_record("1")).await.unwrap();
        let got = store.get("anthropic").await.unwrap();
        assert_eq!(got, Some(oauth_record("1")));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.get("anthropic").await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_then_get_returns_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("anthropic", oauth_record("1")).await.unwrap();
        store.delete("anthropic").await.unwrap();
        assert_eq!(store.get("anthropic").await.unwrap(), None);
        // Deleting a missing key is not an error
        store.delete("anthropic").await.unwrap();
    }

    #[tokio::test]
    async fn list_contains_exactly_the_stored_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("anthropic", oauth_record("a")).await.unwrap();
        store
            .set("staging", TokenRecord::ApiKey { key: "sk".into() })
            .await
            .unwrap();
        let mut keys = store.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["anthropic", "staging"]);
    }

    #[tokio::test]
    async fn written_document_matches_storage_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("anthropic", oauth_record("1")).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("auth.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["providers"]["anthropic"]["type"], "oauth");
        assert_eq!(json["providers"]["anthropic"]["access_token"], "at_1");
        assert_eq!(json["providers"]["anthropic"]["expires_at"], 1760000000);
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_without_being_destroyed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, "{").unwrap();

        let store = FileStore::new(path.clone());
        let err = store.get("anthropic").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)), "got: {err:?}");

        // The broken document is left in place for the user to inspect
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{");
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("anthropic", oauth_record("1")).await.unwrap();
        assert!(!dir.path().join("auth.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("anthropic", oauth_record("1")).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("auth.json"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600, "storage file must be 0600, got {mode:o}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn parent_directory_mode_is_0700() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("claude-gate").join("auth.json"));
        store.set("anthropic", oauth_record("1")).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("claude-gate"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700, "storage dir must be 0700, got {mode:o}");
    }

    #[tokio::test]
    async fn invalid_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let err = store.set("Not Valid", oauth_record("1")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("acct-{i}"), oauth_record(&i.to_string()))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 10);
        // Document must still parse
        let contents = std::fs::read_to_string(dir.path().join("auth.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(json["providers"].as_object().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn explicit_lock_spans_multiple_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.lock().await.unwrap();
        // Operations under the explicit lock must not deadlock on a
        // second handle to the same lock file
        store.set("anthropic", oauth_record("1")).await.unwrap();
        assert!(store.get("anthropic").await.unwrap().is_some());
        store.unlock().await.unwrap();

        // And the lock must actually be released afterwards
        let other = store_in(&dir);
        other.set("other", oauth_record("2")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn two_instances_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = store_in(&dir);
        let b = store_in(&dir);

        a.set("anthropic", oauth_record("a")).await.unwrap();
        b.set("backup", oauth_record("b")).await.unwrap();

        // Each instance re-reads before writing, so neither update is lost
        let mut keys = a.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["anthropic", "backup"]);
    }
}
