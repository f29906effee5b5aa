//! File-backed store
//!
//! Credentials live in a JSON array file. All writes use atomic temp-file +
//! rename to prevent corruption on crash, and a tokio Mutex serializes
//! concurrent writers, which also makes compare-and-set atomic per process.
//! The in-memory copy only changes once the file write has succeeded.
//!
//! The transaction log is a sibling JSON-lines file opened in append mode.

use std::path::{Path, PathBuf};

use common::Secret;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::log::LogEntry;
use crate::model::{Credential, CredentialStatus};
use crate::store::{CredentialStore, LogSink, StoreFuture};

/// Credential file plus transaction log file.
pub struct FileStore {
    path: PathBuf,
    log_path: PathBuf,
    state: Mutex<Vec<Credential>>,
    log_lock: Mutex<()>,
}

impl FileStore {
    /// Load credentials from `path`, logging transactions to `log_path`.
    ///
    /// If the credential file doesn't exist, creates it as `[]` (cold start
    /// with an empty pool). The relay answers 503 until credentials are added
    /// via the admin API.
    pub async fn load(path: PathBuf, log_path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: Vec<Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), credentials = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let credentials = Vec::new();
            write_atomic(&path, &credentials).await?;
            credentials
        };

        Ok(Self {
            path,
            log_path,
            state: Mutex::new(state),
            log_lock: Mutex::new(()),
        })
    }

    /// Path of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn list_all(&self) -> StoreFuture<'_, Vec<Credential>> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn list_active(&self) -> StoreFuture<'_, Vec<Credential>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .iter()
                .filter(|c| c.status.is_selectable())
                .cloned()
                .collect())
        })
    }

    fn insert(
        &self,
        secret: Secret<String>,
        credits: Option<u32>,
    ) -> StoreFuture<'_, Credential> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.iter().any(|c| c.secret == secret) {
                return Err(Error::Duplicate("secret already stored".into()));
            }
            let credential = Credential::new(secret, credits);
            let mut next = state.clone();
            next.push(credential.clone());
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(credential_id = %credential.id, "inserted credential");
            Ok(credential)
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.iter().any(|c| c.id == id) {
                return Ok(false);
            }
            let next: Vec<_> = state.iter().filter(|c| c.id != id).cloned().collect();
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(credential_id = id, "deleted credential");
            Ok(true)
        })
    }

    fn set_status<'a>(
        &'a self,
        id: &'a str,
        status: CredentialStatus,
    ) -> StoreFuture<'a, Credential> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            let credential = next
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
            credential.apply_status(status);
            let updated = credential.clone();
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(credential_id = id, status = %status, "set credential status");
            Ok(updated)
        })
    }

    fn compare_and_set_status<'a>(
        &'a self,
        id: &'a str,
        expected: CredentialStatus,
        status: CredentialStatus,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            let Some(credential) = next.iter_mut().find(|c| c.id == id) else {
                return Ok(false);
            };
            if credential.status != expected {
                return Ok(false);
            }
            credential.apply_status(status);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(credential_id = id, from = %expected, to = %status, "credential status transitioned");
            Ok(true)
        })
    }
}

impl LogSink for FileStore {
    fn append(&self, entry: LogEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut line = serde_json::to_string(&entry)
                .map_err(|e| Error::Parse(format!("serializing log entry: {e}")))?;
            line.push('\n');

            let _guard = self.log_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .await
                .map_err(|e| Error::Io(format!("opening log file: {e}")))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| Error::Io(format!("appending log entry: {e}")))?;
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> StoreFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let _guard = self.log_lock.lock().await;
            let contents = match tokio::fs::read_to_string(&self.log_path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(Error::Io(format!("reading log file: {e}"))),
            };

            let mut entries = Vec::with_capacity(limit.min(64));
            for line in contents.lines().rev() {
                if entries.len() >= limit {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(error = %e, "skipping unreadable log line"),
                }
            }
            Ok(entries)
        })
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bearer secrets.
async fn write_atomic(path: &Path, data: &[Credential]) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::load(dir.path().join("tokens.json"), dir.path().join("logs.jsonl"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        assert!(store.path().exists());
        assert!(store.list_all().await.unwrap().is_empty());
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.trim(), "[]");
    }

    #[tokio::test]
    async fn insert_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let inserted = store.insert(Secret::from("tok-a"), None).await.unwrap();

        let reloaded = test_store(&dir).await;
        let all = reloaded.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, inserted.id);
        assert_eq!(all[0].secret.expose(), "tok-a");
        assert_eq!(all[0].credits, 100);
        assert_eq!(all[0].status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("store");
        std::fs::create_dir(&nested).unwrap();
        let store = FileStore::load(nested.join("tokens.json"), nested.join("logs.jsonl"))
            .await
            .unwrap();
        let existing = store.insert(Secret::from("tok-a"), None).await.unwrap();

        // Every later write fails: the directory holding the file is gone.
        std::fs::remove_dir_all(&nested).unwrap();

        assert!(matches!(
            store.insert(Secret::from("tok-b"), None).await,
            Err(Error::Io(_))
        ));
        assert!(
            store
                .compare_and_set_status(
                    &existing.id,
                    CredentialStatus::Active,
                    CredentialStatus::OutOfCredits
                )
                .await
                .is_err()
        );
        assert!(
            store
                .set_status(&existing.id, CredentialStatus::Inactive)
                .await
                .is_err()
        );
        assert!(store.delete(&existing.id).await.is_err());

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, existing.id);
        assert_eq!(all[0].status, CredentialStatus::Active);
        assert_eq!(all[0].credits, existing.credits);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.insert(Secret::from("tok-a"), None).await.unwrap();

        let err = store.insert(Secret::from("tok-a"), Some(5)).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)), "got: {err}");
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_active_filters_and_keeps_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = store.insert(Secret::from("tok-a"), None).await.unwrap();
        let b = store.insert(Secret::from("tok-b"), None).await.unwrap();
        let c = store.insert(Secret::from("tok-c"), None).await.unwrap();
        store
            .set_status(&b.id, CredentialStatus::Inactive)
            .await
            .unwrap();

        let active: Vec<String> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(active, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = store.insert(Secret::from("tok-a"), None).await.unwrap();

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_status_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let err = store
            .set_status("ghost", CredentialStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn compare_and_set_only_moves_from_expected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = store.insert(Secret::from("tok-a"), Some(60)).await.unwrap();

        let first = store
            .compare_and_set_status(
                &a.id,
                CredentialStatus::Active,
                CredentialStatus::OutOfCredits,
            )
            .await
            .unwrap();
        assert!(first);

        // Second writer lost the race: status is no longer active
        let second = store
            .compare_and_set_status(&a.id, CredentialStatus::Active, CredentialStatus::Inactive)
            .await
            .unwrap();
        assert!(!second);

        let all = store.list_all().await.unwrap();
        assert_eq!(all[0].status, CredentialStatus::OutOfCredits);
        assert_eq!(all[0].credits, 0);

        assert!(
            !store
                .compare_and_set_status(
                    "ghost",
                    CredentialStatus::Active,
                    CredentialStatus::Inactive
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_compare_and_set_has_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(test_store(&dir).await);
        let a = store.insert(Secret::from("tok-a"), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = a.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_set_status(
                        &id,
                        CredentialStatus::Active,
                        CredentialStatus::OutOfCredits,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.insert(Secret::from("tok-a"), None).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn log_recent_is_newest_first_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let secret = Secret::from("eyJhbGciOiJSUzI1NiJ9.payload");

        for status in [200u16, 402, 502] {
            store
                .append(LogEntry::new(&secret, "POST", "/api/lovable-proxy", status))
                .await
                .unwrap();
        }

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status_code, 502);
        assert_eq!(recent[1].status_code, 402);
        assert!(recent.iter().all(|e| e.token_prefix == "eyJhbGciOi..."));
    }

    #[tokio::test]
    async fn log_recent_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        assert!(store.recent(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let secret = Secret::from("eyJhbGciOiJSUzI1NiJ9.payload");
        store
            .append(LogEntry::new(&secret, "POST", "/p", 200))
            .await
            .unwrap();
        let log_path = dir.path().join("logs.jsonl");
        let mut contents = std::fs::read_to_string(&log_path).unwrap();
        contents.push_str("{not json\n");
        std::fs::write(&log_path, contents).unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status_code, 200);
    }
}
