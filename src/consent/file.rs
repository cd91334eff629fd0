//! Consent store persisting one JSON file per consent
//!
//! Files are replaced atomically (write to a temporary file, then rename),
//! so a reader never observes a partially written record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ConsentId, ConsentRecord, ConsentStore, TokenUpdate};
use crate::{Error, Result};

/// File-backed consent store
#[derive(Debug)]
pub struct FileConsentStore {
    base_dir: PathBuf,
    // Serializes read-compare-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileConsentStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await.map_err(|e| {
            Error::Config(format!(
                "Failed to create consent directory {}: {e}",
                base_dir.display()
            ))
        })?;

        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the consent files
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, id: ConsentId) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    /// Write a record as-is, replacing any stored version
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub async fn save(&self, record: &ConsentRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(record).await
    }

    async fn read(&self, id: ConsentId) -> Result<ConsentRecord> {
        let path = self.record_path(id);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("consent {id}")));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content).map_err(|e| {
            Error::Internal(format!("Corrupt consent file {}: {e}", path.display()))
        })
    }

    async fn write(&self, record: &ConsentRecord) -> Result<()> {
        let path = self.record_path(record.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(record)?;

        fs::write(&tmp, content).await?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp, &path).await?;
        debug!(consent_id = record.id, path = %path.display(), "Consent written");
        Ok(())
    }
}

#[async_trait]
impl ConsentStore for FileConsentStore {
    async fn load(&self, id: ConsentId) -> Result<ConsentRecord> {
        self.read(id).await
    }

    async fn update_tokens(&self, update: TokenUpdate) -> Result<ConsentRecord> {
        let _guard = self.write_lock.lock().await;

        let mut record = self.read(update.consent_id).await?;
        record.apply(&update)?;
        self.write(&record).await?;

        info!(
            consent_id = record.id,
            version = record.version,
            "Saved consent tokens"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::tests::{sample_consent, sample_update};

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConsentStore::open(dir.path().join("consents"))
            .await
            .unwrap();

        let consent = sample_consent(42);
        store.save(&consent).await.unwrap();

        assert_eq!(store.load(42).await.unwrap(), consent);
        assert!(store.base_dir().join("42.json").exists());
        assert!(!store.base_dir().join("42.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_consent_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConsentStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.load(1).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn update_is_fenced_on_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConsentStore::open(dir.path()).await.unwrap();
        store.save(&sample_consent(1)).await.unwrap();

        let consent = store.load(1).await.unwrap();
        let updated = store.update_tokens(sample_update(&consent)).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(store.load(1).await.unwrap().access_token.as_deref(), Some("at-1"));

        let err = store
            .update_tokens(sample_update(&consent))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.load(1).await.unwrap().version, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn consent_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileConsentStore::open(dir.path()).await.unwrap();
        store.save(&sample_consent(3)).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("3.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConsentStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("5.json"), b"{not json").unwrap();

        assert!(matches!(store.load(5).await, Err(Error::Internal(_))));
    }
}
