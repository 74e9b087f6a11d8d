//! Durable, crash-resilient persistence of the [`ConfigDocument`].

mod autosave;
mod crypto;

pub use autosave::{AutoSaver, SaveFn};
pub use crypto::SecretCipher;

use crate::config::{ConfigDocument, Secret};
use crate::error::{Result, ServiceError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// Owns the in-memory document and its on-disk copy.
///
/// Readers share the document lock; disk writes are queued on a separate
/// mutex so they land in the order they were requested.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    doc: RwLock<ConfigDocument>,
    write: Mutex<()>,
    cipher: SecretCipher,
}

impl ConfigStore {
    /// Open the store at `path`, loading whatever can be recovered.
    pub async fn open(path: impl Into<PathBuf>, cipher: SecretCipher) -> Self {
        let store = Self {
            path: path.into(),
            doc: RwLock::new(ConfigDocument::default()),
            write: Mutex::new(()),
            cipher,
        };
        let loaded = store.load().await;
        *store.doc.write().await = loaded;
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, crate::settings::BACKUP_SUFFIX)
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    /// Read the primary file, then the backup, then fall back to an empty document.
    /// Never fails: a corrupt configuration must not stop the application.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> ConfigDocument {
        match self.read_document(&self.path).await {
            Ok(doc) => return doc,
            Err(e) => tracing::warn!(error = %e, "primary config unreadable"),
        }
        let backup = self.backup_path();
        match self.read_document(&backup).await {
            Ok(doc) => {
                tracing::warn!(backup = %backup.display(), "loaded configuration from backup");
                doc
            }
            Err(e) => {
                tracing::warn!(error = %e, "backup config unreadable, starting fresh");
                ConfigDocument::default()
            }
        }
    }

    async fn read_document(&self, path: &Path) -> Result<ConfigDocument> {
        let data = tokio::fs::read(path).await?;
        let mut doc: ConfigDocument = serde_json::from_slice(&data)?;
        self.decrypt_secrets(&mut doc);
        Ok(doc)
    }

    /// Write `doc` atomically (temp file + rename), keeping the previous valid
    /// file as a backup, and make it the in-memory document.
    #[instrument(skip(self, doc), fields(services = doc.services.len()))]
    pub async fn save(&self, doc: &ConfigDocument) -> Result<()> {
        let _guard = self.write.lock().await;
        *self.doc.write().await = doc.clone();
        self.write_to_disk(doc).await
    }

    /// Save the current in-memory document, retrying once on failure.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.write.lock().await;
        let doc = self.snapshot().await;
        if let Err(first) = self.write_to_disk(&doc).await {
            tracing::warn!(error = %first, "config save failed, retrying");
            self.write_to_disk(&doc).await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> ConfigDocument {
        self.doc.read().await.clone()
    }

    /// Mutate the in-memory document. Does not touch disk.
    pub async fn update<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut ConfigDocument) -> T,
    {
        let mut doc = self.doc.write().await;
        f(&mut doc)
    }

    async fn write_to_disk(&self, doc: &ConfigDocument) -> Result<()> {
        let data = self.encode(doc)?;
        let persist_err =
            |what: &str, e: std::io::Error| ServiceError::PersistenceError(format!("{what}: {e}"));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persist_err("create config dir", e))?;
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| persist_err("create temp file", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| persist_err("write temp file", e))?;
        file.sync_all()
            .await
            .map_err(|e| persist_err("sync temp file", e))?;
        drop(file);

        // only a parseable primary is worth keeping as the backup
        if let Ok(previous) = tokio::fs::read(&self.path).await {
            if serde_json::from_slice::<ConfigDocument>(&previous).is_ok() {
                if let Err(e) = tokio::fs::write(self.backup_path(), &previous).await {
                    tracing::warn!(error = %e, "failed to refresh config backup");
                }
            }
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| persist_err("replace config file", e))?;
        tracing::debug!("configuration saved");
        Ok(())
    }

    fn encode(&self, doc: &ConfigDocument) -> Result<Vec<u8>> {
        let mut on_disk = doc.clone();
        for service in &mut on_disk.services {
            if let Some(auth) = service.auth.as_mut() {
                auth.secret = Secret::new(self.cipher.encrypt(auth.secret.expose())?);
            }
        }
        Ok(serde_json::to_vec_pretty(&on_disk)?)
    }

    fn decrypt_secrets(&self, doc: &mut ConfigDocument) {
        for service in &mut doc.services {
            let Some(auth) = service.auth.as_mut() else {
                continue;
            };
            match self.cipher.decrypt(auth.secret.expose()) {
                Ok(plain) => auth.secret = Secret::new(plain),
                Err(e) => {
                    tracing::warn!(
                        service_id = %service.id,
                        error = %e,
                        "stored secret cannot be decrypted, dropping auth"
                    );
                    service.auth = None;
                }
            }
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceConfig, ServiceDefinition, ServiceId, SessionState};
    use tempfile::TempDir;

    fn cipher() -> SecretCipher {
        SecretCipher::from_material(b"test-machine").unwrap()
    }

    fn sample() -> ConfigDocument {
        let def = ServiceDefinition::new("docs", "/srv/docs").with_auth("admin", "hunter2");
        let mut doc = ConfigDocument::default();
        doc.services
            .push(ServiceConfig::from_definition(ServiceId::from("a"), def, 5001));
        doc.session = SessionState {
            running: vec![ServiceId::from("a")],
            ..Default::default()
        };
        doc
    }

    #[tokio::test]
    async fn round_trip_with_services() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), cipher()).await;
        let doc = sample();
        store.save(&doc).await.unwrap();
        assert_eq!(store.load().await, doc);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("hunter2"));
    }

    #[tokio::test]
    async fn round_trip_empty_document() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), cipher()).await;
        let doc = ConfigDocument::default();
        store.save(&doc).await.unwrap();
        assert_eq!(store.load().await, doc);
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), cipher()).await;
        let first = sample();
        store.save(&first).await.unwrap();
        let mut second = first.clone();
        second.services.clear();
        store.save(&second).await.unwrap();

        let raw = std::fs::read(store.path()).unwrap();
        std::fs::write(store.path(), &raw[..raw.len() / 2]).unwrap();

        assert_eq!(store.load().await, first);
    }

    #[tokio::test]
    async fn missing_everything_yields_default() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), cipher()).await;
        std::fs::write(store.path(), b"{ nope").unwrap();
        assert_eq!(store.load().await, ConfigDocument::default());
    }

    #[tokio::test]
    async fn plaintext_secret_is_accepted_and_foreign_secret_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        let mut doc = sample();
        doc.services.push(doc.services[0].clone());
        doc.services[1].id = ServiceId::from("b");
        doc.services[1].name = "other".into();
        doc.services[1].auth.as_mut().unwrap().secret =
            Secret::new(SecretCipher::from_material(b"elsewhere").unwrap().encrypt("x").unwrap());
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let store = ConfigStore::open(&path, cipher()).await;
        let loaded = store.snapshot().await;
        assert_eq!(loaded.services[0].auth.as_ref().unwrap().secret.expose(), "hunter2");
        assert!(loaded.services[1].auth.is_none());
    }

    #[tokio::test]
    async fn update_then_persist() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), cipher()).await;
        store
            .update(|doc| doc.app_state.0 = serde_json::json!({"theme": "dark"}))
            .await;
        store.persist().await.unwrap();
        assert_eq!(store.load().await.app_state.0["theme"], "dark");
    }

    #[tokio::test]
    async fn unwritable_location_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let store = ConfigStore::open(blocker.join("cfg.json"), cipher()).await;
        let err = store.persist().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceError);
    }
}
