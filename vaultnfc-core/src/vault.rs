//! Collaborators the transfer mechanism hands records to: a credential store
//! and the password cipher.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::record::CredentialRecord;

/// Persistence for credential records.
pub trait CredentialStore: Send + Sync + 'static {
    /// Inserts or replaces a record and returns its id.  A record with an
    /// empty id is assigned a fresh one.
    fn save(&self, record: CredentialRecord) -> impl Future<Output = Result<String>> + Send + '_;

    /// Removes the record with the given id.  Removing an unknown id is not
    /// an error.
    fn delete<'a>(&'a self, id: &'a str) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Returns every stored record in insertion order.
    fn list(&self) -> impl Future<Output = Result<Vec<CredentialRecord>>> + Send + '_;
}

fn assign_id(record: &mut CredentialRecord) {
    if record.id.is_empty() {
        record.id = uuid::Uuid::new_v4().to_string();
    }
}

fn upsert(records: &mut Vec<CredentialRecord>, mut record: CredentialRecord) -> String {
    assign_id(&mut record);
    let id = record.id.clone();
    match records.iter_mut().find(|r| r.id == id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
    id
}

/// Process-local store, mainly for tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<CredentialRecord>>,
}

impl MemoryStore {
    fn with_records<T>(&self, f: impl FnOnce(&mut Vec<CredentialRecord>) -> T) -> Result<T> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("credential store lock poisoned"))?;
        Ok(f(&mut records))
    }
}

impl CredentialStore for MemoryStore {
    async fn save(&self, record: CredentialRecord) -> Result<String> {
        self.with_records(|records| upsert(records, record))
    }

    async fn delete<'a>(&'a self, id: &'a str) -> Result<()> {
        self.with_records(|records| records.retain(|r| r.id != id))
    }

    async fn list(&self) -> Result<Vec<CredentialRecord>> {
        self.with_records(|records| records.clone())
    }
}

/// Store backed by a JSON array in a single file.
///
/// Every operation reads and rewrites the whole file.  Writes go to a
/// sibling temp file first and are renamed into place.
pub struct FileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<CredentialRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt vault file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read vault file {}", self.path.display()))
            }
        }
    }

    async fn store(&self, records: &[CredentialRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records).context("failed to serialize vault")?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = records.len(), "Vault written");
        Ok(())
    }
}

impl CredentialStore for FileStore {
    async fn save(&self, record: CredentialRecord) -> Result<String> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let id = upsert(&mut records, record);
        self.store(&records).await?;
        Ok(id)
    }

    async fn delete<'a>(&'a self, id: &'a str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() != before {
            self.store(&records).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CredentialRecord>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }
}

/// Output of [`Cipher::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
}

/// Password encryption applied before a record is stored or shared.
///
/// The algorithm is deliberately left to the implementor.
pub trait Cipher: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the implementation cannot seal the plaintext.
    fn encrypt(&self, plaintext: &str) -> Result<Sealed>;

    /// # Errors
    ///
    /// Returns an error if the ciphertext cannot be opened with `key`.
    fn decrypt(&self, ciphertext: &str, iv: &str, key: &str) -> Result<String>;
}

/// Placeholder cipher: returns the plaintext unchanged with an empty IV.
///
/// Provides no confidentiality whatsoever.
pub struct PassThroughCipher;

impl Cipher for PassThroughCipher {
    fn encrypt(&self, plaintext: &str) -> Result<Sealed> {
        Ok(Sealed {
            ciphertext: plaintext.to_owned(),
            iv: String::new(),
        })
    }

    fn decrypt(&self, ciphertext: &str, _iv: &str, _key: &str) -> Result<String> {
        Ok(ciphertext.to_owned())
    }
}
