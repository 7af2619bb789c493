//! Encrypted payloads on top of a [`RecordStore`].
//!
//! The store never sees plaintext: payloads are serialized, passed through the
//! injected [`Cipher`] and stored as base64 strings. Metadata (id, version,
//! flags) stays in the clear, so sync and metadata indexes keep working.

use crate::{error::Result, Error, Query, Record, RecordId, RecordStore, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;

/// Symmetric encryption supplied by the platform.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// A [`RecordStore`] view that encrypts payloads at rest.
#[derive(Clone)]
pub struct SecureStore {
    inner: Arc<RecordStore>,
    cipher: Arc<dyn Cipher>,
}

impl SecureStore {
    pub fn new(inner: Arc<RecordStore>, cipher: Arc<dyn Cipher>) -> Self {
        Self { inner, cipher }
    }

    /// The underlying store, holding ciphertext.
    pub fn inner(&self) -> &Arc<RecordStore> {
        &self.inner
    }

    pub async fn create(&self, store: &str, record: Record) -> Result<RecordId> {
        let sealed = self.seal(record)?;
        self.inner.create(store, sealed).await
    }

    pub async fn read(&self, store: &str, id: &str) -> Result<Option<Record>> {
        match self.inner.read(store, id).await? {
            Some(record) => Ok(Some(self.open(record)?)),
            None => Ok(None),
        }
    }

    pub async fn update(&self, store: &str, record: Record) -> Result<Version> {
        let sealed = self.seal(record)?;
        self.inner.update(store, sealed).await
    }

    pub async fn delete(&self, store: &str, id: &str) -> Result<()> {
        self.inner.delete(store, id).await
    }

    /// Query and decrypt. Filters run against the stored ciphertext.
    pub async fn query(&self, store: &str, query: Query) -> Result<Vec<Record>> {
        self.inner
            .query(store, query)
            .await?
            .into_iter()
            .map(|record| self.open(record))
            .collect()
    }

    fn seal(&self, mut record: Record) -> Result<Record> {
        let plaintext = serde_json::to_vec(&record.data)?;
        let ciphertext = self.cipher.encrypt(&plaintext)?;
        record.data = serde_json::Value::String(STANDARD.encode(ciphertext));
        Ok(record)
    }

    fn open(&self, mut record: Record) -> Result<Record> {
        let encoded = record
            .data
            .as_str()
            .ok_or_else(|| Error::Crypto(format!("record {} is not encrypted", record.id)))?;
        let ciphertext = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("record {}: {e}", record.id)))?;
        let plaintext = self.cipher.decrypt(&ciphertext)?;
        record.data = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Crypto(format!("record {}: {e}", record.id)))?;
        Ok(record)
    }
}
