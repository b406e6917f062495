//! Secret store collaborator
//!
//! Holds the recovery phrase of each wallet. The engine reads it only to
//! derive keys and never writes it into any wallet row.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::StorageError;

pub trait SecretStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete_secret(&self, key: &str) -> Result<(), StorageError>;
}

/// Secret-store key for a wallet's recovery phrase
pub fn mnemonic_key(wallet_id: &str) -> String {
    format!("mnemonic.{}", wallet_id)
}

/// One file per secret under a dedicated directory
#[derive(Clone, Debug)]
pub struct FileSecretStore {
    base_path: PathBuf,
}

impl FileSecretStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn secret_path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.base_path.join(file_name)
    }
}

impl SecretStore for FileSecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.secret_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_path)?;
        fs::write(self.secret_path(key), value)?;
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), StorageError> {
        let path = self.secret_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Process-local secret store for embedding and tests
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.secrets.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), StorageError> {
        self.secrets.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }
}
