//! Snapshot persistence backends.

use crate::error::StoreError;
use crate::store::Collections;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Where committed store contents go.
pub enum Persistence {
    /// Memory-only; contents are lost on drop.
    None,
    /// Encrypted snapshot file.
    ///
    /// File format: [12 bytes nonce][ciphertext with auth tag]. The
    /// snapshot is rewritten in full after every committed write, via a
    /// temp file and an atomic rename.
    EncryptedFile { path: PathBuf, key: [u8; 32] },
}

impl Persistence {
    /// Load previously committed contents, or an empty map if none exist.
    pub(crate) fn load(&self) -> Result<Collections, StoreError> {
        match self {
            Persistence::None => Ok(Collections::new()),
            Persistence::EncryptedFile { path, key } => {
                if !path.exists() {
                    info!("no snapshot at {:?}, starting empty", path);
                    return Ok(Collections::new());
                }

                let data = fs::read(path)?;
                if data.len() < NONCE_SIZE {
                    warn!("snapshot file too short, starting empty");
                    return Ok(Collections::new());
                }

                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
                let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
                let plaintext = cipher.decrypt(nonce, &data[NONCE_SIZE..]).map_err(|_| {
                    StoreError::Encryption(
                        "failed to decrypt store snapshot (wrong key or corrupt file)".to_string(),
                    )
                })?;

                let collections: Collections = serde_json::from_slice(&plaintext)?;
                info!(
                    collections = collections.len(),
                    "loaded encrypted store snapshot from {:?}", path
                );
                Ok(collections)
            }
        }
    }

    /// Write committed contents out.
    pub(crate) fn persist(&self, collections: &Collections) -> Result<(), StoreError> {
        match self {
            Persistence::None => Ok(()),
            Persistence::EncryptedFile { path, key } => {
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

                let mut nonce_bytes = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);

                let plaintext = serde_json::to_vec(collections)?;
                let ciphertext = cipher.encrypt(nonce, plaintext.as_ref())?;

                let mut data = nonce_bytes.to_vec();
                data.extend(ciphertext);

                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }

                // Temp file + rename so a crash mid-write never clobbers
                // the last good snapshot.
                let temp_path = path.with_extension("tmp");
                fs::write(&temp_path, &data)?;
                fs::rename(&temp_path, path)?;

                debug!(bytes = data.len(), "persisted store snapshot to {:?}", path);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, StoreRead};

    const COLLECTION: &str = "TestCollection";

    fn snapshot_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("store.enc")
    }

    #[test]
    fn encrypted_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let key = [0x42u8; 32];

        let store = KeyValueStore::open(Persistence::EncryptedFile {
            path: snapshot_path(&dir),
            key,
        })
        .unwrap();
        store
            .write(|tx| -> Result<(), StoreError> { tx.set(COLLECTION, "number", &"+15551234567") })
            .unwrap();
        drop(store);

        let reopened = KeyValueStore::open(Persistence::EncryptedFile {
            path: snapshot_path(&dir),
            key,
        })
        .unwrap();
        let value: Option<String> = reopened.read(|tx| tx.get(COLLECTION, "number"));
        assert_eq!(value.as_deref(), Some("+15551234567"));
    }

    #[test]
    fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open(Persistence::EncryptedFile {
            path: snapshot_path(&dir),
            key: [0u8; 32],
        })
        .unwrap();
        assert!(store.read(|tx| !tx.contains(COLLECTION, "anything")));
    }

    #[test]
    fn wrong_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open(Persistence::EncryptedFile {
            path: snapshot_path(&dir),
            key: [0x42u8; 32],
        })
        .unwrap();
        store
            .write(|tx| -> Result<(), StoreError> { tx.set(COLLECTION, "key", &"secret") })
            .unwrap();
        drop(store);

        let result = KeyValueStore::open(Persistence::EncryptedFile {
            path: snapshot_path(&dir),
            key: [0x43u8; 32],
        });
        assert!(matches!(result, Err(StoreError::Encryption(_))));
    }

    #[test]
    fn tampered_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(&dir);
        let key = [0x42u8; 32];

        let store = KeyValueStore::open(Persistence::EncryptedFile {
            path: path.clone(),
            key,
        })
        .unwrap();
        store
            .write(|tx| -> Result<(), StoreError> { tx.set(COLLECTION, "key", &"secret") })
            .unwrap();
        drop(store);

        let mut data = fs::read(&path).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xFF;
        }
        fs::write(&path, &data).unwrap();

        let result = KeyValueStore::open(Persistence::EncryptedFile { path, key });
        assert!(matches!(result, Err(StoreError::Encryption(_))));
    }
}
