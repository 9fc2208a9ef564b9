//! Collection-scoped key-value store with transactional access.

use crate::error::StoreError;
use crate::persist::Persistence;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// The committed contents of the store: collection name -> key -> value.
pub(crate) type Collections = HashMap<String, HashMap<String, Value>>;

/// Read access shared by both transaction kinds, so loaders can run
/// inside either.
pub trait StoreRead {
    /// Raw value lookup.
    fn get_value(&self, collection: &str, key: &str) -> Option<Value>;

    /// Typed lookup. Values that fail to deserialize are treated as
    /// absent; stored key schemas do not change across versions.
    fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Option<T> {
        self.get_value(collection, key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn contains(&self, collection: &str, key: &str) -> bool {
        self.get_value(collection, key).is_some()
    }
}

/// A scoped read transaction over the committed store contents.
pub struct ReadTransaction<'a> {
    collections: RwLockReadGuard<'a, Collections>,
}

impl StoreRead for ReadTransaction<'_> {
    fn get_value(&self, collection: &str, key: &str) -> Option<Value> {
        self.collections
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned()
    }
}

/// A scoped write transaction.
///
/// All mutations happen on a working copy of the store; the copy replaces
/// the committed contents in one step when the transaction's block returns
/// `Ok`. Readers therefore never observe a mix of old and new values.
pub struct WriteTransaction {
    working: Collections,
    commit_effects: Vec<Box<dyn FnOnce() + Send>>,
    completions: Vec<Box<dyn FnOnce() + Send>>,
}

impl StoreRead for WriteTransaction {
    fn get_value(&self, collection: &str, key: &str) -> Option<Value> {
        self.working
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned()
    }
}

impl WriteTransaction {
    /// Stage a typed value.
    pub fn set<T: Serialize>(
        &mut self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.working
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Stage removal of a key. Removing an absent key is a no-op.
    pub fn remove(&mut self, collection: &str, key: &str) {
        if let Some(c) = self.working.get_mut(collection) {
            c.remove(key);
        }
    }

    /// Stage removal of an entire collection.
    pub fn remove_collection(&mut self, collection: &str) {
        self.working.remove(collection);
    }

    /// Register a closure to run at commit, while the exclusive section is
    /// still held. Anything a commit effect publishes into other state is
    /// therefore visible to readers the moment they unblock, and nothing
    /// runs if the transaction rolls back.
    pub fn add_commit_effect(&mut self, effect: impl FnOnce() + Send + 'static) {
        self.commit_effects.push(Box::new(effect));
    }

    /// Register a closure to run after this transaction commits and the
    /// exclusive section has ended. Completions are dropped on rollback.
    pub fn add_completion(&mut self, completion: impl FnOnce() + Send + 'static) {
        self.completions.push(Box::new(completion));
    }
}

struct Inner {
    collections: RwLock<Collections>,
    persistence: Persistence,
}

/// Durable key-value store with exclusive-writer transactions.
#[derive(Clone)]
pub struct KeyValueStore {
    inner: Arc<Inner>,
}

impl KeyValueStore {
    /// Create a memory-only store.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(Collections::new()),
                persistence: Persistence::None,
            }),
        }
    }

    /// Open a store with the given persistence backend, loading any
    /// previously committed contents.
    pub fn open(persistence: Persistence) -> Result<Self, StoreError> {
        let collections = persistence.load()?;
        Ok(Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(collections),
                persistence,
            }),
        })
    }

    /// Run a read transaction.
    pub fn read<R>(&self, block: impl FnOnce(&ReadTransaction<'_>) -> R) -> R {
        let tx = ReadTransaction {
            collections: read_lock(&self.inner.collections),
        };
        block(&tx)
    }

    /// Run a write transaction.
    ///
    /// The block's staged changes commit atomically when it returns `Ok`
    /// and are discarded when it returns `Err`. Once this method returns
    /// `Ok`, the changes are durable under the configured persistence
    /// backend. Commit effects run at commit under the exclusive lock;
    /// completions run after it is released. Neither runs on rollback.
    pub fn write<R, E>(
        &self,
        block: impl FnOnce(&mut WriteTransaction) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut guard = write_lock(&self.inner.collections);
        let mut tx = WriteTransaction {
            working: guard.clone(),
            commit_effects: Vec::new(),
            completions: Vec::new(),
        };

        let out = block(&mut tx)?;

        let WriteTransaction {
            working,
            commit_effects,
            completions,
        } = tx;

        self.inner.persistence.persist(&working).map_err(E::from)?;
        *guard = working;
        for effect in commit_effects {
            effect();
        }
        drop(guard);

        let count = completions.len();
        if count > 0 {
            debug!(completions = count, "running post-commit completions");
        }
        for completion in completions {
            completion();
        }

        Ok(out)
    }
}

// A poisoned lock means a writer panicked mid-block; the committed map is
// still the last committed state, so recover the guard.
fn read_lock(lock: &RwLock<Collections>) -> RwLockReadGuard<'_, Collections> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock(lock: &RwLock<Collections>) -> RwLockWriteGuard<'_, Collections> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const COLLECTION: &str = "TestCollection";

    #[test]
    fn write_then_read_round_trip() {
        let store = KeyValueStore::in_memory();

        store
            .write(|tx| -> Result<(), StoreError> {
                tx.set(COLLECTION, "number", &"+15551234567")?;
                tx.set(COLLECTION, "count", &3u32)?;
                Ok(())
            })
            .unwrap();

        let (number, count) = store.read(|tx| {
            (
                tx.get::<String>(COLLECTION, "number"),
                tx.get::<u32>(COLLECTION, "count"),
            )
        });
        assert_eq!(number.as_deref(), Some("+15551234567"));
        assert_eq!(count, Some(3));
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = KeyValueStore::in_memory();
        store
            .write(|tx| -> Result<(), StoreError> { tx.set(COLLECTION, "key", &"before") })
            .unwrap();

        let result: Result<(), StoreError> = store.write(|tx| {
            tx.set(COLLECTION, "key", &"after")?;
            tx.add_commit_effect(|| panic!("commit effect must not run on rollback"));
            tx.add_completion(|| panic!("completion must not run on rollback"));
            Err(StoreError::Encryption("simulated".into()))
        });
        assert!(result.is_err());

        let value: Option<String> = store.read(|tx| tx.get(COLLECTION, "key"));
        assert_eq!(value.as_deref(), Some("before"));
    }

    #[test]
    fn staged_writes_visible_within_transaction() {
        let store = KeyValueStore::in_memory();
        store
            .write(|tx| -> Result<(), StoreError> {
                tx.set(COLLECTION, "key", &42u32)?;
                assert_eq!(tx.get::<u32>(COLLECTION, "key"), Some(42));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn completions_run_after_commit() {
        let store = KeyValueStore::in_memory();
        let ran = Arc::new(AtomicBool::new(false));

        let inner = ran.clone();
        let observer = store.clone();
        store
            .write(move |tx| -> Result<(), StoreError> {
                tx.set(COLLECTION, "key", &1u32)?;
                tx.add_completion(move || {
                    // The commit is visible by the time completions run.
                    let committed: Option<u32> = observer.read(|tx| tx.get(COLLECTION, "key"));
                    assert_eq!(committed, Some(1));
                    inner.store(true, Ordering::SeqCst);
                });
                Ok(())
            })
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn commit_effects_run_before_completions() {
        let store = KeyValueStore::in_memory();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let effect_order = order.clone();
        let completion_order = order.clone();
        store
            .write(move |tx| -> Result<(), StoreError> {
                tx.set(COLLECTION, "key", &1u32)?;
                tx.add_commit_effect(move || effect_order.lock().unwrap().push("effect"));
                tx.add_completion(move || completion_order.lock().unwrap().push("completion"));
                Ok(())
            })
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["effect", "completion"]);
    }

    #[test]
    fn remove_is_persisted() {
        let store = KeyValueStore::in_memory();
        store
            .write(|tx| -> Result<(), StoreError> { tx.set(COLLECTION, "key", &"value") })
            .unwrap();
        store
            .write(|tx| -> Result<(), StoreError> {
                tx.remove(COLLECTION, "key");
                Ok(())
            })
            .unwrap();
        assert!(store.read(|tx| !tx.contains(COLLECTION, "key")));
    }
}
