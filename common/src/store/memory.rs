//! In-memory rendition of the persistent store, with the same
//! compare-and-swap semantics as the etcd implementation. Backs the scenario
//! tests, which exercise concurrent claims against it.

use crate::store::definitions::{
    key_prefix_obj, CasOutcome, ObjectKey, SerialiseValue, StorableObject, StorableObjectType,
    Store, StoreError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::ResultExt;
use std::{collections::BTreeMap, sync::Arc};

/// Store implementation holding every entry in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryStore({} entries)", self.entries.lock().len())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn to_value<O: StorableObject>(object: &O) -> Result<Value, StoreError> {
        serde_json::to_value(object).context(SerialiseValue)
    }

    fn from_value<O: StorableObject>(key: &str, value: &Value) -> Result<O, StoreError> {
        serde_json::from_value(value.clone()).map_err(|source| StoreError::DeserialiseValue {
            value: format!("{}: {}", key, value),
            source,
        })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_obj<O: StorableObject>(&self, object: &O) -> Result<(), StoreError> {
        let value = Self::to_value(object)?;
        self.entries.lock().insert(object.key().key(), value);
        Ok(())
    }

    async fn get_obj<O: StorableObject>(&self, key: &O::Key) -> Result<O, StoreError> {
        let key = key.key();
        let entries = self.entries.lock();
        match entries.get(&key) {
            Some(value) => Self::from_value(&key, value),
            None => Err(StoreError::MissingEntry { key }),
        }
    }

    async fn delete_obj<K: ObjectKey>(&self, key: &K) -> Result<(), StoreError> {
        self.entries.lock().remove(&key.key());
        Ok(())
    }

    async fn get_prefix<O: StorableObject>(
        &self,
        obj_type: StorableObjectType,
    ) -> Result<Vec<O>, StoreError> {
        let prefix = key_prefix_obj(obj_type);
        let entries = self.entries.lock();
        entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| Self::from_value(key, value))
            .collect()
    }

    async fn compare_and_put<O: StorableObject>(
        &self,
        observed: &O,
        updated: &O,
    ) -> Result<CasOutcome, StoreError> {
        let key = observed.key().key();
        let observed_value = Self::to_value(observed)?;
        let updated_value = Self::to_value(updated)?;
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(current) if current == &observed_value => {
                entries.insert(key, updated_value);
                Ok(CasOutcome::Committed)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn create_if_absent<O: StorableObject>(
        &self,
        object: &O,
    ) -> Result<CasOutcome, StoreError> {
        let key = object.key().key();
        let value = Self::to_value(object)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            Ok(CasOutcome::Conflict)
        } else {
            entries.insert(key, value);
            Ok(CasOutcome::Committed)
        }
    }

    async fn online(&self) -> bool {
        true
    }
}
