//! Definition of the persistent store abstraction consumed by the control
//! plane. The conditional-write primitive (`compare_and_put`) is the pool's
//! synchronization mechanism: its return type distinguishes a lost race
//! (`CasOutcome::Conflict`) from an I/O failure (`StoreError`).

use crate::KEY_PREFIX;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;

/// Error type returned by the store.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum StoreError {
    /// Failed to connect to the store.
    #[snafu(display("Failed to connect to the store: {}", source))]
    Connect { source: etcd_client::Error },
    /// Failed to 'put' an entry in the store.
    #[snafu(display("Failed to 'put' entry with key '{}'. Error: {}", key, source))]
    Put {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to 'get' an entry from the store.
    #[snafu(display("Failed to 'get' entry with key '{}'. Error: {}", key, source))]
    Get {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to find an entry with the given key.
    #[snafu(display("Entry with key '{}' not found.", key))]
    MissingEntry { key: String },
    /// Failed to 'delete' an entry from the store.
    #[snafu(display("Failed to 'delete' entry with key '{}'. Error: {}", key, source))]
    Delete {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to 'get' entries with the given prefix.
    #[snafu(display("Failed to 'get' entries with prefix '{}'. Error: {}", prefix, source))]
    GetPrefix {
        prefix: String,
        source: etcd_client::Error,
    },
    /// Failed to run a transaction against the store.
    #[snafu(display("Transaction on key '{}' failed. Error: {}", key, source))]
    Txn {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to serialise value.
    #[snafu(display("Failed to serialise value. Error: {}", source))]
    SerialiseValue { source: serde_json::Error },
    /// Failed to deserialise value.
    #[snafu(display("Failed to deserialise value {}. Error: {}", value, source))]
    DeserialiseValue {
        value: String,
        source: serde_json::Error,
    },
}

/// Outcome of a conditional write. `Conflict` is the expected result of a
/// lost allocation race and is not an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CasOutcome {
    /// The predicate held and the write was committed.
    Committed,
    /// The predicate did not hold; nothing was written.
    Conflict,
}

impl CasOutcome {
    /// Whether the write was committed.
    pub fn committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Types of objects which are storable in the persistent store.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StorableObjectType {
    Session,
    Instance,
    Usage,
    Subscriber,
}

impl StorableObjectType {
    /// Path segment under which objects of this type are keyed.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Session => "sessions",
            Self::Instance => "instances",
            Self::Usage => "usage",
            Self::Subscriber => "subscribers",
        }
    }
}

/// Returns the full store prefix for objects of the given type.
pub fn key_prefix_obj(obj_type: StorableObjectType) -> String {
    format!("{}/{}/", KEY_PREFIX, obj_type.key_prefix())
}

/// Trait defining the key of a storable object.
pub trait ObjectKey: Sync + Send {
    fn key_type(&self) -> StorableObjectType;
    fn key_uuid(&self) -> String;
    fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            KEY_PREFIX,
            self.key_type().key_prefix(),
            self.key_uuid()
        )
    }
}

/// Trait defining a storable object.
pub trait StorableObject: Serialize + DeserializeOwned + Sync + Send {
    type Key: ObjectKey;

    fn key(&self) -> Self::Key;
}

/// Trait defining the operations the control plane requires from the
/// persistent store.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Put the given object, unconditionally.
    async fn put_obj<O: StorableObject>(&self, object: &O) -> Result<(), StoreError>;

    /// Get the object with the given key, failing with `MissingEntry` when it
    /// does not exist.
    async fn get_obj<O: StorableObject>(&self, key: &O::Key) -> Result<O, StoreError>;

    /// Get the object with the given key, `None` when it does not exist.
    async fn find_obj<O: StorableObject>(&self, key: &O::Key) -> Result<Option<O>, StoreError> {
        match self.get_obj(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::MissingEntry { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Delete the object with the given key. Deleting a missing key is not an
    /// error.
    async fn delete_obj<K: ObjectKey>(&self, key: &K) -> Result<(), StoreError>;

    /// Retrieve all objects of the given type.
    async fn get_prefix<O: StorableObject>(
        &self,
        obj_type: StorableObjectType,
    ) -> Result<Vec<O>, StoreError>;

    /// Replace `observed` with `updated` only if the stored value still equals
    /// `observed`. This is the claim primitive: concurrent writers race and
    /// exactly one commits.
    async fn compare_and_put<O: StorableObject>(
        &self,
        observed: &O,
        updated: &O,
    ) -> Result<CasOutcome, StoreError>;

    /// Write the object only if no entry exists under its key.
    async fn create_if_absent<O: StorableObject>(
        &self,
        object: &O,
    ) -> Result<CasOutcome, StoreError>;

    /// Whether the store is reachable.
    async fn online(&self) -> bool;
}
