use crate::store::definitions::{
    key_prefix_obj, CasOutcome, Connect, Delete, DeserialiseValue, Get, GetPrefix, ObjectKey, Put,
    SerialiseValue, StorableObject, StorableObjectType, Store, StoreError,
    StoreError::MissingEntry, Txn as TxnError,
};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use snafu::ResultExt;

/// etcd client
#[derive(Clone)]
pub struct Etcd {
    client: Client,
}

impl std::fmt::Debug for Etcd {
    fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Ok(())
    }
}

impl Etcd {
    /// Create a new instance of the etcd client
    pub async fn new(endpoint: &str) -> Result<Etcd, StoreError> {
        Ok(Self::from(
            &Client::connect([endpoint], None).await.context(Connect {})?,
        ))
    }

    /// Create `Etcd` from an existing instance of the etcd `Client`
    pub(crate) fn from(client: &Client) -> Etcd {
        Etcd {
            client: client.clone(),
        }
    }
}

#[async_trait]
impl Store for Etcd {
    async fn put_obj<O: StorableObject>(&self, object: &O) -> Result<(), StoreError> {
        let key = object.key().key();
        let vec_value = serde_json::to_vec(object).context(SerialiseValue)?;
        let mut client = self.client.clone();
        client
            .put(key.clone(), vec_value, None)
            .await
            .context(Put { key })?;
        Ok(())
    }

    async fn get_obj<O: StorableObject>(&self, key: &O::Key) -> Result<O, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(key.key(), None)
            .await
            .context(Get { key: key.key() })?;
        match resp.kvs().first() {
            Some(kv) => Ok(
                serde_json::from_slice(kv.value()).context(DeserialiseValue {
                    value: String::from_utf8_lossy(kv.value()).to_string(),
                })?,
            ),
            None => Err(MissingEntry { key: key.key() }),
        }
    }

    async fn delete_obj<K: ObjectKey>(&self, key: &K) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client
            .delete(key.key(), None)
            .await
            .context(Delete { key: key.key() })?;
        Ok(())
    }

    async fn get_prefix<O: StorableObject>(
        &self,
        obj_type: StorableObjectType,
    ) -> Result<Vec<O>, StoreError> {
        let prefix = key_prefix_obj(obj_type);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .context(GetPrefix {
                prefix: prefix.clone(),
            })?;
        let mut objects = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<O>(kv.value()) {
                Ok(object) => objects.push(object),
                // a corrupt row must not take down a whole reconciler pass
                Err(error) => tracing::warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    %error,
                    "Failed to deserialise store entry, skipping it"
                ),
            }
        }
        Ok(objects)
    }

    async fn compare_and_put<O: StorableObject>(
        &self,
        observed: &O,
        updated: &O,
    ) -> Result<CasOutcome, StoreError> {
        let key = observed.key().key();
        let observed_value = serde_json::to_vec(observed).context(SerialiseValue)?;
        let updated_value = serde_json::to_vec(updated).context(SerialiseValue)?;
        let cmp = Compare::value(key.as_str(), CompareOp::Equal, observed_value);
        let put = TxnOp::put(key.as_str(), updated_value, None);
        let mut client = self.client.clone();
        let resp = client
            .txn(Txn::new().when([cmp]).and_then([put]))
            .await
            .context(TxnError { key: key.clone() })?;
        if resp.succeeded() {
            Ok(CasOutcome::Committed)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn create_if_absent<O: StorableObject>(
        &self,
        object: &O,
    ) -> Result<CasOutcome, StoreError> {
        let key = object.key().key();
        let value = serde_json::to_vec(object).context(SerialiseValue)?;
        // a key which has never been written has create revision 0
        let cmp = Compare::create_revision(key.as_str(), CompareOp::Equal, 0);
        let put = TxnOp::put(key.as_str(), value, None);
        let mut client = self.client.clone();
        let resp = client
            .txn(Txn::new().when([cmp]).and_then([put]))
            .await
            .context(TxnError { key: key.clone() })?;
        if resp.succeeded() {
            Ok(CasOutcome::Committed)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn online(&self) -> bool {
        let mut client = self.client.clone();
        client.status().await.is_ok()
    }
}
