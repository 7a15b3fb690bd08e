//! Keyspace fixtures.

use keyalloc_keyspace::{Compare, Op, Store, Txn};
use serde_json::json;

use crate::error::{TestingError, TestingResult};

/// Encoded Member value with the given `ItemLimit`.
pub fn member_value(item_limit: u32) -> String {
    json!({ "R": item_limit }).to_string()
}

/// Encoded Item value with the given `DesiredReplication`.
pub fn item_value(desired_replication: u32) -> String {
    json!({ "R": desired_replication }).to_string()
}

/// Create `kvs` in one transaction. Fails if any key already exists.
pub async fn insert(store: &dyn Store, kvs: &[(String, String)]) -> TestingResult<i64> {
    let mut txn = Txn::new();
    for (key, value) in kvs {
        txn = txn
            .when(Compare::ModRevision {
                key: key.clone(),
                revision: 0,
            })
            .then(Op::Put {
                key: key.clone(),
                value: value.as_bytes().to_vec(),
            });
    }
    commit(store, txn, kvs).await
}

/// Overwrite `kvs` in one transaction. Fails if any key is missing or
/// changes concurrently.
pub async fn update(store: &dyn Store, kvs: &[(String, String)]) -> TestingResult<i64> {
    let mut txn = Txn::new();
    for (key, value) in kvs {
        let current = store
            .range(key, 0)
            .await?
            .kvs
            .into_iter()
            .find(|kv| &kv.key == key)
            .ok_or_else(|| TestingError::Missing(key.clone()))?;
        txn = txn
            .when(Compare::ModRevision {
                key: key.clone(),
                revision: current.mod_revision,
            })
            .then(Op::Put {
                key: key.clone(),
                value: value.as_bytes().to_vec(),
            });
    }
    commit(store, txn, kvs).await
}

/// Delete `keys` unconditionally, as an expiring lease or an operator would.
pub async fn remove(store: &dyn Store, keys: &[String]) -> TestingResult<i64> {
    let mut txn = Txn::new();
    for key in keys {
        txn = txn.then(Op::Delete { key: key.clone() });
    }
    Ok(store.txn(txn).await?.revision)
}

async fn commit(store: &dyn Store, txn: Txn, kvs: &[(String, String)]) -> TestingResult<i64> {
    let response = store.txn(txn).await?;
    if !response.succeeded {
        let keys: Vec<&str> = kvs.iter().map(|(k, _)| k.as_str()).collect();
        return Err(TestingError::Rejected(keys.join(", ")));
    }
    Ok(response.revision)
}

#[cfg(test)]
mod tests {
    use keyalloc_keyspace::MemStore;

    use super::*;

    fn kv(key: &str, value: &str) -> (String, String) {
        (key.to_string(), value.to_string())
    }

    #[test]
    fn test_values() {
        assert_eq!(member_value(1500), r#"{"R":1500}"#);
        assert_eq!(item_value(3), r#"{"R":3}"#);
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = MemStore::new();
        let revision = insert(&store, &[kv("/a/x", "1"), kv("/a/y", "2")]).await.unwrap();
        assert_eq!(revision, 1);

        assert!(matches!(
            insert(&store, &[kv("/a/x", "3")]).await.unwrap_err(),
            TestingError::Rejected(_)
        ));

        update(&store, &[kv("/a/x", "4")]).await.unwrap();
        assert_eq!(store.get("/a/x").unwrap().value, b"4".to_vec());

        assert!(matches!(
            update(&store, &[kv("/a/z", "5")]).await.unwrap_err(),
            TestingError::Missing(key) if key == "/a/z"
        ));
    }
}
