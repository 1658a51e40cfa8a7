//! In-memory reference backend: two maps keyed by message id, one for
//! envelopes and one for queue metadata. Intended for testing and
//! transient deployments; everything is lost on restart.

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::SystemTime,
};

use ahash::AHashMap;
use async_trait::async_trait;
use mailway_common::Envelope;
use ulid::Ulid;

use crate::{
    error::{SpoolError, SpoolResult},
    store::QueueStorage,
};

#[derive(Debug, Clone)]
struct MetaEntry {
    timestamp: SystemTime,
    attempts: u32,
    delivered_indexes: Vec<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    envelopes: AHashMap<String, Envelope>,
    meta: AHashMap<String, MetaEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStorage for MemoryStorage {
    async fn write(&self, envelope: &Envelope, timestamp: SystemTime) -> SpoolResult<String> {
        let mut inner = self.write_lock();
        loop {
            let id = Ulid::new().to_string();
            if inner.envelopes.contains_key(&id) {
                continue;
            }
            inner.envelopes.insert(id.clone(), envelope.clone());
            inner.meta.insert(
                id.clone(),
                MetaEntry {
                    timestamp,
                    attempts: 0,
                    delivered_indexes: Vec::new(),
                },
            );
            tracing::debug!(target: "mailway", id, "queue storage write");
            return Ok(id);
        }
    }

    async fn set_timestamp(&self, id: &str, timestamp: SystemTime) -> SpoolResult<()> {
        let mut inner = self.write_lock();
        let meta = inner
            .meta
            .get_mut(id)
            .ok_or_else(|| SpoolError::NotFound(id.to_owned()))?;
        meta.timestamp = timestamp;
        Ok(())
    }

    async fn increment_attempts(&self, id: &str) -> SpoolResult<u32> {
        let mut inner = self.write_lock();
        let meta = inner
            .meta
            .get_mut(id)
            .ok_or_else(|| SpoolError::NotFound(id.to_owned()))?;
        meta.attempts += 1;
        Ok(meta.attempts)
    }

    async fn set_recipients_delivered(&self, id: &str, indexes: &[usize]) -> SpoolResult<()> {
        let mut inner = self.write_lock();

        let envelope = inner
            .envelopes
            .get_mut(id)
            .ok_or_else(|| SpoolError::NotFound(id.to_owned()))?;

        let mut sorted: Vec<usize> = indexes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for &index in sorted.iter().rev() {
            if index < envelope.recipients.len() {
                envelope.recipients.remove(index);
            }
        }

        let meta = inner
            .meta
            .get_mut(id)
            .ok_or_else(|| SpoolError::NotFound(id.to_owned()))?;
        meta.delivered_indexes.extend_from_slice(&sorted);
        Ok(())
    }

    async fn load(&self) -> SpoolResult<Vec<(SystemTime, String)>> {
        Ok(self
            .read()
            .meta
            .iter()
            .map(|(id, meta)| (meta.timestamp, id.clone()))
            .collect())
    }

    async fn get(&self, id: &str) -> SpoolResult<(Envelope, u32)> {
        let inner = self.read();
        let envelope = inner
            .envelopes
            .get(id)
            .ok_or_else(|| SpoolError::NotFound(id.to_owned()))?;
        let meta = inner
            .meta
            .get(id)
            .ok_or_else(|| SpoolError::NotFound(id.to_owned()))?;
        Ok((envelope.clone(), meta.attempts))
    }

    async fn remove(&self, id: &str) -> SpoolResult<()> {
        let mut inner = self.write_lock();
        inner.envelopes.remove(id);
        inner.meta.remove(id);
        tracing::debug!(target: "mailway", id, "queue storage remove");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope(recipients: &[&str]) -> Envelope {
        let mut env = Envelope::new("sender@example.com");
        env.recipients = recipients.iter().map(|r| (*r).to_owned()).collect();
        env.message = b"body\r\n".to_vec();
        env
    }

    #[tokio::test]
    async fn write_get_round_trip() {
        let store = MemoryStorage::new();
        let env = envelope(&["a@example.com"]);
        let now = SystemTime::now();

        let id = store.write(&env, now).await.unwrap();
        let (loaded, attempts) = store.get(&id).await.unwrap();

        assert_eq!(loaded, env);
        assert_eq!(attempts, 0);
    }

    #[tokio::test]
    async fn attempts_count_increments() {
        let store = MemoryStorage::new();
        let id = store
            .write(&envelope(&["a@example.com"]), SystemTime::now())
            .await
            .unwrap();

        for expected in 1..=3 {
            assert_eq!(store.increment_attempts(&id).await.unwrap(), expected);
        }
        let (_, attempts) = store.get(&id).await.unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn delivered_recipients_are_removed_on_get() {
        let store = MemoryStorage::new();
        let id = store
            .write(
                &envelope(&["a@example.com", "b@example.com", "c@example.com"]),
                SystemTime::now(),
            )
            .await
            .unwrap();

        store.set_recipients_delivered(&id, &[0, 2]).await.unwrap();

        let (loaded, _) = store.get(&id).await.unwrap();
        assert_eq!(loaded.recipients, vec!["b@example.com".to_string()]);
    }

    #[tokio::test]
    async fn load_yields_all_entries() {
        let store = MemoryStorage::new();
        let t1 = SystemTime::now();
        let t2 = t1 + std::time::Duration::from_secs(60);

        let id1 = store.write(&envelope(&["a@example.com"]), t1).await.unwrap();
        let id2 = store.write(&envelope(&["b@example.com"]), t2).await.unwrap();

        let mut entries = store.load().await.unwrap();
        entries.sort_by_key(|(timestamp, _)| *timestamp);
        assert_eq!(entries, vec![(t1, id1), (t2, id2)]);
    }

    #[tokio::test]
    async fn remove_deletes_both_maps() {
        let store = MemoryStorage::new();
        let id = store
            .write(&envelope(&["a@example.com"]), SystemTime::now())
            .await
            .unwrap();

        store.remove(&id).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.get(&id).await,
            Err(SpoolError::NotFound(_))
        ));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let store = MemoryStorage::new();
        assert!(matches!(
            store.increment_attempts("missing").await,
            Err(SpoolError::NotFound(_))
        ));
        assert!(matches!(
            store.set_timestamp("missing", SystemTime::now()).await,
            Err(SpoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wait_is_unsupported() {
        let store = MemoryStorage::new();
        assert!(matches!(
            store.wait().await,
            Err(SpoolError::Unsupported("wait"))
        ));
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let store = MemoryStorage::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..64 {
            let id = store
                .write(&envelope(&["a@example.com"]), SystemTime::now())
                .await
                .unwrap();
            assert!(ids.insert(id));
        }
    }
}
