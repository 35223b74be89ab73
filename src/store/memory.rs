//! In-memory relay store: an append-only arena plus one index per lookup
//! direction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DatabaseError;
use crate::store::traits::{MessageKey, NewRelayRecord, RelayRecord, RelayStore};

#[derive(Default)]
struct Arena {
    records: Vec<RelayRecord>,
    by_source: HashMap<MessageKey, Vec<usize>>,
    by_target: HashMap<MessageKey, Vec<usize>>,
}

impl Arena {
    fn contains(&self, record: &NewRelayRecord) -> bool {
        self.by_source
            .get(&record.source)
            .is_some_and(|slots| slots.iter().any(|&i| self.records[i].target == record.target))
    }

    fn collect(&self, slots: Option<&Vec<usize>>) -> Vec<RelayRecord> {
        slots
            .map(|slots| slots.iter().map(|&i| self.records[i].clone()).collect())
            .unwrap_or_default()
    }
}

/// Process-local store, used by tests and when no database path is configured.
#[derive(Default)]
pub struct MemoryStore {
    arena: RwLock<Arena>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records held.
    pub async fn len(&self) -> usize {
        self.arena.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn find_by_source(&self, key: &MessageKey) -> Result<Vec<RelayRecord>, DatabaseError> {
        let arena = self.arena.read().await;
        Ok(arena.collect(arena.by_source.get(key)))
    }

    async fn find_by_target(&self, key: &MessageKey) -> Result<Vec<RelayRecord>, DatabaseError> {
        let arena = self.arena.read().await;
        Ok(arena.collect(arena.by_target.get(key)))
    }

    async fn upsert(&self, records: &[NewRelayRecord]) -> Result<usize, DatabaseError> {
        let mut arena = self.arena.write().await;
        let mut inserted = 0;
        for record in records {
            if arena.contains(record) {
                continue;
            }
            let slot = arena.records.len();
            arena.records.push(RelayRecord {
                record_id: slot as i64 + 1,
                source: record.source.clone(),
                target: record.target.clone(),
                created_at: Utc::now(),
            });
            arena
                .by_source
                .entry(record.source.clone())
                .or_default()
                .push(slot);
            arena
                .by_target
                .entry(record.target.clone())
                .or_default()
                .push(slot);
            inserted += 1;
        }
        debug!(inserted, total = arena.records.len(), "Relay records stored in memory");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(src: &str, tgt: &str) -> NewRelayRecord {
        NewRelayRecord {
            source: MessageKey::new(src, "s1", "c1"),
            target: MessageKey::new(tgt, "s2", "c2"),
        }
    }

    #[tokio::test]
    async fn lookup_in_both_directions() {
        let store = MemoryStore::new();
        store.upsert(&[record("m1", "t1")]).await.unwrap();

        let by_source = store
            .find_by_source(&MessageKey::new("m1", "s1", "c1"))
            .await
            .unwrap();
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].target.message_id, "t1");

        let by_target = store
            .find_by_target(&MessageKey::new("t1", "s2", "c2"))
            .await
            .unwrap();
        assert_eq!(by_target.len(), 1);
        assert_eq!(by_target[0].source.message_id, "m1");
    }

    #[tokio::test]
    async fn lookup_requires_matching_location() {
        let store = MemoryStore::new();
        store.upsert(&[record("m1", "t1")]).await.unwrap();
        let wrong_channel = store
            .find_by_source(&MessageKey::new("m1", "s1", "other"))
            .await
            .unwrap();
        assert!(wrong_channel.is_empty());
    }

    #[tokio::test]
    async fn upsert_ignores_duplicates() {
        let store = MemoryStore::new();
        assert_eq!(store.upsert(&[record("m1", "t1")]).await.unwrap(), 1);
        assert_eq!(
            store
                .upsert(&[record("m1", "t1"), record("m1", "t2")])
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn record_ids_ascend() {
        let store = MemoryStore::new();
        store
            .upsert(&[record("m1", "t1"), record("m1", "t2")])
            .await
            .unwrap();
        let rows = store
            .find_by_source(&MessageKey::new("m1", "s1", "c1"))
            .await
            .unwrap();
        assert!(rows[0].record_id < rows[1].record_id);
    }
}
