use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{InsertOutcome, RecordStore, StoreError};
use crate::types::EnrichedRecord;

/// Records kept in process memory, ordered by id.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, EnrichedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_if_absent(&self, record: &EnrichedRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        drop(records.insert(record.id.clone(), record.clone()));
        Ok(InsertOutcome::Inserted)
    }

    async fn scan(&self, limit: usize) -> Result<Vec<EnrichedRecord>, StoreError> {
        Ok(self.records.read().values().take(limit).cloned().collect())
    }

    async fn query_by_country(&self, country: &str) -> Result<Vec<EnrichedRecord>, StoreError> {
        let mut matching: Vec<EnrichedRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.country == country)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn get(&self, id: &str) -> Result<Option<EnrichedRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn record(id: &str, country: &str) -> EnrichedRecord {
        EnrichedRecord {
            id: id.to_owned(),
            raw: "+31 6 1234 5678".to_owned(),
            raw_digits: "31612345678".to_owned(),
            e164: None,
            country: country.to_owned(),
            is_target_mobile: false,
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_twice() {
        let store = MemoryStore::new();
        let first = record("r1", "NL");
        let mut second = record("r1", "BE");
        second.raw_digits = "32470000000".to_owned();

        assert_eq!(
            store.insert_if_absent(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&second).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("r1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_scan_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert_if_absent(&record(&format!("r{i}"), "NL"))
                .await
                .unwrap();
        }

        assert_eq!(store.scan(3).await.unwrap().len(), 3);
        assert_eq!(store.scan(100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_query_by_country() {
        let store = MemoryStore::new();
        store.insert_if_absent(&record("r1", "NL")).await.unwrap();
        store.insert_if_absent(&record("r2", "BE")).await.unwrap();
        store.insert_if_absent(&record("r3", "NL")).await.unwrap();

        let ids: Vec<String> = store
            .query_by_country("NL")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();

        assert_eq!(ids, vec!["r1", "r3"]);
        assert!(store.query_by_country("FR").await.unwrap().is_empty());
        assert_eq!(store.get("missing").await.unwrap(), None);
    }
}
