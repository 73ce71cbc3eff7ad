use async_trait::async_trait;
use sqlx::postgres::PgPool;

use super::{InsertOutcome, RecordStore, StoreError};
use crate::types::EnrichedRecord;

/// Records stored in a PostgreSQL table shaped like `phone_numbers`.
#[derive(Clone)]
pub struct PgStore {
    table: String,
    pool: PgPool,
}

impl PgStore {
    /// The table name is interpolated into queries, so only plain identifiers are accepted.
    pub fn new(table: &str, pool: PgPool) -> Result<Self, StoreError> {
        let is_identifier = table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !is_identifier {
            return Err(StoreError::InvalidTableName(table.to_owned()));
        }

        Ok(Self {
            table: table.to_owned(),
            pool,
        })
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_if_absent(&self, record: &EnrichedRecord) -> Result<InsertOutcome, StoreError> {
        let query = format!(
            r#"
INSERT INTO "{0}"
    (id, raw, raw_digits, e164, country, is_target_mobile, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (id) DO NOTHING
            "#,
            &self.table
        );

        let inserted = sqlx::query(&query)
            .bind(&record.id)
            .bind(&record.raw)
            .bind(&record.raw_digits)
            .bind(&record.e164)
            .bind(&record.country)
            .bind(record.is_target_mobile)
            .bind(record.created_at)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?
            .rows_affected();

        match inserted {
            0 => Ok(InsertOutcome::AlreadyExists),
            _ => Ok(InsertOutcome::Inserted),
        }
    }

    async fn scan(&self, limit: usize) -> Result<Vec<EnrichedRecord>, StoreError> {
        let query = format!(
            r#"
SELECT id, raw, raw_digits, e164, country, is_target_mobile, created_at
FROM "{0}"
LIMIT $1
            "#,
            &self.table
        );

        sqlx::query_as(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn query_by_country(&self, country: &str) -> Result<Vec<EnrichedRecord>, StoreError> {
        let query = format!(
            r#"
SELECT id, raw, raw_digits, e164, country, is_target_mobile, created_at
FROM "{0}"
WHERE country = $1
ORDER BY created_at
            "#,
            &self.table
        );

        sqlx::query_as(&query)
            .bind(country)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn get(&self, id: &str) -> Result<Option<EnrichedRecord>, StoreError> {
        let query = format!(
            r#"
SELECT id, raw, raw_digits, e164, country, is_target_mobile, created_at
FROM "{0}"
WHERE id = $1
            "#,
            &self.table
        );

        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
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
            e164: Some("+31612345678".to_owned()),
            country: country.to_owned(),
            is_target_mobile: country == "NL",
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_table_name_must_be_an_identifier() {
        // Validation happens before the pool is touched.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();

        assert!(PgStore::new("phone_numbers", pool.clone()).is_ok());
        assert!(matches!(
            PgStore::new("phone_numbers\"; DROP TABLE x; --", pool.clone()),
            Err(StoreError::InvalidTableName(_))
        ));
        assert!(PgStore::new("1numbers", pool).is_err());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_insert_if_absent_stores_once(db: PgPool) {
        let store = PgStore::new("phone_numbers", db).unwrap();
        let first = record("r1", "NL");
        let mut second = record("r1", "NL");
        second.raw = "different".to_owned();

        assert_eq!(
            store.insert_if_absent(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&second).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        assert_eq!(store.get("r1").await.unwrap(), Some(first));
        assert_eq!(store.scan(100).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_query_by_country_uses_exact_match(db: PgPool) {
        let store = PgStore::new("phone_numbers", db).unwrap();
        store.insert_if_absent(&record("r1", "NL")).await.unwrap();
        store.insert_if_absent(&record("r2", "BE")).await.unwrap();

        let nl = store.query_by_country("NL").await.unwrap();
        assert_eq!(nl.len(), 1);
        assert_eq!(nl[0].id, "r1");
        assert!(store.query_by_country("nl").await.unwrap().is_empty());
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
