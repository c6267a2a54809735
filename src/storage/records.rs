use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use super::{RiskSummaryRecord, RiskSummaryStore, configure_connection};

/// Record counts used by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub records: usize,
    pub embedded: usize,
    pub never_embedded: usize,
}

pub struct SqliteRiskStore {
    connection: Connection,
}

impl SqliteRiskStore {
    /// Opens an existing store; a missing file is an error.
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open record store: {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_record_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Opens an existing store without touching it: no pragmas, no schema
    /// bootstrap, and SQLite refuses any write.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open record store read-only: {}", path.display()))?;
        Ok(Self { connection })
    }

    pub fn open_or_create(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open record store: {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_record_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        ensure_record_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Inserts or refreshes a record's text fields. Embedding bookkeeping is
    /// kept. Returns whether the summary text changed.
    pub fn upsert_record(&self, record: &RiskSummaryRecord) -> Result<bool> {
        let previous = self
            .connection
            .query_row(
                "SELECT summary_text, updated_at FROM risk_summaries WHERE record_id = ?1",
                params![record.record_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let (changed, updated_at) = match previous {
            Some((text, updated_at)) if text == record.summary_text => (false, updated_at),
            _ => (true, record.updated_at.clone()),
        };

        self.connection.execute(
            "
            INSERT INTO risk_summaries(record_id, summary_text, risk_level, aggregated_score, source, updated_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(record_id) DO UPDATE SET
              summary_text=excluded.summary_text,
              risk_level=excluded.risk_level,
              aggregated_score=excluded.aggregated_score,
              source=excluded.source,
              updated_at=excluded.updated_at
            ",
            params![
                record.record_id,
                record.summary_text,
                record.risk_level,
                record.aggregated_score,
                record.source,
                updated_at,
            ],
        )?;

        Ok(changed)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let (records, embedded) = self.connection.query_row(
            "SELECT COUNT(*), COUNT(embedded_at) FROM risk_summaries",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;

        Ok(StoreCounts {
            records: records as usize,
            embedded: embedded as usize,
            never_embedded: (records - embedded) as usize,
        })
    }
}

impl RiskSummaryStore for SqliteRiskStore {
    fn fetch_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<RiskSummaryRecord>> {
        let mut statement = self.connection.prepare_cached(
            "
            SELECT record_id, summary_text, risk_level, aggregated_score, source,
                   updated_at, embedded_at, vector_ref
            FROM risk_summaries
            WHERE ?1 IS NULL OR record_id > ?1
            ORDER BY record_id ASC
            LIMIT ?2
            ",
        )?;

        let mut rows = statement.query(params![after, limit as i64])?;
        let mut out = Vec::<RiskSummaryRecord>::with_capacity(limit);

        while let Some(row) = rows.next()? {
            out.push(RiskSummaryRecord {
                record_id: row.get(0)?,
                summary_text: row.get(1)?,
                risk_level: row.get(2)?,
                aggregated_score: row.get(3)?,
                source: row.get(4)?,
                updated_at: row.get(5)?,
                embedded_at: row.get(6)?,
                vector_ref: row.get(7)?,
            });
        }

        Ok(out)
    }

    fn mark_embedded(&self, record_id: &str, embedded_at: &str, vector_ref: &str) -> Result<()> {
        let updated = self.connection.execute(
            "UPDATE risk_summaries SET embedded_at = ?2, vector_ref = ?3 WHERE record_id = ?1",
            params![record_id, embedded_at, vector_ref],
        )?;
        anyhow::ensure!(updated == 1, "record {record_id} vanished from the store");
        Ok(())
    }
}

fn ensure_record_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS risk_summaries (
          record_id TEXT PRIMARY KEY,
          summary_text TEXT NOT NULL DEFAULT '',
          risk_level TEXT,
          aggregated_score REAL,
          source TEXT NOT NULL DEFAULT 'applications',
          updated_at TEXT NOT NULL,
          embedded_at TEXT,
          vector_ref TEXT
        );
        ",
    )?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('store_schema_version', '1')
         ON CONFLICT(key) DO NOTHING",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_record(record_id: &str, text: &str) -> RiskSummaryRecord {
    RiskSummaryRecord {
        record_id: record_id.to_string(),
        summary_text: text.to_string(),
        risk_level: Some("Medium".to_string()),
        aggregated_score: Some(42.0),
        source: "applications".to_string(),
        updated_at: crate::util::now_utc_string(),
        embedded_at: None,
        vector_ref: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_page_walks_records_in_id_order() {
        let store = SqliteRiskStore::open_in_memory().unwrap();
        for id in ["c", "a", "e", "b", "d"] {
            store.upsert_record(&sample_record(id, "text")).unwrap();
        }

        let first = store.fetch_page(None, 2).unwrap();
        let ids = first.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["a", "b"]);

        let second = store.fetch_page(Some("b"), 2).unwrap();
        let ids = second.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["c", "d"]);

        let third = store.fetch_page(Some("d"), 2).unwrap();
        assert_eq!(third.len(), 1);
        assert!(store.fetch_page(Some("e"), 2).unwrap().is_empty());
    }

    #[test]
    fn upsert_record_keeps_embedding_bookkeeping() {
        let store = SqliteRiskStore::open_in_memory().unwrap();
        store.upsert_record(&sample_record("a", "old")).unwrap();
        store
            .mark_embedded("a", "2025-01-01T00:00:00Z", "m:a")
            .unwrap();

        let changed = store.upsert_record(&sample_record("a", "new")).unwrap();
        assert!(changed);

        let record = store.fetch_page(None, 10).unwrap().remove(0);
        assert_eq!(record.summary_text, "new");
        assert_eq!(record.embedded_at.as_deref(), Some("2025-01-01T00:00:00Z"));
        assert_eq!(record.vector_ref.as_deref(), Some("m:a"));
    }

    #[test]
    fn unchanged_text_keeps_updated_at() {
        let store = SqliteRiskStore::open_in_memory().unwrap();
        let mut record = sample_record("a", "same");
        record.updated_at = "2024-01-01T00:00:00Z".to_string();
        store.upsert_record(&record).unwrap();

        record.updated_at = "2025-06-01T00:00:00Z".to_string();
        assert!(!store.upsert_record(&record).unwrap());

        let stored = store.fetch_page(None, 1).unwrap().remove(0);
        assert_eq!(stored.updated_at, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn counts_split_embedded_and_pending() {
        let store = SqliteRiskStore::open_in_memory().unwrap();
        store.upsert_record(&sample_record("a", "x")).unwrap();
        store.upsert_record(&sample_record("b", "y")).unwrap();
        store.mark_embedded("a", "2025-01-01T00:00:00Z", "m:a").unwrap();

        assert_eq!(
            store.counts().unwrap(),
            StoreCounts {
                records: 2,
                embedded: 1,
                never_embedded: 1,
            }
        );
    }

    #[test]
    fn read_only_store_reads_but_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        {
            let store = SqliteRiskStore::open_or_create(&path).unwrap();
            store.upsert_record(&sample_record("a", "text")).unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let store = SqliteRiskStore::open_read_only(&path).unwrap();
        assert_eq!(store.fetch_page(None, 10).unwrap().len(), 1);
        assert!(store.mark_embedded("a", "t", "m:a").is_err());
        drop(store);

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn mark_embedded_fails_for_unknown_record() {
        let store = SqliteRiskStore::open_in_memory().unwrap();
        assert!(store.mark_embedded("ghost", "t", "m:ghost").is_err());
    }
}
