use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use super::{
    IndexEntry, StoredVector, VectorIndex, configure_connection, decode_embedding_blob,
    encode_embedding_blob,
};
use crate::util::now_utc_string;

pub struct SqliteVectorIndex {
    connection: Connection,
}

impl SqliteVectorIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open vector index: {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_index_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Opens the index for reads only. A missing file reads as an empty
    /// index and nothing is created on disk.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::open_in_memory();
        }

        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open vector index read-only: {}", path.display()))?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        ensure_index_schema(&connection)?;
        Ok(Self { connection })
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn get(&self, record_id: &str) -> Result<Option<StoredVector>> {
        let row = self
            .connection
            .query_row(
                "
                SELECT model_id, embedding, embedding_dim, text_hash, generated_at
                FROM risk_embeddings
                WHERE record_id = ?1
                ",
                params![record_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read vector for {record_id}"))?;

        let Some((model_id, blob, dim, text_hash, generated_at)) = row else {
            return Ok(None);
        };

        let embedding = decode_embedding_blob(&blob, dim as usize)
            .with_context(|| format!("stored vector for {record_id} is corrupt"))?;

        Ok(Some(StoredVector {
            model_id,
            embedding,
            text_hash,
            generated_at,
        }))
    }

    fn upsert_batch(&mut self, entries: &[IndexEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let generated_at = now_utc_string();
        let tx = self
            .connection
            .transaction()
            .context("failed to begin vector index transaction")?;
        {
            let mut statement = tx.prepare_cached(
                "
                INSERT INTO risk_embeddings(record_id, model_id, embedding, embedding_dim, text_hash, metadata_json, generated_at)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(record_id) DO UPDATE SET
                  model_id=excluded.model_id,
                  embedding=excluded.embedding,
                  embedding_dim=excluded.embedding_dim,
                  text_hash=excluded.text_hash,
                  metadata_json=excluded.metadata_json,
                  generated_at=excluded.generated_at
                ",
            )?;

            for entry in entries {
                statement.execute(params![
                    entry.record_id,
                    entry.model_id,
                    encode_embedding_blob(&entry.embedding),
                    entry.embedding.len() as i64,
                    entry.text_hash,
                    entry.metadata_json,
                    generated_at,
                ])?;
            }
        }
        tx.commit().context("failed to commit vector index transaction")?;

        Ok(entries.len())
    }

    fn len(&self) -> Result<usize> {
        let count: i64 =
            self.connection
                .query_row("SELECT COUNT(*) FROM risk_embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn ensure_index_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS risk_embeddings (
          record_id TEXT PRIMARY KEY,
          model_id TEXT NOT NULL,
          embedding BLOB NOT NULL,
          embedding_dim INTEGER NOT NULL,
          text_hash TEXT NOT NULL,
          metadata_json TEXT NOT NULL DEFAULT '{}',
          generated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_risk_embeddings_model ON risk_embeddings(model_id);
        ",
    )?;
    Ok(())
}
