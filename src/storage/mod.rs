//! Record store and vector index adapters.
//!
//! Both are SQLite files. The record store is the source of truth for risk
//! summaries; the vector index holds exactly one vector per record id.

mod records;
mod vectors;

#[cfg(test)]
pub(crate) use records::sample_record;
pub use records::SqliteRiskStore;
pub use vectors::SqliteVectorIndex;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::util::sha256_hex;

/// One previously generated risk assessment, as stored upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSummaryRecord {
    pub record_id: String,
    pub summary_text: String,
    pub risk_level: Option<String>,
    pub aggregated_score: Option<f64>,
    pub source: String,
    pub updated_at: String,
    pub embedded_at: Option<String>,
    pub vector_ref: Option<String>,
}

impl RiskSummaryRecord {
    pub fn text_hash(&self) -> String {
        sha256_hex(&self.summary_text)
    }

    pub fn metadata_json(&self, model_id: &str) -> String {
        serde_json::json!({
            "record_id": self.record_id,
            "risk_level": self.risk_level,
            "aggregated_score": self.aggregated_score,
            "source": self.source,
            "record_updated_at": self.updated_at,
            "model_id": model_id,
        })
        .to_string()
    }
}

/// The vector row written to the index for a record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record_id: String,
    pub model_id: String,
    pub embedding: Vec<f32>,
    pub text_hash: String,
    pub metadata_json: String,
}

/// What the index currently holds for a record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub model_id: String,
    pub embedding: Vec<f32>,
    pub text_hash: String,
    pub generated_at: String,
}

pub trait RiskSummaryStore {
    /// Records ordered by id, strictly after `after`, at most `limit` rows.
    fn fetch_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<RiskSummaryRecord>>;

    fn mark_embedded(&self, record_id: &str, embedded_at: &str, vector_ref: &str) -> Result<()>;
}

pub trait VectorIndex {
    fn get(&self, record_id: &str) -> Result<Option<StoredVector>>;

    /// Replaces any prior vector per record. All entries commit together or
    /// none do.
    fn upsert_batch(&mut self, entries: &[IndexEntry]) -> Result<usize>;

    fn len(&self) -> Result<usize>;
}

pub fn vector_ref(model_id: &str, record_id: &str) -> String {
    format!("{model_id}:{record_id}")
}

pub(crate) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    let out = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<f32>>();

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_length_mismatch() {
        let blob = encode_embedding_blob(&[0.25, -1.5, 3.0]);
        assert_eq!(blob.len(), 12);
        assert_eq!(decode_embedding_blob(&blob, 3), Some(vec![0.25, -1.5, 3.0]));
        assert_eq!(decode_embedding_blob(&blob, 4), None);
        assert_eq!(decode_embedding_blob(&[], 0), None);
    }

    #[test]
    fn vector_ref_joins_model_and_record() {
        assert_eq!(vector_ref("local-v1", "APP-7"), "local-v1:APP-7");
    }
}
