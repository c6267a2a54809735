use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{ProviderKind, StatusArgs};
use crate::config::{
    DEFAULT_LOCAL_MODEL_ID, DEFAULT_OPENAI_MODEL, INDEX_FILE_NAME, STORE_FILE_NAME, non_blank,
};
use crate::storage::{RiskSummaryStore, SqliteRiskStore, SqliteVectorIndex, VectorIndex};

const PAGE_SIZE: usize = 256;

/// Freshness of the index relative to the record store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexFreshness {
    pub indexed: usize,
    pub missing: usize,
    pub stale: usize,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let store_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join(STORE_FILE_NAME));
    let index_path = args
        .index_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join(INDEX_FILE_NAME));
    let model_id = resolve_model_id(&args)?;
    let model_id = model_id.as_str();

    info!(cache_root = %args.cache_root.display(), "status requested");

    if !store_path.exists() {
        warn!(path = %store_path.display(), "record store missing");
        return Ok(());
    }

    let store = SqliteRiskStore::open_read_only(&store_path)?;
    let counts = store.counts()?;
    info!(
        path = %store_path.display(),
        records = counts.records,
        embedded = counts.embedded,
        never_embedded = counts.never_embedded,
        "record store status"
    );

    if !index_path.exists() {
        warn!(path = %index_path.display(), "vector index missing");
        return Ok(());
    }

    let index = SqliteVectorIndex::open_read_only(&index_path)?;
    let freshness = index_freshness(&store, &index, model_id)?;
    info!(
        path = %index_path.display(),
        vectors = index.len()?,
        model_id,
        indexed = freshness.indexed,
        missing = freshness.missing,
        stale = freshness.stale,
        "vector index status"
    );

    Ok(())
}

/// The model `reembed` would run with for the same provider settings.
fn resolve_model_id(args: &StatusArgs) -> Result<String> {
    if let Some(model_id) = non_blank(args.model_id.as_deref()) {
        return Ok(model_id.to_string());
    }

    let model_id = match args.provider {
        ProviderKind::Local => DEFAULT_LOCAL_MODEL_ID,
        ProviderKind::Openai => DEFAULT_OPENAI_MODEL,
        ProviderKind::Azure => non_blank(args.azure_deployment.as_deref())
            .context("set --model-id or AZURE_OPENAI_EMBEDDING_DEPLOYMENT for azure")?,
    };
    Ok(model_id.to_string())
}

/// A vector is stale when its text hash or model no longer matches the record.
pub fn index_freshness(
    store: &dyn RiskSummaryStore,
    index: &dyn VectorIndex,
    model_id: &str,
) -> Result<IndexFreshness> {
    let mut freshness = IndexFreshness::default();
    let mut after: Option<String> = None;

    loop {
        let page = store.fetch_page(after.as_deref(), PAGE_SIZE)?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.record_id.clone());

        for record in &page {
            match index.get(&record.record_id)? {
                None => freshness.missing += 1,
                Some(stored)
                    if stored.model_id != model_id || stored.text_hash != record.text_hash() =>
                {
                    freshness.stale += 1;
                }
                Some(_) => freshness.indexed += 1,
            }
        }
    }

    Ok(freshness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IndexEntry, sample_record};

    fn status_args(provider: ProviderKind) -> StatusArgs {
        StatusArgs {
            cache_root: ".cache/kyp".into(),
            db_path: None,
            index_path: None,
            provider,
            model_id: None,
            azure_deployment: None,
        }
    }

    #[test]
    fn model_id_defaults_follow_the_provider() {
        assert_eq!(
            resolve_model_id(&status_args(ProviderKind::Local)).unwrap(),
            DEFAULT_LOCAL_MODEL_ID
        );
        assert_eq!(
            resolve_model_id(&status_args(ProviderKind::Openai)).unwrap(),
            DEFAULT_OPENAI_MODEL
        );

        let mut azure = status_args(ProviderKind::Azure);
        assert!(resolve_model_id(&azure).is_err());
        azure.azure_deployment = Some("risk-embed".to_string());
        assert_eq!(resolve_model_id(&azure).unwrap(), "risk-embed");

        azure.model_id = Some(" custom ".to_string());
        assert_eq!(resolve_model_id(&azure).unwrap(), "custom");
    }

    #[test]
    fn freshness_splits_missing_stale_and_current() {
        let store = SqliteRiskStore::open_in_memory().unwrap();
        let mut index = SqliteVectorIndex::open_in_memory().unwrap();

        let current = sample_record("a", "current text");
        let stale = sample_record("b", "edited text");
        let missing = sample_record("c", "never embedded");
        for record in [&current, &stale, &missing] {
            store.upsert_record(record).unwrap();
        }

        index
            .upsert_batch(&[
                IndexEntry {
                    record_id: "a".to_string(),
                    model_id: "m".to_string(),
                    embedding: vec![1.0],
                    text_hash: current.text_hash(),
                    metadata_json: "{}".to_string(),
                },
                IndexEntry {
                    record_id: "b".to_string(),
                    model_id: "m".to_string(),
                    embedding: vec![1.0],
                    text_hash: "old-hash".to_string(),
                    metadata_json: "{}".to_string(),
                },
            ])
            .unwrap();

        assert_eq!(
            index_freshness(&store, &index, "m").unwrap(),
            IndexFreshness {
                indexed: 1,
                missing: 1,
                stale: 1,
            }
        );

        let other_model = index_freshness(&store, &index, "other").unwrap();
        assert_eq!(other_model.stale, 2);
    }
}
