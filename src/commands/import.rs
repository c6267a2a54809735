use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::ImportArgs;
use crate::config::STORE_FILE_NAME;
use crate::model::{ApplicationEntry, ImportCounts, ImportRunManifest};
use crate::risk_blob::{build_risk_blob, risk_headline};
use crate::storage::{RiskSummaryRecord, SqliteRiskStore};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

const SOURCE_INLINE: &str = "applications";
const SOURCE_RISK_FILE: &str = "risk_file";

pub fn run(args: ImportArgs) -> Result<()> {
    let started_ts = Utc::now();
    let run_id = format!("import-{}", utc_compact_string(started_ts));
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join(STORE_FILE_NAME));

    info!(
        run_id = %run_id,
        applications = %args.applications_path.display(),
        risk_dir = %args.risk_dir.display(),
        dry_run = args.dry_run,
        "starting import"
    );

    let applications = load_applications(&args.applications_path)?;
    let mut counts = ImportCounts {
        applications: applications.len(),
        ..ImportCounts::default()
    };
    let mut warnings = Vec::<String>::new();
    let records = collect_records(&applications, &args.risk_dir, &mut counts, &mut warnings);

    for record in &records {
        info!(
            record_id = %record.record_id,
            source = %record.source,
            lines = record.summary_text.lines().count(),
            chars = record.summary_text.chars().count(),
            "risk summary found"
        );
    }

    if args.dry_run {
        info!(
            candidates = records.len(),
            missing_risk = counts.missing_risk,
            "import dry-run complete; nothing written"
        );
        return Ok(());
    }

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory(parent)?;
        }
    }
    let store = SqliteRiskStore::open_or_create(&db_path)?;
    for record in &records {
        if store
            .upsert_record(record)
            .with_context(|| format!("failed to store record {}", record.record_id))?
        {
            counts.inserted_or_changed += 1;
        } else {
            counts.unchanged += 1;
        }
    }

    let manifest = ImportRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        generated_at: now_utc_string(),
        applications_path: args.applications_path.display().to_string(),
        risk_dir: args.risk_dir.display().to_string(),
        db_path: db_path.display().to_string(),
        dry_run: args.dry_run,
        counts: counts.clone(),
        warnings,
    };
    let manifest_path = args
        .cache_root
        .join("manifests")
        .join(format!("{run_id}.json"));
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        records = records.len(),
        inserted_or_changed = counts.inserted_or_changed,
        unchanged = counts.unchanged,
        "import completed"
    );

    Ok(())
}

fn load_applications(path: &Path) -> Result<Vec<ApplicationEntry>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Resolves each application's risk object (inline first, then
/// `<risk_dir>/<id>.json`) and renders it into a store record.
fn collect_records(
    applications: &[ApplicationEntry],
    risk_dir: &Path,
    counts: &mut ImportCounts,
    warnings: &mut Vec<String>,
) -> Vec<RiskSummaryRecord> {
    let updated_at = now_utc_string();
    let mut records = Vec::<RiskSummaryRecord>::new();

    for application in applications {
        let Some(record_id) = application.record_id() else {
            counts.missing_id += 1;
            continue;
        };

        let (risk, source) = match application.risk.as_ref().filter(|risk| has_content(risk)) {
            Some(risk) => {
                counts.inline_risk += 1;
                (risk.clone(), SOURCE_INLINE)
            }
            None => match load_risk_file(risk_dir, record_id) {
                Ok(Some(risk)) => {
                    counts.risk_file += 1;
                    (risk, SOURCE_RISK_FILE)
                }
                Ok(None) => {
                    counts.missing_risk += 1;
                    continue;
                }
                Err(err) => {
                    counts.unreadable_risk_file += 1;
                    let message = format!("{record_id}: {err:#}");
                    warn!(record_id, error = %format!("{err:#}"), "skipping unreadable risk file");
                    warnings.push(message);
                    continue;
                }
            },
        };

        let headline = risk_headline(&risk);
        records.push(RiskSummaryRecord {
            record_id: record_id.to_string(),
            summary_text: build_risk_blob(&risk),
            risk_level: headline.risk_level,
            aggregated_score: headline.aggregated_score,
            source: source.to_string(),
            updated_at: updated_at.clone(),
            embedded_at: None,
            vector_ref: None,
        });
    }

    records
}

fn load_risk_file(risk_dir: &Path, record_id: &str) -> Result<Option<Value>> {
    let path = risk_dir.join(format!("{record_id}.json"));
    if !path.is_file() {
        return Ok(None);
    }

    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut data: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let risk = match data.get_mut("model_response") {
        Some(inner) => inner.take(),
        None => data,
    };

    Ok(has_content(&risk).then_some(risk))
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(fields) => !fields.is_empty(),
        Value::String(text) => !text.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}
