use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::reembed::RunReport;

/// One entry of `applications.json`. Only the fields the importer reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationEntry {
    pub id: Option<String>,
    pub application_id: Option<String>,
    #[serde(default)]
    pub risk: Option<Value>,
}

impl ApplicationEntry {
    pub fn record_id(&self) -> Option<&str> {
        [self.id.as_deref(), self.application_id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
    }
}


#[derive(Debug, Clone, Serialize)]
pub struct ReembedPaths {
    pub store_path: String,
    pub index_path: String,
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReembedRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub mode: String,
    pub model_id: String,
    pub backend: String,
    pub batch_size: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub paths: ReembedPaths,
    #[serde(flatten)]
    pub report: RunReport,
    pub duration_ms: u128,
    pub status: String,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ImportCounts {
    pub applications: usize,
    pub inline_risk: usize,
    pub risk_file: usize,
    pub missing_risk: usize,
    pub missing_id: usize,
    pub unreadable_risk_file: usize,
    pub inserted_or_changed: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub applications_path: String,
    pub risk_dir: String,
    pub db_path: String,
    pub dry_run: bool,
    pub counts: ImportCounts,
    pub warnings: Vec<String>,
}
