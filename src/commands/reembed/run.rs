use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{error, info, warn};

use super::job::{JobError, ReembedJob};
use crate::cli::ReembedArgs;
use crate::config::ReembedConfig;
use crate::embedding::build_provider;
use crate::model::{ReembedPaths, ReembedRunManifest};
use crate::storage::{SqliteRiskStore, SqliteVectorIndex};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

const MANIFEST_VERSION: u32 = 1;
const FORCED_EXIT_CODE: i32 = 130;

pub fn run(args: ReembedArgs, log_path: Option<&Path>) -> Result<()> {
    let started_ts = Utc::now();
    let run_id = format!("reembed-{}", utc_compact_string(started_ts));
    let mode = if args.apply { "apply" } else { "dry-run" };

    info!(
        run_id = %run_id,
        mode,
        provider = args.provider.as_str(),
        log = %log_path.map(|path| path.display().to_string()).unwrap_or_default(),
        "re-embedding run starting"
    );

    match execute(&args, &run_id, log_path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let status = match err.downcast_ref::<JobError>() {
                Some(JobError::Interrupted { .. }) => "interrupted",
                _ => "aborted",
            };
            error!(run_id = %run_id, status, error = %format!("{err:#}"), "re-embedding run aborted");
            Err(err)
        }
    }
}

fn execute(args: &ReembedArgs, run_id: &str, log_path: Option<&Path>) -> Result<()> {
    let config = ReembedConfig::from_args(args).context("invalid re-embedding configuration")?;
    let provider = build_provider(&config.provider)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    register_interrupt(&interrupt)?;

    // Dry-runs open both files read-only so nothing on disk changes.
    let (store, index) = if config.job.apply {
        (
            SqliteRiskStore::open(&config.store_path),
            SqliteVectorIndex::open(&config.index_path),
        )
    } else {
        (
            SqliteRiskStore::open_read_only(&config.store_path),
            SqliteVectorIndex::open_read_only(&config.index_path),
        )
    };
    let store = store?;
    let mut index = index.map_err(|err| JobError::Index {
        reason: format!("{err:#}"),
    })?;

    info!(
        run_id,
        model_id = provider.model_id(),
        backend = provider.backend(),
        dimensions = provider.dimensions(),
        store = %config.store_path.display(),
        index = %config.index_path.display(),
        batch_size = config.job.batch_size,
        workers = config.job.workers,
        "configuration validated"
    );

    let started_at = now_utc_string();
    let started = Instant::now();

    let mut job = ReembedJob::new(
        &config.job,
        &store,
        &mut index,
        provider.as_ref(),
        &interrupt,
    );
    let result = job.execute();
    let report = job.report().clone();

    let (status, failure_reason) = match &result {
        Ok(()) => ("completed", None),
        Err(JobError::Interrupted { .. }) => ("interrupted", Some(result_reason(&result))),
        Err(_) => ("aborted", Some(result_reason(&result))),
    };

    let manifest = ReembedRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: run_id.to_string(),
        started_at,
        finished_at: now_utc_string(),
        mode: if config.job.apply { "apply" } else { "dry-run" }.to_string(),
        model_id: provider.model_id().to_string(),
        backend: provider.backend().to_string(),
        batch_size: config.job.batch_size,
        workers: config.job.workers,
        max_retries: config.job.retry.max_retries,
        paths: ReembedPaths {
            store_path: config.store_path.display().to_string(),
            index_path: config.index_path.display().to_string(),
            log_path: log_path.map(|path| path.display().to_string()),
        },
        report: report.clone(),
        duration_ms: started.elapsed().as_millis(),
        status: status.to_string(),
        failure_reason,
    };
    let manifest_path = manifest_path(&config, run_id);
    if let Err(err) = write_json_pretty(&manifest_path, &manifest) {
        warn!(path = %manifest_path.display(), error = %format!("{err:#}"), "failed to write run manifest");
    }

    result?;

    if !report.failures.is_empty() {
        warn!(
            run_id,
            failed = report.failures.len(),
            "some records failed; their previous vectors were kept"
        );
    }

    info!(
        run_id,
        mode = %manifest.mode,
        records = report.records_seen,
        embedded = report.embedded,
        new = report.new_vectors,
        changed = report.changed_vectors,
        unchanged = report.unchanged_vectors,
        failed = report.failures.len(),
        manifest = %manifest_path.display(),
        "re-embedding run completed"
    );

    Ok(())
}

/// The first SIGINT/SIGTERM sets `interrupt` for a graceful stop; a second
/// one while the flag is set exits immediately.
fn register_interrupt(interrupt: &Arc<AtomicBool>) -> Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(
            signal,
            FORCED_EXIT_CODE,
            Arc::clone(interrupt),
        )
        .context("failed to register forced-exit handler")?;
        signal_hook::flag::register(signal, Arc::clone(interrupt))
            .context("failed to register interrupt handler")?;
    }
    Ok(())
}

fn result_reason(result: &Result<(), JobError>) -> String {
    match result {
        Ok(()) => String::new(),
        Err(err) => err.to_string(),
    }
}

fn manifest_path(config: &ReembedConfig, run_id: &str) -> PathBuf {
    config.manifest_dir.join(format!("{run_id}.json"))
}
