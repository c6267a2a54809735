use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::worker::{Outcome, StopSignal, worker_loop};
use crate::config::JobSettings;
use crate::embedding::{EmbedError, EmbeddingProvider, FailureKind, ensure_embeddable};
use crate::storage::{IndexEntry, RiskSummaryRecord, RiskSummaryStore, VectorIndex, vector_ref};
use crate::util::now_utc_string;

/// Errors that end a run early. Per-record failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("record store failure: {reason}")]
    Store { reason: String },

    #[error("vector index failure: {reason}")]
    Index { reason: String },

    #[error("embedding provider failure: {reason}")]
    Provider { reason: String },

    #[error("run interrupted after {processed} record(s)")]
    Interrupted { processed: usize },
}

impl JobError {
    fn store(err: anyhow::Error) -> Self {
        Self::Store {
            reason: format!("{err:#}"),
        }
    }

    fn index(err: anyhow::Error) -> Self {
        Self::Index {
            reason: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordFailure {
    pub record_id: String,
    pub kind: String,
    pub attempts: u32,
    pub reason: String,
}

/// Vector state of a record before this run touched it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum VectorState {
    New,
    Changed,
    Unchanged,
}

impl VectorState {
    fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunReport {
    pub records_seen: usize,
    pub pages: usize,
    pub new_vectors: usize,
    pub changed_vectors: usize,
    pub unchanged_vectors: usize,
    pub embedded: usize,
    pub failures: Vec<RecordFailure>,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.embedded + self.failures.len()
    }
}

/// Re-embeds every record in the store, page by page.
///
/// Dry-runs only read. Apply runs embed on a worker pool and upsert each page
/// in a single index transaction, so a record either gets its new vector or
/// keeps the old one.
pub struct ReembedJob<'a> {
    settings: &'a JobSettings,
    store: &'a dyn RiskSummaryStore,
    index: &'a mut dyn VectorIndex,
    provider: &'a dyn EmbeddingProvider,
    interrupt: &'a AtomicBool,
    report: RunReport,
}

impl<'a> ReembedJob<'a> {
    pub fn new(
        settings: &'a JobSettings,
        store: &'a dyn RiskSummaryStore,
        index: &'a mut dyn VectorIndex,
        provider: &'a dyn EmbeddingProvider,
        interrupt: &'a AtomicBool,
    ) -> Self {
        Self {
            settings,
            store,
            index,
            provider,
            interrupt,
            report: RunReport::default(),
        }
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn execute(&mut self) -> Result<(), JobError> {
        if self.settings.apply {
            self.execute_apply()
        } else {
            self.execute_dry_run()
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    fn interrupted_error(&self) -> JobError {
        JobError::Interrupted {
            processed: self.report.processed(),
        }
    }

    fn next_page(&mut self, after: &mut Option<String>) -> Result<Vec<RiskSummaryRecord>, JobError> {
        let page = self
            .store
            .fetch_page(after.as_deref(), self.settings.batch_size)
            .map_err(JobError::store)?;

        if let Some(last) = page.last() {
            *after = Some(last.record_id.clone());
            self.report.pages += 1;
            self.report.records_seen += page.len();
        }

        Ok(page)
    }

    fn classify(&mut self, record: &RiskSummaryRecord) -> Result<VectorState, JobError> {
        let stored = self.index.get(&record.record_id).map_err(JobError::index)?;
        let state = match stored {
            None => VectorState::New,
            Some(stored)
                if stored.model_id == self.provider.model_id()
                    && stored.text_hash == record.text_hash() =>
            {
                VectorState::Unchanged
            }
            Some(_) => VectorState::Changed,
        };

        match state {
            VectorState::New => self.report.new_vectors += 1,
            VectorState::Changed => self.report.changed_vectors += 1,
            VectorState::Unchanged => self.report.unchanged_vectors += 1,
        }

        Ok(state)
    }

    fn record_failure(&mut self, record_id: String, kind: FailureKind, attempts: u32, reason: &str) {
        self.report.failures.push(RecordFailure {
            record_id,
            kind: kind.as_str().to_string(),
            attempts,
            reason: reason.to_string(),
        });
    }

    fn execute_dry_run(&mut self) -> Result<(), JobError> {
        let mut after = None;

        loop {
            if self.interrupted() {
                return Err(self.interrupted_error());
            }

            let page = self.next_page(&mut after)?;
            if page.is_empty() {
                return Ok(());
            }

            for record in &page {
                if let Err(err) = ensure_embeddable(&record.summary_text) {
                    warn!(
                        record_id = %record.record_id,
                        kind = err.kind().as_str(),
                        reason = err.reason(),
                        "record would fail"
                    );
                    self.record_failure(record.record_id.clone(), err.kind(), 0, err.reason());
                    continue;
                }

                let state = self.classify(record)?;
                info!(
                    record_id = %record.record_id,
                    vector = state.as_str(),
                    lines = record.summary_text.lines().count(),
                    chars = record.summary_text.chars().count(),
                    "record would be re-embedded"
                );
            }
        }
    }

    fn execute_apply(&mut self) -> Result<(), JobError> {
        let retry = RetryPolicy::new(&self.settings.retry);
        let stop = StopSignal::new(self.interrupt);
        let provider = self.provider;
        let workers = self.settings.workers.max(1);

        thread::scope(|scope| {
            let (work_tx, work_rx) = bounded::<RiskSummaryRecord>(workers * 2);
            let (result_tx, result_rx) = unbounded::<Outcome>();

            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let retry = &retry;
                let stop = &stop;
                scope.spawn(move || worker_loop(provider, retry, stop, work_rx, result_tx));
            }
            drop(work_rx);
            drop(result_tx);

            let outcome = self.drive_apply(&stop, &work_tx, &result_rx);
            if outcome.is_err() {
                stop.abort();
            }
            outcome
        })
    }

    fn drive_apply(
        &mut self,
        stop: &StopSignal<'_>,
        work_tx: &Sender<RiskSummaryRecord>,
        result_rx: &Receiver<Outcome>,
    ) -> Result<(), JobError> {
        let mut after = None;
        let mut consecutive_failures = 0usize;

        loop {
            if self.interrupted() {
                return Err(self.interrupted_error());
            }

            let page = self.next_page(&mut after)?;
            if page.is_empty() {
                return Ok(());
            }

            let mut dispatched = 0usize;
            for record in page {
                if stop.requested() {
                    break;
                }
                let state = self.classify(&record)?;
                debug!(record_id = %record.record_id, vector = state.as_str(), "dispatching record");
                work_tx.send(record).map_err(|_| JobError::Provider {
                    reason: "embedding workers exited unexpectedly".to_string(),
                })?;
                dispatched += 1;
            }

            let mut pending = Vec::<(RiskSummaryRecord, Vec<f32>, u32)>::new();
            let mut fatal: Option<String> = None;

            for _ in 0..dispatched {
                let outcome = result_rx.recv().map_err(|_| JobError::Provider {
                    reason: "embedding workers exited unexpectedly".to_string(),
                })?;

                match outcome {
                    Outcome::Embedded {
                        record,
                        embedding,
                        attempts,
                    } => {
                        consecutive_failures = 0;
                        pending.push((record, embedding, attempts));
                    }
                    Outcome::Failed {
                        record_id,
                        error,
                        attempts,
                    } => {
                        if let Some(reason) = self.handle_failure(
                            record_id,
                            &error,
                            attempts,
                            &mut consecutive_failures,
                        ) {
                            if fatal.is_none() {
                                stop.abort();
                                fatal = Some(reason);
                            }
                        }
                    }
                    Outcome::Cancelled { record_id } => {
                        debug!(record_id = %record_id, "record skipped, run stopping");
                    }
                }
            }

            if let Some(reason) = fatal {
                return Err(JobError::Provider { reason });
            }

            self.flush(pending)?;

            if self.interrupted() {
                return Err(self.interrupted_error());
            }
        }
    }

    /// Logs a failed record once. Returns a reason when the run must abort.
    fn handle_failure(
        &mut self,
        record_id: String,
        error: &EmbedError,
        attempts: u32,
        consecutive_failures: &mut usize,
    ) -> Option<String> {
        match error.kind() {
            FailureKind::Fatal => {
                error!(
                    record_id = %record_id,
                    reason = error.reason(),
                    "embedding provider rejected the run"
                );
                Some(error.reason().to_string())
            }
            FailureKind::Permanent => {
                warn!(
                    record_id = %record_id,
                    kind = "permanent",
                    attempts,
                    reason = error.reason(),
                    "record failed"
                );
                self.record_failure(record_id, FailureKind::Permanent, attempts, error.reason());
                None
            }
            FailureKind::Transient => {
                warn!(
                    record_id = %record_id,
                    kind = "transient",
                    attempts,
                    reason = error.reason(),
                    "record failed"
                );
                self.record_failure(record_id, FailureKind::Transient, attempts, error.reason());
                *consecutive_failures += 1;

                let limit = self.settings.max_consecutive_failures;
                (limit > 0 && *consecutive_failures >= limit).then(|| {
                    format!(
                        "{consecutive_failures} consecutive records exhausted their retries; provider appears down"
                    )
                })
            }
        }
    }

    fn flush(&mut self, pending: Vec<(RiskSummaryRecord, Vec<f32>, u32)>) -> Result<(), JobError> {
        if pending.is_empty() {
            return Ok(());
        }

        let provider = self.provider;
        let model_id = provider.model_id();
        let mut committed = Vec::<(String, u32)>::with_capacity(pending.len());
        let mut entries = Vec::<IndexEntry>::with_capacity(pending.len());
        for (record, embedding, attempts) in pending {
            entries.push(IndexEntry {
                record_id: record.record_id.clone(),
                model_id: model_id.to_string(),
                embedding,
                text_hash: record.text_hash(),
                metadata_json: record.metadata_json(model_id),
            });
            committed.push((record.record_id, attempts));
        }

        self.index.upsert_batch(&entries).map_err(JobError::index)?;

        let embedded_at = now_utc_string();
        for (record_id, attempts) in committed {
            self.store
                .mark_embedded(&record_id, &embedded_at, &vector_ref(model_id, &record_id))
                .map_err(JobError::store)?;
            self.report.embedded += 1;
            info!(record_id = %record_id, attempts, "record re-embedded");
        }

        Ok(())
    }
}
