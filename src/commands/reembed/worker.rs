use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use super::retry::RetryPolicy;
use crate::embedding::{EmbedError, EmbeddingProvider, FailureKind};
use crate::storage::RiskSummaryRecord;

/// What a worker reports back for one dispatched record.
#[derive(Debug)]
pub(super) enum Outcome {
    Embedded {
        record: RiskSummaryRecord,
        embedding: Vec<f32>,
        attempts: u32,
    },
    Failed {
        record_id: String,
        error: EmbedError,
        attempts: u32,
    },
    /// Skipped because the run is stopping.
    Cancelled { record_id: String },
}

/// Stop conditions visible to every worker: an external interrupt and the
/// coordinator's own abort.
pub(super) struct StopSignal<'a> {
    pub(super) interrupt: &'a AtomicBool,
    pub(super) abort: AtomicBool,
}

impl<'a> StopSignal<'a> {
    pub(super) fn new(interrupt: &'a AtomicBool) -> Self {
        Self {
            interrupt,
            abort: AtomicBool::new(false),
        }
    }

    pub(super) fn requested(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed) || self.abort.load(Ordering::Relaxed)
    }

    pub(super) fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }
}

pub(super) fn worker_loop(
    provider: &dyn EmbeddingProvider,
    retry: &RetryPolicy,
    stop: &StopSignal<'_>,
    work_rx: Receiver<RiskSummaryRecord>,
    result_tx: Sender<Outcome>,
) {
    for record in work_rx.iter() {
        let outcome = if stop.requested() {
            Outcome::Cancelled {
                record_id: record.record_id,
            }
        } else {
            embed_record(provider, retry, stop, record)
        };

        if result_tx.send(outcome).is_err() {
            break;
        }
    }
}

fn embed_record(
    provider: &dyn EmbeddingProvider,
    retry: &RetryPolicy,
    stop: &StopSignal<'_>,
    record: RiskSummaryRecord,
) -> Outcome {
    let attempted = retry.run(
        || stop.requested(),
        || provider.embed(&record.summary_text),
        |attempt, err, delay| {
            warn!(
                record_id = %record.record_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient embedding failure, retrying"
            );
        },
    );

    match attempted.result {
        Ok(embedding) => Outcome::Embedded {
            record,
            embedding,
            attempts: attempted.attempts,
        },
        // A transient error cut short by a stop was never exhausted.
        Err(error) if error.kind() == FailureKind::Transient && stop.requested() => {
            Outcome::Cancelled {
                record_id: record.record_id,
            }
        }
        Err(error) => Outcome::Failed {
            record_id: record.record_id,
            error,
            attempts: attempted.attempts,
        },
    }
}
