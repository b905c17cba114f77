// hexatiles/crates/hexpipe/src/pipeline.rs
//! Parallel row processing with in-order release.
//!
//! One blocking producer drains the [`RowSource`] into a bounded job queue,
//! `workers` tasks run [`process_row`], and the caller's task reassembles the
//! results by sequence number before handing them to the sink and metrics.
//! Both channels are bounded at twice the worker count, so a slow sink
//! back-pressures all the way to the decoder.

use crate::cancel::CancelSignal;
use crate::decoder::{Row, RowSource};
use crate::error::PipelineError;
use crate::metrics::{MetricsAggregator, RunMetrics};
use crate::props::{FilterSpec, QuantizeRules};
use crate::sink::FeatureSink;
use crate::worker::{process_row, Outcome, ProcessingResult, RowContext};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_PROPERTY_BYTE_CAP: usize = 2048;

type WorkerMessage = Result<ProcessingResult, PipelineError>;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub filter: FilterSpec,
    pub quantize: QuantizeRules,
    pub min_resolution: Option<u8>,
    pub max_resolution: Option<u8>,
    /// Serialized property size limit in bytes; 0 disables it.
    pub property_byte_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            filter: FilterSpec::default(),
            quantize: QuantizeRules::default(),
            min_resolution: None,
            max_resolution: None,
            property_byte_cap: DEFAULT_PROPERTY_BYTE_CAP,
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl PipelineConfig {
    fn row_context(&self) -> RowContext {
        RowContext {
            filter: self.filter.clone(),
            quantize: self.quantize.clone(),
            min_resolution: self.min_resolution,
            max_resolution: self.max_resolution,
            property_byte_cap: self.property_byte_cap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub workers: usize,
    pub metrics: RunMetrics,
}

/// Runs the whole source through the workers and into `sink`.
///
/// On error the sink may hold a partial stream and must be discarded. A
/// tripped `cancel` (from outside or from a fatal error) stops every task;
/// the function only returns after all of them have been joined.
pub async fn run_pipeline<S, K>(
    source: S,
    sink: &mut K,
    config: PipelineConfig,
    cancel: &CancelSignal,
) -> Result<PipelineSummary, PipelineError>
where
    S: RowSource,
    K: FeatureSink + ?Sized,
{
    let started = Instant::now();
    let workers = config.workers.max(1);
    let expected_rows = source.total_rows();
    let ctx = Arc::new(config.row_context());

    tracing::info!(
        workers,
        total_rows = ?expected_rows,
        property_byte_cap = config.property_byte_cap,
        min_resolution = ?config.min_resolution,
        max_resolution = ?config.max_resolution,
        "Starting pipeline"
    );

    let (job_tx, job_rx) = mpsc::channel::<Row>(workers * 2);
    let (result_tx, mut result_rx) = mpsc::channel::<WorkerMessage>(workers * 2);

    let producer = {
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || produce(source, job_tx, result_tx, cancel))
    };

    let job_rx = Arc::new(Mutex::new(job_rx));
    let worker_handles: Vec<JoinHandle<()>> = (0..workers)
        .map(|worker_id| {
            tokio::spawn(worker_loop(
                worker_id,
                job_rx.clone(),
                result_tx.clone(),
                ctx.clone(),
                cancel.clone(),
            ))
        })
        .collect();
    // Workers and the producer own the remaining handles; once they exit the
    // channels close.
    drop(job_rx);
    drop(result_tx);

    let mut aggregator = MetricsAggregator::new();
    let reassembled = reassemble(&mut result_rx, sink, &mut aggregator, cancel).await;
    if let Err(e) = &reassembled {
        tracing::error!(error = %e, "Pipeline failed, cancelling workers");
        cancel.cancel();
    }
    drop(result_rx);

    let mut join_failure = None;
    if let Err(e) = producer.await {
        join_failure = Some(format!("producer task failed: {e}"));
    }
    for handle in worker_handles {
        if let Err(e) = handle.await {
            join_failure.get_or_insert_with(|| format!("worker task failed: {e}"));
        }
    }

    reassembled?;
    if let Some(msg) = join_failure {
        return Err(PipelineError::Internal(msg));
    }
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    sink.finish()?;

    let mut metrics = aggregator.finish();
    metrics.sink_records = sink.records();
    metrics.sink_bytes = sink.bytes();
    metrics.processing_seconds = started.elapsed().as_secs_f64();

    if let Some(expected) = expected_rows {
        if expected != metrics.total_rows {
            tracing::warn!(
                expected,
                released = metrics.total_rows,
                "Row count differs from source metadata"
            );
        }
    }

    tracing::info!(
        total_rows = metrics.total_rows,
        emitted = metrics.emitted_features,
        dropped = metrics.dropped.total(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pipeline finished"
    );

    Ok(PipelineSummary { workers, metrics })
}

/// Drains the source. Runs on a blocking thread.
fn produce<S: RowSource>(
    mut source: S,
    jobs: mpsc::Sender<Row>,
    results: mpsc::Sender<WorkerMessage>,
    cancel: CancelSignal,
) {
    loop {
        if cancel.is_cancelled() {
            tracing::debug!("Producer observed cancellation");
            return;
        }
        match source.next_row() {
            Ok(Some(row)) => {
                if jobs.blocking_send(row).is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("Producer reached end of stream");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Decoding failed");
                let _ = results.blocking_send(Err(e.into()));
                return;
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Row>>>,
    results: mpsc::Sender<WorkerMessage>,
    ctx: Arc<RowContext>,
    cancel: CancelSignal,
) {
    let mut processed = 0u64;
    loop {
        // The lock guards only the queue handle and is released before processing.
        let row = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                row = rx.recv() => row,
            }
        };
        let Some(row) = row else { break };

        let message = process_row(row, &ctx);
        let fatal = message.is_err();

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = results.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if fatal {
            break;
        }
        processed += 1;
    }
    tracing::debug!(worker_id, processed, "Worker exiting");
}

/// Releases results strictly by increasing sequence number.
async fn reassemble<K: FeatureSink + ?Sized>(
    results: &mut mpsc::Receiver<WorkerMessage>,
    sink: &mut K,
    aggregator: &mut MetricsAggregator,
    cancel: &CancelSignal,
) -> Result<(), PipelineError> {
    let mut expected: u64 = 1;
    let mut pending: BTreeMap<u64, ProcessingResult> = BTreeMap::new();

    while let Some(message) = results.recv().await {
        let result = message?;
        pending.insert(result.seq, result);

        while let Some(result) = pending.remove(&expected) {
            if let Outcome::Emitted { feature, .. } = &result.outcome {
                sink.write_feature(feature)?;
            }
            aggregator.record(&result);
            expected += 1;
        }
    }

    // Workers drop in-flight rows on cancellation, so gaps are expected then.
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    if !pending.is_empty() {
        let first = pending.keys().next().copied().unwrap_or_default();
        return Err(PipelineError::Internal(format!(
            "{} results still pending at end of stream (waiting for row {expected}, holding from row {first})",
            pending.len()
        )));
    }
    Ok(())
}
