//! Concurrent ingestion: a bounded work queue feeding a fixed pool of batch-writing workers.
//!
//! The calling thread produces, `worker_count` scoped threads consume. Each worker owns its own
//! batch buffer and commits it through [`write_batch`] whenever it fills, plus once more for the
//! remainder after the queue closes. A worker stops at its first failure; the first failure
//! captured across the pool is returned once every worker has been joined.
//!
//! Atomicity is per batch only. A failed run may leave earlier batches committed, and running the
//! same input again overwrites them with identical values.
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::{
    error::{QuoteStoreError, Result},
    quote::Quote,
    store::QuoteStore,
    writer::{write_batch, BatchReport},
};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_WORKER_COUNT: usize = 4;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

/// Sizing of an [`ingest`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Quotes committed per write transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl IngestOptions {
    pub fn new(batch_size: usize, worker_count: usize) -> Self {
        Self {
            batch_size,
            worker_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(QuoteStoreError::InvalidIngestOptions(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(QuoteStoreError::InvalidIngestOptions(
                "worker_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Capacity of the work queue between the producer and the workers.
    pub fn queue_capacity(&self) -> usize {
        self.worker_count.saturating_mul(2)
    }
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_WORKER_COUNT)
    }
}

/// Totals of a successful [`ingest`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Committed write transactions.
    pub batches: usize,
    pub written: usize,
    pub skipped: usize,
}

impl IngestReport {
    fn record(&mut self, batch: BatchReport) {
        self.batches += 1;
        self.written += batch.written;
        self.skipped += batch.skipped;
    }

    fn merge(&mut self, other: IngestReport) {
        self.batches += other.batches;
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Persists `quotes` under `symbol` using `options.worker_count` concurrent workers.
///
/// Empty input returns immediately without touching the store. The producer blocks while the
/// queue is full and stops early once no worker is left to receive.
pub fn ingest<I>(
    store: &QuoteStore,
    symbol: &str,
    quotes: I,
    options: &IngestOptions,
) -> Result<IngestReport>
where
    I: IntoIterator<Item = Quote>,
{
    options.validate()?;
    let mut quotes = quotes.into_iter().peekable();
    if quotes.peek().is_none() {
        debug!(symbol, "No quotes to ingest");
        return Ok(IngestReport::default());
    }

    info!(
        "Ingesting quotes for {} (batch size {}, {} workers)",
        symbol, options.batch_size, options.worker_count
    );
    let (work_tx, work_rx) = channel::bounded::<Quote>(options.queue_capacity());
    let (error_tx, error_rx) = channel::unbounded::<(usize, QuoteStoreError)>();

    let joined = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(options.worker_count);
        for id in 0..options.worker_count {
            let worker = Worker {
                id,
                store,
                symbol,
                batch_size: options.batch_size,
            };
            let queue = work_rx.clone();
            let errors = error_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("ingest-{id}"))
                .spawn_scoped(scope, move || worker.run(queue, errors));
            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(source) => {
                    // Closing the queue lets the workers already running drain and exit.
                    drop(work_tx);
                    for (_, handle) in handles {
                        let _ = handle.join();
                    }
                    return Err(QuoteStoreError::Spawn { worker: id, source });
                }
            }
        }
        drop(work_rx);

        let mut produced = 0usize;
        for quote in quotes {
            if work_tx.send(quote).is_err() {
                error!(symbol, produced, "All ingest workers stopped; abandoning remaining input");
                break;
            }
            produced += 1;
        }
        drop(work_tx);
        trace!(symbol, produced, "Producer finished");

        let mut report = IngestReport::default();
        let mut panicked = None;
        for (id, handle) in handles {
            match handle.join() {
                Ok(partial) => report.merge(partial),
                Err(_) => {
                    error!(worker = id, "Ingest worker panicked");
                    panicked.get_or_insert(id);
                }
            }
        }
        Ok((report, panicked))
    });
    drop(error_tx);
    let (report, panicked) = joined?;

    if let Ok((worker, source)) = error_rx.try_recv() {
        let others = error_rx.try_iter().count();
        error!(
            worker,
            additional_failures = others,
            "Ingest of {} failed: {}",
            symbol,
            source
        );
        return Err(QuoteStoreError::Worker {
            worker,
            source: Box::new(source),
        });
    }
    if let Some(worker) = panicked {
        return Err(QuoteStoreError::WorkerPanicked { worker });
    }

    info!(
        "Ingested {} quotes for {} in {} batches ({} skipped)",
        report.written, symbol, report.batches, report.skipped
    );
    Ok(report)
}

struct Worker<'a> {
    id: usize,
    store: &'a QuoteStore,
    symbol: &'a str,
    batch_size: usize,
}

impl Worker<'_> {
    /// Consumes the queue until it closes or a batch fails. A failure is sent on `errors` and the
    /// worker exits, dropping its end of the queue.
    fn run(
        &self,
        queue: Receiver<Quote>,
        errors: Sender<(usize, QuoteStoreError)>,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        if let Err(err) = self.consume(queue, &mut report) {
            error!(worker = self.id, "Ingest worker stopping: {}", err);
            let _ = errors.send((self.id, err));
        } else {
            debug!(
                worker = self.id,
                batches = report.batches,
                written = report.written,
                "Ingest worker finished"
            );
        }
        report
    }

    fn consume(&self, queue: Receiver<Quote>, report: &mut IngestReport) -> Result<()> {
        let mut batch = Vec::with_capacity(self.batch_size);
        for quote in queue.iter() {
            batch.push(quote);
            if batch.len() >= self.batch_size {
                self.commit(&mut batch, report)?;
            }
        }
        self.commit(&mut batch, report)
    }

    fn commit(&self, batch: &mut Vec<Quote>, report: &mut IngestReport) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let written = write_batch(self.store, self.symbol, batch)?;
        trace!(worker = self.id, size = batch.len(), "Batch committed");
        report.record(written);
        batch.clear();
        Ok(())
    }
}
