//! Bounded in-memory queue between the consumer tasks and the writer.
//!
//! Records are flushed in batches of at most `batch_size`, either as soon as a full batch is
//! waiting or when the flush timer fires. Only one flush runs at a time, a flush that finds
//! another one in progress is skipped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::pipeline_metrics;
use crate::record::ParsedRecord;
use crate::sink::Sink;
use crate::writer::{ResilientWriter, WriteOutcome};

/// Result of [`BatchQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// The queue was full and the record was dropped.
    Dropped,
}

struct Inner<S> {
    queue: parking_lot::Mutex<VecDeque<ParsedRecord>>,
    batch_size: usize,
    max_size: usize,
    flush_interval: Duration,
    flush_lock: tokio::sync::Mutex<()>,
    flush_scheduled: AtomicBool,
    writer: Arc<ResilientWriter<S>>,
}

pub struct BatchQueue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for BatchQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> BatchQueue<S>
where
    S: Sink + Sync + 'static,
{
    pub fn new(
        writer: Arc<ResilientWriter<S>>,
        batch_size: usize,
        max_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: parking_lot::Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
                batch_size: batch_size.max(1),
                max_size,
                flush_interval,
                flush_lock: tokio::sync::Mutex::new(()),
                flush_scheduled: AtomicBool::new(false),
                writer,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a record without blocking. A full queue drops the record instead.
    pub fn enqueue(&self, record: ParsedRecord) -> Enqueue {
        let metrics = pipeline_metrics();
        let len = {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.max_size {
                None
            } else {
                queue.push_back(record);
                Some(queue.len())
            }
        };

        let Some(len) = len else {
            metrics.dropped.inc();
            warn!(
                max_queue_size = self.inner.max_size,
                "Batch queue is full, dropping record"
            );
            return Enqueue::Dropped;
        };
        metrics.enqueued.inc();
        metrics.queue_size.set(len as i64);

        if len >= self.inner.batch_size
            && !self.inner.flush_scheduled.swap(true, Ordering::SeqCst)
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.flush_full_batches().await });
        }
        Enqueue::Accepted
    }

    /// Writes up to `batch_size` of the oldest records. Returns `None` when the queue was
    /// empty or another flush was running.
    pub async fn flush(&self) -> Option<WriteOutcome> {
        let Ok(_guard) = self.inner.flush_lock.try_lock() else {
            debug!("Flush already in progress, skipping");
            return None;
        };
        self.inner.write_next().await.map(|(_, outcome)| outcome)
    }

    /// Flushes until the queue is empty, waiting for a running flush first. Returns the
    /// number of records handed to the writer.
    pub async fn drain(&self) -> usize {
        let _guard = self.inner.flush_lock.lock().await;
        let mut drained = 0;
        while let Some((records, outcome)) = self.inner.write_next().await {
            debug!(?outcome, "Drained batch");
            drained += records;
        }
        drained
    }

    /// Starts the flush timer. The first flush happens one interval from now.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        let period = self.inner.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(outcome) = queue.flush().await {
                            debug!(?outcome, "Timer flush");
                        }
                    }
                }
            }
            info!("Flush timer stopped");
        })
    }
}

impl<S> Inner<S>
where
    S: Sink + Sync + 'static,
{
    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Writes full batches only, the timer takes care of the rest.
    async fn flush_full_batches(&self) {
        loop {
            while self.len() >= self.batch_size {
                let Ok(_guard) = self.flush_lock.try_lock() else {
                    debug!("Flush already in progress, skipping size-triggered flush");
                    self.flush_scheduled.store(false, Ordering::SeqCst);
                    return;
                };
                self.write_next().await;
            }
            if !self.reschedule() {
                return;
            }
        }
    }

    /// Clears the scheduled flag. Returns true when a full batch arrived after the last
    /// length check, its enqueue saw the flag still set and spawned nothing, so the caller
    /// keeps flushing.
    fn reschedule(&self) -> bool {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        self.len() >= self.batch_size && !self.flush_scheduled.swap(true, Ordering::SeqCst)
    }

    /// Returns the number of records taken off the queue with the outcome of writing them.
    /// Callers hold the flush lock.
    async fn write_next(&self) -> Option<(usize, WriteOutcome)> {
        let batch: Vec<ParsedRecord> = {
            let mut queue = self.queue.lock();
            let n = queue.len().min(self.batch_size);
            let batch = queue.drain(..n).collect();
            pipeline_metrics().queue_size.set(queue.len() as i64);
            batch
        };
        if batch.is_empty() {
            return None;
        }
        Some((batch.len(), self.writer.write(&batch).await))
    }
}
