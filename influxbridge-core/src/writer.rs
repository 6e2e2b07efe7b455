//! Writes batches to the sink with retries and a circuit breaker, spooling batches that
//! never made it to the dead-letter log.

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backoff::retry::{Retry, RetryError};
use backoff::strategy::exponential::Exponential;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::breaker::{Admission, CircuitBreaker, Open};
use crate::config::{BreakerConfig, RetryConfig};
use crate::dead_letter::DeadLetterLog;
use crate::metrics::pipeline_metrics;
use crate::record::ParsedRecord;
use crate::sink::Sink;

/// The delay doubles with every retry.
const BACKOFF_FACTOR: f64 = 2.0;

/// What happened to a batch handed to [`ResilientWriter::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written { records: usize, attempts: usize },
    /// The circuit was open before any attempt reached the sink. The records are lost.
    Skipped { records: usize, retry_in: Duration },
    /// Every attempt failed, the records are in the dead-letter log.
    DeadLettered {
        records: usize,
        attempts: usize,
        error: String,
    },
    /// The dead-letter log could not be written either.
    Lost { records: usize, error: String },
}

#[derive(Debug)]
enum AttemptError {
    Sink(Error),
    Open(Open),
}

impl AttemptError {
    fn can_retry(&self) -> bool {
        match self {
            AttemptError::Sink(e) => e.is_retryable(),
            // the breaker decides when the sink is worth another call
            AttemptError::Open(_) => false,
        }
    }
}

/// Bookkeeping of one `write` call across its attempts.
#[derive(Default)]
struct Attempts {
    sink_calls: AtomicUsize,
    last_error: parking_lot::Mutex<Option<String>>,
}

pub struct ResilientWriter<S> {
    sink: S,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    dead_letter: DeadLetterLog,
    // one write at a time
    lock: Mutex<()>,
    cancel: CancellationToken,
}

impl<S: Sink> ResilientWriter<S> {
    pub fn new(
        sink: S,
        retry: RetryConfig,
        breaker: BreakerConfig,
        dead_letter: DeadLetterLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            breaker: CircuitBreaker::new(breaker),
            retry,
            dead_letter,
            lock: Mutex::new(()),
            cancel,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Writes a batch. Failures are handled here and reported through the outcome. Records the
    /// sink can never accept are dead-lettered on their own first, the outcome then covers
    /// the rest of the batch.
    pub async fn write(&self, records: &[ParsedRecord]) -> WriteOutcome {
        self.write_with(records, false).await
    }

    /// Writes a single record through the same retry, breaker and dead-letter path.
    pub async fn write_point(&self, record: &ParsedRecord) -> WriteOutcome {
        self.write_with(std::slice::from_ref(record), true).await
    }

    async fn write_with(&self, records: &[ParsedRecord], single: bool) -> WriteOutcome {
        if records.is_empty() {
            return WriteOutcome::Written {
                records: 0,
                attempts: 0,
            };
        }
        let _guard = self.lock.lock().await;

        let (records, rejected) = self.screen(records);
        if !rejected.is_empty() {
            let outcome = self.dead_letter_rejected(&rejected).await;
            if records.is_empty() {
                return outcome;
            }
        }
        let records = &*records;

        let attempts = Attempts::default();
        let backoff = Exponential::new(
            self.retry.base_delay,
            self.retry.max_delay,
            BACKOFF_FACTOR,
            self.retry.max_retries,
        );
        let result = Retry::new(
            backoff,
            || self.attempt(records, single, &attempts),
            |e: &AttemptError| e.can_retry(),
            self.cancel.clone(),
        )
        .with_notify(|e: &AttemptError, retry: usize, delay: Duration| {
            warn!(?e, retry, ?delay, records = records.len(), "Retrying sink write");
        })
        .await;

        let metrics = pipeline_metrics();
        let count = records.len();
        let error = match result {
            Ok(()) => {
                metrics.written.inc_by(count as u64);
                let attempts = attempts.sink_calls.load(Ordering::Relaxed);
                debug!(records = count, attempts, "Batch written");
                return WriteOutcome::Written {
                    records: count,
                    attempts,
                };
            }
            Err(RetryError::Cancelled { attempts: tried, error }) => {
                info!(?error, attempts = tried, "Write cancelled while waiting to retry");
                Error::Cancelled.to_string()
            }
            Err(RetryError::Exhausted {
                attempts: tried,
                error,
            }) => match error {
                AttemptError::Open(open) => {
                    if attempts.sink_calls.load(Ordering::Relaxed) == 0 {
                        metrics.skipped.inc_by(count as u64);
                        warn!(
                            records = count,
                            retry_in = ?open.retry_in,
                            "Circuit breaker open, skipping batch"
                        );
                        return WriteOutcome::Skipped {
                            records: count,
                            retry_in: open.retry_in,
                        };
                    }
                    // earlier attempts failed and opened the breaker
                    let last_error = attempts.last_error.lock().take();
                    last_error
                        .unwrap_or_else(|| format!("circuit breaker open for {:?}", open.retry_in))
                }
                AttemptError::Sink(e) => {
                    warn!(?e, attempts = tried, "Giving up on batch");
                    e.to_string()
                }
            },
        };

        let sink_calls = attempts.sink_calls.load(Ordering::Relaxed);
        match self.dead_letter.append(records, &error).await {
            Ok(()) => {
                metrics.dead_lettered.inc_by(count as u64);
                warn!(
                    records = count,
                    path = %self.dead_letter.path().display(),
                    %error,
                    "Batch written to dead-letter log"
                );
                WriteOutcome::DeadLettered {
                    records: count,
                    attempts: sink_calls,
                    error,
                }
            }
            Err(e) => {
                error!(?e, records = count, %error, "Records lost, dead-letter log unavailable");
                WriteOutcome::Lost {
                    records: count,
                    error,
                }
            }
        }
    }

    /// Splits off the records the sink can never accept, so they do not fail the rest of the
    /// batch with them.
    fn screen<'a>(
        &self,
        records: &'a [ParsedRecord],
    ) -> (Cow<'a, [ParsedRecord]>, Vec<(&'a ParsedRecord, Error)>) {
        let mut rejected = Vec::new();
        let mut valid = Vec::new();
        for record in records {
            match self.sink.check(record) {
                Ok(()) => valid.push(record),
                Err(e) => rejected.push((record, e)),
            }
        }
        if rejected.is_empty() {
            return (Cow::Borrowed(records), rejected);
        }
        let valid: Vec<ParsedRecord> = valid.into_iter().cloned().collect();
        (Cow::Owned(valid), rejected)
    }

    /// Dead-letters records set aside by [`Self::screen`], each with its own error.
    async fn dead_letter_rejected(&self, rejected: &[(&ParsedRecord, Error)]) -> WriteOutcome {
        let metrics = pipeline_metrics();
        let count = rejected.len();
        let mut failure = None;
        for (record, e) in rejected {
            let error = e.to_string();
            warn!(measurement = %record.measurement(), %error, "Record cannot be written");
            match self
                .dead_letter
                .append(std::slice::from_ref(*record), &error)
                .await
            {
                Ok(()) => {
                    metrics.dead_lettered.inc();
                }
                Err(e) => {
                    error!(?e, %error, "Record lost, dead-letter log unavailable");
                    failure = Some(error);
                }
            }
        }

        match failure {
            Some(error) => WriteOutcome::Lost {
                records: count,
                error,
            },
            None => WriteOutcome::DeadLettered {
                records: count,
                attempts: 0,
                error: rejected
                    .first()
                    .map(|(_, e)| e.to_string())
                    .unwrap_or_default(),
            },
        }
    }

    async fn attempt(
        &self,
        records: &[ParsedRecord],
        single: bool,
        attempts: &Attempts,
    ) -> Result<(), AttemptError> {
        let admission = self.breaker.try_acquire().map_err(AttemptError::Open)?;
        if admission == Admission::Trial {
            info!(records = records.len(), "Sending trial write");
        }

        attempts.sink_calls.fetch_add(1, Ordering::Relaxed);
        let result = match records {
            [record] if single => self.sink.write_point(record).await,
            _ => self.sink.write_batch(records).await,
        };
        match result {
            Ok(()) => {
                self.breaker.on_success();
                Ok(())
            }
            Err(e) => {
                pipeline_metrics().write_errors.inc();
                if e.is_retryable() {
                    self.breaker.on_failure();
                } else {
                    // the sink answered, it is only the data it did not like
                    self.breaker.on_success();
                }
                *attempts.last_error.lock() = Some(e.to_string());
                Err(AttemptError::Sink(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::*;
    use crate::breaker::CircuitState;
    use crate::record::FieldValue;
    use crate::sink::test_utils::MockSink;

    fn record(value: i64) -> ParsedRecord {
        ParsedRecord::new(
            "candles",
            [("close".to_string(), FieldValue::Integer(value))]
                .into_iter()
                .collect(),
            BTreeMap::new(),
            Utc.timestamp_opt(1_700_000_000 + value, 0).unwrap(),
        )
        .unwrap()
    }

    fn retry(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(60),
        }
    }

    fn breaker(threshold: usize) -> BreakerConfig {
        BreakerConfig {
            threshold,
            cooldown: Duration::from_secs(30),
        }
    }

    fn writer(
        sink: &MockSink,
        retry: RetryConfig,
        breaker: BreakerConfig,
        cancel: CancellationToken,
    ) -> (ResilientWriter<MockSink>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dead_letter = DeadLetterLog::new(dir.path().join("dlq.jsonl"));
        (
            ResilientWriter::new(sink.clone(), retry, breaker, dead_letter, cancel),
            dir,
        )
    }

    async fn dead_letter_lines(writer: &ResilientWriter<MockSink>) -> Vec<serde_json::Value> {
        match tokio::fs::read_to_string(writer.dead_letter.path()).await {
            Ok(content) => content
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_success() {
        let sink = MockSink::new();
        let (writer, _dir) = writer(&sink, retry(3), breaker(5), CancellationToken::new());

        let outcome = writer.write(&[record(1), record(2)]).await;
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                records: 2,
                attempts: 1
            }
        );
        assert_eq!(sink.batch_sizes(), vec![2]);
        assert!(dead_letter_lines(&writer).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let sink = MockSink::new();
        sink.fail_writes(2);
        let (writer, _dir) = writer(&sink, retry(3), breaker(5), CancellationToken::new());

        let start = Instant::now();
        let outcome = writer.write(&[record(1)]).await;
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                records: 1,
                attempts: 3
            }
        );
        // 10ms before the first retry, 20ms before the second
        assert_eq!(start.elapsed(), Duration::from_millis(30));
        assert_eq!(sink.write_calls(), 3);
        assert_eq!(writer.breaker().state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_is_dead_lettered_once() {
        let sink = MockSink::new();
        sink.fail_all_writes(true);
        let (writer, _dir) = writer(&sink, retry(3), breaker(10), CancellationToken::new());

        let start = Instant::now();
        let outcome = writer.write(&[record(1), record(2)]).await;
        let elapsed = start.elapsed();

        assert_eq!(
            outcome,
            WriteOutcome::DeadLettered {
                records: 2,
                attempts: 4,
                error: "Sink Error - injected write failure".to_string(),
            }
        );
        // 10 + 20 + 40
        assert!(elapsed >= Duration::from_millis(70), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(80), "{elapsed:?}");
        assert_eq!(sink.write_calls(), 4);

        let lines = dead_letter_lines(&writer).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["fields"]["close"], 1);
        assert_eq!(lines[1]["fields"]["close"], 2);
        for line in &lines {
            assert!(!line["error"].as_str().unwrap().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_capped() {
        let sink = MockSink::new();
        sink.fail_all_writes(true);
        let retry = RetryConfig {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        let (writer, _dir) = writer(&sink, retry, breaker(10), CancellationToken::new());

        let start = Instant::now();
        writer.write(&[record(1)]).await;
        // 100 + 200 + 250 + 250
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(810), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_without_sink_call() {
        let sink = MockSink::new();
        sink.fail_all_writes(true);
        let (writer, _dir) = writer(&sink, retry(0), breaker(5), CancellationToken::new());

        for i in 0..5 {
            let outcome = writer.write(&[record(i)]).await;
            assert!(matches!(outcome, WriteOutcome::DeadLettered { .. }), "{i}");
        }
        assert!(matches!(writer.breaker().state(), CircuitState::Open { .. }));

        let outcome = writer.write(&[record(5)]).await;
        assert_eq!(
            outcome,
            WriteOutcome::Skipped {
                records: 1,
                retry_in: Duration::from_secs(30)
            }
        );
        assert_eq!(sink.write_calls(), 5);
        assert_eq!(dead_letter_lines(&writer).await.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_dead_letters_last_error() {
        let sink = MockSink::new();
        sink.fail_all_writes(true);
        let (writer, _dir) = writer(&sink, retry(5), breaker(5), CancellationToken::new());

        let outcome = writer.write(&[record(1)]).await;
        assert_eq!(
            outcome,
            WriteOutcome::DeadLettered {
                records: 1,
                attempts: 5,
                error: "Sink Error - injected write failure".to_string(),
            }
        );
        // the sixth attempt never reached the sink
        assert_eq!(sink.write_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_after_cooldown_closes_breaker() {
        let sink = MockSink::new();
        sink.fail_all_writes(true);
        let (writer, _dir) = writer(&sink, retry(0), breaker(1), CancellationToken::new());

        writer.write(&[record(1)]).await;
        assert!(matches!(
            writer.write(&[record(2)]).await,
            WriteOutcome::Skipped { .. }
        ));

        sink.fail_all_writes(false);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            writer.write(&[record(3)]).await,
            WriteOutcome::Written {
                records: 1,
                attempts: 1
            }
        );
        assert_eq!(writer.breaker().state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_is_not_retried() {
        let sink = MockSink::new();
        sink.reject_writes(true);
        let (writer, _dir) = writer(&sink, retry(3), breaker(1), CancellationToken::new());

        let outcome = writer.write(&[record(1)]).await;
        assert!(
            matches!(outcome, WriteOutcome::DeadLettered { attempts: 1, .. }),
            "{outcome:?}"
        );
        assert_eq!(sink.write_calls(), 1);
        // a rejection does not count against the sink
        assert_eq!(writer.breaker().state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let sink = MockSink::new();
        sink.fail_all_writes(true);
        let cancel = CancellationToken::new();
        let retry = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        };
        let (writer, _dir) = writer(&sink, retry, breaker(10), cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let start = Instant::now();
        let outcome = writer.write(&[record(1)]).await;
        canceller.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(
            outcome,
            WriteOutcome::DeadLettered {
                records: 1,
                attempts: 1,
                error: Error::Cancelled.to_string(),
            }
        );
        // cancellation is not a sink failure
        assert_eq!(writer.breaker().state(), CircuitState::Closed { failures: 1 });
        let lines = dead_letter_lines(&writer).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["error"], "cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_point() {
        let sink = MockSink::new();
        sink.fail_writes(1);
        let (writer, _dir) = writer(&sink, retry(3), breaker(5), CancellationToken::new());

        assert_eq!(
            writer.write_point(&record(7)).await,
            WriteOutcome::Written {
                records: 1,
                attempts: 2
            }
        );
        assert_eq!(sink.batches(), vec![vec![record(7)]]);
    }

    fn without_fields(measurement: &str) -> ParsedRecord {
        ParsedRecord::new(
            measurement,
            BTreeMap::new(),
            BTreeMap::new(),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_record_does_not_fail_its_batch() {
        let sink = MockSink::new();
        let (writer, _dir) = writer(&sink, retry(3), breaker(5), CancellationToken::new());

        let outcome = writer
            .write(&[record(1), without_fields("cpu"), record(2)])
            .await;
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                records: 2,
                attempts: 1
            }
        );
        assert_eq!(sink.batches(), vec![vec![record(1), record(2)]]);

        let lines = dead_letter_lines(&writer).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["measurement"], "cpu");
        assert_eq!(
            lines[0]["error"],
            "Sink Rejected - point for measurement cpu has no fields"
        );
        assert_eq!(writer.breaker().state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_of_unwritable_records_never_reaches_sink() {
        let sink = MockSink::new();
        let (writer, _dir) = writer(&sink, retry(3), breaker(5), CancellationToken::new());

        let outcome = writer
            .write(&[without_fields("cpu"), without_fields("mem")])
            .await;
        assert_eq!(
            outcome,
            WriteOutcome::DeadLettered {
                records: 2,
                attempts: 0,
                error: "Sink Rejected - point for measurement cpu has no fields".to_string(),
            }
        );
        assert_eq!(sink.write_calls(), 0);

        let lines = dead_letter_lines(&writer).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1]["error"],
            "Sink Rejected - point for measurement mem has no fields"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writes_do_not_overlap() {
        let sink = MockSink::new();
        sink.set_write_latency(Duration::from_millis(100));
        let (writer, _dir) = writer(&sink, retry(3), breaker(5), CancellationToken::new());

        let batch = [record(1), record(2)];
        let point = record(3);
        let start = Instant::now();
        let (first, second) = tokio::join!(writer.write(&batch), writer.write_point(&point));
        assert!(matches!(first, WriteOutcome::Written { records: 2, .. }));
        assert!(matches!(second, WriteOutcome::Written { records: 1, .. }));

        assert_eq!(sink.max_in_flight(), 1);
        assert_eq!(sink.write_calls(), 2);
        // one after the other
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_lost_when_dead_letter_unwritable() {
        let sink = MockSink::new();
        sink.reject_writes(true);
        let dir = tempfile::tempdir().unwrap();
        let dead_letter = DeadLetterLog::new(dir.path().join("missing").join("dlq.jsonl"));
        let writer = ResilientWriter::new(
            sink,
            retry(0),
            breaker(5),
            dead_letter,
            CancellationToken::new(),
        );

        assert!(matches!(
            writer.write(&[record(1)]).await,
            WriteOutcome::Lost { records: 1, .. }
        ));
    }
}
