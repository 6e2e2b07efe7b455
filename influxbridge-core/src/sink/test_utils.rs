//! In-memory sink and provisioning doubles with failure injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::Error;
use crate::error::Result;
use crate::record::ParsedRecord;
use crate::sink::{Provisioning, Sink};

#[derive(Debug, Default)]
struct Injector {
    /// Fail the next N writes.
    fail_next_writes: AtomicUsize,
    fail_all_writes: AtomicBool,
    /// Answer writes with a non-retryable rejection instead of a sink error.
    reject_writes: AtomicBool,
    unhealthy: AtomicBool,
    ping_latency_ms: AtomicU64,
    write_latency_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct Inner {
    injector: Injector,
    write_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batches: Mutex<Vec<Vec<ParsedRecord>>>,
}

/// Records every accepted batch.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSink {
    inner: Arc<Inner>,
}

impl MockSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_writes(&self, count: usize) {
        self.inner
            .injector
            .fail_next_writes
            .store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_all_writes(&self, fail: bool) {
        self.inner
            .injector
            .fail_all_writes
            .store(fail, Ordering::SeqCst);
    }

    pub(crate) fn reject_writes(&self, reject: bool) {
        self.inner
            .injector
            .reject_writes
            .store(reject, Ordering::SeqCst);
    }

    pub(crate) fn set_unhealthy(&self, unhealthy: bool) {
        self.inner
            .injector
            .unhealthy
            .store(unhealthy, Ordering::SeqCst);
    }

    pub(crate) fn set_ping_latency(&self, latency: Duration) {
        self.inner
            .injector
            .ping_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_write_latency(&self, latency: Duration) {
        self.inner
            .injector
            .write_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Most write calls that were running at the same time.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of write calls that reached the sink, failed or not.
    pub(crate) fn write_calls(&self) -> usize {
        self.inner.write_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn batches(&self) -> Vec<Vec<ParsedRecord>> {
        self.inner.batches.lock().clone()
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batches.lock().iter().map(Vec::len).collect()
    }

    pub(crate) fn written(&self) -> usize {
        self.inner.batches.lock().iter().map(Vec::len).sum()
    }

    fn should_fail(&self) -> bool {
        let injector = &self.inner.injector;
        if injector.fail_all_writes.load(Ordering::SeqCst) {
            return true;
        }
        injector
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn accept(&self, records: &[ParsedRecord]) -> Result<()> {
        if self.inner.injector.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Rejected("unable to parse points".to_string()));
        }
        if self.should_fail() {
            return Err(Error::Sink("injected write failure".to_string()));
        }
        self.inner.batches.lock().push(records.to_vec());
        Ok(())
    }
}

impl Sink for MockSink {
    async fn write_batch(&self, records: &[ParsedRecord]) -> Result<()> {
        self.inner.write_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let latency = self.inner.injector.write_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let result = self.accept(records);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn write_point(&self, record: &ParsedRecord) -> Result<()> {
        self.write_batch(std::slice::from_ref(record)).await
    }

    /// Like InfluxDB, a record without fields cannot be written.
    fn check(&self, record: &ParsedRecord) -> Result<()> {
        if record.fields().is_empty() {
            return Err(Error::Rejected(format!(
                "point for measurement {} has no fields",
                record.measurement()
            )));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        let latency = self.inner.injector.ping_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(!self.inner.injector.unhealthy.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct Store {
    /// name -> id
    orgs: HashMap<String, String>,
    /// (org id, name) -> id
    buckets: HashMap<(String, String), (String, u64)>,
    orgs_created: usize,
    buckets_created: usize,
}

/// In-memory organizations and buckets.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockProvisioning {
    store: Arc<Mutex<Store>>,
    /// Creates the resource behind the caller's back and answers with a conflict, as if a
    /// concurrent instance won the race.
    race_on_create: Arc<AtomicBool>,
    fail_lookups: Arc<AtomicBool>,
}

impl MockProvisioning {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn race_on_create(&self, race: bool) {
        self.race_on_create.store(race, Ordering::SeqCst);
    }

    pub(crate) fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn orgs_created(&self) -> usize {
        self.store.lock().orgs_created
    }

    pub(crate) fn buckets_created(&self) -> usize {
        self.store.lock().buckets_created
    }

    pub(crate) fn bucket_retention(&self, org_id: &str, name: &str) -> Option<u64> {
        self.store
            .lock()
            .buckets
            .get(&(org_id.to_string(), name.to_string()))
            .map(|(_, retention)| *retention)
    }

    fn check_lookups(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::Sink("connection refused".to_string()));
        }
        Ok(())
    }
}

impl Provisioning for MockProvisioning {
    async fn find_organization(&self, name: &str) -> Result<Option<String>> {
        self.check_lookups()?;
        Ok(self.store.lock().orgs.get(name).cloned())
    }

    async fn create_organization(&self, name: &str) -> Result<String> {
        let mut store = self.store.lock();
        if store.orgs.contains_key(name) {
            return Err(Error::Conflict(format!("organization {name} already exists")));
        }
        let id = format!("org-{}", store.orgs.len() + 1);
        store.orgs.insert(name.to_string(), id.clone());
        if self.race_on_create.load(Ordering::SeqCst) {
            return Err(Error::Conflict(format!("organization {name} already exists")));
        }
        store.orgs_created += 1;
        Ok(id)
    }

    async fn find_bucket(&self, org_id: &str, name: &str) -> Result<Option<String>> {
        self.check_lookups()?;
        Ok(self
            .store
            .lock()
            .buckets
            .get(&(org_id.to_string(), name.to_string()))
            .map(|(id, _)| id.clone()))
    }

    async fn create_bucket(
        &self,
        org_id: &str,
        name: &str,
        retention_seconds: u64,
    ) -> Result<String> {
        let mut store = self.store.lock();
        let key = (org_id.to_string(), name.to_string());
        if store.buckets.contains_key(&key) {
            return Err(Error::Conflict(format!("bucket {name} already exists")));
        }
        let id = format!("bucket-{}", store.buckets.len() + 1);
        store.buckets.insert(key, (id.clone(), retention_seconds));
        if self.race_on_create.load(Ordering::SeqCst) {
            return Err(Error::Conflict(format!("bucket {name} already exists")));
        }
        store.buckets_created += 1;
        Ok(id)
    }
}
