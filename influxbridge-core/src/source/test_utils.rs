//! In-memory message source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Error;
use crate::error::Result;
use crate::source::{MessageSource, RawMessage, SourceOffset};

#[derive(Debug, Default)]
struct Inner {
    pending: Mutex<VecDeque<RawMessage>>,
    next_offset: AtomicUsize,
    subscribed: Mutex<Vec<String>>,
    committed: Mutex<Vec<SourceOffset>>,
    fail_commits: AtomicBool,
    fail_polls: AtomicUsize,
    unreachable: AtomicBool,
    closed: AtomicBool,
}

/// Messages pushed into it are handed out one per poll on partition 0 of `topic`.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemorySource {
    topic: String,
    inner: Arc<Inner>,
}

impl InMemorySource {
    pub(crate) fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            inner: Arc::default(),
        }
    }

    /// Queues a payload and returns the offset it will be delivered with.
    pub(crate) fn push(&self, payload: impl Into<Bytes>) -> SourceOffset {
        let offset = SourceOffset {
            topic: self.topic.clone(),
            partition: 0,
            offset: self.inner.next_offset.fetch_add(1, Ordering::SeqCst) as i64,
        };
        self.inner.pending.lock().push_back(RawMessage {
            payload: payload.into(),
            offset: offset.clone(),
        });
        offset
    }

    pub(crate) fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub(crate) fn committed(&self) -> Vec<SourceOffset> {
        self.inner.committed.lock().clone()
    }

    pub(crate) fn subscribed(&self) -> Vec<String> {
        self.inner.subscribed.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_commits(&self, fail: bool) {
        self.inner.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_polls(&self, count: usize) {
        self.inner.fail_polls.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl MessageSource for InMemorySource {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        self.inner.subscribed.lock().extend(topics.iter().cloned());
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<RawMessage>> {
        if self
            .inner
            .fail_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Source("injected poll failure".to_string()));
        }
        let message = self.inner.pending.lock().pop_front();
        if message.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(message)
    }

    async fn commit(&self, offset: &SourceOffset) -> Result<()> {
        if self.inner.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Source("injected commit failure".to_string()));
        }
        self.inner.committed.lock().push(offset.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> Result<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Source("brokers unreachable".to_string()));
        }
        Ok(())
    }
}
