//! In-memory fake, gated behind the `test-util` feature, so the
//! classifier, host scheduler and job-lease crates can be unit tested
//! without a running JetStream server. Mirrors the `spool::Spool`
//! trait-object seam used elsewhere for exactly this purpose.

use crate::trait_def::{FetchMode, QueuedMessage, WorkQueue};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;

struct FakeMessage {
    data: Vec<u8>,
}

#[async_trait]
impl QueuedMessage for FakeMessage {
    fn data(&self) -> &[u8] {
        &self.data
    }

    async fn double_ack(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Subject-partitioned in-memory queue. Each subject gets its own FIFO
/// `VecDeque`; `ensure_stream` just records the stream name so tests can
/// assert it was called. `dedup_ids` mirrors the real stream's
/// deduplication window well enough for tests: a `dedup_id` seen once is
/// never published again for the lifetime of this fake.
#[derive(Default)]
pub struct FakeWorkQueue {
    subjects: Mutex<std::collections::HashMap<String, VecDeque<Vec<u8>>>>,
    streams: Mutex<HashSet<String>>,
    dedup_ids: Mutex<HashSet<String>>,
}

impl FakeWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: how many messages are currently buffered on a
    /// subject.
    pub async fn depth(&self, subject: &str) -> usize {
        self.subjects
            .lock()
            .await
            .get(subject)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn streams_ensured(&self) -> Vec<String> {
        let mut names: Vec<_> = self.streams.lock().await.iter().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl WorkQueue for FakeWorkQueue {
    async fn ensure_stream(&self, stream_name: &str) -> anyhow::Result<()> {
        self.streams.lock().await.insert(stream_name.to_string());
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>, dedup_id: Option<&str>) -> anyhow::Result<()> {
        if let Some(id) = dedup_id {
            let mut seen = self.dedup_ids.lock().await;
            if !seen.insert(id.to_string()) {
                return Ok(());
            }
        }
        self.subjects
            .lock()
            .await
            .entry(subject.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn consume(
        &self,
        _stream_name: &str,
        subject: &str,
        batch: usize,
        mode: FetchMode,
    ) -> anyhow::Result<Vec<Box<dyn QueuedMessage>>> {
        let mut subjects = self.subjects.lock().await;
        let queue = subjects.entry(subject.to_string()).or_default();

        if queue.is_empty() {
            if let FetchMode::Wait(timeout) = mode {
                drop(subjects);
                tokio::time::sleep(timeout.min(std::time::Duration::from_millis(50))).await;
                subjects = self.subjects.lock().await;
            }
        }
        let queue = subjects.entry(subject.to_string()).or_default();

        let mut out = Vec::new();
        for _ in 0..batch {
            match queue.pop_front() {
                Some(data) => out.push(Box::new(FakeMessage { data }) as Box<dyn QueuedMessage>),
                None => break,
            }
        }
        Ok(out)
    }

    async fn purge(&self, _stream_name: &str, subject: &str) -> anyhow::Result<()> {
        self.subjects
            .lock()
            .await
            .entry(subject.to_string())
            .or_default()
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_fifo() {
        let q = FakeWorkQueue::new();
        q.publish("queued.f0", b"one".to_vec(), None).await.unwrap();
        q.publish("queued.f0", b"two".to_vec(), None).await.unwrap();

        let batch = q
            .consume("queued", "queued.f0", 10, FetchMode::NoWait)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].data(), b"one");
        assert_eq!(batch[1].data(), b"two");

        // Messages were removed by consume, not just peeked.
        assert_eq!(q.depth("queued.f0").await, 0);
    }

    #[tokio::test]
    async fn purge_discards_without_delivering() {
        let q = FakeWorkQueue::new();
        q.publish("completed.host7", b"x".to_vec(), None).await.unwrap();
        q.purge("completed", "completed.host7").await.unwrap();
        assert_eq!(q.depth("completed.host7").await, 0);
    }

    #[tokio::test]
    async fn duplicate_dedup_id_collapses_to_one_message() {
        let q = FakeWorkQueue::new();
        q.publish("queued.f0", b"one".to_vec(), Some("42-build-1"))
            .await
            .unwrap();
        q.publish("queued.f0", b"one-again".to_vec(), Some("42-build-1"))
            .await
            .unwrap();

        assert_eq!(q.depth("queued.f0").await, 1);
    }
}
