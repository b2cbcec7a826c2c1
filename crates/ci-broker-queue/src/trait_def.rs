use async_trait::async_trait;
use std::time::Duration;

/// How long a `consume` call is willing to wait for at least one message
/// before returning an empty batch.
#[derive(Debug, Clone, Copy)]
pub enum FetchMode {
    /// Return immediately with whatever is already buffered.
    NoWait,
    /// Block up to the given duration for the first message to arrive.
    Wait(Duration),
}

/// A single delivered message. `double_ack` blocks until the server has
/// confirmed the acknowledgement, giving exactly-once acknowledgement
/// semantics (not exactly-once delivery — redelivery still happens if
/// the consumer crashes before acking).
#[async_trait]
pub trait QueuedMessage: Send + Sync {
    fn data(&self) -> &[u8];
    async fn double_ack(self: Box<Self>) -> anyhow::Result<()>;
}

/// Work-queue semantics over two subject namespaces (`<prefix>queued`
/// and `<prefix>completed`). Abstracts the four operations the core
/// depends on so that the classifier, host scheduler and job-lease
/// consumer can be exercised against an in-memory fake without a
/// running JetStream server.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Idempotent create with the fixed stream config; tolerates
    /// "already exists".
    async fn ensure_stream(&self, stream_name: &str) -> anyhow::Result<()>;

    /// At-least-once publish; returns once the server has acknowledged
    /// receipt. `dedup_id`, when given, is carried as the stream's
    /// message-id for the deduplication window (§3): two publishes with
    /// the same `dedup_id` within that window collapse to one message.
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_id: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Create-or-update an ephemeral consumer on `stream_name` filtered
    /// by `subject`, fetch up to `batch` messages, then delete the
    /// consumer before returning (or on error). `stream_name` names one
    /// of the two streams `ensure_stream` was called with; `subject`
    /// must match one of that stream's partitions.
    async fn consume(
        &self,
        stream_name: &str,
        subject: &str,
        batch: usize,
        mode: FetchMode,
    ) -> anyhow::Result<Vec<Box<dyn QueuedMessage>>>;

    /// Discard all currently buffered messages matching `subject`
    /// without consuming them.
    async fn purge(&self, stream_name: &str, subject: &str) -> anyhow::Result<()>;
}
