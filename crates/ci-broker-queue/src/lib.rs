//! Durable work-queue wrapper providing work-queue semantics over two
//! subject namespaces (`<prefix>queued`, `<prefix>completed`) in an
//! external messaging substrate. The real backend is NATS JetStream via
//! `async-nats`; the `WorkQueue` trait lets the classifier, host
//! scheduler and job-lease consumer be exercised against an in-memory
//! fake in tests.

mod config;
mod nats;
mod trait_def;

#[cfg(any(test, feature = "test-util"))]
mod fake;

pub use config::{DEDUPLICATE_WINDOW, MAX_AGE, MAX_DELIVER, MAX_MESSAGE_SIZE, REPLICAS};
pub use nats::{NatsConfig, NatsWorkQueue};
pub use trait_def::{FetchMode, QueuedMessage, WorkQueue};

#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeWorkQueue;
