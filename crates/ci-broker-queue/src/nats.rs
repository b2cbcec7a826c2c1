//! Real backend: NATS JetStream via `async-nats`. Connection bootstrap
//! mirrors `mod-nats::build_client`, trimmed of the Lua-config surface
//! (this crate is consumed from Rust, not from a policy engine) and of
//! the TLS/cert options the distilled spec never exercises.

use crate::config;
use crate::trait_def::{FetchMode, QueuedMessage, WorkQueue};
use anyhow::Context as _;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::context::PublishAckFuture;
use async_nats::jetstream::stream::{Config as StreamConfig, DiscardPolicy, RetentionPolicy};
use async_nats::jetstream::{self, AckKind, Context, Message};
use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use ci_broker_secrets::KeySource;
use std::time::Duration;
use tracing::debug;

/// Connection options for the messaging substrate. Username/password
/// read through `KeySource` so the credentials can come from
/// `NATS_USERNAME`/`NATS_PASSWORD` (or the `NATS_USER`/`NATS_PASS`
/// fallback pair) without being written into a config file.
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub username: Option<KeySource>,
    pub password: Option<KeySource>,
}

impl NatsConfig {
    /// Build connection options from the environment, matching the
    /// fallback pair called out in the external interfaces: prefer
    /// `NATS_USERNAME`/`NATS_PASSWORD`, fall back to
    /// `NATS_USER`/`NATS_PASS`.
    pub fn from_env(servers: Vec<String>) -> Self {
        let username =
            first_env(&["NATS_USERNAME", "NATS_USER"]).map(|env_var| KeySource::Env { env_var });
        let password =
            first_env(&["NATS_PASSWORD", "NATS_PASS"]).map(|env_var| KeySource::Env { env_var });
        Self {
            servers,
            username,
            password,
        }
    }

    pub async fn connect(&self) -> anyhow::Result<NatsWorkQueue> {
        let mut opts = ConnectOptions::new();
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            let username = username.get_string().await.context("reading NATS username")?;
            let password = password.get_string().await.context("reading NATS password")?;
            opts = opts.user_and_password(username, password);
        }
        let client = opts
            .connect(self.servers.clone())
            .await
            .context("connecting to NATS")?;
        Ok(NatsWorkQueue {
            context: jetstream::new(client),
        })
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find(|name| std::env::var(name).is_ok())
        .map(|name| name.to_string())
}

pub struct NatsWorkQueue {
    context: Context,
}

#[async_trait]
impl QueuedMessage for Message {
    fn data(&self) -> &[u8] {
        &self.payload
    }

    async fn double_ack(self: Box<Self>) -> anyhow::Result<()> {
        self.ack_with(AckKind::Ack)
            .await
            .map_err(|err| anyhow::anyhow!("double_ack failed: {err:#}"))
    }
}

#[async_trait]
impl WorkQueue for NatsWorkQueue {
    async fn ensure_stream(&self, stream_name: &str) -> anyhow::Result<()> {
        self.context
            .get_or_create_stream(StreamConfig {
                name: stream_name.to_string(),
                subjects: vec![format!("{stream_name}.>")],
                retention: RetentionPolicy::WorkQueue,
                discard: DiscardPolicy::Old,
                max_age: config::MAX_AGE,
                max_message_size: config::MAX_MESSAGE_SIZE as i32,
                num_replicas: config::REPLICAS,
                duplicate_window: config::DEDUPLICATE_WINDOW,
                ..Default::default()
            })
            .await
            .with_context(|| format!("ensuring stream {stream_name} exists"))?;
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>, dedup_id: Option<&str>) -> anyhow::Result<()> {
        let ack = match dedup_id {
            Some(id) => {
                let mut headers = HeaderMap::new();
                headers.insert("Nats-Msg-Id", id);
                self.context
                    .publish_with_headers(subject.to_string(), headers, payload.into())
                    .await
                    .with_context(|| format!("publishing to {subject}"))?
            }
            None => self
                .context
                .publish(subject.to_string(), payload.into())
                .await
                .with_context(|| format!("publishing to {subject}"))?,
        };
        wait_for_ack(ack).await
    }

    async fn consume(
        &self,
        stream_name: &str,
        subject: &str,
        batch: usize,
        mode: FetchMode,
    ) -> anyhow::Result<Vec<Box<dyn QueuedMessage>>> {
        let stream = self
            .context
            .get_stream(stream_name)
            .await
            .with_context(|| format!("looking up stream {stream_name}"))?;

        let consumer = stream
            .create_consumer(PullConfig {
                filter_subject: subject.to_string(),
                max_deliver: config::MAX_DELIVER,
                ..Default::default()
            })
            .await
            .with_context(|| format!("creating ephemeral consumer on {subject}"))?;

        let result = fetch_batch(&consumer, batch, mode).await;

        // Ephemeral consumers are deleted on exit regardless of outcome:
        // a long-lived pull consumer bound to a durable name was
        // observed to silently disconnect under load, so nothing here
        // should outlive a single fetch.
        if let Err(err) = consumer.delete().await {
            debug!(%err, subject, "failed to delete ephemeral consumer (likely already gone)");
        }

        result
    }

    async fn purge(&self, stream_name: &str, subject: &str) -> anyhow::Result<()> {
        let stream = self
            .context
            .get_stream(stream_name)
            .await
            .with_context(|| format!("looking up stream {stream_name}"))?;
        stream
            .purge()
            .filter(subject)
            .await
            .with_context(|| format!("purging subject {subject}"))?;
        Ok(())
    }
}

async fn wait_for_ack(ack: PublishAckFuture) -> anyhow::Result<()> {
    ack.await
        .map_err(|err| anyhow::anyhow!("publish was not acknowledged: {err:#}"))?;
    Ok(())
}

async fn fetch_batch(
    consumer: &async_nats::jetstream::consumer::Consumer<PullConfig>,
    batch: usize,
    mode: FetchMode,
) -> anyhow::Result<Vec<Box<dyn QueuedMessage>>> {
    use futures::StreamExt;

    let mut messages = match mode {
        FetchMode::NoWait => consumer
            .batch()
            .max_messages(batch)
            .no_wait()
            .messages()
            .await
            .context("starting no-wait fetch")?,
        FetchMode::Wait(timeout) => consumer
            .fetch()
            .max_messages(batch)
            .expires(as_nats_expiry(timeout))
            .messages()
            .await
            .context("starting fetch")?,
    };

    let mut out = Vec::with_capacity(batch);
    while let Some(message) = messages.next().await {
        let message = message.context("reading message from fetch batch")?;
        out.push(Box::new(message) as Box<dyn QueuedMessage>);
    }
    Ok(out)
}

/// JetStream rejects an `expires` of zero; clamp to a sane minimum.
fn as_nats_expiry(d: Duration) -> Duration {
    d.max(Duration::from_millis(1))
}
