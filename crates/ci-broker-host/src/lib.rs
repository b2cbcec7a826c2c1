//! Per-host supervisor: binds accepted jobs to a bounded pool of
//! numbered slots and drives the microVM lifecycle under crash,
//! cancellation and retry. See the design ledger's §4.4 for the state
//! machine this implements.

use ci_broker_lifecycle::Activity;
use ci_broker_provider::Provider;
use ci_broker_queue::{FetchMode, WorkQueue};
use ci_broker_types::{unframe, RoutingKey, WorkflowJobEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// How long to pause before reopening the completed-drain consumer
/// after a fetch/iteration error.
const DRAIN_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// How long to idle between no-wait fetches that found nothing. The
/// distilled spec only calls out a sleep on the *error* path; an
/// unconditional no-wait loop with no idle pause on the empty-success
/// path would otherwise hammer the messaging substrate for no benefit.
/// See DESIGN.md for this judgment call.
const DRAIN_IDLE_POLL: Duration = Duration::from_millis(750);

pub struct HostScheduler {
    provider: Arc<dyn Provider>,
    queue: Arc<dyn WorkQueue>,
    hostname: String,
    prefix: String,
    num_workers: usize,
    /// One `Activity` per slot currently bound to a running VM, so
    /// process shutdown waits for in-flight runners to wind down before
    /// the VMs are cancelled out from under it.
    running: AsyncMutex<HashMap<usize, Activity>>,
}

impl HostScheduler {
    pub fn new(
        provider: Arc<dyn Provider>,
        queue: Arc<dyn WorkQueue>,
        hostname: impl Into<String>,
        prefix: impl Into<String>,
        num_workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            queue,
            hostname: hostname.into(),
            prefix: prefix.into(),
            num_workers: num_workers.max(1),
            running: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn queued_stream_name(&self) -> String {
        format!("{}queued", self.prefix)
    }

    pub fn completed_stream_name(&self) -> String {
        format!("{}completed", self.prefix)
    }

    fn completed_subject(&self) -> String {
        RoutingKey::completed(&self.prefix, &self.hostname).subject()
    }

    /// Startup sequence: validate provider preconditions, ensure both
    /// streams exist, start the completed-drain loop, then saturate the
    /// slot pool. Returns once the fill loop has finished its first
    /// pass; the drain loop and any spawned completion workers keep
    /// running in the background for the lifetime of the process.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        self.provider
            .init()
            .await
            .map_err(|err| anyhow::anyhow!("provider precondition failed: {err:#}"))?;

        self.queue.ensure_stream(&self.queued_stream_name()).await?;
        self.queue.ensure_stream(&self.completed_stream_name()).await?;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.completed_drain_loop().await });

        self.fill_loop().await;
        Ok(())
    }

    /// Idempotent; repeatedly `next()`s the slot pool and starts a VM on
    /// each free slot, stopping when the pool is saturated. May be
    /// re-entered after any completion frees a slot.
    async fn fill_loop(self: &Arc<Self>) {
        while let Some(slot) = self.provider.next() {
            let id = slot.id();
            match self.provider.start_runner(&slot).await {
                Ok(()) => {
                    info!(slot = id, uid = slot.uid(), "runner started");
                    let activity = Activity::get_opt(format!("runner on slot {id}"));
                    let mut running = self.running.lock().await;
                    if let Some(activity) = activity {
                        running.insert(id, activity);
                    }
                }
                Err(err) => {
                    // Terminal for this slot acquisition (§4.4): release
                    // it and stop this pass rather than looping straight
                    // back into `next()`, which would just hand us the
                    // same lowest-index slot again and spin forever
                    // against a persistently failing provider. The slot
                    // is left for the next fill, e.g. the one re-entered
                    // after the next completion.
                    error!(slot = id, %err, "failed to start runner; releasing slot");
                    self.provider.done(slot);
                    break;
                }
            }
        }
    }

    async fn completed_drain_loop(self: Arc<Self>) {
        let stream_name = self.completed_stream_name();
        let subject = self.completed_subject();

        loop {
            if ci_broker_lifecycle::is_shutting_down() {
                debug!("completed-drain loop exiting: process is shutting down");
                return;
            }

            // Purge once per consumer (re)open, not once per fetch: this
            // is meant to discard stale completions left over from a
            // prior process lifetime for this host (§4.4), not to wipe
            // out completions published during steady-state operation.
            if let Err(err) = self.queue.purge(&stream_name, &subject).await {
                warn!(%err, "failed to purge stale completions, retrying");
                tokio::time::sleep(DRAIN_ERROR_BACKOFF).await;
                continue;
            }

            loop {
                if ci_broker_lifecycle::is_shutting_down() {
                    debug!("completed-drain loop exiting: process is shutting down");
                    return;
                }

                match self.drain_once(&stream_name, &subject).await {
                    Ok(found_any) => {
                        if !found_any {
                            tokio::time::sleep(DRAIN_IDLE_POLL).await;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "completed-drain iteration failed, reopening consumer");
                        tokio::time::sleep(DRAIN_ERROR_BACKOFF).await;
                        break;
                    }
                }
            }
        }
    }

    /// One steady-state fetch: fetch up to `num_workers` with no-wait
    /// (each call opens and tears down its own ephemeral consumer, per
    /// the create-consume-delete discipline) and dispatch each message
    /// to a short-lived worker. Returns whether any message was found.
    async fn drain_once(self: &Arc<Self>, stream_name: &str, subject: &str) -> anyhow::Result<bool> {
        let batch = self
            .queue
            .consume(stream_name, subject, self.num_workers, FetchMode::NoWait)
            .await?;

        let found_any = !batch.is_empty();
        for message in batch {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.handle_completed(message).await });
        }
        Ok(found_any)
    }

    async fn handle_completed(self: Arc<Self>, message: Box<dyn ci_broker_queue::QueuedMessage>) {
        match self.process_completed(message.data()).await {
            Ok(()) => {
                if let Err(err) = message.double_ack().await {
                    error!(%err, "double_ack failed after processing completed message");
                }
            }
            Err(err) => {
                // Leave the message unacked; redelivery (bounded at 5
                // attempts) gives it another chance. Never silently
                // drop a slot's fate here.
                error!(%err, "failed to process completed message");
            }
        }
    }

    async fn process_completed(self: &Arc<Self>, framed: &[u8]) -> anyhow::Result<()> {
        let (_event_type, payload) = unframe(framed)?;
        let event: WorkflowJobEvent = serde_json::from_slice(payload)?;

        self.provider
            .stop_runner(&event)
            .await
            .map_err(|err| anyhow::anyhow!("stop_runner failed: {err:#}"))?;

        // We don't learn the freed slot's numeric id from the event
        // alone (the provider owns the uid->id mapping), so we can't
        // drop its `Activity` entry precisely here. The fill-loop below
        // either overwrites the map entry for whatever id it restarts on
        // or, on a start failure, removes it explicitly — so the map
        // never undercounts live tenancies, only (harmlessly) overcounts
        // a freed-but-not-yet-refilled slot for one extra drain cycle.
        if let Some(slot) = self.provider.next() {
            let id = slot.id();
            match self.provider.start_runner(&slot).await {
                Ok(()) => {
                    info!(slot = id, uid = slot.uid(), "replacement runner started");
                    let activity = Activity::get_opt(format!("runner on slot {id}"));
                    let mut running = self.running.lock().await;
                    if let Some(activity) = activity {
                        running.insert(id, activity);
                    } else {
                        running.remove(&id);
                    }
                }
                Err(err) => {
                    error!(slot = id, %err, "failed to start replacement runner; releasing slot");
                    self.provider.done(slot);
                    self.running.lock().await.remove(&id);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ci_broker_provider::FakeProvider;
    use ci_broker_queue::FakeWorkQueue;
    use ci_broker_slots::SlotPool;
    use ci_broker_types::{frame, Organization, Repository, RepositoryOwner, WorkflowJob};

    fn completed_payload(runner_name: &str) -> Vec<u8> {
        let event = WorkflowJobEvent {
            action: "completed".to_string(),
            workflow_job: WorkflowJob {
                id: 1,
                run_id: 42,
                run_attempt: 1,
                name: "build".to_string(),
                labels: vec!["firecracker".to_string()],
                runner_name: Some(runner_name.to_string()),
                extra: Default::default(),
            },
            organization: Some(Organization {
                login: "acme".to_string(),
            }),
            repository: Repository {
                name: "widgets".to_string(),
                owner: RepositoryOwner {
                    login: "acme".to_string(),
                },
            },
            extra: Default::default(),
        };
        frame("workflow_job", &serde_json::to_vec(&event).unwrap())
    }

    #[tokio::test]
    async fn fill_loop_saturates_pool() {
        let pool = Arc::new(SlotPool::new(2, std::env::temp_dir().join("host-test-fill")));
        let provider = Arc::new(FakeProvider::new(pool.clone()));
        let queue = Arc::new(FakeWorkQueue::new());

        let scheduler = HostScheduler::new(provider.clone(), queue, "host7", "ghactions.", 1);
        scheduler.fill_loop().await;

        assert_eq!(provider.start_count(), 2);
        assert_eq!(pool.in_use_count(), 2);
    }

    #[tokio::test]
    async fn fill_loop_is_a_noop_once_saturated() {
        let pool = Arc::new(SlotPool::new(1, std::env::temp_dir().join("host-test-refill")));
        let provider = Arc::new(FakeProvider::new(pool.clone()));
        let queue = Arc::new(FakeWorkQueue::new());

        let scheduler = HostScheduler::new(provider.clone(), queue, "host7", "ghactions.", 1);
        scheduler.fill_loop().await;
        assert_eq!(provider.start_count(), 1);

        scheduler.fill_loop().await;
        assert_eq!(provider.start_count(), 1, "saturated pool takes no further starts");
    }

    #[tokio::test]
    async fn fill_loop_does_not_retry_a_failed_slot_within_the_same_pass() {
        let pool = Arc::new(SlotPool::new(2, std::env::temp_dir().join("host-test-fill-fail")));
        let provider = Arc::new(FakeProvider::new(pool.clone()));
        let queue = Arc::new(FakeWorkQueue::new());
        provider.fail_next_start();

        let scheduler = HostScheduler::new(provider.clone(), queue, "host7", "ghactions.", 1);
        scheduler.fill_loop().await;

        // The failed slot was released, not retried in place, and the
        // pass stopped there rather than looping straight back into
        // `next()` (which would just hand back the same freed slot).
        assert_eq!(provider.start_count(), 0);
        assert_eq!(pool.in_use_count(), 0);

        // Re-entering the fill loop (as happens on the next completion)
        // picks the slot back up normally.
        scheduler.fill_loop().await;
        assert_eq!(provider.start_count(), 2);
    }

    #[tokio::test]
    async fn process_completed_stops_and_restarts() {
        let pool = Arc::new(SlotPool::new(1, std::env::temp_dir().join("host-test-process")));
        let provider = Arc::new(FakeProvider::new(pool.clone()));
        let queue = Arc::new(FakeWorkQueue::new());

        let scheduler = HostScheduler::new(provider.clone(), queue, "host7", "ghactions.", 1);

        let slot = provider.next().expect("slot available");
        provider.start_runner(&slot).await.unwrap();
        let runner_name = slot.runner_name("host7");

        let payload = completed_payload(&runner_name);
        scheduler.process_completed(&payload).await.unwrap();

        assert_eq!(provider.stop_count(), 1);
        // A replacement runner should have been started on the freed slot.
        assert_eq!(provider.start_count(), 2);
        assert_eq!(pool.in_use_count(), 1);
    }

    #[tokio::test]
    async fn drain_once_dispatches_and_reports_presence() {
        let pool = Arc::new(SlotPool::new(1, std::env::temp_dir().join("host-test-drain")));
        let provider = Arc::new(FakeProvider::new(pool.clone()));
        let queue = Arc::new(FakeWorkQueue::new());

        let slot = provider.next().expect("slot available");
        provider.start_runner(&slot).await.unwrap();
        let runner_name = slot.runner_name("host7");

        let scheduler = HostScheduler::new(provider.clone(), queue.clone(), "host7", "ghactions.", 1);
        let subject = scheduler.completed_subject();
        queue
            .publish(&subject, completed_payload(&runner_name), None)
            .await
            .unwrap();

        let found = scheduler
            .drain_once(&scheduler.completed_stream_name(), &subject)
            .await
            .unwrap();
        assert!(found);

        // Give the spawned worker a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.stop_count(), 1);
    }
}
