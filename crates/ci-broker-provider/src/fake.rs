use crate::Provider;
use async_trait::async_trait;
use ci_broker_slots::{SlotHandle, SlotPool};
use ci_broker_types::{suffix_from_runner_name, WorkflowJobEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Calls {
    starts: Vec<usize>,
    stops: Vec<usize>,
}

/// Records start/stop calls and always succeeds; owns a real
/// `SlotPool` so tests exercise the same acquire/release invariants the
/// production provider would. Mirrors how `spool::Spool` implementors
/// are swapped out for tests against a `local_disk` backend.
pub struct FakeProvider {
    pool: Arc<SlotPool>,
    calls: Mutex<Calls>,
    /// uid -> slot id, the mapping a real provider would maintain to
    /// recover a slot from a runner-name alone.
    by_uid: Mutex<HashMap<String, usize>>,
    fail_start: Mutex<bool>,
}

impl FakeProvider {
    pub fn new(pool: Arc<SlotPool>) -> Self {
        Self {
            pool,
            calls: Mutex::new(Calls::default()),
            by_uid: Mutex::new(HashMap::new()),
            fail_start: Mutex::new(false),
        }
    }

    /// Test helper: make the next `start_runner` call fail.
    pub fn fail_next_start(&self) {
        *self.fail_start.lock() = true;
    }

    pub fn start_count(&self) -> usize {
        self.calls.lock().starts.len()
    }

    pub fn stop_count(&self) -> usize {
        self.calls.lock().stops.len()
    }

    pub fn started_slots(&self) -> Vec<usize> {
        self.calls.lock().starts.clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn next(&self) -> Option<SlotHandle> {
        self.pool.next()
    }

    fn done(&self, slot: SlotHandle) {
        self.pool.free(slot.id());
    }

    async fn start_runner(&self, slot: &SlotHandle) -> anyhow::Result<()> {
        let mut should_fail = self.fail_start.lock();
        if *should_fail {
            *should_fail = false;
            anyhow::bail!("fake provider: forced start failure");
        }
        drop(should_fail);

        self.by_uid.lock().insert(slot.uid().to_string(), slot.id());
        self.calls.lock().starts.push(slot.id());
        Ok(())
    }

    async fn stop_runner(&self, event: &WorkflowJobEvent) -> anyhow::Result<()> {
        let runner_name = event
            .runner_name()
            .ok_or_else(|| anyhow::anyhow!("completed event is missing runner_name"))?;
        let uid = suffix_from_runner_name(runner_name)
            .ok_or_else(|| anyhow::anyhow!("runner_name {runner_name} has no uid suffix"))?;

        let id = self
            .by_uid
            .lock()
            .remove(uid)
            .ok_or_else(|| anyhow::anyhow!("no tracked slot for uid {uid}"))?;

        self.calls.lock().stops.push(id);
        self.pool.free(id);
        Ok(())
    }

    fn status(&self) -> serde_json::Value {
        let calls = self.calls.lock();
        serde_json::json!({
            "starts": calls.starts.len(),
            "stops": calls.stops.len(),
            "slots_in_use": self.pool.in_use_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ci_broker_types::{Organization, Repository, RepositoryOwner, WorkflowJob};

    fn fake_event(runner_name: &str) -> WorkflowJobEvent {
        WorkflowJobEvent {
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
        }
    }

    #[tokio::test]
    async fn start_then_stop_round_trip() {
        let pool = Arc::new(SlotPool::new(1, std::env::temp_dir().join("fake-provider-test")));
        let provider = FakeProvider::new(pool.clone());

        let slot = provider.next().expect("slot available");
        provider.start_runner(&slot).await.expect("start succeeds");
        assert_eq!(provider.start_count(), 1);
        assert_eq!(pool.in_use_count(), 1);

        let runner_name = slot.runner_name("host7");
        let stop_event = fake_event(&runner_name);
        provider.stop_runner(&stop_event).await.expect("stop succeeds");
        assert_eq!(provider.stop_count(), 1);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[tokio::test]
    async fn forced_start_failure_does_not_record_slot() {
        let pool = Arc::new(SlotPool::new(1, std::env::temp_dir().join("fake-provider-test2")));
        let provider = FakeProvider::new(pool.clone());
        provider.fail_next_start();

        let slot = provider.next().expect("slot available");
        assert!(provider.start_runner(&slot).await.is_err());
        assert_eq!(provider.start_count(), 0);
    }
}
