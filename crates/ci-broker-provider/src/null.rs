//! A provider that records nothing and launches nothing: the default
//! registered implementation, useful for running `hostctl`/`wait-for-job`
//! end to end without a real microVM backend wired up. Logs what it
//! would have done so the pipeline is observable.
//!
//! The real backend — kernel args, cloud-init MIME assembly, TAP and
//! iptables plumbing — is a collaborator per the design notes; an
//! out-of-tree crate wires its own `Provider` impl into the same
//! registry this module populates.

use crate::{Provider, ProviderFactory};
use async_trait::async_trait;
use ci_broker_slots::{SlotHandle, SlotPool};
use ci_broker_types::{suffix_from_runner_name, WorkflowJobEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct NullProvider {
    pool: Arc<SlotPool>,
    /// uid -> slot id. A real provider maintains the same mapping to
    /// recover a slot from the runner-name embedded in a completed event.
    by_uid: Mutex<HashMap<String, usize>>,
}

impl NullProvider {
    pub fn new(pool: Arc<SlotPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            by_uid: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Provider for NullProvider {
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
        info!(
            slot = slot.id(),
            uid = slot.uid(),
            "null provider: would launch a microVM here"
        );
        self.by_uid
            .lock()
            .unwrap()
            .insert(slot.uid().to_string(), slot.id());
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
            .unwrap()
            .remove(uid)
            .ok_or_else(|| anyhow::anyhow!("no tracked slot for uid {uid}"))?;
        info!(slot = id, uid, "null provider: would tear down the microVM here");
        self.pool.free(id);
        Ok(())
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "null",
            "slots_in_use": self.pool.in_use_count(),
        })
    }
}

/// Factory registered under the name `"null"`.
pub fn factory() -> ProviderFactory {
    Arc::new(|pool| NullProvider::new(pool) as Arc<dyn Provider>)
}
