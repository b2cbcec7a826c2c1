//! Job-lease consumer: a short-lived, single-shot consumer used by the
//! in-VM runner bootstrap to atomically claim a pending job for its host
//! before registering with the upstream service. See the design
//! ledger's §4.5 for the tier-preference contract this implements.

use ci_broker_queue::{FetchMode, WorkQueue};
use ci_broker_types::{unframe, RunnerLabel, WorkflowJobEvent};
use tracing::debug;

/// A single claimed job, framed payload plus the decoded event the
/// in-VM bootstrap needs to register with the right scope and labels.
pub struct LeasedJob {
    pub label: RunnerLabel,
    pub event: WorkflowJobEvent,
    pub framed: Vec<u8>,
}

impl LeasedJob {
    /// Scope the upstream registration token should be requested for:
    /// the organization if the event carries one, else `owner/repo`.
    pub fn runner_scope(&self) -> String {
        match self.event.organization_login() {
            Some(login) => login.to_string(),
            None => format!("{}/{}", self.event.repo_owner_login(), self.event.repo_name()),
        }
    }
}

/// Attempt to pop exactly one job targeted at this host's priority
/// tiers. Tries `<prefix>queued.f0` first, then `<prefix>queued.firecracker` —
/// the high-priority subject is drained first so that when both tiers
/// have pending work, an available runner host is allocated to the
/// higher tier. Returns `None` if neither subject yields a message.
pub async fn try_lease(queue: &dyn WorkQueue, prefix: &str) -> anyhow::Result<Option<LeasedJob>> {
    let stream_name = format!("{prefix}queued");

    for label in RunnerLabel::ALL {
        let subject = format!("{prefix}queued.{label}");
        let mut batch = queue
            .consume(&stream_name, &subject, 1, FetchMode::NoWait)
            .await?;
        let Some(message) = batch.pop() else {
            continue;
        };

        let framed = message.data().to_vec();
        let (event_type, body) = unframe(&framed)?;
        debug!(%subject, event_type, "leased one job");
        let event: WorkflowJobEvent = serde_json::from_slice(body)?;

        message.double_ack().await?;

        return Ok(Some(LeasedJob {
            label,
            event,
            framed,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ci_broker_queue::FakeWorkQueue;
    use ci_broker_types::{frame, Organization, Repository, RepositoryOwner, WorkflowJob};

    fn queued_payload(labels: Vec<&str>) -> Vec<u8> {
        let event = WorkflowJobEvent {
            action: "queued".to_string(),
            workflow_job: WorkflowJob {
                id: 1,
                run_id: 42,
                run_attempt: 1,
                name: "build".to_string(),
                labels: labels.into_iter().map(str::to_string).collect(),
                runner_name: None,
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
    async fn prefers_f0_over_firecracker() {
        let queue = FakeWorkQueue::new();
        queue
            .publish("ghactions.queued.firecracker", queued_payload(vec!["firecracker"]), None)
            .await
            .unwrap();
        queue
            .publish("ghactions.queued.f0", queued_payload(vec!["f0"]), None)
            .await
            .unwrap();

        let leased = try_lease(&queue, "ghactions.").await.unwrap().expect("a job");
        assert_eq!(leased.label, RunnerLabel::F0);

        let leased = try_lease(&queue, "ghactions.").await.unwrap().expect("a job");
        assert_eq!(leased.label, RunnerLabel::Firecracker);

        assert!(try_lease(&queue, "ghactions.").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runner_scope_prefers_organization() {
        let queue = FakeWorkQueue::new();
        queue
            .publish("ghactions.queued.f0", queued_payload(vec!["f0"]), None)
            .await
            .unwrap();

        let leased = try_lease(&queue, "ghactions.").await.unwrap().unwrap();
        assert_eq!(leased.runner_scope(), "acme");
    }
}
