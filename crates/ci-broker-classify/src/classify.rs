//! Event classification: decide whether an inbound workflow-job event
//! should be published, and to which subject. This is the core
//! algorithm from the design ledger's §4.1, independent of HTTP and of
//! signature verification so it can be unit tested directly against a
//! `FakeWorkQueue`.

use ci_broker_queue::WorkQueue;
use ci_broker_types::{
    frame, hostname_from_runner_name, BrokerError, EventKey, RoutingKey, RunnerLabel, WorkflowJobEvent,
};

/// `event-type` this classifier recognizes; every other value is
/// ignored (acked, not an error).
const WORKFLOW_JOB_EVENT_TYPE: &str = "workflow_job";

/// Classify a decoded webhook body and publish it if it targets a
/// self-hosted runner. Returns the routing key that was published to,
/// or `None` if the event was ignored.
pub async fn classify_and_publish(
    queue: &dyn WorkQueue,
    prefix: &str,
    event_type: &str,
    body: &[u8],
) -> Result<Option<RoutingKey>, BrokerError> {
    if event_type != WORKFLOW_JOB_EVENT_TYPE {
        return Ok(None);
    }

    let event: WorkflowJobEvent = serde_json::from_slice(body).map_err(|err| {
        BrokerError::Other(anyhow::anyhow!("decoding workflow_job event: {err:#}"))
    })?;

    let Some(label) = RunnerLabel::classify(event.labels()) else {
        return Ok(None);
    };

    let routing_key = match event.action() {
        "queued" => RoutingKey::queued(prefix, label),
        "completed" => {
            let runner_name = event.runner_name().ok_or(BrokerError::InvalidPayload)?;
            let hostname =
                hostname_from_runner_name(runner_name).ok_or(BrokerError::InvalidPayload)?;
            RoutingKey::completed(prefix, hostname)
        }
        _ => return Ok(None),
    };

    let framed = frame(event_type, body);
    let dedup_id = EventKey::from_event(&event).to_string();
    queue
        .publish(&routing_key.subject(), framed, Some(&dedup_id))
        .await
        .map_err(BrokerError::PublishFailed)?;

    Ok(Some(routing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ci_broker_queue::FakeWorkQueue;
    use serde_json::json;

    fn body(action: &str, labels: Vec<&str>, runner_name: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": action,
            "workflow_job": {
                "id": 1,
                "run_id": 42,
                "run_attempt": 1,
                "name": "build",
                "labels": labels,
                "runner_name": runner_name,
            },
            "repository": {
                "name": "widgets",
                "owner": {"login": "acme"},
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn queued_high_priority_publishes_once() {
        let queue = FakeWorkQueue::new();
        let b = body("queued", vec!["f0"], None);

        let key = classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();

        assert_eq!(key.unwrap().subject(), "ghactions.queued.f0");
        assert_eq!(queue.depth("ghactions.queued.f0").await, 1);
    }

    #[tokio::test]
    async fn completed_routes_to_host_minus_suffix() {
        let queue = FakeWorkQueue::new();
        let b = body("completed", vec!["firecracker"], Some("host7-a1b2c3"));

        let key = classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();

        assert_eq!(key.unwrap().subject(), "ghactions.completed.host7");
    }

    #[tokio::test]
    async fn non_self_hosted_label_is_ignored() {
        let queue = FakeWorkQueue::new();
        let b = body("queued", vec!["ubuntu-24.04"], None);

        let key = classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();

        assert!(key.is_none());
        assert_eq!(queue.depth("ghactions.queued.f0").await, 0);
    }

    #[tokio::test]
    async fn multiple_labels_disqualify_even_if_one_matches() {
        let queue = FakeWorkQueue::new();
        let b = body("queued", vec!["f0", "extra-label"], None);

        let key = classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn non_workflow_job_event_type_is_ignored() {
        let queue = FakeWorkQueue::new();
        let b = body("queued", vec!["f0"], None);

        let key = classify_and_publish(&queue, "ghactions.", "check_run", &b)
            .await
            .unwrap();
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn framing_round_trips_through_publish() {
        let queue = FakeWorkQueue::new();
        let b = body("queued", vec!["f0"], None);

        classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();

        // Re-consume and verify the exact framing contract.
        use ci_broker_queue::FetchMode;
        let batch = queue
            .consume("ghactions.queued", "ghactions.queued.f0", 1, FetchMode::NoWait)
            .await
            .unwrap();
        let (event_type, payload) = ci_broker_types::unframe(batch[0].data()).unwrap();
        assert_eq!(event_type, "workflow_job");
        assert_eq!(payload, b.as_slice());
    }

    #[tokio::test]
    async fn redelivered_webhook_is_deduplicated() {
        let queue = FakeWorkQueue::new();
        let b = body("queued", vec!["f0"], None);

        // Same job attempt published twice, as happens when the upstream
        // webhook sender redelivers after losing the HTTP response.
        classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();
        classify_and_publish(&queue, "ghactions.", "workflow_job", &b)
            .await
            .unwrap();

        assert_eq!(queue.depth("ghactions.queued.f0").await, 1);
    }
}
