use crate::event::WorkflowJobEvent;
use std::fmt;

/// `(run_id, job_name, run_attempt)` serialized into a stable string.
/// Identifies a single attempt of a single job within a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey(String);

impl EventKey {
    pub fn from_event(event: &WorkflowJobEvent) -> Self {
        Self(format!(
            "{}-{}-{}",
            event.run_id(),
            event.job_name(),
            event.run_attempt()
        ))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A priority tier. The closed set of labels that mark a job as destined
/// for a self-hosted runner; any other label disqualifies the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerLabel {
    /// Regular-priority self-hosted runner.
    Firecracker,
    /// High-priority self-hosted runner, drained first by the job-lease
    /// consumer and the completed-drain loop.
    F0,
}

impl RunnerLabel {
    pub const ALL: [RunnerLabel; 2] = [RunnerLabel::F0, RunnerLabel::Firecracker];

    pub fn as_str(self) -> &'static str {
        match self {
            RunnerLabel::Firecracker => "firecracker",
            RunnerLabel::F0 => "f0",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "firecracker" => Some(RunnerLabel::Firecracker),
            "f0" => Some(RunnerLabel::F0),
            _ => None,
        }
    }

    /// Self-hosted iff `labels` contains exactly one element and that
    /// element is a recognized runner label.
    pub fn classify(labels: &[String]) -> Option<Self> {
        if labels.len() != 1 {
            return None;
        }
        Self::parse(&labels[0])
    }
}

impl fmt::Display for RunnerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject on the durable queue. Queued subjects partition by priority
/// tier; completed subjects partition by the originating hostname, since
/// only that host owns the slot and VM to terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingKey {
    Queued { prefix: String, label: RunnerLabel },
    Completed { prefix: String, hostname: String },
}

impl RoutingKey {
    pub fn queued(prefix: &str, label: RunnerLabel) -> Self {
        Self::Queued {
            prefix: prefix.to_string(),
            label,
        }
    }

    pub fn completed(prefix: &str, hostname: impl Into<String>) -> Self {
        Self::Completed {
            prefix: prefix.to_string(),
            hostname: hostname.into(),
        }
    }

    pub fn subject(&self) -> String {
        match self {
            RoutingKey::Queued { prefix, label } => format!("{prefix}queued.{label}"),
            RoutingKey::Completed { prefix, hostname } => format!("{prefix}completed.{hostname}"),
        }
    }

    /// Name of the JetStream stream this subject belongs to. Matches
    /// the stream's subject filter of `<stream>.>`.
    pub fn stream_name(&self) -> String {
        match self {
            RoutingKey::Queued { prefix, .. } => format!("{prefix}queued"),
            RoutingKey::Completed { prefix, .. } => format!("{prefix}completed"),
        }
    }
}

/// Extract the hostname from a runner-name of the form `<host>-<suffix>`
/// by removing the last `-`-delimited segment. Returns `None` if there is
/// no `-` to split on.
pub fn hostname_from_runner_name(runner_name: &str) -> Option<&str> {
    runner_name.rsplit_once('-').map(|(host, _suffix)| host)
}

/// Extract the last `-`-delimited segment of a runner-name. This is the
/// slot's tenancy `uid`, also used by providers as the VM's `instance_id`.
pub fn suffix_from_runner_name(runner_name: &str) -> Option<&str> {
    runner_name.rsplit_once('-').map(|(_host, suffix)| suffix)
}

/// Build a runner-name of the form `<hostname>-<uid>`.
pub fn make_runner_name(hostname: &str, uid: &str) -> String {
    format!("{hostname}-{uid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_self_hosted_labels() {
        assert_eq!(
            RunnerLabel::classify(&["f0".to_string()]),
            Some(RunnerLabel::F0)
        );
        assert_eq!(
            RunnerLabel::classify(&["firecracker".to_string()]),
            Some(RunnerLabel::Firecracker)
        );
        assert_eq!(RunnerLabel::classify(&["ubuntu-24.04".to_string()]), None);
        assert_eq!(
            RunnerLabel::classify(&["f0".to_string(), "extra".to_string()]),
            None
        );
        assert_eq!(RunnerLabel::classify(&[]), None);
    }

    #[test]
    fn routing_key_subjects() {
        let q = RoutingKey::queued("ghactions.", RunnerLabel::F0);
        assert_eq!(q.subject(), "ghactions.queued.f0");

        let c = RoutingKey::completed("ghactions.", "host7");
        assert_eq!(c.subject(), "ghactions.completed.host7");

        assert_eq!(q.stream_name(), "ghactions.queued");
        assert_eq!(c.stream_name(), "ghactions.completed");
    }

    #[test]
    fn hostname_extraction() {
        assert_eq!(hostname_from_runner_name("host7-a1b2c3"), Some("host7"));
        assert_eq!(suffix_from_runner_name("host7-a1b2c3"), Some("a1b2c3"));
        // a hostname may itself contain dashes; only the last segment is the uid.
        assert_eq!(
            hostname_from_runner_name("worker-host-7-a1b2c3"),
            Some("worker-host-7")
        );
        assert_eq!(hostname_from_runner_name("noseparator"), None);
    }

    #[test]
    fn runner_name_roundtrip() {
        let name = make_runner_name("host7", "a1b2c3");
        assert_eq!(name, "host7-a1b2c3");
        assert_eq!(hostname_from_runner_name(&name), Some("host7"));
        assert_eq!(suffix_from_runner_name(&name), Some("a1b2c3"));
    }
}
