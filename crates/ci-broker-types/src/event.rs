use serde::{Deserialize, Serialize};

/// The subset of a GitHub `workflow_job` webhook event that the
/// dispatch core depends on. Fields the core never inspects (steps,
/// timestamps, sender, installation id, ...) are preserved losslessly
/// in `extra` rather than dropped, so that re-emitting the event for
/// logging doesn't lose information a collaborator might still want.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: String,
    pub workflow_job: WorkflowJob,
    #[serde(default)]
    pub organization: Option<Organization>,
    pub repository: Repository,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub run_id: i64,
    #[serde(default)]
    pub run_attempt: i64,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: RepositoryOwner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryOwner {
    pub login: String,
}

impl WorkflowJobEvent {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn labels(&self) -> &[String] {
        &self.workflow_job.labels
    }

    pub fn runner_name(&self) -> Option<&str> {
        self.workflow_job.runner_name.as_deref()
    }

    pub fn run_id(&self) -> i64 {
        self.workflow_job.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.workflow_job.name
    }

    pub fn run_attempt(&self) -> i64 {
        self.workflow_job.run_attempt
    }

    pub fn repo_owner_login(&self) -> &str {
        &self.repository.owner.login
    }

    pub fn repo_name(&self) -> &str {
        &self.repository.name
    }

    pub fn organization_login(&self) -> Option<&str> {
        self.organization.as_ref().map(|o| o.login.as_str())
    }
}
