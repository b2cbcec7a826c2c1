//! Shared wire types and errors for the CI runner broker. Every other
//! crate in the workspace builds on top of these.

mod error;
mod event;
mod framing;
mod keys;

pub use error::BrokerError;
pub use event::{Organization, Repository, RepositoryOwner, WorkflowJob, WorkflowJobEvent};
pub use framing::{frame, unframe};
pub use keys::{
    hostname_from_runner_name, make_runner_name, suffix_from_runner_name, EventKey, RoutingKey,
    RunnerLabel,
};
