//! The event classifier and the webhook HTTP surface that fronts it.
//! Validates an inbound HTTP-signed payload, decodes the workflow-job
//! event, and decides whether and where to publish it.

mod classify;
mod http;
mod signature;

pub use classify::classify_and_publish;
pub use http::{router, AppState, StatusFn};
pub use signature::verify_signature;
