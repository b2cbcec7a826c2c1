use thiserror::Error;

/// Error kinds the dispatch core produces or consumes. See the design
/// ledger for the propagation policy of each variant.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("webhook signature verification failed")]
    BadSignature,

    #[error("framed payload is missing its ':' separator or is not valid utf-8")]
    InvalidPayload,

    #[error("failed to publish message: {0}")]
    PublishFailed(#[source] anyhow::Error),

    #[error("fetch timed out")]
    FetchTimeout,

    #[error("failed to start runner: {0}")]
    ProviderStartFailed(#[source] anyhow::Error),

    #[error("failed to stop runner: {0}")]
    ProviderStopFailed(#[source] anyhow::Error),

    #[error("provider precondition failed: {0}")]
    PreconditionFailed(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
