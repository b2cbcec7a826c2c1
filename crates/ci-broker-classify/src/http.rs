//! Webhook ingress HTTP surface. TLS provisioning and termination are
//! out of scope (a collaborator's job, per the design notes); this
//! listens plain HTTP and expects to sit behind a terminating proxy.

use crate::classify::classify_and_publish;
use crate::signature::verify_signature;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{body::Bytes, Router};
use ci_broker_billing::BillingCache;
use ci_broker_billing::BillingLookup;
use ci_broker_queue::WorkQueue;
use ci_broker_secrets::KeySource;
use ci_broker_types::BrokerError;
use serde::Deserialize;
use std::sync::Arc;

/// Snapshot injected by the caller for `GET /status`. `run` (webhook
/// server) and `hostctl` (host scheduler) each pass their own view; the
/// shared shape is just "hostname plus an opaque extra blob".
pub type StatusFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn WorkQueue>,
    pub secret: Arc<KeySource>,
    pub prefix: String,
    pub billing: Arc<BillingCache<Box<dyn BillingLookup>>>,
    pub status: StatusFn,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs-on/{org}", get(runs_on))
        .route("/status", get(status))
        .fallback(webhook)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

struct AppError(StatusCode, anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, format!("{:#}", self.1)).into_response()
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        let code = match &err {
            BrokerError::BadSignature | BrokerError::InvalidPayload | BrokerError::Other(_) => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::PublishFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError(code, err.into())
    }
}

async fn webhook(State(state): State<AppState>, method: Method, headers: HeaderMap, body: Bytes) -> Response {
    if method != Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }

    match handle_webhook(state, headers, body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_webhook(state: AppState, headers: HeaderMap, body: Bytes) -> Result<(), AppError> {
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError(StatusCode::BAD_REQUEST, anyhow::anyhow!("missing X-GitHub-Event header")))?
        .to_string();

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError(
                StatusCode::BAD_REQUEST,
                anyhow::anyhow!("missing X-Hub-Signature-256 header"),
            )
        })?;

    let secret = state
        .secret
        .get()
        .await
        .map_err(|err| AppError(StatusCode::INTERNAL_SERVER_ERROR, err))?;

    if !verify_signature(&secret, &body, signature) {
        return Err(BrokerError::BadSignature.into());
    }

    classify_and_publish(state.queue.as_ref(), &state.prefix, &event_type, &body)
        .await
        .map(|_| ())
        .map_err(AppError::from)
}

#[derive(Deserialize)]
struct RunsOnQuery {
    #[serde(default = "default_visibility")]
    visibility: String,
}

fn default_visibility() -> String {
    "private".to_string()
}

async fn runs_on(
    State(state): State<AppState>,
    axum::extract::Path(org): axum::extract::Path<String>,
    Query(query): Query<RunsOnQuery>,
) -> Response {
    match state.billing.minutes_exhausted(&org, &query.visibility).await {
        Ok(exhausted) => {
            let label = BillingCache::<Box<dyn BillingLookup>>::suggested_label(exhausted);
            (StatusCode::OK, label.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Response {
    (StatusCode::OK, axum::Json((state.status)())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ci_broker_billing::StubBillingLookup;
    use ci_broker_queue::FakeWorkQueue;

    fn test_state() -> AppState {
        AppState {
            queue: Arc::new(FakeWorkQueue::new()),
            secret: Arc::new(KeySource::Data {
                key_data: "shh".to_string(),
            }),
            prefix: "ghactions.".to_string(),
            billing: Arc::new(BillingCache::new(
                Box::new(StubBillingLookup) as Box<dyn BillingLookup>
            )),
            status: Arc::new(|| serde_json::json!({"role": "test"})),
        }
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let state = test_state();
        let headers = {
            let mut h = HeaderMap::new();
            h.insert("x-github-event", "workflow_job".parse().unwrap());
            h.insert("x-hub-signature-256", "sha256=deadbeef".parse().unwrap());
            h
        };
        let err = handle_webhook(state, headers, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
