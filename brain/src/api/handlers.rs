//! HTTP handlers
//!
//! The edge stays thin: strict JSON in, classified status codes out.
//! Bodies are limited to 1 MiB, unknown fields are rejected, and a body
//! must contain exactly one JSON value.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use kari_proto::LogChunk;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::domain::{Actor, Server, Site};
use crate::errors::{ErrorKind, PanelError};
use crate::hub::{LogHub, SubscriberId};
use crate::pipeline::activation::ActivationPipeline;
use crate::pipeline::deployments::{DeploymentService, NewDeployment};
use crate::pipeline::onboarding::OnboardingService;
use crate::workers::health::HealthCache;

/// Shared state behind the router.
pub struct ApiContext {
    pub activation: ActivationPipeline,
    pub onboarding: OnboardingService,
    pub deployments: DeploymentService,
    pub hub: Arc<LogHub>,
    pub health: Arc<HealthCache>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActivateSiteRequest {
    id: String,
    domain: String,
    #[serde(default)]
    ipv4: Option<String>,
    #[serde(default)]
    ipv6: Option<String>,
    owner_uid: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OnboardServerRequest {
    id: String,
    address: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitDeploymentRequest {
    site_id: String,
    repo_url: String,
    branch: String,
    build_command: String,
    port: u16,
    /// PEM-encoded deploy key for private repositories.
    #[serde(default)]
    ssh_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

pub async fn activate_site(
    State(ctx): State<Arc<ApiContext>>,
    actor: Option<Extension<Actor>>,
    body: Bytes,
) -> Response {
    let request: ActivateSiteRequest = match parse_strict(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let site = Site {
        id: request.id,
        domain: request.domain,
        ipv4: request.ipv4,
        ipv6: request.ipv6,
        owner_uid: request.owner_uid,
    };

    match ctx.activation.activate(&resolve_actor(actor), site).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(StatusResponse {
                status: "activation_started",
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn onboard_server(
    State(ctx): State<Arc<ApiContext>>,
    actor: Option<Extension<Actor>>,
    body: Bytes,
) -> Response {
    let request: OnboardServerRequest = match parse_strict(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let server = Server {
        id: request.id,
        address: request.address,
    };

    match ctx.onboarding.onboard(&resolve_actor(actor), server).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({ "status": "onboarded", "report": report })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn submit_deployment(
    State(ctx): State<Arc<ApiContext>>,
    actor: Option<Extension<Actor>>,
    body: Bytes,
) -> Response {
    let request: SubmitDeploymentRequest = match parse_strict(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let new_deployment = NewDeployment {
        site_id: request.site_id,
        repo_url: request.repo_url,
        branch: request.branch,
        build_command: request.build_command,
        port: request.port,
        ssh_key: request.ssh_key.map(String::into_bytes),
    };

    match ctx
        .deployments
        .submit(&resolve_actor(actor), new_deployment)
        .await
    {
        Ok(deployment) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "deployment_queued",
                "deployment_id": deployment.id,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Live build-log terminal: subscribes the caller to the deployment's
/// fan-out channel and relays chunks as server-sent events. Channel
/// closure (the EOF signal) ends the response; dropping the response
/// unsubscribes, and the last departure cancels the upstream stream.
pub async fn deployment_logs(
    State(ctx): State<Arc<ApiContext>>,
    Path(deployment_id): Path<String>,
) -> Response {
    match ctx.deployments.get(&deployment_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown deployment" })),
            )
                .into_response()
        }
        Err(e) => return error_response(e),
    }

    let (subscriber, rx) = ctx.hub.subscribe(&deployment_id);
    let stream = LogEventStream {
        hub: ctx.hub.clone(),
        deployment_id,
        subscriber,
        rx,
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// SSE adapter over a hub subscription. Unsubscribes on drop so a
/// closed browser tab counts as a departure.
struct LogEventStream {
    hub: Arc<LogHub>,
    deployment_id: String,
    subscriber: SubscriberId,
    rx: mpsc::Receiver<LogChunk>,
}

impl Stream for LogEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let data = serde_json::to_string(&chunk).unwrap_or_default();
                Poll::Ready(Some(Ok(Event::default().data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LogEventStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.deployment_id, self.subscriber);
    }
}

/// `200 "ok"` iff the last successful Muscle probe is recent.
pub async fn healthz(State(ctx): State<Arc<ApiContext>>) -> Response {
    if ctx.health.is_healthy() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "muscle link down").into_response()
    }
}

/// The upstream authenticator (out of scope here) attaches the verified
/// actor as a request extension. Without one the panel is running in
/// single-operator mode and the local admin identity applies.
fn resolve_actor(actor: Option<Extension<Actor>>) -> Actor {
    actor
        .map(|Extension(actor)| actor)
        .unwrap_or_else(Actor::local_admin)
}

/// Decode exactly one JSON value with unknown fields rejected. Trailing
/// content after the first value is an error, same as the strict decoder
/// the edge has always used.
fn parse_strict<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    let mut deserializer = serde_json::Deserializer::from_slice(body);
    let value = match T::deserialize(&mut deserializer) {
        Ok(value) => value,
        Err(_) => return Err(bad_request("invalid JSON body")),
    };
    if deserializer.end().is_err() {
        return Err(bad_request("invalid JSON body"));
    }
    Ok(value)
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn error_response(err: PanelError) -> Response {
    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // The classified message only; raw detail was already logged where
    // the error happened.
    (status, Json(json!({ "error": err.operator_message() }))).into_response()
}
