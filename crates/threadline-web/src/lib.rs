//! Axum dispatcher exposing the sync engine over local HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use threadline_core::{ControllerState, EventPayload};
use threadline_sync::{
    Engine, FlushOutcome, SyncError, SyncOutcome, TriggerOutcome, TriggerReason,
};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "threadline-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    key: String,
    #[serde(default)]
    payload: EventPayload,
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    url: String,
}

/// `{ok, ...body}` with the body's fields inlined.
#[derive(Serialize)]
struct Reply<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct ErrorBody {
    error: SyncError,
}

#[derive(Serialize)]
struct StateBody {
    state: ControllerState,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/diagnostics", get(diagnostics_handler))
        .route("/events", post(enqueue_handler))
        .route("/events/flush", post(flush_handler))
        .route("/navigation", post(navigation_handler))
        .route("/threads/sync", post(thread_sync_handler))
        .route("/controller/start", post(controller_start_handler))
        .route("/controller/pause", post(controller_pause_handler))
        .route("/controller/stop", post(controller_stop_handler))
        .route("/controller/trigger", post(controller_trigger_handler))
        .with_state(Arc::new(state))
}

/// Serve until ctrl-c, then shut the engine down with one final flush.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "threadline dispatcher listening");
    axum::serve(listener, app(AppState::new(Arc::clone(&engine))))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    let outcome = engine.shutdown().await;
    info!(?outcome, "dispatcher stopped");
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "ok": true, "service": CRATE_NAME })).into_response()
}

async fn diagnostics_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.diagnostics()).into_response()
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EventRequest>,
) -> Response {
    match state.engine.enqueue(request.key, request.payload) {
        Ok(outcome) => reply(true, outcome),
        Err(error) => error_response(error),
    }
}

async fn flush_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.engine.flush().await;
    let ok = !matches!(outcome, FlushOutcome::Failed { .. });
    reply(ok, outcome)
}

async fn navigation_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UrlRequest>,
) -> Response {
    if request.url.trim().is_empty() {
        return error_response(SyncError::validation("url must not be empty"));
    }
    let changed = state.engine.on_url_observed(&request.url);
    Json(serde_json::json!({ "ok": true, "changed": changed })).into_response()
}

async fn thread_sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UrlRequest>,
) -> Response {
    if request.url.trim().is_empty() {
        return error_response(SyncError::validation("url must not be empty"));
    }
    let outcome = state.engine.trigger_thread_sync(&request.url).await;
    let status = match &outcome {
        SyncOutcome::Failed {
            error: SyncError::Validation { .. },
            ..
        } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

async fn controller_start_handler(State(state): State<Arc<AppState>>) -> Response {
    controller_state(state.engine.controller().start())
}

async fn controller_pause_handler(State(state): State<Arc<AppState>>) -> Response {
    controller_state(state.engine.controller().pause())
}

async fn controller_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    controller_state(state.engine.controller().stop())
}

async fn controller_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.engine.controller().trigger(TriggerReason::Manual).await;
    let ok = matches!(
        outcome,
        TriggerOutcome::Completed | TriggerOutcome::Coalesced
    );
    reply(ok, outcome)
}

fn controller_state(state: ControllerState) -> Response {
    reply(true, StateBody { state })
}

fn reply<T: Serialize>(ok: bool, body: T) -> Response {
    Json(Reply { ok, body }).into_response()
}

fn error_response(error: SyncError) -> Response {
    let status = match error {
        SyncError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::OK,
    };
    (status, Json(Reply { ok: false, body: ErrorBody { error } })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use threadline_core::ExtractedPayload;
    use threadline_extract::{
        AbortSignal, ExtractError, ExtractOptions, Extractor, ProfileExtractor, ProfileRecord,
        RootHandle,
    };
    use threadline_sync::{Collaborators, StaticAuthProvider, SyncConfig};
    use threadline_transport::header::HeaderMap;
    use threadline_transport::{ResponseBody, Transport, TransportError, TransportResponse};
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl Transport for AcceptAll {
        async fn post_json(
            &self,
            _url: &str,
            _headers: HeaderMap,
            _body: &Value,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                body: ResponseBody::Json(json!({ "received": true })),
            })
        }
    }

    struct NoPayload;

    #[async_trait]
    impl Extractor for NoPayload {
        async fn root_handle(&self, url: &str) -> Result<RootHandle, ExtractError> {
            Ok(RootHandle {
                url: url.to_string(),
                thread_key: None,
                document: None,
            })
        }

        async fn extract(
            &self,
            _handle: &RootHandle,
            _options: &ExtractOptions,
        ) -> Result<Option<ExtractedPayload>, ExtractError> {
            Ok(None)
        }
    }

    struct NoProfiles;

    #[async_trait]
    impl ProfileExtractor for NoProfiles {
        async fn extract_profiles(
            &self,
            _signal: &AbortSignal,
        ) -> Result<Vec<ProfileRecord>, ExtractError> {
            Ok(Vec::new())
        }
    }

    fn test_app() -> Router {
        let engine = Engine::new(
            SyncConfig::default(),
            Collaborators {
                transport: Arc::new(AcceptAll),
                auth: Arc::new(StaticAuthProvider::bearer("tok")),
                extractor: Arc::new(NoPayload),
                profiles: Arc::new(NoProfiles),
            },
        );
        app(AppState::new(Arc::new(engine)))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn events_are_deduplicated_and_visible_in_diagnostics() {
        let app = test_app();
        let event = json!({ "key": "p1", "payload": { "name": "Ada" } });

        let (status, body) = call(&app, "POST", "/events", Some(event.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "accepted");
        assert_eq!(body["queue_length"], 1);

        let (_, body) = call(&app, "POST", "/events", Some(event)).await;
        assert_eq!(body["outcome"], "duplicate");

        let (_, diagnostics) = call(&app, "GET", "/diagnostics", None).await;
        assert_eq!(diagnostics["queue_length"], 1);
        assert_eq!(diagnostics["controller_state"], "IDLE");

        let (_, flushed) = call(&app, "POST", "/events/flush", None).await;
        assert_eq!(flushed["ok"], true);
        assert_eq!(flushed["outcome"], "sent");
        assert_eq!(flushed["count"], 1);
    }

    #[tokio::test]
    async fn empty_event_key_is_unprocessable() {
        let app = test_app();
        let (status, body) = call(&app, "POST", "/events", Some(json!({ "key": "" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn thread_sync_reports_skips_and_validation() {
        let app = test_app();
        let (status, body) = call(
            &app,
            "POST",
            "/threads/sync",
            Some(json!({ "url": "https://www.linkedin.com/feed/" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["skipped"], true);
        assert_eq!(body["reason"], "not_a_thread");

        let (status, body) = call(
            &app,
            "POST",
            "/threads/sync",
            Some(json!({ "url": "https://www.linkedin.com/messaging/thread/2-abc/" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["kind"], "validation");

        let (status, body) = call(
            &app,
            "POST",
            "/threads/sync",
            Some(json!({ "url": "https://www.linkedin.com/messaging/thread/2-abc/" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "ok": true, "skipped": true, "reason": "throttled" })
        );
    }

    #[tokio::test]
    async fn controller_lifecycle_over_http() {
        let app = test_app();
        let (_, body) = call(&app, "POST", "/controller/trigger", None).await;
        assert_eq!(body["outcome"], "not_running");

        let (_, body) = call(&app, "POST", "/controller/start", None).await;
        assert_eq!(body["state"], "RUNNING");

        let (_, body) = call(&app, "POST", "/controller/trigger", None).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["outcome"], "completed");

        let (_, body) = call(&app, "POST", "/controller/pause", None).await;
        assert_eq!(body["state"], "PAUSED");

        let (_, body) = call(&app, "POST", "/controller/stop", None).await;
        assert_eq!(body["state"], "STOPPED");
    }

    #[tokio::test]
    async fn navigation_reports_url_changes() {
        let app = test_app();
        let nav = json!({ "url": "https://www.linkedin.com/in/sam/" });
        let (_, body) = call(&app, "POST", "/navigation", Some(nav.clone())).await;
        assert_eq!(body["changed"], true);
        let (_, body) = call(&app, "POST", "/navigation", Some(nav)).await;
        assert_eq!(body["changed"], false);
    }
}
