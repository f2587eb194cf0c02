//! HTTP surfaces.
//!
//! Two compatible endpoints front the same pipeline: `/v1/chat/completions`
//! accepts the OpenAI wire format, `/v1/messages` the Anthropic one.
//! Errors are rendered in the wire format of the surface they arrived on,
//! and every response carries the trace id of its audit entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::audit::generate_trace_id;
use crate::error::RelayError;
use crate::gateway::{Gateway, RelayBody, RelayRequest, RelayResponse};
use crate::identity::IdentityResolver;
use crate::rules::WireProtocol;

pub const TRACE_ID_HEADER: &str = "x-modelrelay-trace-id";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub resolver: Arc<dyn IdentityResolver>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, WireProtocol::OpenAi, headers, body).await
}

async fn messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    relay(state, WireProtocol::Anthropic, headers, body).await
}

async fn relay(
    state: AppState,
    surface: WireProtocol,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = generate_trace_id();

    let Some(credential) = extract_credential(surface, &headers) else {
        return error_response(
            surface,
            &trace_id,
            StatusCode::UNAUTHORIZED,
            "missing credentials",
        );
    };
    let Some(caller) = state.resolver.resolve(&credential).await else {
        return error_response(
            surface,
            &trace_id,
            StatusCode::UNAUTHORIZED,
            "invalid credentials",
        );
    };

    // An unparseable body still flows through the pipeline as a rejected
    // request, so it lands in the audit log like every other outcome.
    let body = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);

    let request = RelayRequest {
        trace_id: trace_id.clone(),
        caller,
        surface,
        headers: flatten_headers(&headers),
        body,
    };

    // The pipeline runs on its own task so a client disconnect (this
    // handler future being dropped) cancels it through the token instead
    // of silently aborting it, and the cancelled outcome still gets
    // audited.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let gateway = Arc::clone(&state.gateway);
    let pipeline = {
        let cancel = cancel.clone();
        tokio::spawn(async move { gateway.handle(request, &cancel).await })
    };

    match pipeline.await {
        Ok(Ok(response)) => success_response(response, &trace_id),
        Ok(Err(err)) => {
            let status = error_status(&err);
            error_response(surface, &trace_id, status, &err.to_string())
        }
        Err(join_err) => {
            tracing::error!(error = %join_err, trace_id = %trace_id, "request pipeline panicked");
            error_response(
                surface,
                &trace_id,
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            )
        }
    }
}

fn extract_credential(surface: WireProtocol, headers: &HeaderMap) -> Option<String> {
    let primary = match surface {
        WireProtocol::OpenAi => headers.get(header::AUTHORIZATION),
        WireProtocol::Anthropic => headers.get("x-api-key"),
    };
    primary
        .or_else(|| match surface {
            WireProtocol::OpenAi => headers.get("x-api-key"),
            WireProtocol::Anthropic => headers.get(header::AUTHORIZATION),
        })
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn success_response(response: RelayResponse, trace_id: &str) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    builder = builder.header(TRACE_ID_HEADER, trace_id);

    let body = match response.body {
        RelayBody::Buffered(bytes) => Body::from(bytes),
        RelayBody::Stream(stream) => Body::from_stream(stream),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Validation { .. } => StatusCode::BAD_REQUEST,
        RelayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
        RelayError::ModelDisabled { .. } => StatusCode::FORBIDDEN,
        RelayError::NoCandidate { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Exhausted { last_status, .. } => {
            StatusCode::from_u16(*last_status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
        }
        // Non-standard but conventional "client closed request".
        RelayError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(
    surface: WireProtocol,
    trace_id: &str,
    status: StatusCode,
    message: &str,
) -> Response {
    let error_type = match status.as_u16() {
        401 => "authentication_error",
        400 | 403 | 404 => "invalid_request_error",
        _ => "api_error",
    };
    let body = match surface {
        WireProtocol::OpenAi => json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
            }
        }),
        WireProtocol::Anthropic => json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }),
    };
    (
        status,
        [
            (
                HeaderName::from_static(TRACE_ID_HEADER),
                HeaderValue::from_str(trace_id)
                    .unwrap_or_else(|_| HeaderValue::from_static("invalid")),
            ),
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            ),
        ],
        Json(body),
    )
        .into_response()
}
