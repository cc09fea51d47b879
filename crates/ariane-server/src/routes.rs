use std::sync::Arc;

use ariane_core::dispatch::Dispatcher;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub webhook_secret: String,
    pub version: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/github/hook", post(webhook))
        .route("/healthz", get(healthz))
        .route("/", get(index))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event_type = match header(&headers, EVENT_HEADER) {
        Some(value) => value,
        None => return StatusCode::BAD_REQUEST,
    };
    let delivery_id = header(&headers, DELIVERY_HEADER).unwrap_or_default();

    let Some(signature) = header(&headers, SIGNATURE_HEADER) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !verify_signature(&state.webhook_secret, &body, &signature) {
        debug!(delivery_id = %delivery_id, "webhook signature mismatch");
        return StatusCode::UNAUTHORIZED;
    }

    match state.dispatcher.dispatch(&event_type, &delivery_id, &body) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(err) => {
            error!(
                event_type = %event_type,
                delivery_id = %delivery_id,
                "failed to decode webhook payload: {err:#}"
            );
            StatusCode::BAD_REQUEST
        }
    }
}

async fn healthz() -> &'static str {
    "OK"
}

async fn index(State(state): State<Arc<AppState>>) -> String {
    format!("Ariane is running!\nVersion: {}", state.version)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// HMAC-SHA256 signature check against the `sha256=<hex>` header value,
/// compared in constant time.
fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let actual = mac.finalize().into_bytes();
    actual.ct_eq(expected.as_slice()).into()
}
