use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::{engine::EngineHandle, error::Failure};

/// Body of `GET /`. Clients of the original service match on this literal.
pub const HEALTH_MESSAGE: &str = "✅ Flask Server is Running. Model is Loaded.";

pub fn router(engine: EngineHandle, max_body_bytes: usize) -> Router {
    // Mirrors the request origin, so any site may call with credentials.
    let cors = CorsLayer::very_permissive().max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/", get(health_handler))
        .route("/verify-face", post(verify_face_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

pub async fn health_handler() -> &'static str {
    HEALTH_MESSAGE
}

pub async fn verify_face_handler(State(engine): State<EngineHandle>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4();

    async move {
        let result = match extract_image(&body) {
            Ok(image) => engine.verify(image).await.map_err(Failure::processing),
            Err(failure) => Err(failure),
        };

        match result {
            Ok(verdict) => {
                tracing::debug!(verified = verdict.is_verified(), "verify-face done");
                Json(verdict.body()).into_response()
            }
            Err(failure) => {
                match &failure {
                    Failure::InvalidInput => tracing::warn!("verify-face: no image provided"),
                    Failure::Processing(details) => {
                        tracing::error!(error = %details, "verify-face failed")
                    }
                }
                failure.into_response()
            }
        }
    }
    .instrument(tracing::info_span!("verify_face", %request_id))
    .await
}

/// Pull the `image` string out of a JSON request body.
fn extract_image(body: &[u8]) -> Result<String, Failure> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| Failure::Processing(format!("request body is not valid JSON: {e}")))?;

    // Only objects carry the key. A string or array without an `image` item is
    // treated as a missing key; anything else cannot be looked up at all.
    let image = match &payload {
        Value::Object(map) => map.get("image").ok_or(Failure::InvalidInput)?,
        Value::String(s) if !s.contains("image") => return Err(Failure::InvalidInput),
        Value::Array(items) if !items.iter().any(|v| v == "image") => {
            return Err(Failure::InvalidInput)
        }
        other => {
            return Err(Failure::Processing(format!(
                "cannot look up 'image' in {}",
                json_kind(other)
            )))
        }
    };

    match image {
        Value::String(image) => Ok(image.clone()),
        other => Err(Failure::Processing(format!(
            "'image' must be a string, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
