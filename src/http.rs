//! REST adapter over the device engine.
//!
//! A thin translation layer: routes and body grammar on one side, engine
//! calls on the other. No authentication; the gateway is meant to sit on a
//! controls network.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    dsp::{ControlError, Dsp},
    model::BlockType,
};

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

/// Build the REST routing table around one engine
pub fn router(dsp: Arc<Dsp>) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/dsp", get(dsp_info))
        .route("/block", get(list_blocks))
        .route(
            "/block/{id}",
            get(get_block).post(set_block).patch(set_block),
        )
        .with_state(dsp)
}

/// Serve the API until Ctrl-C
pub async fn serve(dsp: Arc<Dsp>, listen: SocketAddr) -> std::io::Result<()> {
    let app = router(dsp);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("API listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Engine failures mapped onto the API status contract
fn control_error(e: ControlError) -> ApiError {
    let status = match &e {
        ControlError::NoSuchBlock(_) => StatusCode::NOT_FOUND,
        ControlError::NoSuchChannel { .. }
        | ControlError::UnsupportedForBlockType { .. }
        | ControlError::OutOfRange { .. } => StatusCode::PRECONDITION_FAILED,
        ControlError::NotReady
        | ControlError::TransportDown
        | ControlError::SourceSelectorUnverified => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

/// Basic liveness report, served before and after the engine is ready
async fn landing(State(dsp): State<Arc<Dsp>>) -> Json<Value> {
    Json(json!({
        "api": "tesira-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "ready": dsp.ready(),
        "time": Utc::now().timestamp(),
    }))
}

async fn dsp_info(State(dsp): State<Arc<Dsp>>) -> ApiResult {
    let info = dsp.info().map_err(control_error)?;
    Ok(Json(json!(info)))
}

/// Supported blocks only; anything the gateway cannot drive stays hidden
async fn list_blocks(State(dsp): State<Arc<Dsp>>) -> ApiResult {
    let blocks = dsp.supported_blocks().map_err(control_error)?;
    let listing: serde_json::Map<String, Value> = blocks
        .into_iter()
        .map(|(id, kind)| (id, json!({ "type": kind })))
        .collect();
    Ok(Json(json!({ "blocks": listing })))
}

async fn get_block(State(dsp): State<Arc<Dsp>>, Path(id): Path<String>) -> ApiResult {
    let block = dsp
        .block(&id)
        .map_err(control_error)?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("block {id} not found")))?;
    Ok(Json(
        serde_json::to_value(&block)
            .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
    ))
}

/// Apply a change document to one block
async fn set_block(
    State(dsp): State<Arc<Dsp>>,
    Path(id): Path<String>,
    body: String,
) -> ApiResult {
    let content: Value = serde_json::from_str(&body)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid request body"))?;
    let content = match content.as_object() {
        Some(map) if !map.is_empty() => map.clone(),
        _ => return Err(error_response(StatusCode::BAD_REQUEST, "empty request")),
    };

    let block = dsp
        .block(&id)
        .map_err(control_error)?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("block {id} not found")))?;

    let mut changes: Vec<String> = Vec::new();
    match block.kind {
        BlockType::LevelControl
        | BlockType::MuteControl
        | BlockType::DanteInput
        | BlockType::DanteOutput
        | BlockType::AudioOutput => {
            apply_channel_changes(&dsp, &id, block.kind, &content, &mut changes)?;
        }
        BlockType::SourceSelector => {
            apply_selector_changes(&dsp, &id, &content, &mut changes)?;
        }
        other => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("block type {other:?} does not support changes"),
            ));
        }
    }

    Ok(Json(json!({ "changes": changes })))
}

/// `{"channel": {"<idx>": {"mute"|"muted": <bool-like>, "level": <number>}}}`
fn apply_channel_changes(
    dsp: &Dsp,
    id: &str,
    kind: BlockType,
    content: &serde_json::Map<String, Value>,
    changes: &mut Vec<String>,
) -> Result<(), ApiError> {
    let channels = content
        .get("channel")
        .ok_or_else(|| error_response(StatusCode::PRECONDITION_FAILED, "channel must be specified"))?
        .as_object()
        .ok_or_else(|| {
            error_response(
                StatusCode::PRECONDITION_FAILED,
                "invalid channel specification type",
            )
        })?;

    for (channel_key, request) in channels {
        let channel: u32 = channel_key.trim().parse().map_err(|_| {
            error_response(
                StatusCode::PRECONDITION_FAILED,
                format!("non-numeric channel received: {channel_key}"),
            )
        })?;
        let request = request.as_object().ok_or_else(|| {
            error_response(
                StatusCode::PRECONDITION_FAILED,
                format!("invalid change request type on channel {channel}"),
            )
        })?;

        for (change_key, change_value) in request {
            match change_key.as_str() {
                "mute" | "muted" => {
                    dsp.set_mute(id, channel, bool_like(change_value))
                        .map_err(control_error)?;
                    changes.push(format!("mute_{channel}"));
                }
                "level" => {
                    if kind == BlockType::MuteControl {
                        return Err(error_response(
                            StatusCode::PRECONDITION_FAILED,
                            format!("level adjustment on unsupported block type {kind:?}"),
                        ));
                    }
                    let value = number_like(change_value).ok_or_else(|| {
                        error_response(
                            StatusCode::PRECONDITION_FAILED,
                            format!("non-numeric value received on channel {channel}"),
                        )
                    })?;
                    dsp.set_level(id, channel, value).map_err(control_error)?;
                    changes.push(format!("level_{channel}"));
                }
                other => warn!("unknown change key: {other} (on {id})"),
            }
        }
    }
    Ok(())
}

/// Selector grammar: `mute` shorthand (which wins over `output.muted`),
/// `selected`, and per-source levels under `sources`
fn apply_selector_changes(
    dsp: &Dsp,
    id: &str,
    content: &serde_json::Map<String, Value>,
    changes: &mut Vec<String>,
) -> Result<(), ApiError> {
    if let Some(mute) = content.get("mute") {
        dsp.set_mute(id, 0, bool_like(mute)).map_err(control_error)?;
        changes.push("mute".to_owned());
    } else if let Some(muted) = content.get("output").and_then(|o| o.get("muted")) {
        dsp.set_mute(id, 0, bool_like(muted)).map_err(control_error)?;
        changes.push("mute".to_owned());
    }

    if let Some(selected) = content.get("selected") {
        let source = match selected {
            Value::String(s) => s.trim().to_owned(),
            other => other.to_string(),
        };
        dsp.set_source_select(id, &source).map_err(control_error)?;
        changes.push("selected".to_owned());
    }

    if let Some(sources) = content.get("sources") {
        let sources = sources.as_object().ok_or_else(|| {
            error_response(
                StatusCode::PRECONDITION_FAILED,
                "invalid sources specification type",
            )
        })?;
        for (index_key, config) in sources {
            let index: u32 = index_key.trim().parse().map_err(|_| {
                error_response(
                    StatusCode::PRECONDITION_FAILED,
                    format!("non-numeric source index received: {index_key}"),
                )
            })?;
            let Some(level) = config.get("level") else {
                continue;
            };
            // Levels come either directly or nested under "current"
            let value = match level {
                Value::Object(nested) => nested.get("current").and_then(number_like),
                other => number_like(other),
            }
            .ok_or_else(|| {
                error_response(
                    StatusCode::PRECONDITION_FAILED,
                    format!("non-numeric level for source {index}"),
                )
            })?;
            dsp.set_source_level(id, index, value).map_err(control_error)?;
            changes.push(format!("level_{index}"));
        }
    }
    Ok(())
}

/// The loose boolean reading the write grammar accepts
fn bool_like(value: &Value) -> bool {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "mute" | "muted"
    )
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
