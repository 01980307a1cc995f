//! Control Endpoint
//!
//! A small HTTP surface next to the sync port: `GET /status` for health
//! checks (always safe, no auth), and `POST /` for backend-originated
//! commands. Every non-safe request must come from inside the configured
//! CIDR mask and present the control secret; failures are reported without
//! leaking anything in the body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Json, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use crate::server::core::ServerCore;
use crate::server::events::ServerEvent;
use crate::shared::{Action, ActionStatus, Meta};

/// Control request body
#[derive(Debug, Deserialize)]
struct ControlRequest {
    /// Protocol version; accepted but not branched on yet
    #[allow(dead_code)]
    #[serde(default)]
    version: Option<u32>,
    secret: String,
    commands: Vec<Value>,
}

/// Build the control router
pub fn router(core: Arc<ServerCore>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/", post(command))
        .with_state(core)
}

/// `GET /status`: liveness, no auth
async fn status() -> &'static str {
    "OK"
}

/// `POST /`: backend-originated commands, mask- and secret-gated
async fn command(
    State(core): State<Arc<ServerCore>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<ControlRequest>,
) -> StatusCode {
    let ip = remote.ip();
    if !core.control_mask.contains(&ip) {
        core.events.emit(ServerEvent::WrongControlIp { ip });
        return StatusCode::FORBIDDEN;
    }
    let authorized = core
        .control_secret
        .as_ref()
        .is_some_and(|secret| *secret == request.secret);
    if !authorized {
        core.events.emit(ServerEvent::WrongControlSecret { ip });
        return StatusCode::FORBIDDEN;
    }

    for entry in request.commands {
        if let Err(reason) = apply_command(&core, entry, &ip.to_string()) {
            tracing::warn!("[Control] Rejected command: {}", reason);
            return StatusCode::BAD_REQUEST;
        }
    }
    StatusCode::OK
}

/// Validate and apply one `["action", action, meta]` command
fn apply_command(core: &Arc<ServerCore>, entry: Value, from_ip: &str) -> Result<(), String> {
    let parts = entry.as_array().ok_or("command is not an array")?;
    let name = parts
        .first()
        .and_then(Value::as_str)
        .ok_or("command has no name")?;
    if name != "action" {
        return Err(format!("unknown command {name}"));
    }

    let action: Action = serde_json::from_value(
        parts.get(1).cloned().ok_or("command has no action")?,
    )
    .map_err(|error| format!("bad action shape: {error}"))?;
    let mut meta: Meta = match parts.get(2) {
        Some(raw) => {
            serde_json::from_value(raw.clone()).map_err(|error| format!("bad meta shape: {error}"))?
        }
        None => Meta::default(),
    };

    meta.extra
        .insert("backend".into(), Value::String(from_ip.to_string()));
    // Types the server has no local processor for were already handled on
    // the backend side; the pipeline must not touch them again.
    if !action.is_control()
        && meta.status.is_none()
        && core.types.resolve_registered(&action.type_name).is_none()
    {
        meta.status = Some(ActionStatus::Processed);
    }

    core.log.add(action, meta);
    Ok(())
}
