use axum::response::Json;
use serde_json::{Value, json};

use crate::{BUILD_TIME, GIT_HASH, VERSION};

/// Liveness probe for the proxy process; never touches the upstream provider.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build metadata for the running `chat-edge-proxy` binary.
pub async fn version() -> Json<Value> {
    Json(json!({
        "version": VERSION,
        "git_hash": GIT_HASH,
        "build_time": BUILD_TIME,
    }))
}
