use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ProxyError;
use crate::pipeline::{self, ChatRequest};

pub async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return ProxyError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    match pipeline::run(&state, &request).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                warn!(%status, "Chat request failed: {err}");
            } else {
                info!(%status, "Chat request rejected: {err}");
            }
            err.into_response()
        }
    }
}
