//! Request pipeline: validation, command classification and dispatch.
//!
//! Nothing here touches the network until the request has passed the
//! password, input and token-budget checks.

use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::AppState;
use crate::budget;
use crate::constants::{BALANCE_QUERY_PHRASE, DEFAULT_TEMPERATURE, RAW_KEY_PREFIX};
use crate::error::ProxyError;
use crate::keys::{pick_random, split_keys};
use crate::models::{ChatMessage, Model};
use crate::transforms::transcode;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub key: Option<String>,
    pub temperature: Option<f32>,
    pub password: Option<String>,
    pub model: Option<Model>,
}

/// Which key string a request runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential<'a> {
    pub keys: &'a str,
    /// True when falling back to the server's own key(s)
    pub builtin: bool,
}

/// A supplied key string only counts when it holds at least one key and none
/// of its keys belong to the built-in pool.
pub fn resolve_credential<'a>(supplied: Option<&'a str>, builtin: &'a str) -> Credential<'a> {
    let builtin_pool = split_keys(builtin);
    let own = supplied.map(str::trim).filter(|keys| {
        let keys = split_keys(keys);
        !keys.is_empty() && !keys.iter().any(|k| builtin_pool.contains(k))
    });

    match own {
        Some(keys) => Credential {
            keys,
            builtin: false,
        },
        None => Credential {
            keys: builtin,
            builtin: true,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Completion,
    BalanceQueryByStoredKey,
    /// Keys pasted as the message content
    BalanceQueryByPastedKey(String),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Completion => "completion",
            Command::BalanceQueryByStoredKey => "balance_stored_key",
            Command::BalanceQueryByPastedKey(_) => "balance_pasted_key",
        }
    }
}

/// Decide what the last message asks for. Pure; performs no I/O.
pub fn classify(last_content: &str, credential: &Credential<'_>) -> Result<Command, ProxyError> {
    let content = last_content.trim();
    if content.eq_ignore_ascii_case(BALANCE_QUERY_PHRASE) {
        if credential.builtin {
            return Err(ProxyError::BalanceQueryDenied);
        }
        return Ok(Command::BalanceQueryByStoredKey);
    }
    if content.starts_with(RAW_KEY_PREFIX) {
        return Ok(Command::BalanceQueryByPastedKey(content.to_string()));
    }
    Ok(Command::Completion)
}

pub fn validate(request: &ChatRequest, password: Option<&str>) -> Result<(), ProxyError> {
    if let Some(expected) = password {
        let provided = request.password.as_deref().unwrap_or_default();
        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(ProxyError::Unauthorized);
        }
    }
    if request.messages.is_empty() {
        return Err(ProxyError::EmptyInput);
    }
    Ok(())
}

pub async fn run(state: &AppState, request: &ChatRequest) -> Result<Response, ProxyError> {
    validate(request, state.password.as_deref())?;

    let credential = resolve_credential(request.key.as_deref(), &state.builtin_keys);
    let last = request
        .messages
        .last()
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    let command = classify(last, &credential)?;
    let model = request.model.unwrap_or(state.default_model);

    info!(
        command = command.name(),
        %model,
        messages = request.messages.len(),
        builtin_key = credential.builtin,
        "Handling chat request"
    );

    match command {
        Command::BalanceQueryByStoredKey => balance(state, credential.keys).await,
        Command::BalanceQueryByPastedKey(keys) => balance(state, &keys).await,
        Command::Completion => complete(state, request, model, credential).await,
    }
}

async fn balance(state: &AppState, keys: &str) -> Result<Response, ProxyError> {
    let keys = split_keys(keys);
    if keys.is_empty() {
        return Err(ProxyError::NoCredential);
    }
    let table = state.billing.aggregate(&keys).await;
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        table,
    )
        .into_response())
}

async fn complete(
    state: &AppState,
    request: &ChatRequest,
    model: Model,
    credential: Credential<'_>,
) -> Result<Response, ProxyError> {
    let tokens = budget::estimate(state.tokenizer.as_ref(), &request.messages);
    let limit = state.limits.limit_for(model, credential.builtin);
    budget::check(tokens, limit, request.messages.len())?;

    let keys = split_keys(credential.keys);
    let api_key = pick_random(&keys).ok_or(ProxyError::NoCredential)?;
    let temperature = request.temperature.unwrap_or(DEFAULT_TEMPERATURE);

    let upstream = state
        .upstream
        .complete(api_key, model, &request.messages, temperature)
        .await?;

    let body = Body::from_stream(transcode(upstream.bytes_stream()));
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}
