//! Streaming chat-completion calls to the upstream provider.

use reqwest::{Client, Response, header};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::constants::CHAT_COMPLETIONS_PATH;
use crate::error::ProxyError;
use crate::keys::key_prefix;
use crate::models::{ChatMessage, Model};

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: Model,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Start a streaming completion.
    ///
    /// The timeout covers the wait for response headers; once a successful body
    /// starts streaming it may take as long as the upstream needs. A non-success
    /// status comes back as `ProxyError::UpstreamError` carrying the original
    /// status and body so it can be relayed untouched. Reading that error body
    /// shares the same deadline as the headers.
    pub async fn complete(
        &self,
        api_key: &str,
        model: Model,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<Response, ProxyError> {
        let url = format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH);
        let body = CompletionRequest {
            model,
            messages,
            temperature,
            stream: true,
        };

        info!(
            %model,
            key = %key_prefix(api_key),
            messages = messages.len(),
            "Forwarding completion upstream"
        );

        let request = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {api_key}"))
            .header(header::ACCEPT, "text/event-stream")
            .json(&body)
            .send();

        let deadline = Instant::now() + self.timeout;
        let response = match tokio::time::timeout_at(deadline, request).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timed_out("headers")),
        };

        if !response.status().is_success() {
            let status = response.status();
            let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
            let body = match tokio::time::timeout_at(deadline, response.bytes()).await {
                Ok(result) => result?,
                Err(_) => return Err(self.timed_out("error body")),
            };
            warn!(%status, "Upstream rejected completion request");
            return Err(ProxyError::UpstreamError {
                status,
                content_type,
                body,
            });
        }

        Ok(response)
    }

    fn timed_out(&self, waiting_for: &str) -> ProxyError {
        warn!(
            timeout_ms = self.timeout.as_millis() as u64,
            waiting_for, "Upstream request timed out"
        );
        ProxyError::Timeout
    }
}
