use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Incorrect password, please contact the site administrator.")]
    Unauthorized,

    #[error("No message content was provided.")]
    EmptyInput,

    #[error("{}", input_too_long_message(*multi_turn))]
    InputTooLong {
        tokens: usize,
        limit: usize,
        multi_turn: bool,
    },

    #[error("No OpenAI API key is configured, or the key is malformed.")]
    NoCredential,

    #[error("No API key was provided; the built-in key's balance cannot be queried.")]
    BalanceQueryDenied,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("The upstream request timed out, please try again later.")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Upstream returned {status}")]
    UpstreamError {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        body: Bytes,
    },

    #[error("Malformed upstream event: {0}")]
    StreamDecodeError(String),

    #[error("Billing lookup failed: {0}")]
    BillingLookupDegraded(String),
}

fn input_too_long_message(multi_turn: bool) -> &'static str {
    if multi_turn {
        "The conversation is too long because continuous conversation is enabled. \
         Please clear some history or disable continuation and try again."
    } else {
        "The message is too long, please shorten it."
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthorized
            | ProxyError::EmptyInput
            | ProxyError::InputTooLong { .. }
            | ProxyError::NoCredential
            | ProxyError::BalanceQueryDenied
            | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamError { status, .. } => *status,
            ProxyError::Timeout
            | ProxyError::Network(_)
            | ProxyError::StreamDecodeError(_)
            | ProxyError::BillingLookupDegraded(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        // Upstream rejections pass through untouched
        if let ProxyError::UpstreamError {
            status,
            content_type,
            body,
        } = self
        {
            let mut response = (status, body).into_response();
            if let Some(content_type) = content_type {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type);
            }
            return response;
        }

        let status = self.status();
        (
            status,
            Json(json!({
                "error": {
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_policy_errors_are_400_envelopes() {
        let response = ProxyError::EmptyInput.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["message"], "No message content was provided.");
    }

    #[tokio::test]
    async fn test_timeout_is_500_envelope() {
        let response = ProxyError::Timeout.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["error"]["message"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_upstream_error_relayed_verbatim() {
        let response = ProxyError::UpstreamError {
            status: StatusCode::TOO_MANY_REQUESTS,
            content_type: Some(HeaderValue::from_static("application/json")),
            body: Bytes::from_static(b"{\"error\":\"slow down\"}"),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{\"error\":\"slow down\"}");
    }

    #[test]
    fn test_input_too_long_messages_differ() {
        let single = ProxyError::InputTooLong {
            tokens: 10,
            limit: 5,
            multi_turn: false,
        };
        let multi = ProxyError::InputTooLong {
            tokens: 10,
            limit: 5,
            multi_turn: true,
        };
        assert!(single.to_string().contains("shorten it"));
        assert!(multi.to_string().contains("clear some history"));
        assert!(multi.to_string().contains("disable continuation"));
    }
}
