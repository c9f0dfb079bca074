mod billing;
mod budget;
mod config;
mod constants;
mod error;
mod keys;
mod models;
mod pipeline;
mod routes;
mod transforms;
mod upstream;

#[cfg(test)]
mod test_support;

use axum::ServiceExt;
use axum::http::{HeaderValue, Method, header};
use billing::BillingAggregator;
use budget::{TiktokenCounter, TokenCounter, TokenLimits};
use clap::Parser;
use config::{Config, CorsMode};
use models::Model;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::UpstreamClient;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

/// Everything a request needs, built once at startup and shared read-only.
pub struct AppState {
    /// Built-in credential string
    pub builtin_keys: String,
    pub password: Option<String>,
    pub default_model: Model,
    pub limits: TokenLimits,
    pub tokenizer: Arc<dyn TokenCounter>,
    pub upstream: UpstreamClient,
    pub billing: BillingAggregator,
}

impl AppState {
    pub fn from_config(config: &Config, http_client: Client) -> Self {
        Self {
            builtin_keys: config.api_keys.clone(),
            password: config.password.clone(),
            default_model: config.default_model,
            limits: TokenLimits::new(&config.max_input_tokens),
            tokenizer: Arc::new(TiktokenCounter::new()),
            upstream: UpstreamClient::new(
                http_client.clone(),
                config.base_url.clone(),
                config.timeout,
            ),
            billing: BillingAggregator::new(http_client, config.base_url.clone(), config.timeout),
        }
    }
}

#[derive(Parser)]
#[command(name = "chat-edge-proxy")]
#[command(about = "Streaming edge proxy for OpenAI-compatible chat completions")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "CHAT_PROXY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "CHAT_PROXY_PORT")]
    port: Option<u16>,
}

fn cors_layer(mode: CorsMode) -> CorsLayer {
    match &mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &mode {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env().expect("Invalid configuration");

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    // No overall request timeout: completions stream for as long as they need.
    // The header timeout is applied per call.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    if config.api_keys.trim().is_empty() {
        tracing::warn!("OPENAI_API_KEY is not set; only requests carrying their own key will work");
    }
    if config.password.is_none() {
        tracing::warn!("CHAT_PROXY_PASSWORD is not set; the endpoint is open to anyone");
    }
    info!(
        "Upstream: {} (timeout {} ms, default model {})",
        config.base_url,
        config.timeout.as_millis(),
        config.default_model
    );

    let state = Arc::new(AppState::from_config(&config, http_client));
    let cors = cors_layer(config.cors_mode.clone());

    let app = NormalizePath::trim_trailing_slash(routes::router(state).layer(cors));

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting chat-edge-proxy v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .unwrap();
}
