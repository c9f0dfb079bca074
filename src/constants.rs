/// Default upstream host when `OPENAI_API_BASE_URL` is unset
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Chat completion endpoint, relative to the base URL
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Billing endpoints, relative to the base URL
pub const BILLING_SUBSCRIPTION_PATH: &str = "/v1/dashboard/billing/subscription";
pub const BILLING_USAGE_PATH: &str = "/v1/dashboard/billing/usage";

/// Timeout for the upstream response headers when none (or garbage) is configured
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Sampling temperature used when the request omits one
pub const DEFAULT_TEMPERATURE: f32 = 0.6;

/// Billing lookback window in days (plus one day ahead to include today's usage)
pub const BILLING_LOOKBACK_DAYS: i64 = 90;

/// Upstream reports usage in hundredths of a unit
pub const USAGE_DIVISOR: f64 = 100.0;

/// Message content that asks for the balance of the caller-supplied key(s)
pub const BALANCE_QUERY_PHRASE: &str = "check balance";

/// Message content starting with this is treated as pasted raw keys
pub const RAW_KEY_PREFIX: &str = "sk-";

/// Sentinel payload that ends an upstream completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Number of key characters shown in logs and balance tables
pub const KEY_DISPLAY_LEN: usize = 8;
