//! Account balance lookups across one or more upstream keys.
//!
//! Each key needs two upstream calls (hard limit and usage to date). All keys
//! are queried concurrently and joined before the table is rendered. A key
//! whose lookup fails in any way shows up as unavailable instead of failing the
//! whole batch.

use chrono::{NaiveDate, TimeDelta, Utc};
use futures_util::future::join_all;
use reqwest::{Client, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::constants::{
    BILLING_LOOKBACK_DAYS, BILLING_SUBSCRIPTION_PATH, BILLING_USAGE_PATH, USAGE_DIVISOR,
};
use crate::error::ProxyError;
use crate::keys::key_prefix;

const DATE_FORMAT: &str = "%Y-%m-%d";
const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, PartialEq)]
pub struct BillingRecord {
    pub key: String,
    pub rate: f64,
    pub total_granted: f64,
    pub total_used: f64,
    pub total_available: f64,
}

impl BillingRecord {
    pub fn new(key: impl Into<String>, total_granted: f64, total_used: f64) -> Self {
        let total_available = total_granted - total_used;
        let rate = if total_granted > 0.0 {
            (total_available / total_granted).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            key: key.into(),
            rate,
            total_granted,
            total_used,
            total_available,
        }
    }

    /// Record for a key whose lookup failed
    pub fn unavailable(key: impl Into<String>) -> Self {
        Self::new(key, 0.0, 0.0)
    }

    pub fn is_usable(&self) -> bool {
        self.total_granted > 0.0
    }
}

#[derive(Debug, Deserialize)]
struct Subscription {
    hard_limit_usd: f64,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_usage: f64,
}

/// `[today - 90 days, today + 1 day]`
pub fn lookback_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (
        today - TimeDelta::days(BILLING_LOOKBACK_DAYS),
        today + TimeDelta::days(1),
    )
}

pub struct BillingAggregator {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl BillingAggregator {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Look up every key and render the sorted balance table.
    pub async fn aggregate(&self, keys: &[String]) -> String {
        let records = self.fetch_all(keys).await;
        render_table(&sort_records(records))
    }

    /// One record per key, in input order. Never fails.
    pub async fn fetch_all(&self, keys: &[String]) -> Vec<BillingRecord> {
        let (start, end) = lookback_window(Utc::now().date_naive());
        join_all(keys.iter().map(|key| self.fetch_or_degrade(key, start, end))).await
    }

    async fn fetch_or_degrade(&self, key: &str, start: NaiveDate, end: NaiveDate) -> BillingRecord {
        match self.fetch(key, start, end).await {
            Ok(record) => {
                debug!(key = %key_prefix(key), granted = record.total_granted, "Fetched billing");
                record
            }
            Err(e) => {
                warn!(key = %key_prefix(key), "{e}");
                BillingRecord::unavailable(key)
            }
        }
    }

    async fn fetch(
        &self,
        key: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BillingRecord, ProxyError> {
        let subscription_url = self.url(BILLING_SUBSCRIPTION_PATH)?;
        let mut usage_url = self.url(BILLING_USAGE_PATH)?;
        usage_url
            .query_pairs_mut()
            .append_pair("start_date", &start.format(DATE_FORMAT).to_string())
            .append_pair("end_date", &end.format(DATE_FORMAT).to_string());

        let (subscription, usage) = tokio::try_join!(
            self.get_json::<Subscription>(subscription_url, key),
            self.get_json::<Usage>(usage_url, key),
        )?;

        Ok(BillingRecord::new(
            key,
            subscription.hard_limit_usd,
            usage.total_usage / USAGE_DIVISOR,
        ))
    }

    fn url(&self, path: &str) -> Result<Url, ProxyError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ProxyError::BillingLookupDegraded(format!("invalid billing URL: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, key: &str) -> Result<T, ProxyError> {
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, format!("Bearer {key}"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProxyError::BillingLookupDegraded(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::BillingLookupDegraded(e.to_string()))?;
        if !status.is_success() {
            return Err(ProxyError::BillingLookupDegraded(format!(
                "upstream returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        // Error payloads lack the expected fields and fail here too
        serde_json::from_slice(&body)
            .map_err(|e| ProxyError::BillingLookupDegraded(format!("unexpected payload: {e}")))
    }
}

/// Unusable keys first, then by remaining ratio, highest first.
pub fn sort_records(mut records: Vec<BillingRecord>) -> Vec<BillingRecord> {
    records.sort_by(|a, b| match (a.is_usable(), b.is_usable()) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        _ => b.rate.total_cmp(&a.rate),
    });
    records
}

pub fn render_table(records: &[BillingRecord]) -> String {
    let mut table = String::from("| Key | Remaining | Used | Gross magnitude |\n");
    table.push_str("| --- | --- | --- | --- |\n");
    for record in records {
        let remaining = if record.is_usable() {
            format!(
                "{:.4} ({:.1}%)",
                record.total_available,
                record.rate * 100.0
            )
        } else {
            UNAVAILABLE.to_string()
        };
        let _ = writeln!(
            table,
            "| {} | {} | {:.4} | {:.4} |",
            key_prefix(&record.key),
            remaining,
            record.total_used,
            record.total_granted
        );
    }
    table
}
