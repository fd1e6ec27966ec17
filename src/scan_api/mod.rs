use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;
use url::Url;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// One page of update envelopes. The Scan API has shipped the list
/// under several keys over time; all are accepted.
#[derive(Debug, Clone, Default)]
pub struct UpdatesPage {
    pub envelopes: Vec<Value>,
    pub next_page_token: Option<String>,
}

/// One page of ACS entries.
#[derive(Debug, Clone, Default)]
pub struct AcsPage {
    pub entries: Vec<Value>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanClient {
    client: Client,
    base_url: Url,
    max_retries: usize,
    retry_base_ms: u64,
}

fn extract_array(response: &Value, keys: &[&str]) -> Vec<Value> {
    for key in keys {
        if let Some(items) = response.get(*key).and_then(|v| v.as_array()) {
            return items.clone();
        }
    }
    Vec::new()
}

fn extract_page_token(response: &Value) -> Option<String> {
    response
        .get("next_page_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `round` arrives as either an integer or a base-10 string.
fn parse_round(response: &Value) -> Option<i64> {
    match response.get("round") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

impl ScanClient {
    /// Build a client. The insecure toggle disables certificate
    /// verification on this client only; there is deliberately no
    /// process-wide override.
    pub fn new(base_url: &str, timeout: Duration, insecure_tls: bool) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        if insecure_tls {
            warn!("TLS certificate verification disabled for the Scan client");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: Url::parse(base_url)
                .with_context(|| format!("Invalid scan URL: {base_url}"))?,
            max_retries: 4,
            retry_base_ms: 10,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid endpoint path: {path}"))
    }

    /// Issue a request, retrying transport errors and retryable
    /// statuses (429 and 5xx) with jittered exponential backoff.
    async fn request_json(&self, build: impl Fn(&Client) -> reqwest::RequestBuilder) -> Result<Value> {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_base_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        Retry::spawn(retry_strategy, || async {
            let response = build(&self.client).send().await?;
            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                warn!(status = status.as_u16(), "Scan API returned retryable status");
                anyhow::bail!("Scan API returned retryable status {status}");
            }
            let response = response.error_for_status()?;
            Ok::<Value, anyhow::Error>(response.json::<Value>().await?)
        })
        .await
        .map_err(|e| {
            e.context(format!(
                "Scan request failed after {} attempts",
                self.max_retries + 1
            ))
        })
    }

    /// The most recent round the Scan service has data for; the
    /// startup preflight.
    pub async fn latest_round(&self) -> Result<i64> {
        let url = self.endpoint("v0/round-of-latest-data")?;
        let response = self.request_json(|c| c.get(url.clone())).await?;
        parse_round(&response)
            .ok_or_else(|| anyhow::anyhow!("round-of-latest-data returned no round: {response}"))
    }

    /// Historical page: updates strictly before the given instant, in
    /// reverse chronological order.
    pub async fn updates_before(&self, before: &str, page_size: usize) -> Result<UpdatesPage> {
        let mut url = self.endpoint("v0/updates")?;
        url.query_pairs_mut()
            .append_pair("before", before)
            .append_pair("page_size", &page_size.to_string());
        let response = self.request_json(|c| c.get(url.clone())).await?;
        Ok(UpdatesPage {
            envelopes: extract_array(&response, &["updates", "items", "transactions"]),
            next_page_token: extract_page_token(&response),
        })
    }

    /// Live page: updates after a position, in forward order.
    pub async fn updates_after(
        &self,
        begin_after: Option<&str>,
        page_size: usize,
    ) -> Result<UpdatesPage> {
        let url = self.endpoint("v2/updates")?;
        let body = json!({
            "begin_after": begin_after,
            "page_size": page_size,
        });
        let response = self
            .request_json(|c| c.post(url.clone()).json(&body))
            .await?;
        Ok(UpdatesPage {
            envelopes: extract_array(&response, &["updates", "items", "transactions"]),
            next_page_token: extract_page_token(&response),
        })
    }

    /// Snapshot cutoff for a migration, if the service has one at or
    /// before the given instant.
    pub async fn snapshot_timestamp(
        &self,
        before: &str,
        migration_id: i64,
    ) -> Result<Option<String>> {
        let mut url = self.endpoint("v0/state/acs/snapshot-timestamp")?;
        url.query_pairs_mut()
            .append_pair("before", before)
            .append_pair("migration_id", &migration_id.to_string());
        let response = self.request_json(|c| c.get(url.clone())).await?;
        Ok(response
            .get("record_time")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    /// One page of the Active Contract Set at a snapshot instant.
    pub async fn acs_page(
        &self,
        record_time: &str,
        migration_id: i64,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<AcsPage> {
        let mut url = self.endpoint("v0/state/acs")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("record_time", record_time)
                .append_pair("migration_id", &migration_id.to_string())
                .append_pair("page_size", &page_size.to_string());
            if let Some(token) = page_token {
                pairs.append_pair("page_token", token);
            }
        }
        let response = self.request_json(|c| c.get(url.clone())).await?;
        Ok(AcsPage {
            entries: extract_array(&response, &["items", "contracts", "created_events"]),
            next_page_token: extract_page_token(&response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_int_or_string() {
        assert_eq!(parse_round(&json!({"round": 42})), Some(42));
        assert_eq!(parse_round(&json!({"round": "42"})), Some(42));
        assert_eq!(parse_round(&json!({"round": "x"})), None);
        assert_eq!(parse_round(&json!({})), None);
    }

    #[test]
    fn test_extract_array_accepts_all_spellings() {
        for key in ["updates", "items", "transactions"] {
            let response = json!({key: [{"update_id": "u-1"}]});
            assert_eq!(extract_array(&response, &["updates", "items", "transactions"]).len(), 1);
        }
        assert!(extract_array(&json!({"other": []}), &["updates"]).is_empty());
    }

    #[test]
    fn test_empty_page_token_is_none() {
        assert_eq!(extract_page_token(&json!({"next_page_token": ""})), None);
        assert_eq!(
            extract_page_token(&json!({"next_page_token": "abc"})).as_deref(),
            Some("abc")
        );
        assert_eq!(extract_page_token(&json!({})), None);
    }

    #[test]
    fn test_client_rejects_bad_url() {
        assert!(ScanClient::new("not a url", Duration::from_secs(30), false).is_err());
    }
}
