//! Upstream quota authority
//!
//! The pool manager treats remaining quota as owned by the upstream; this
//! module is the client that asks for the authoritative value. The trait
//! exists so tests (and alternative upstreams) can stand in for the real
//! HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::UpstreamError;
use crate::utils::string::{mask_token, truncate_str};

/// Source of authoritative remaining-quota values.
#[async_trait]
pub trait QuotaAuthority: Send + Sync {
    /// Fetch the remaining quota for one credential, measured against the
    /// given reference model.
    async fn fetch_remaining_quota(
        &self,
        token: &str,
        reference_model: &str,
    ) -> Result<u64, UpstreamError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitResponse {
    #[serde(default)]
    remaining_queries: Option<u64>,
    #[serde(default)]
    remaining_tokens: Option<u64>,
}

/// HTTP client for the upstream's rate-limit endpoint.
pub struct GrokQuotaClient {
    client: Client,
    base_url: String,
}

impl GrokQuotaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn classify(status: u16, body: &str, retry_after: Option<&str>) -> UpstreamError {
        let mut err = UpstreamError::new(status, truncate_str(body, 200));
        if let Some(value) = retry_after {
            err = err.with_header("retry-after", value);
            if let Ok(secs) = value.trim().parse::<f64>() {
                err = err.with_retry_after(secs);
            }
        }
        err
    }
}

#[async_trait]
impl QuotaAuthority for GrokQuotaClient {
    async fn fetch_remaining_quota(
        &self,
        token: &str,
        reference_model: &str,
    ) -> Result<u64, UpstreamError> {
        let url = format!("{}/rest/rate-limits", self.base_url);
        let payload = json!({
            "requestKind": "DEFAULT",
            "modelName": reference_model,
        });

        let response = self
            .client
            .post(&url)
            .header("Cookie", format!("sso={}; sso-rw={}", token, token))
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .await
            .map_err(|e| UpstreamError::new(0, e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, &body, retry_after.as_deref()));
        }

        let parsed: RateLimitResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::new(status, format!("invalid rate-limit body: {}", e)))?;

        let remaining = parsed
            .remaining_queries
            .or(parsed.remaining_tokens)
            .ok_or_else(|| {
                UpstreamError::new(status, "rate-limit response carried no remaining counter")
            })?;

        debug!(
            token = %mask_token(token),
            model = reference_model,
            remaining,
            "fetched remaining quota"
        );
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_captures_retry_after() {
        let err = GrokQuotaClient::classify(429, "Too Many Requests", Some("12"));
        assert_eq!(err.status, 429);
        assert_eq!(err.retry_after, Some(12.0));
        assert_eq!(err.headers.get("retry-after").map(String::as_str), Some("12"));
    }

    #[test]
    fn test_classify_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let err = GrokQuotaClient::classify(500, &body, None);
        assert_eq!(err.message.len(), 200);
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = GrokQuotaClient::new("https://grok.com/");
        assert_eq!(client.base_url, "https://grok.com");
    }

    #[test]
    fn test_rate_limit_response_parses_either_counter() {
        let a: RateLimitResponse =
            serde_json::from_str(r#"{"remainingQueries": 42}"#).unwrap();
        assert_eq!(a.remaining_queries, Some(42));

        let b: RateLimitResponse =
            serde_json::from_str(r#"{"remainingTokens": 7}"#).unwrap();
        assert_eq!(b.remaining_tokens, Some(7));

        let c: RateLimitResponse = serde_json::from_str("{}").unwrap();
        assert!(c.remaining_queries.is_none() && c.remaining_tokens.is_none());
    }
}
