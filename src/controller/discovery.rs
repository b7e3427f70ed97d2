//! Gateway discovery
//!
//! `GET /gateway/bot` returns the gateway URL, the recommended shard count
//! and the identify concurrency. The call is retried on 429 / 5xx with
//! exponential backoff, fails immediately on 401, and gives up on any other
//! status or once the attempt ceiling is reached.

use crate::error::{is_retryable_status, ErrorKind, GatewayError};
use crate::metrics;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default REST base URL
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// User agent required by the REST API
pub const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/0xHoneyJar/arrakis, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Raw REST answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Transport for the discovery call (mocked in tests)
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn get_gateway_bot(&self) -> Result<ApiResponse, GatewayError>;
}

/// Decoded `/gateway/bot` payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    pub shards: u32,
    #[serde(default)]
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

impl Default for SessionStartLimit {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_concurrency() -> u32 {
    1
}

impl GatewayInfo {
    pub fn max_concurrency(&self) -> u32 {
        self.session_start_limit.max_concurrency
    }

    /// Decode a 200 body.
    pub fn from_body(body: &str) -> Result<Self, GatewayError> {
        let info: GatewayInfo = serde_json::from_str(body).map_err(GatewayError::InvalidResponse)?;
        if info.shards == 0 {
            return Err(GatewayError::Config(
                "gateway recommended zero shards".to_string(),
            ));
        }
        Ok(info)
    }
}

/// Attempt ceiling and backoff base for discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `base * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Production transport
pub struct HttpGatewayApi {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl HttpGatewayApi {
    /// `accept-encoding: gzip` is added by the client itself.
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl GatewayApi for HttpGatewayApi {
    async fn get_gateway_bot(&self) -> Result<ApiResponse, GatewayError> {
        let url = format!("{}/gateway/bot", self.base);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| classify_transport_error("GET /gateway/bot", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error("reading /gateway/bot body", e))?;

        Ok(ApiResponse { status, body })
    }
}

fn classify_transport_error(context: &str, err: reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::Config(format!("{context}: {err}"))
    } else {
        GatewayError::transient(context, err)
    }
}

/// Run discovery to a definitive outcome.
pub async fn fetch_gateway_info(
    api: &dyn GatewayApi,
    policy: RetryPolicy,
) -> Result<GatewayInfo, GatewayError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        metrics::record_discovery_attempt();

        let response = match api.get_gateway_bot().await {
            Ok(response) => response,
            Err(err) if err.kind() == ErrorKind::TransientNetwork => {
                if attempts >= policy.max_attempts {
                    error!(attempts, error = %err, "Gateway discovery failed, giving up");
                    return Err(err);
                }
                let delay = policy.delay_for(attempts);
                warn!(attempts, error = %err, ?delay, "Gateway discovery request failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => return Err(err),
        };

        match response.status {
            200 => {
                let info = GatewayInfo::from_body(&response.body)?;
                info!(
                    shards = info.shards,
                    max_concurrency = info.max_concurrency(),
                    url = %info.url,
                    attempts,
                    "Gateway discovered"
                );
                return Ok(info);
            }
            401 => {
                error!("Gateway discovery rejected the bot token");
                return Err(GatewayError::Authentication(
                    "the provided token is invalid".to_string(),
                ));
            }
            status if is_retryable_status(status) && attempts < policy.max_attempts => {
                let delay = policy.delay_for(attempts);
                warn!(status, attempts, ?delay, "Gateway discovery throttled, backing off");
                tokio::time::sleep(delay).await;
            }
            status => {
                error!(status, attempts, body = %response.body, "Gateway discovery failed");
                return Err(GatewayError::Http {
                    status,
                    attempts,
                    body: response.body,
                });
            }
        }
        debug!(attempts, "Retrying gateway discovery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_payload() {
        let info = GatewayInfo::from_body(
            r#"{"url":"wss://example","shards":8,"session_start_limit":{"total":1000,"remaining":999,"reset_after":14400000,"max_concurrency":16}}"#,
        )
        .unwrap();
        assert_eq!(info.url, "wss://example");
        assert_eq!(info.shards, 8);
        assert_eq!(info.max_concurrency(), 16);
    }

    #[test]
    fn missing_session_start_limit_defaults_to_one() {
        let info = GatewayInfo::from_body(r#"{"url":"wss://example","shards":2}"#).unwrap();
        assert_eq!(info.max_concurrency(), 1);
    }

    #[test]
    fn malformed_body_is_invalid_response() {
        let err = GatewayInfo::from_body("<html>").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
        let err = GatewayInfo::from_body(r#"{"url":"wss://example","shards":0}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn user_agent_names_the_product() {
        assert!(USER_AGENT.starts_with("DiscordBot ("));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
