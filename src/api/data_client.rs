//! Polymarket Data API client: wallet activity, wallet positions and market
//! resolution lookups.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::models::{MarketResolution, OutcomeToken, WalletPosition};

use super::types::*;

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const CLOB_API_BASE: &str = "https://clob.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Records fetched per poll (most recent first).
pub const ACTIVITY_PAGE_SIZE: u32 = 25;

/// Read-only source of the tracked wallet's activity.
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Most recent activity records, newest first.
    async fn latest_activity(&self, wallet: &str) -> Result<Vec<ActivityResponse>, FeedError>;

    /// Shares the wallet currently holds in a token. Zero when the wallet
    /// holds none.
    async fn position_shares(&self, wallet: &str, token_id: &str) -> Result<Decimal>;
}

/// Market state lookups used by the stop-loss and settlement sweeps.
#[async_trait]
pub trait MarketLookup: Send + Sync {
    /// Resolution state, `None` when the market is unknown.
    async fn resolution(&self, condition_id: &str) -> Result<Option<MarketResolution>>;

    /// Outcome tokens of a market.
    async fn outcome_tokens(&self, condition_id: &str) -> Result<Vec<OutcomeToken>>;

    /// Best price we could sell a token at right now.
    async fn current_price(&self, token_id: &str) -> Result<Option<Decimal>>;
}

/// Client for the Polymarket Data API plus the public CLOB market endpoints.
pub struct DataClient {
    client: Client,
    base_url: String,
    clob_url: String,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_urls(DATA_API_BASE.to_string(), CLOB_API_BASE.to_string())
    }

    /// Create with custom base URLs.
    pub fn with_base_urls(base_url: String, clob_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            clob_url,
        })
    }

    /// Fetch positions for a wallet.
    pub async fn get_positions(&self, address: &str) -> Result<Vec<WalletPosition>> {
        let url = format!("{}/positions?user={}&limit=500", self.base_url, address);

        debug!(url = %url, "Fetching positions");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch positions")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Positions request failed: {} - {}", status, body);
        }

        let items: Vec<PositionResponse> = response
            .json()
            .await
            .context("Failed to parse positions response")?;

        Ok(items
            .into_iter()
            .map(|p| WalletPosition {
                token_id: if p.asset.is_empty() {
                    p.condition_id.clone()
                } else {
                    p.asset
                },
                condition_id: p.condition_id,
                title: p.title,
                outcome: p.outcome,
                size: p.size,
                avg_price: p.avg_price,
                cur_price: p.cur_price,
                current_value: p.current_value,
            })
            .collect())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<Option<T>> {
        debug!(url = %url, "Fetching {}", what);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {what}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} request failed: {} - {}", what, status, body);
        }

        let parsed = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {what} response"))?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl ActivityFeed for DataClient {
    async fn latest_activity(&self, wallet: &str) -> Result<Vec<ActivityResponse>, FeedError> {
        let url = format!(
            "{}/activity?user={}&limit={}&offset=0",
            self.base_url, wallet, ACTIVITY_PAGE_SIZE
        );

        debug!(url = %url, "Fetching activity");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Unavailable(format!("{status} - {body}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        parse_activity(&body)
    }

    async fn position_shares(&self, wallet: &str, token_id: &str) -> Result<Decimal> {
        let positions = self.get_positions(wallet).await?;
        Ok(positions
            .iter()
            .find(|p| p.token_id == token_id)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO))
    }
}

#[async_trait]
impl MarketLookup for DataClient {
    async fn resolution(&self, condition_id: &str) -> Result<Option<MarketResolution>> {
        let url = format!("{}/markets?conditionId={}", self.base_url, condition_id);
        let markets: Option<Vec<MarketResponse>> = self.get_json(&url, "market").await?;

        Ok(markets
            .and_then(|m| m.into_iter().next())
            .map(|m| MarketResolution::from_response(&m)))
    }

    async fn outcome_tokens(&self, condition_id: &str) -> Result<Vec<OutcomeToken>> {
        let url = format!("{}/markets/{}", self.clob_url, condition_id);
        let market: Option<ClobMarketResponse> = self.get_json(&url, "CLOB market").await?;

        Ok(market.map(|m| OutcomeToken::from_clob(&m)).unwrap_or_default())
    }

    async fn current_price(&self, token_id: &str) -> Result<Option<Decimal>> {
        let url = format!("{}/price?token_id={}&side=sell", self.clob_url, token_id);
        let price: Option<PriceResponse> = self.get_json(&url, "price").await?;

        Ok(price
            .map(|p| p.price)
            .filter(|p| *p >= Decimal::ZERO && *p <= Decimal::ONE))
    }
}

/// Parse an activity body. Anything but a JSON array is malformed; single
/// records that fail to parse are dropped.
pub fn parse_activity(body: &str) -> Result<Vec<ActivityResponse>, FeedError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| FeedError::Malformed(e.to_string()))?;

    let Value::Array(items) = value else {
        return Err(FeedError::Malformed("expected a list of activity records".to_string()));
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ActivityResponse>(item) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Skipping unparseable activity record");
                None
            }
        })
        .collect())
}
