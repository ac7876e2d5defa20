use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::VenueConfig;
use crate::db::models::Side;

use super::{MarketFeed, RawQuote, RealizedResult, VenueError};

/// Client for a binary-outcome prediction exchange. Contracts are quoted
/// in cents on the dollar and pay $1 per share on the winning side.
pub struct BinaryExchangeFeed {
    config: VenueConfig,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<ContractRow>,
}

#[derive(Debug, Deserialize)]
struct ContractRow {
    event_id: String,
    entity_id: String,
    statistic: String,
    #[serde(default)]
    line: Option<f64>,
    side: String,
    /// Last traded price in cents (1–99)
    price_cents: f64,
}

#[derive(Debug, Deserialize)]
struct ResolutionResponse {
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    stat_value: Option<f64>,
}

impl BinaryExchangeFeed {
    pub fn new(config: VenueConfig, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(BinaryExchangeFeed { config, http })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, VenueError> {
        debug!("GET {}", url);
        let mut req = self.http.get(url);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(VenueError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), &self.config.id));
        }
        resp.json::<T>()
            .await
            .map_err(|e| VenueError::Permanent(format!("{}: bad response body: {e}", self.config.id)))
    }
}

#[async_trait]
impl MarketFeed for BinaryExchangeFeed {
    fn config(&self) -> &VenueConfig {
        &self.config
    }

    async fn fetch_quotes(&self, run_date: NaiveDate) -> Result<Vec<RawQuote>, VenueError> {
        let url = format!("{}/markets?close_date={}", self.config.base_url, run_date);
        let resp: MarketsResponse = self.get_json(&url).await?;

        let mut quotes = Vec::with_capacity(resp.markets.len());
        for row in resp.markets {
            let Some(side) = Side::parse(&row.side) else {
                warn!(
                    "{}: unknown side '{}' for event {}, skipping row",
                    self.config.id, row.side, row.event_id
                );
                continue;
            };
            quotes.push(RawQuote {
                event_id: row.event_id,
                entity_id: row.entity_id,
                statistic: row.statistic,
                line: row.line,
                side,
                price: row.price_cents,
            });
        }
        Ok(quotes)
    }

    async fn fetch_closing_price(
        &self,
        event_id: &str,
        statistic: &str,
        line: Option<f64>,
        side: Side,
    ) -> Result<f64, VenueError> {
        let mut url = format!(
            "{}/markets/{}/{}/price?side={}",
            self.config.base_url,
            event_id,
            statistic,
            side.as_str()
        );
        if let Some(line) = line {
            url.push_str(&format!("&line={line}"));
        }
        #[derive(Deserialize)]
        struct PriceResponse {
            price_cents: f64,
        }
        let resp: PriceResponse = self.get_json(&url).await?;
        Ok(resp.price_cents)
    }

    async fn fetch_result(
        &self,
        event_id: &str,
        entity_id: &str,
        statistic: &str,
    ) -> Result<Option<RealizedResult>, VenueError> {
        let url = format!(
            "{}/markets/{}/resolution?entity={}&statistic={}",
            self.config.base_url, event_id, entity_id, statistic
        );
        let resp: ResolutionResponse = match self.get_json(&url).await {
            Ok(resp) => resp,
            Err(VenueError::Permanent(msg)) if msg.contains("404") => return Ok(None),
            Err(e) => return Err(e),
        };

        match resp.resolution.as_deref() {
            Some("yes") => Ok(Some(RealizedResult::Won(true))),
            Some("no") => Ok(Some(RealizedResult::Won(false))),
            Some("void") => Ok(Some(RealizedResult::Voided)),
            Some("stat") => match resp.stat_value {
                Some(value) => Ok(Some(RealizedResult::StatValue(value))),
                None => Err(VenueError::Permanent(format!(
                    "{}: stat resolution for {} without a value",
                    self.config.id, event_id
                ))),
            },
            _ => Ok(None),
        }
    }
}
