use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::VenueConfig;
use crate::db::models::Side;

use super::{MarketFeed, RawQuote, RealizedResult, VenueError};

/// Client for a fixed-odds sportsbook API. The book quotes player-prop
/// lines (over/under) and moneyline-equivalents in its configured odds
/// format; prices carry the book's margin.
pub struct FixedOddsFeed {
    config: VenueConfig,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct OddsResponse {
    markets: Vec<OddsRow>,
}

#[derive(Debug, Deserialize)]
struct OddsRow {
    event_id: String,
    entity_id: String,
    statistic: String,
    #[serde(default)]
    line: Option<f64>,
    side: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    stat_value: Option<f64>,
    #[serde(default)]
    winner_entity_id: Option<String>,
}

impl FixedOddsFeed {
    pub fn new(config: VenueConfig, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(FixedOddsFeed { config, http })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, VenueError> {
        debug!("GET {}", url);
        let mut req = self.http.get(url);
        if let Some(key) = &self.config.api_key {
            req = req.header("X-Api-Key", key);
        }
        let resp = req.send().await.map_err(VenueError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), &self.config.id));
        }
        resp.json::<T>()
            .await
            .map_err(|e| VenueError::Permanent(format!("{}: bad response body: {e}", self.config.id)))
    }

    fn parse_side(raw: &str) -> Option<Side> {
        match raw {
            "over" => Some(Side::Over),
            "under" => Some(Side::Under),
            // Moneyline rows quote the entity winning
            "win" | "moneyline" => Some(Side::Yes),
            _ => None,
        }
    }
}

#[async_trait]
impl MarketFeed for FixedOddsFeed {
    fn config(&self) -> &VenueConfig {
        &self.config
    }

    async fn fetch_quotes(&self, run_date: NaiveDate) -> Result<Vec<RawQuote>, VenueError> {
        let url = format!("{}/v1/odds?date={}", self.config.base_url, run_date);
        let resp: OddsResponse = self.get_json(&url).await?;

        let mut quotes = Vec::with_capacity(resp.markets.len());
        for row in resp.markets {
            let Some(side) = Self::parse_side(&row.side) else {
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
                price: row.price,
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
            "{}/v1/odds/{}/{}?side={}",
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
            price: f64,
        }
        let resp: PriceResponse = self.get_json(&url).await?;
        Ok(resp.price)
    }

    async fn fetch_result(
        &self,
        event_id: &str,
        entity_id: &str,
        statistic: &str,
    ) -> Result<Option<RealizedResult>, VenueError> {
        let url = format!(
            "{}/v1/results/{}?entity={}&statistic={}",
            self.config.base_url, event_id, entity_id, statistic
        );
        let resp: ResultResponse = match self.get_json(&url).await {
            Ok(resp) => resp,
            // No result yet is not an error; the grader retries tomorrow
            Err(VenueError::Permanent(msg)) if msg.contains("404") => return Ok(None),
            Err(e) => return Err(e),
        };

        match resp.status.as_deref() {
            Some("cancelled") | Some("postponed") => Ok(Some(RealizedResult::Voided)),
            Some("final") => {
                if let Some(value) = resp.stat_value {
                    Ok(Some(RealizedResult::StatValue(value)))
                } else if let Some(winner) = resp.winner_entity_id {
                    Ok(Some(RealizedResult::Won(winner == entity_id)))
                } else {
                    Err(VenueError::Permanent(format!(
                        "{}: final result for {} carries no settlement data",
                        self.config.id, event_id
                    )))
                }
            }
            _ => Ok(None),
        }
    }
}
