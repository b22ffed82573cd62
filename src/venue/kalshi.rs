use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::cities::City;
use crate::range::{bounds_from_strike, RangeSpec, Venue};
use crate::venue::{OrderbookDepth, PriceQuote};
use crate::venue::polymarket::canonical_range_name;

/// Series ticker for a city's daily-high market family.
pub fn series_ticker(city_key: &str) -> Option<&'static str> {
    match city_key {
        "NYC" => Some("KXHIGHNY"),
        "LAX" => Some("KXHIGHLAX"),
        "CHI" => Some("KXHIGHCHI"),
        "MIA" => Some("KXHIGHMIA"),
        "PHL" => Some("KXHIGHPHIL"),
        "DEN" => Some("KXHIGHDEN"),
        "HOU" => Some("KXHIGHHOU"),
        "ATL" => Some("KXHIGHATL"),
        "SEA" => Some("KXHIGHSEA"),
        _ => None,
    }
}

/// Event ticker for one (city, date): `KXHIGHNY-26FEB20`.
pub fn event_ticker(series: &str, target_date: NaiveDate) -> String {
    format!(
        "{}-{}",
        series,
        target_date.format("%y%b%d").to_string().to_uppercase()
    )
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<KalshiMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KalshiMarket {
    pub ticker: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub strike_type: String,
    #[serde(default)]
    pub floor_strike: Option<f64>,
    #[serde(default)]
    pub cap_strike: Option<f64>,
    /// Prices come back as integer cents.
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SingleMarketResponse {
    market: KalshiMarket,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: KalshiOrderbook,
}

#[derive(Debug, Deserialize)]
struct KalshiOrderbook {
    /// Resting NO bids as [price_cents, count]; a NO bid at c is a YES
    /// ask at 100 − c.
    #[serde(default)]
    no: Vec<[f64; 2]>,
}

/// Structured-venue client. Strike metadata maps directly to bounds, no
/// text parsing involved.
pub struct KalshiClient {
    client: Client,
    base_url: String,
}

impl KalshiClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Kalshi HTTP client")?;
        Ok(KalshiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, base_url: String) -> Self {
        KalshiClient { client, base_url }
    }

    pub async fn list_outcomes(
        &self,
        city: &City,
        target_date: NaiveDate,
    ) -> Result<Vec<RangeSpec>> {
        let Some(series) = series_ticker(city.key) else {
            return Ok(Vec::new());
        };
        let event = event_ticker(series, target_date);

        let url = format!("{}/markets", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("event_ticker", event.as_str()), ("limit", "100")])
            .send()
            .await
            .context("Failed to fetch Kalshi markets")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Kalshi markets query returned {}", status);
        }

        let body: MarketsResponse = response
            .json()
            .await
            .context("Failed to parse Kalshi markets response")?;

        let mut outcomes = Vec::new();
        for market in body.markets {
            if market.status != "active" && !market.status.is_empty() {
                continue;
            }
            let Some((range_min, range_max)) =
                bounds_from_strike(&market.strike_type, market.floor_strike, market.cap_strike)
            else {
                warn!(
                    "Unmappable strike on {}: type='{}'",
                    market.ticker, market.strike_type
                );
                continue;
            };

            let bid = market.yes_bid.unwrap_or(0) as f64 / 100.0;
            let ask = market.yes_ask.unwrap_or(100) as f64 / 100.0;
            let spec = RangeSpec {
                venue: Venue::Kalshi,
                market_id: market.ticker.clone(),
                token_id: market.ticker.clone(),
                city: city.key.to_string(),
                target_date,
                range_name: canonical_range_name(range_min, range_max, city.unit),
                range_min,
                range_max,
                range_unit: city.unit,
                bid,
                ask,
                spread: ask - bid,
                volume: market.volume.unwrap_or(0.0),
            };
            if let Err(e) = spec.validate() {
                warn!("Dropping invalid Kalshi outcome: {}", e);
                continue;
            }
            outcomes.push(spec);
        }
        Ok(outcomes)
    }

    pub async fn get_price(&self, ticker: &str) -> Result<PriceQuote> {
        let url = format!("{}/markets/{}", self.base_url, ticker);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch Kalshi market")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Kalshi market query returned {}", status);
        }

        let body: SingleMarketResponse = response
            .json()
            .await
            .context("Failed to parse Kalshi market response")?;

        let bid = body.market.yes_bid.unwrap_or(0) as f64 / 100.0;
        let ask = body.market.yes_ask.unwrap_or(100) as f64 / 100.0;
        Ok(PriceQuote {
            bid,
            ask,
            spread: ask - bid,
            volume: body.market.volume.unwrap_or(0.0),
        })
    }

    pub async fn get_orderbook(&self, ticker: &str) -> Result<OrderbookDepth> {
        let url = format!("{}/markets/{}/orderbook", self.base_url, ticker);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch Kalshi orderbook")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Kalshi orderbook query returned {}", status);
        }

        let body: OrderbookResponse = response
            .json()
            .await
            .context("Failed to parse Kalshi orderbook response")?;

        // NO bids convert to YES asks, cheapest first.
        let mut ask_depth: Vec<(f64, f64)> = body
            .orderbook
            .no
            .iter()
            .map(|[price_cents, count]| ((100.0 - price_cents) / 100.0, *count))
            .collect();
        ask_depth.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(OrderbookDepth { ask_depth })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cities::find_city;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_event_ticker_format() {
        assert_eq!(
            event_ticker("KXHIGHNY", date("2026-02-20")),
            "KXHIGHNY-26FEB20"
        );
    }

    #[test]
    fn test_series_ticker_known_cities() {
        assert_eq!(series_ticker("NYC"), Some("KXHIGHNY"));
        assert!(series_ticker("LON").is_none());
    }

    #[tokio::test]
    async fn test_list_outcomes_maps_strikes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .and(query_param("event_ticker", "KXHIGHNY-26FEB20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "markets": [
                    {
                        "ticker": "KXHIGHNY-26FEB20-B50.5",
                        "status": "active",
                        "strike_type": "between",
                        "floor_strike": 50.0,
                        "cap_strike": 51.0,
                        "yes_bid": 10,
                        "yes_ask": 14,
                        "volume": 5000.0
                    },
                    {
                        "ticker": "KXHIGHNY-26FEB20-T55",
                        "status": "active",
                        "strike_type": "greater",
                        "floor_strike": 55.0,
                        "yes_bid": 2,
                        "yes_ask": 5,
                        "volume": 3000.0
                    },
                    {
                        "ticker": "KXHIGHNY-26FEB20-T40",
                        "status": "active",
                        "strike_type": "less",
                        "cap_strike": 40.0,
                        "yes_bid": 1,
                        "yes_ask": 3,
                        "volume": 1000.0
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = KalshiClient::with_client(Client::new(), server.uri());
        let city = find_city("NYC").unwrap();
        let outcomes = client.list_outcomes(city, date("2026-02-20")).await.unwrap();
        assert_eq!(outcomes.len(), 3);

        let between = &outcomes[0];
        assert_eq!(between.range_min, Some(50.0));
        assert_eq!(between.range_max, Some(51.0));
        assert!((between.bid - 0.10).abs() < 1e-9);
        assert!((between.ask - 0.14).abs() < 1e-9);

        // greater(55) → min 56, open above
        let greater = &outcomes[1];
        assert_eq!(greater.range_min, Some(56.0));
        assert_eq!(greater.range_max, None);

        // less(40) → open below, max 39
        let less = &outcomes[2];
        assert_eq!(less.range_min, None);
        assert_eq!(less.range_max, Some(39.0));
    }

    #[tokio::test]
    async fn test_list_outcomes_city_without_series() {
        let client = KalshiClient::with_client(Client::new(), "http://unused".to_string());
        let city = find_city("LON").unwrap();
        let outcomes = client.list_outcomes(city, date("2026-02-20")).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_get_price_cents_conversion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/KXHIGHNY-26FEB20-B50.5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "market": {
                    "ticker": "KXHIGHNY-26FEB20-B50.5",
                    "status": "active",
                    "strike_type": "between",
                    "floor_strike": 50.0,
                    "cap_strike": 51.0,
                    "yes_bid": 36,
                    "yes_ask": 40,
                    "volume": 8000.0
                }
            })))
            .mount(&server)
            .await;

        let client = KalshiClient::with_client(Client::new(), server.uri());
        let quote = client.get_price("KXHIGHNY-26FEB20-B50.5").await.unwrap();
        assert!((quote.bid - 0.36).abs() < 1e-9);
        assert!((quote.ask - 0.40).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_orderbook_no_bids_become_yes_asks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/KXHIGHNY-26FEB20-B50.5/orderbook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderbook": {
                    "yes": [[10.0, 200.0]],
                    "no": [[55.0, 300.0], [60.0, 150.0]]
                }
            })))
            .mount(&server)
            .await;

        let client = KalshiClient::with_client(Client::new(), server.uri());
        let book = client
            .get_orderbook("KXHIGHNY-26FEB20-B50.5")
            .await
            .unwrap();
        // NO bid 60¢ → YES ask 0.40, NO bid 55¢ → YES ask 0.45
        assert_eq!(book.ask_depth.len(), 2);
        assert!((book.ask_depth[0].0 - 0.40).abs() < 1e-9);
        assert!((book.ask_depth[0].1 - 150.0).abs() < 1e-9);
        assert!((book.ask_depth[1].0 - 0.45).abs() < 1e-9);
    }
}
