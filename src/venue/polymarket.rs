use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cities::City;
use crate::range::{RangeSpec, TempUnit, Venue};
use crate::venue::{OrderbookDepth, PriceQuote};

// Gamma tag id for the temperature event family.
const WEATHER_TAG_ID: u32 = 84;

fn deserialize_optional_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrFloat {
        Float(f64),
        String(String),
        Null,
    }

    match StringOrFloat::deserialize(deserializer)? {
        StringOrFloat::Float(f) => Ok(Some(f)),
        StringOrFloat::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(de::Error::custom)
            }
        }
        StringOrFloat::Null => Ok(None),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    pub question: String,
    #[serde(rename = "conditionId", default)]
    pub condition_id: Option<String>,
    /// Stringified JSON array of CLOB token ids, `[yes, no]`.
    #[serde(rename = "clobTokenIds", default)]
    pub clob_token_ids: Option<String>,
    #[serde(rename = "bestBid", default, deserialize_with = "deserialize_optional_f64")]
    pub best_bid: Option<f64>,
    #[serde(rename = "bestAsk", default, deserialize_with = "deserialize_optional_f64")]
    pub best_ask: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    pub volume: Option<f64>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub active: bool,
}

impl GammaMarket {
    pub fn yes_token_id(&self) -> Option<String> {
        let ids: Vec<String> = serde_json::from_str(self.clob_token_ids.as_deref()?).ok()?;
        ids.into_iter().next()
    }
}

#[derive(Debug, Deserialize)]
struct GammaEvent {
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    #[serde(default)]
    asks: Vec<BookLevel>,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: String,
    size: String,
}

/// Parsed (city, date, bounds) from a narrative question.
#[derive(Debug, Clone)]
pub struct ParsedQuestion {
    pub city_key: String,
    pub date: NaiveDate,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
}

/// Extract city, date and temperature bounds from question text like
/// "Will the highest temperature in New York City be between 34-35°F on
/// February 11?".
pub fn parse_question(question: &str, today: NaiveDate) -> Option<ParsedQuestion> {
    if !question.to_lowercase().contains("temperature") {
        return None;
    }

    let city_key = crate::cities::CITIES
        .iter()
        .find(|c| question.contains(c.name) || question.contains(c.key))
        .map(|c| c.key.to_string())?;

    let date = extract_date(question, today)?;
    let (range_min, range_max) = extract_bounds(question)?;

    Some(ParsedQuestion {
        city_key,
        date,
        range_min,
        range_max,
    })
}

fn extract_date(question: &str, today: NaiveDate) -> Option<NaiveDate> {
    // ISO date first
    let iso_re = Regex::new(r"(\d{4}-\d{2}-\d{2})").ok()?;
    if let Some(caps) = iso_re.captures(question) {
        return caps[1].parse().ok();
    }

    // "on Month Day" with or without year
    let month_re = Regex::new(
        r"(?i)(January|February|March|April|May|June|July|August|September|October|November|December)\s+(\d{1,2})(?:,?\s+(\d{4}))?",
    )
    .ok()?;
    let caps = month_re.captures(question)?;
    let month = month_name_to_number(&caps[1])?;
    let day: u32 = caps[2].parse().ok()?;

    if let Some(year) = caps.get(3) {
        let year: i32 = year.as_str().parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    // No year: markets list only a few days out, so a date far in the
    // past must mean next year.
    let candidate = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if candidate < today - chrono::Duration::days(7) {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else {
        Some(candidate)
    }
}

fn month_name_to_number(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "january" => Some(1),
        "february" => Some(2),
        "march" => Some(3),
        "april" => Some(4),
        "may" => Some(5),
        "june" => Some(6),
        "july" => Some(7),
        "august" => Some(8),
        "september" => Some(9),
        "october" => Some(10),
        "november" => Some(11),
        "december" => Some(12),
        _ => None,
    }
}

fn extract_bounds(question: &str) -> Option<(Option<f64>, Option<f64>)> {
    // "between X-Y°F" / "X-Y°F" (hyphen or en-dash)
    let range_re = Regex::new(r"(-?\d+)\s*[-\u{2013}]\s*(-?\d+)°[FC]").ok()?;
    if let Some(caps) = range_re.captures(question) {
        let lo: f64 = caps[1].parse().ok()?;
        let hi: f64 = caps[2].parse().ok()?;
        return Some((Some(lo), Some(hi)));
    }

    // "X°F or above/higher/more" and "≥X°F"
    let above_re = Regex::new(r"(-?\d+)°[FC]\s+or\s+(?:above|higher|more)|≥\s*(-?\d+)").ok()?;
    if let Some(caps) = above_re.captures(question) {
        let n = caps.get(1).or_else(|| caps.get(2))?;
        return Some((Some(n.as_str().parse().ok()?), None));
    }

    // "X°F or below/less/lower" and "≤X°F"
    let below_re = Regex::new(r"(-?\d+)°[FC]\s+or\s+(?:below|less|lower)|≤\s*(-?\d+)").ok()?;
    if let Some(caps) = below_re.captures(question) {
        let n = caps.get(1).or_else(|| caps.get(2))?;
        return Some((None, Some(n.as_str().parse().ok()?)));
    }

    // "below/under X°F"
    let under_re = Regex::new(r"(?i)(?:below|under)\s+(-?\d+)°[FC]").ok()?;
    if let Some(caps) = under_re.captures(question) {
        return Some((None, Some(caps[1].parse().ok()?)));
    }

    // Bare "X°F": the one-degree bucket centered on X
    let single_re = Regex::new(r"(-?\d+)°[FC]").ok()?;
    if let Some(caps) = single_re.captures(question) {
        let n: f64 = caps[1].parse().ok()?;
        return Some((Some(n - 0.5), Some(n + 0.5)));
    }

    None
}

/// Canonical display name for a pair of bounds; stable across scans so
/// it can key deduplication.
pub fn canonical_range_name(
    range_min: Option<f64>,
    range_max: Option<f64>,
    unit: TempUnit,
) -> String {
    match (range_min, range_max) {
        (Some(lo), Some(hi)) => format!("{:.0}-{:.0}{}", lo, hi, unit.symbol()),
        (Some(lo), None) => format!("≥{:.0}{}", lo, unit.symbol()),
        (None, Some(hi)) => format!("≤{:.0}{}", hi, unit.symbol()),
        (None, None) => "?".to_string(),
    }
}

/// Narrative-venue client (Gamma-style events API + CLOB-style book).
pub struct PolymarketClient {
    client: Client,
    base_url: String,
}

impl PolymarketClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Polymarket HTTP client")?;
        Ok(PolymarketClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, base_url: String) -> Self {
        PolymarketClient { client, base_url }
    }

    /// All open temperature outcomes for one (city, date), normalized.
    pub async fn list_outcomes(
        &self,
        city: &City,
        target_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<RangeSpec>> {
        let url = format!("{}/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("tag_id", WEATHER_TAG_ID.to_string().as_str()),
                ("closed", "false"),
                ("limit", "200"),
            ])
            .send()
            .await
            .context("Failed to fetch weather events")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Gamma events query returned {}", status);
        }

        let events: Vec<GammaEvent> = response
            .json()
            .await
            .context("Failed to parse events response")?;

        let mut outcomes = Vec::new();
        for market in events.into_iter().flat_map(|e| e.markets) {
            if market.closed || !market.active {
                continue;
            }
            let Some(parsed) = parse_question(&market.question, today) else {
                continue;
            };
            if parsed.city_key != city.key || parsed.date != target_date {
                continue;
            }
            let Some(condition_id) = market.condition_id.clone() else {
                debug!("Market '{}' has no condition id", market.question);
                continue;
            };
            let token_id = market.yes_token_id().unwrap_or_else(|| condition_id.clone());

            let bid = market.best_bid.unwrap_or(0.0);
            let ask = market.best_ask.unwrap_or(1.0);
            let spec = RangeSpec {
                venue: Venue::Polymarket,
                market_id: condition_id,
                token_id,
                city: city.key.to_string(),
                target_date,
                range_name: canonical_range_name(parsed.range_min, parsed.range_max, city.unit),
                range_min: parsed.range_min,
                range_max: parsed.range_max,
                range_unit: city.unit,
                bid,
                ask,
                spread: ask - bid,
                volume: market.volume.unwrap_or(0.0),
            };
            if let Err(e) = spec.validate() {
                warn!("Dropping invalid outcome: {}", e);
                continue;
            }
            outcomes.push(spec);
        }
        Ok(outcomes)
    }

    pub async fn get_price(&self, market_id: &str) -> Result<PriceQuote> {
        let url = format!("{}/markets", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("condition_ids", market_id)])
            .send()
            .await
            .context("Failed to fetch market price")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Gamma market query returned {}", status);
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .context("Failed to parse market response")?;
        let market = markets
            .into_iter()
            .next()
            .context("Market not found in price response")?;

        let bid = market.best_bid.unwrap_or(0.0);
        let ask = market.best_ask.unwrap_or(1.0);
        Ok(PriceQuote {
            bid,
            ask,
            spread: ask - bid,
            volume: market.volume.unwrap_or(0.0),
        })
    }

    pub async fn get_orderbook(&self, token_id: &str) -> Result<OrderbookDepth> {
        let url = format!("{}/book?token_id={}", self.base_url, token_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch orderbook")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Book query returned {}", status);
        }

        let book: BookResponse = response
            .json()
            .await
            .context("Failed to parse orderbook response")?;
        let ask_depth = book
            .asks
            .iter()
            .filter_map(|l| Some((l.price.parse().ok()?, l.size.parse().ok()?)))
            .collect();
        Ok(OrderbookDepth { ask_depth })
    }
}
