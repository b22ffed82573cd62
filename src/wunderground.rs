use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cities::City;
use crate::errors::BotError;
use crate::range::{c_to_f, f_to_c, TempUnit};

/// Crowd-sourced daily high from the WU-style provider.
#[derive(Debug, Clone, Copy)]
pub struct WuDailyHigh {
    pub high_f: f64,
    pub high_c: f64,
    pub observation_count: i64,
}

#[derive(Debug, Deserialize)]
struct WuResponse {
    #[serde(default)]
    summaries: Vec<WuSummary>,
}

#[derive(Debug, Deserialize)]
struct WuSummary {
    imperial: Option<WuTemps>,
    metric: Option<WuTemps>,
    #[serde(rename = "obsCount", default)]
    obs_count: i64,
}

#[derive(Debug, Deserialize)]
struct WuTemps {
    #[serde(rename = "tempHigh")]
    temp_high: Option<f64>,
}

/// Crowd-observation client. Two instances exist in practice: the fast
/// loop's (hard 3 s timeout, no spacing) and the slow loop's (spaced
/// requests). Without an API key all fetches report data-absent.
pub struct WuClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    min_spacing: Option<Duration>,
    last_request: Mutex<Option<Instant>>,
}

impl WuClient {
    pub fn new(base_url: &str, timeout_secs: u64, min_spacing_ms: Option<u64>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("tempedge/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build WU client")?;
        let api_key = std::env::var("WU_API_KEY").ok().filter(|s| !s.is_empty());
        if api_key.is_none() {
            debug!("WU_API_KEY not set — crowd observations disabled");
        }
        Ok(WuClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            min_spacing: min_spacing_ms.map(Duration::from_millis),
            last_request: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, base_url: String, min_spacing_ms: Option<u64>) -> Self {
        WuClient {
            client,
            base_url,
            api_key: Some("test-key".to_string()),
            min_spacing: min_spacing_ms.map(Duration::from_millis),
            last_request: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn respect_spacing(&self) {
        let Some(spacing) = self.min_spacing else {
            return;
        };
        let wait = {
            let last = self.last_request.lock().unwrap();
            last.map(|t| spacing.saturating_sub(t.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        *self.last_request.lock().unwrap() = Some(Instant::now());
    }

    /// Fetch the crowd daily high for a city's local date. Returns None
    /// when the provider has no summary yet.
    pub async fn fetch_daily_high(
        &self,
        city: &City,
        local_date: NaiveDate,
    ) -> std::result::Result<Option<WuDailyHigh>, BotError> {
        let Some(key) = &self.api_key else {
            return Err(BotError::DataAbsent("WU client disabled".to_string()));
        };
        self.respect_spacing().await;

        let url = format!(
            "{}/pws/history/daily?stationId={}&date={}&format=json&units=m&apiKey={}",
            self.base_url,
            city.polymarket_station,
            local_date.format("%Y%m%d"),
            key,
        );

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BotError::Transport(format!("WU returned {}", status)));
        }

        let body: WuResponse = resp
            .json()
            .await
            .map_err(|e| BotError::Validation(format!("WU response unparseable: {}", e)))?;

        let Some(summary) = body.summaries.into_iter().next() else {
            return Ok(None);
        };

        let high_f = summary
            .imperial
            .as_ref()
            .and_then(|t| t.temp_high)
            .or_else(|| {
                summary
                    .metric
                    .as_ref()
                    .and_then(|t| t.temp_high)
                    .map(c_to_f)
            });
        let high_c = summary
            .metric
            .as_ref()
            .and_then(|t| t.temp_high)
            .or(high_f.map(f_to_c));

        match (high_f, high_c) {
            (Some(high_f), Some(high_c)) => Ok(Some(WuDailyHigh {
                high_f,
                high_c,
                observation_count: summary.obs_count,
            })),
            _ => Ok(None),
        }
    }

    /// The high in the city's resolution unit.
    pub fn high_in_unit(high: &WuDailyHigh, unit: TempUnit) -> f64 {
        match unit {
            TempUnit::F => high.high_f,
            TempUnit::C => high.high_c,
        }
    }
}
