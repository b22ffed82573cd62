use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::errors::BotError;

/// One station reading from the METAR batch endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MetarObservation {
    #[serde(rename = "icaoId")]
    pub station_id: String,
    pub temp: Option<f64>,
    #[serde(rename = "obsTime")]
    pub obs_time: Option<i64>,
}

/// Batch METAR client. All active stations go out in a single request
/// per tick, comma-separated.
pub struct MetarClient {
    client: Client,
    base_url: String,
}

impl MetarClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent("tempedge/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build METAR client")?;
        Ok(MetarClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, base_url: String) -> Self {
        MetarClient { client, base_url }
    }

    /// Fetch the latest observation for every station in one call.
    /// Stations missing from the response are simply absent from the map.
    pub async fn batch_fetch(
        &self,
        stations: &[&str],
    ) -> std::result::Result<HashMap<String, MetarObservation>, BotError> {
        if stations.is_empty() {
            return Ok(HashMap::new());
        }
        let url = format!("{}?ids={}&format=json", self.base_url, stations.join(","));

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BotError::Transport(format!(
                "METAR batch returned {}",
                status
            )));
        }

        let readings: Vec<MetarObservation> = resp
            .json()
            .await
            .map_err(|e| BotError::Validation(format!("METAR response unparseable: {}", e)))?;

        let mut map: HashMap<String, MetarObservation> = HashMap::new();
        for obs in readings {
            if obs.temp.is_none() {
                debug!("METAR {}: no temperature in report", obs.station_id);
                continue;
            }
            // Keep the newest report per station
            match map.get(&obs.station_id) {
                Some(existing) if existing.obs_time >= obs.obs_time => {}
                _ => {
                    map.insert(obs.station_id.clone(), obs);
                }
            }
        }
        Ok(map)
    }
}
