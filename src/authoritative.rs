use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cities::City;
use crate::db::{AuditTable, SharedDb};
use crate::range::{c_to_f, f_to_c, TempUnit, Venue};
use crate::wunderground::WuClient;

/// Authoritative daily high with the source that produced it.
#[derive(Debug, Clone)]
pub struct AuthoritativeHigh {
    pub high_f: f64,
    pub high_c: f64,
    pub source_tag: String,
    pub observation_count: i64,
}

impl AuthoritativeHigh {
    pub fn in_unit(&self, unit: TempUnit) -> f64 {
        match unit {
            TempUnit::F => self.high_f,
            TempUnit::C => self.high_c,
        }
    }

    fn from_f(high_f: f64, source_tag: &str, observation_count: i64) -> Self {
        AuthoritativeHigh {
            high_f,
            high_c: f_to_c(high_f),
            source_tag: source_tag.to_string(),
            observation_count,
        }
    }

    fn from_c(high_c: f64, source_tag: &str, observation_count: i64) -> Self {
        AuthoritativeHigh {
            high_f: c_to_f(high_c),
            high_c,
            source_tag: source_tag.to_string(),
            observation_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NwsProductList {
    #[serde(rename = "@graph", default)]
    graph: Vec<NwsProductRef>,
}

#[derive(Debug, Deserialize)]
struct NwsProductRef {
    #[serde(rename = "@id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct NwsProduct {
    #[serde(rename = "productText")]
    product_text: String,
}

#[derive(Debug, Deserialize)]
struct NwsObsCollection {
    #[serde(default)]
    features: Vec<NwsObsFeature>,
}

#[derive(Debug, Deserialize)]
struct NwsObsFeature {
    properties: NwsObsProps,
}

#[derive(Debug, Deserialize)]
struct NwsObsProps {
    temperature: NwsQuantity,
}

#[derive(Debug, Deserialize)]
struct NwsQuantity {
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    daily: Option<ArchiveDaily>,
}

#[derive(Debug, Deserialize)]
struct ArchiveDaily {
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
}

/// The per-venue resolution chain: structured venue prefers the NWS
/// daily climate report, the narrative venue prefers the crowd high.
/// Every fetched value is audited for later dispute review.
pub struct ResolutionChain {
    client: Client,
    nws_base: String,
    archive_base: String,
}

impl ResolutionChain {
    pub fn new(nws_base: &str, archive_base: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent("tempedge/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build resolution client")?;
        Ok(ResolutionChain {
            client,
            nws_base: nws_base.trim_end_matches('/').to_string(),
            archive_base: archive_base.trim_end_matches('/').to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, nws_base: String, archive_base: String) -> Self {
        ResolutionChain {
            client,
            nws_base,
            archive_base,
        }
    }

    /// Walk the venue's fallback chain until one source yields a high.
    pub async fn fetch(
        &self,
        db: &SharedDb,
        wu: &WuClient,
        city: &City,
        venue: Venue,
        target_date: NaiveDate,
    ) -> Result<Option<AuthoritativeHigh>> {
        let station = city.station_for(venue);

        if venue.resolves_against_wu() {
            // WU → METAR → NWS hourly → archive
            if wu.is_enabled() {
                match wu.fetch_daily_high(city, target_date).await {
                    Ok(Some(high)) => {
                        let result = AuthoritativeHigh {
                            high_f: high.high_f,
                            high_c: high.high_c,
                            source_tag: "wu".to_string(),
                            observation_count: high.observation_count,
                        };
                        self.audit(db, AuditTable::Wu, city, station, target_date, &result);
                        return Ok(Some(result));
                    }
                    Ok(None) => debug!("WU has no summary for {}/{}", city.key, target_date),
                    Err(e) => warn!("WU resolution fetch failed for {}: {}", city.key, e),
                }
            }
            if let Some(high) = self.metar_high(db, city, station, target_date)? {
                return Ok(Some(high));
            }
            if let Some(high) = self.nws_hourly_high(city, station, target_date).await {
                return Ok(Some(high));
            }
        } else {
            // CLI → station hourly → METAR → archive
            if let Some(high) = self.cli_high(station, target_date).await {
                self.audit(db, AuditTable::Cli, city, station, target_date, &high);
                return Ok(Some(high));
            }
            if let Some(high) = self.nws_hourly_high(city, station, target_date).await {
                return Ok(Some(high));
            }
            if let Some(high) = self.metar_high(db, city, station, target_date)? {
                return Ok(Some(high));
            }
        }

        Ok(self.archive_high(city, target_date).await)
    }

    fn audit(
        &self,
        db: &SharedDb,
        table: AuditTable,
        city: &City,
        station: &str,
        target_date: NaiveDate,
        high: &AuthoritativeHigh,
    ) {
        if let Err(e) = db.lock().unwrap().upsert_audit(
            table,
            city.key,
            station,
            target_date,
            Some(high.high_f),
            Some(high.high_c),
            &high.source_tag,
            Some(high.observation_count),
        ) {
            warn!("Audit upsert failed for {}/{}: {}", city.key, station, e);
        }
    }

    /// NWS daily climate report (CLI product). The report's MAXIMUM line
    /// carries the certified high in whole °F.
    async fn cli_high(&self, station: &str, target_date: NaiveDate) -> Option<AuthoritativeHigh> {
        let location = station.strip_prefix('K').unwrap_or(station);
        let list_url = format!(
            "{}/products/types/CLI/locations/{}",
            self.nws_base, location
        );

        let list: NwsProductList = match self.client.get(&list_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(list) => list,
                Err(e) => {
                    warn!("CLI product list unparseable for {}: {}", station, e);
                    return None;
                }
            },
            Ok(resp) => {
                debug!("CLI product list for {} returned {}", station, resp.status());
                return None;
            }
            Err(e) => {
                warn!("CLI product list fetch failed for {}: {}", station, e);
                return None;
            }
        };

        // Products are newest-first; the first whose text names the
        // target date is the day's report.
        let date_needle = target_date.format("%b %-d %Y").to_string().to_uppercase();
        let max_re = Regex::new(r"MAXIMUM\s+(-?\d+)").ok()?;
        for product in list.graph.iter().take(4) {
            let product: NwsProduct = match self.client.get(&product.id).send().await {
                Ok(resp) if resp.status().is_success() => resp.json().await.ok()?,
                _ => continue,
            };
            if !product.product_text.to_uppercase().contains(&date_needle) {
                continue;
            }
            if let Some(caps) = max_re.captures(&product.product_text) {
                let high_f: f64 = caps[1].parse().ok()?;
                return Some(AuthoritativeHigh::from_f(high_f, "cli", 1));
            }
        }
        None
    }

    /// Hourly station observations over the city-local day window.
    async fn nws_hourly_high(
        &self,
        city: &City,
        station: &str,
        target_date: NaiveDate,
    ) -> Option<AuthoritativeHigh> {
        let (start, end) = city.local_day_bounds_utc(target_date);
        let url = format!(
            "{}/stations/{}/observations?start={}&end={}",
            self.nws_base,
            station,
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ"),
        );

        let collection: NwsObsCollection = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok()?,
            _ => return None,
        };

        let temps: Vec<f64> = collection
            .features
            .iter()
            .filter_map(|f| f.properties.temperature.value)
            .collect();
        let max_c = temps.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if temps.is_empty() || !max_c.is_finite() {
            return None;
        }
        Some(AuthoritativeHigh::from_c(max_c, "nws_obs", temps.len() as i64))
    }

    /// The bot's own stored running high.
    fn metar_high(
        &self,
        db: &SharedDb,
        city: &City,
        station: &str,
        target_date: NaiveDate,
    ) -> Result<Option<AuthoritativeHigh>> {
        Ok(db
            .lock()
            .unwrap()
            .get_running_high(city.key, target_date, station)?
            .map(|h| AuthoritativeHigh {
                high_f: h.high_f,
                high_c: h.high_c,
                source_tag: "metar".to_string(),
                observation_count: h.observation_count,
            }))
    }

    /// Historical-archive fallback, last resort for stale dates.
    async fn archive_high(&self, city: &City, target_date: NaiveDate) -> Option<AuthoritativeHigh> {
        let url = format!(
            "{}/archive?latitude={:.4}&longitude={:.4}&start_date={}&end_date={}&daily=temperature_2m_max",
            self.archive_base, city.lat, city.lon, target_date, target_date
        );

        let resp: ArchiveResponse = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok()?,
            _ => return None,
        };
        let max_c = resp.daily?.temperature_2m_max.first().copied().flatten()?;
        Some(AuthoritativeHigh::from_c(max_c, "archive", 1))
    }
}
