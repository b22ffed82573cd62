use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cities::City;
use crate::config::Config;
use crate::db::{Database, SharedDb};
use crate::range::{convert_temp, RangeSpec, Side, TempUnit, Venue};

/// Confidence label derived from inter-source spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    VeryHigh,
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::VeryHigh => "very-high",
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    /// Label from the maximum pairwise source disagreement, in °F.
    pub fn from_spread_f(spread_f: f64) -> Self {
        if spread_f <= 1.0 {
            Confidence::VeryHigh
        } else if spread_f <= 2.0 {
            Confidence::High
        } else if spread_f <= 4.0 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// Fallback standard deviation, used until enough empirical residuals
    /// accumulate. Values are in °C; scaled for °F cities.
    pub fn fallback_std_dev(&self, unit: TempUnit) -> f64 {
        let std_c = match self {
            Confidence::VeryHigh => 1.39,
            Confidence::High => 1.67,
            Confidence::Medium => 2.22,
            Confidence::Low => 2.78,
        };
        match unit {
            TempUnit::C => std_c,
            TempUnit::F => std_c * 1.8,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fused forecast for one (city, target_date).
#[derive(Debug, Clone)]
pub struct Forecast {
    pub city: String,
    pub target_date: NaiveDate,
    pub temp: f64,
    pub std_dev: f64,
    pub confidence: Confidence,
    pub sources: BTreeMap<String, f64>,
    pub hours_to_resolution: f64,
    pub unit: TempUnit,
}

/// YES probability for a range under N(temp, std_dev).
///
/// Null bounds integrate to ±∞. On the structured venue, whose ranges
/// enumerate whole degrees, integer-aligned bounds get a continuity
/// correction of half a degree outward.
pub fn probability_for_range(forecast: &Forecast, range: &RangeSpec) -> f64 {
    let dist = match Normal::new(forecast.temp, forecast.std_dev.max(1e-6)) {
        Ok(d) => d,
        Err(_) => return 0.0,
    };

    let mut lo = range
        .range_min
        .map(|v| convert_temp(v, range.range_unit, forecast.unit));
    let mut hi = range
        .range_max
        .map(|v| convert_temp(v, range.range_unit, forecast.unit));

    if range.venue == Venue::Kalshi {
        if let (Some(l), Some(h)) = (lo, hi) {
            if l.fract() == 0.0 && h.fract() == 0.0 {
                lo = Some(l - 0.5);
                hi = Some(h + 0.5);
            }
        }
    }

    let upper = hi.map(|h| dist.cdf(h)).unwrap_or(1.0);
    let lower = lo.map(|l| dist.cdf(l)).unwrap_or(0.0);
    (upper - lower).clamp(0.0, 1.0)
}

/// Probability for one side of the outcome. NO is the exact complement.
pub fn probability_for_side(p_yes: f64, side: Side) -> f64 {
    match side {
        Side::Yes => p_yes,
        Side::No => 1.0 - p_yes,
    }
}

#[derive(Debug, Clone)]
struct SourceReading {
    source: &'static str,
    temp: f64,
}

// ── Forecast sources ──

/// NWS point forecast (api.weather.gov). Two-step: points → forecast,
/// then the daytime period matching the target date.
pub struct NwsSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NwsPoints {
    properties: NwsPointsProps,
}

#[derive(Debug, Deserialize)]
struct NwsPointsProps {
    forecast: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NwsForecast {
    properties: NwsForecastProps,
}

#[derive(Debug, Deserialize)]
struct NwsForecastProps {
    periods: Vec<NwsPeriod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NwsPeriod {
    temperature: f64,
    temperature_unit: String,
    is_daytime: bool,
    start_time: String,
}

impl NwsSource {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("tempedge/0.1")
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build NWS client")?;
        Ok(NwsSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_high(&self, city: &City, target_date: NaiveDate) -> Result<Option<f64>> {
        let points_url = format!("{}/points/{:.4},{:.4}", self.base_url, city.lat, city.lon);
        let points: NwsPoints = self
            .client
            .get(&points_url)
            .send()
            .await
            .context("NWS points request failed")?
            .json()
            .await
            .context("Failed to parse NWS points response")?;

        let forecast_url = match points.properties.forecast {
            Some(url) => url,
            None => return Ok(None),
        };

        let forecast: NwsForecast = self
            .client
            .get(&forecast_url)
            .send()
            .await
            .context("NWS forecast request failed")?
            .json()
            .await
            .context("Failed to parse NWS forecast response")?;

        let date_str = target_date.to_string();
        for period in &forecast.properties.periods {
            if !period.is_daytime || !period.start_time.starts_with(&date_str) {
                continue;
            }
            let unit = if period.temperature_unit == "C" {
                TempUnit::C
            } else {
                TempUnit::F
            };
            return Ok(Some(convert_temp(period.temperature, unit, city.unit)));
        }
        Ok(None)
    }
}

/// Open-Meteo daily-max forecast, one call per (city, date).
pub struct OpenMeteoSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    daily: Option<OpenMeteoDaily>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoDaily {
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_max: Vec<f64>,
}

impl OpenMeteoSource {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("tempedge/0.1")
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Open-Meteo client")?;
        Ok(OpenMeteoSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_high(&self, city: &City, target_date: NaiveDate) -> Result<Option<f64>> {
        let unit_param = match city.unit {
            TempUnit::F => "&temperature_unit=fahrenheit",
            TempUnit::C => "",
        };
        let url = format!(
            "{}/forecast?latitude={:.4}&longitude={:.4}&daily=temperature_2m_max&forecast_days=7&timezone=auto{}",
            self.base_url, city.lat, city.lon, unit_param
        );

        let resp: OpenMeteoResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("Open-Meteo request failed")?
            .json()
            .await
            .context("Failed to parse Open-Meteo response")?;

        let daily = match resp.daily {
            Some(d) => d,
            None => return Ok(None),
        };
        let date_str = target_date.to_string();
        Ok(daily
            .time
            .iter()
            .position(|t| *t == date_str)
            .and_then(|i| daily.temperature_2m_max.get(i).copied()))
    }
}

/// One configured forecast source.
pub enum ForecastSource {
    Nws(NwsSource),
    OpenMeteo(OpenMeteoSource),
}

impl ForecastSource {
    pub fn name(&self) -> &'static str {
        match self {
            ForecastSource::Nws(_) => "nws",
            ForecastSource::OpenMeteo(_) => "open_meteo",
        }
    }

    async fn fetch_high(&self, city: &City, target_date: NaiveDate) -> Result<Option<f64>> {
        match self {
            ForecastSource::Nws(s) => s.fetch_high(city, target_date).await,
            ForecastSource::OpenMeteo(s) => s.fetch_high(city, target_date).await,
        }
    }
}

struct CachedForecast {
    forecast: Forecast,
    fetched_at: Instant,
}

/// Fuses the source ensemble into per-(city, date) forecasts, applying
/// per-source bias and per-city residual std-dev learned from the
/// forecast_accuracy table.
pub struct ForecastEngine {
    sources: Vec<ForecastSource>,
    cache: Mutex<BTreeMap<(String, NaiveDate), CachedForecast>>,
    cache_ttl: std::time::Duration,
    calibration_window_days: i64,
    min_city_stddev_samples: u32,
    source_demotion_mae_f: f64,
    source_demotion_min_samples: u32,
    ensemble_spread_enabled: bool,
    ensemble_spread_floor: f64,
    ensemble_spread_ceiling: f64,
}

impl ForecastEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let sources = vec![
            ForecastSource::Nws(NwsSource::new(
                &config.nws_api_url,
                config.weather_request_timeout_secs,
            )?),
            ForecastSource::OpenMeteo(OpenMeteoSource::new(
                &config.open_meteo_api_url,
                config.weather_request_timeout_secs,
            )?),
        ];
        Ok(Self::with_sources(config, sources))
    }

    pub fn with_sources(config: &Config, sources: Vec<ForecastSource>) -> Self {
        ForecastEngine {
            sources,
            cache: Mutex::new(BTreeMap::new()),
            cache_ttl: std::time::Duration::from_secs(config.forecast_cache_minutes * 60),
            calibration_window_days: config.calibration_window_days as i64,
            min_city_stddev_samples: config.min_city_stddev_samples,
            source_demotion_mae_f: config.source_demotion_mae_f,
            source_demotion_min_samples: config.source_demotion_min_samples,
            ensemble_spread_enabled: config.ensemble_spread_enabled,
            ensemble_spread_floor: config.ensemble_spread_floor,
            ensemble_spread_ceiling: config.ensemble_spread_ceiling,
        }
    }

    /// Fetch (or serve from cache) the fused forecast. Returns None when
    /// no source has data for the date — the caller treats that tick as
    /// "no opportunity".
    pub async fn get(
        &self,
        db: &SharedDb,
        city: &'static City,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<Forecast>> {
        let key = (city.key.to_string(), target_date);
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&key) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(Some(cached.forecast.clone()));
                }
            }
        }

        let mut readings: Vec<SourceReading> = Vec::new();
        for source in &self.sources {
            match source.fetch_high(city, target_date).await {
                Ok(Some(temp)) => readings.push(SourceReading {
                    source: source.name(),
                    temp,
                }),
                Ok(None) => {
                    debug!("{}: no {} data for {}", source.name(), city.key, target_date)
                }
                Err(e) => warn!("{} fetch failed for {}: {}", source.name(), city.key, e),
            }
        }

        if readings.is_empty() {
            return Ok(None);
        }

        let forecast = {
            let db = db.lock().unwrap();
            self.fuse(&db, city, target_date, &readings, now)?
        };
        self.cache.lock().unwrap().insert(
            key,
            CachedForecast {
                forecast: forecast.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(Some(forecast))
    }

    fn fuse(
        &self,
        db: &Database,
        city: &City,
        target_date: NaiveDate,
        readings: &[SourceReading],
        now: DateTime<Utc>,
    ) -> Result<Forecast> {
        let since = now.date_naive() - Duration::days(self.calibration_window_days);

        // Demote sources whose rolling error has run away, unless that
        // would empty the ensemble.
        let mut kept: Vec<&SourceReading> = Vec::with_capacity(readings.len());
        for r in readings {
            let demoted = match db.source_mae(r.source, since)? {
                Some(stats) => {
                    stats.n >= self.source_demotion_min_samples
                        && stats.mae > self.source_demotion_mae_f
                }
                None => false,
            };
            if demoted {
                warn!(
                    "Demoting forecast source {} for {}: rolling MAE over {:.1}",
                    r.source, city.key, self.source_demotion_mae_f,
                );
            } else {
                kept.push(r);
            }
        }
        if kept.is_empty() {
            kept = readings.iter().collect();
        }

        // Bias-correct each kept source, then average.
        let mut corrected = Vec::with_capacity(kept.len());
        let mut sources = BTreeMap::new();
        for r in &kept {
            let bias = db.source_bias(r.source, since)?.unwrap_or(0.0);
            corrected.push(r.temp - bias);
            sources.insert(r.source.to_string(), r.temp);
        }
        let temp = corrected.iter().sum::<f64>() / corrected.len() as f64;

        // Confidence from the widest pairwise disagreement, measured in °F.
        let mut spread: f64 = 0.0;
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                spread = spread.max((a.temp - b.temp).abs());
            }
        }
        let spread_f = match city.unit {
            TempUnit::F => spread,
            TempUnit::C => spread * 1.8,
        };
        let confidence = Confidence::from_spread_f(spread_f);

        let mut std_dev = match db.city_residual_std(city.key, since)? {
            Some((std, n)) if n >= self.min_city_stddev_samples && std > 0.0 => std,
            _ => confidence.fallback_std_dev(city.unit),
        };
        // Optional spread widening: disagreement across sources inflates
        // the distribution inside a configured band.
        if self.ensemble_spread_enabled {
            let multiplier =
                (spread_f / 2.0).clamp(self.ensemble_spread_floor, self.ensemble_spread_ceiling);
            std_dev *= multiplier;
        }

        let (_, resolution) = city.local_day_bounds_utc(target_date);
        let hours_to_resolution = (resolution - now).num_minutes() as f64 / 60.0;

        Ok(Forecast {
            city: city.key.to_string(),
            target_date,
            temp,
            std_dev,
            confidence,
            sources,
            hours_to_resolution,
            unit: city.unit,
        })
    }
}
