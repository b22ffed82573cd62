pub mod kalshi;
pub mod polymarket;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::cities::City;
use crate::config::Config;
use crate::range::{RangeSpec, Venue};
use kalshi::KalshiClient;
use polymarket::PolymarketClient;

#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct OrderbookDepth {
    pub ask_depth: Vec<(f64, f64)>,
}

/// Paper execution at the quoted ask. The entry-price source of truth
/// in every trading mode.
#[derive(Debug, Clone)]
pub struct SimulatedFill {
    pub price: f64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

struct CachedOutcomes {
    outcomes: Vec<RangeSpec>,
    fetched_at: Instant,
}

/// Uniform facade over the two venues. Hides per-venue wire formats,
/// self-throttles, and caches the outcome set for the length of a scan
/// cycle.
pub struct VenueAdapter {
    polymarket: Option<PolymarketClient>,
    kalshi: Option<KalshiClient>,
    kalshi_fee_multiplier: f64,
    throttle_interval: Duration,
    cache_ttl: Duration,
    last_call: tokio::sync::Mutex<HashMap<Venue, Instant>>,
    cache: std::sync::Mutex<HashMap<(Venue, String, NaiveDate), CachedOutcomes>>,
}

impl VenueAdapter {
    pub fn new(config: &Config) -> Result<Self> {
        let polymarket = if config.polymarket_enabled {
            Some(PolymarketClient::new(
                &config.polymarket_api_url,
                config.venue_request_timeout_secs,
            )?)
        } else {
            None
        };
        let kalshi = if config.kalshi_enabled {
            Some(KalshiClient::new(
                &config.kalshi_api_url,
                config.venue_request_timeout_secs,
            )?)
        } else {
            None
        };
        Ok(VenueAdapter {
            polymarket,
            kalshi,
            kalshi_fee_multiplier: config.kalshi_fee_multiplier,
            throttle_interval: Duration::from_millis(config.venue_throttle_ms),
            cache_ttl: Duration::from_secs(config.scan_interval_minutes * 60),
            last_call: tokio::sync::Mutex::new(HashMap::new()),
            cache: std::sync::Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub fn with_clients(
        polymarket: Option<PolymarketClient>,
        kalshi: Option<KalshiClient>,
        kalshi_fee_multiplier: f64,
    ) -> Self {
        VenueAdapter {
            polymarket,
            kalshi,
            kalshi_fee_multiplier,
            throttle_interval: Duration::ZERO,
            cache_ttl: Duration::from_secs(300),
            last_call: tokio::sync::Mutex::new(HashMap::new()),
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Keep at least the configured interval between calls to one venue.
    async fn throttle(&self, venue: Venue) {
        if self.throttle_interval.is_zero() {
            return;
        }
        let wait = {
            let mut last = self.last_call.lock().await;
            let wait = last
                .get(&venue)
                .map(|t| self.throttle_interval.saturating_sub(t.elapsed()))
                .unwrap_or(Duration::ZERO);
            last.insert(venue, Instant::now() + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// All outcomes for (city, date) across enabled venues. Fails soft:
    /// a venue error logs and contributes nothing.
    pub async fn list_outcomes(
        &self,
        city: &'static City,
        target_date: NaiveDate,
        today: NaiveDate,
    ) -> Vec<RangeSpec> {
        let mut all = Vec::new();
        for venue in [Venue::Polymarket, Venue::Kalshi] {
            all.extend(self.venue_outcomes(venue, city, target_date, today).await);
        }
        all
    }

    /// One venue's outcomes, served from the per-cycle cache when fresh.
    pub async fn venue_outcomes(
        &self,
        venue: Venue,
        city: &'static City,
        target_date: NaiveDate,
        today: NaiveDate,
    ) -> Vec<RangeSpec> {
        let key = (venue, city.key.to_string(), target_date);
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&key) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return cached.outcomes.clone();
                }
            }
        }

        self.throttle(venue).await;
        let result = match venue {
            Venue::Polymarket => match &self.polymarket {
                Some(client) => client.list_outcomes(city, target_date, today).await,
                None => Ok(Vec::new()),
            },
            Venue::Kalshi => match &self.kalshi {
                Some(client) => client.list_outcomes(city, target_date).await,
                None => Ok(Vec::new()),
            },
        };

        match result {
            Ok(outcomes) => {
                self.cache.lock().unwrap().insert(
                    key,
                    CachedOutcomes {
                        outcomes: outcomes.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                outcomes
            }
            Err(e) => {
                warn!(
                    "{} outcome listing failed for {}/{}: {}",
                    venue, city.key, target_date, e
                );
                Vec::new()
            }
        }
    }

    pub async fn get_price(&self, venue: Venue, market_id: &str) -> Result<PriceQuote> {
        self.throttle(venue).await;
        match venue {
            Venue::Polymarket => match &self.polymarket {
                Some(client) => client.get_price(market_id).await,
                None => anyhow::bail!("Polymarket disabled"),
            },
            Venue::Kalshi => match &self.kalshi {
                Some(client) => client.get_price(market_id).await,
                None => anyhow::bail!("Kalshi disabled"),
            },
        }
    }

    pub async fn get_orderbook(&self, venue: Venue, token_id: &str) -> Result<OrderbookDepth> {
        self.throttle(venue).await;
        match venue {
            Venue::Polymarket => match &self.polymarket {
                Some(client) => client.get_orderbook(token_id).await,
                None => anyhow::bail!("Polymarket disabled"),
            },
            Venue::Kalshi => match &self.kalshi {
                Some(client) => client.get_orderbook(token_id).await,
                None => anyhow::bail!("Kalshi disabled"),
            },
        }
    }

    /// Per-contract fee at a given price. The narrative venue charges
    /// nothing; the structured venue's fee is quadratic in price.
    pub fn fee_per_contract(&self, venue: Venue, price: f64) -> f64 {
        match venue {
            Venue::Polymarket => 0.0,
            Venue::Kalshi => self.kalshi_fee_multiplier * price * (1.0 - price),
        }
    }

    /// Execution at the quoted ask.
    pub fn simulate_buy(&self, spec: &RangeSpec, shares: i64) -> SimulatedFill {
        SimulatedFill {
            price: spec.ask,
            cost: shares as f64 * spec.ask,
            timestamp: Utc::now(),
        }
    }

    /// The other venue's outcome matching this range, if one is in the
    /// current cycle's cache. Used for cross-venue orderbook snapshots.
    pub fn cached_matching_outcome(&self, spec: &RangeSpec) -> Option<RangeSpec> {
        let other = match spec.venue {
            Venue::Polymarket => Venue::Kalshi,
            Venue::Kalshi => Venue::Polymarket,
        };
        let cache = self.cache.lock().unwrap();
        let cached = cache.get(&(other, spec.city.clone(), spec.target_date))?;
        cached
            .outcomes
            .iter()
            .find(|o| spec.matches_range(o))
            .cloned()
    }

    /// Drop all per-cycle cached outcomes. Called at the top of each
    /// scan cycle.
    pub fn clear_cycle_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}
