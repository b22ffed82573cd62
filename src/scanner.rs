use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use futures::{stream, FutureExt, StreamExt};
use tracing::{debug, info};

use crate::cities::{City, CITIES};
use crate::config::Config;
use crate::db::{NewOpportunity, SharedDb};
use crate::executor::{EntryCandidate, ExecutionOutcome, Executor};
use crate::forecast::{probability_for_range, probability_for_side, Forecast, ForecastEngine};
use crate::range::{RangeSpec, RangeType, Side, TempUnit};
use crate::venue::VenueAdapter;

const CITY_POLL_CONCURRENCY: usize = 4;

#[derive(Debug, Default)]
pub struct ScanStats {
    pub cities_polled: usize,
    pub outcomes_seen: usize,
    pub opportunities_recorded: usize,
    pub entries: usize,
}

/// One scored candidate that passed the entry filters, pending executor
/// sizing.
struct ApprovedCandidate {
    opportunity_id: i64,
    candidate: EntryCandidate,
    edge: f64,
}

/// Top of the entry pipeline: enumerate outcomes, score both sides
/// against the forecast, filter, persist every candidate, forward the
/// approved ones.
pub struct MarketScanner {
    config: Config,
}

impl MarketScanner {
    pub fn new(config: &Config) -> Self {
        MarketScanner {
            config: config.clone(),
        }
    }

    pub async fn tick(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        forecasts: &ForecastEngine,
        executor: &Executor,
    ) -> Result<ScanStats> {
        let now = Utc::now();
        adapter.clear_cycle_cache();

        // Every enabled city × date in the scan window, city-local.
        let mut pairs: Vec<(&'static City, NaiveDate)> = Vec::new();
        for city in CITIES {
            let today = city.local_date(now);
            for offset in 0..self.config.scan_days_ahead {
                pairs.push((city, today + Duration::days(offset as i64)));
            }
        }

        // Poll venues in parallel with bounded concurrency; evaluation
        // below stays serial per city.
        let futs: Vec<_> = pairs
            .into_iter()
            .map(|pair| {
                async move {
                    let (city, date) = pair;
                    let today = city.local_date(now);
                    (city, date, adapter.list_outcomes(city, date, today).await)
                }
                .boxed()
            })
            .collect();
        let polled: Vec<(&'static City, NaiveDate, Vec<RangeSpec>)> = stream::iter(futs)
            .buffer_unordered(CITY_POLL_CONCURRENCY)
            .collect()
            .await;

        let mut stats = ScanStats {
            cities_polled: CITIES.len(),
            ..Default::default()
        };
        let mut approved: Vec<ApprovedCandidate> = Vec::new();

        for (city, date, outcomes) in &polled {
            let (city, date) = (*city, *date);
            if outcomes.is_empty() {
                continue;
            }
            stats.outcomes_seen += outcomes.len();

            let forecast = match forecasts.get(db, city, date, now).await? {
                Some(f) => f,
                None => {
                    debug!("No forecast for {}/{} — skipping", city.key, date);
                    continue;
                }
            };

            let eligibility = self.city_eligibility(db, city)?;

            for spec in outcomes {
                let p_yes = probability_for_range(&forecast, spec);
                for side in [Side::Yes, Side::No] {
                    let probability = probability_for_side(p_yes, side);
                    let ask = spec.ask_for_side(side);
                    let edge = probability - ask;

                    let reject = self.entry_filter(spec, side, probability, &forecast, &eligibility);

                    let opportunity_id = {
                        let db = db.lock().unwrap();
                        db.insert_opportunity(&NewOpportunity {
                            city: city.key.to_string(),
                            target_date: date,
                            venue: spec.venue,
                            range_name: spec.range_name.clone(),
                            side,
                            range_type: spec.range_type(),
                            range_min: spec.range_min,
                            range_max: spec.range_max,
                            range_unit: spec.range_unit,
                            bid: spec.bid_for_side(side),
                            ask,
                            spread: spec.spread,
                            volume: spec.volume,
                            probability,
                            edge,
                            forecast_temp: forecast.temp,
                            forecast_std_dev: forecast.std_dev,
                            forecast_confidence: forecast.confidence.to_string(),
                            forecast_sources: serde_json::to_string(&forecast.sources)
                                .unwrap_or_else(|_| "{}".to_string()),
                            hours_to_resolution: forecast.hours_to_resolution,
                            accepted: reject.is_none(),
                            reject_reason: reject.clone(),
                        })?
                    };
                    stats.opportunities_recorded += 1;

                    if reject.is_none() {
                        approved.push(ApprovedCandidate {
                            opportunity_id,
                            candidate: EntryCandidate::model(
                                spec.clone(),
                                side,
                                probability,
                                forecast.clone(),
                                self.config.max_bankroll_pct,
                            ),
                            edge,
                        });
                    }
                }
            }
        }

        // Best edges first; per-outcome dedup is the executor's job.
        approved.sort_by(|a, b| b.edge.partial_cmp(&a.edge).unwrap_or(std::cmp::Ordering::Equal));

        for item in approved {
            let outcome = {
                let db_guard = db.lock().unwrap();
                executor.execute(&db_guard, adapter, &item.candidate)?
            };
            let db_guard = db.lock().unwrap();
            match outcome {
                ExecutionOutcome::Entered(entered) => {
                    db_guard.link_opportunity_trade(item.opportunity_id, entered.trade_id)?;
                    stats.entries += 1;
                }
                ExecutionOutcome::Rejected(reason) => {
                    db_guard.conn.execute(
                        "UPDATE opportunities SET accepted = 0, reject_reason = ?1 WHERE id = ?2",
                        rusqlite::params![reason, item.opportunity_id],
                    )?;
                }
            }
        }

        info!(
            "Scan: {} cities, {} outcomes, {} opportunities recorded, {} entries",
            stats.cities_polled, stats.outcomes_seen, stats.opportunities_recorded, stats.entries,
        );
        Ok(stats)
    }

    /// Per-(city, range_type) MAE gate state, computed once per city.
    fn city_eligibility(&self, db: &SharedDb, city: &City) -> Result<CityEligibility> {
        let since =
            Utc::now().date_naive() - Duration::days(self.config.calibration_window_days as i64);
        let stats = db.lock().unwrap().city_mae(city.key, since)?;
        Ok(CityEligibility {
            stats,
            min_samples: self.config.eligibility_min_samples,
            cap_bounded: match city.unit {
                TempUnit::F => self.config.mae_cap_bounded_f,
                TempUnit::C => self.config.mae_cap_bounded_c,
            },
            cap_unbounded: match city.unit {
                TempUnit::F => self.config.mae_cap_unbounded_f,
                TempUnit::C => self.config.mae_cap_unbounded_c,
            },
        })
    }

    /// Entry filters in spec order. Returns the first reject reason.
    fn entry_filter(
        &self,
        spec: &RangeSpec,
        side: Side,
        probability: f64,
        forecast: &Forecast,
        eligibility: &CityEligibility,
    ) -> Option<String> {
        let ask = spec.ask_for_side(side);

        // Strict: edge of exactly MIN_EDGE_PCT rejects
        if probability <= ask + self.config.min_edge() {
            return Some(format!(
                "insufficient_edge: p={:.3} ask={:.2}",
                probability, ask
            ));
        }

        if spec.spread > self.config.max_spread {
            return Some(format!("spread_too_wide: {:.2}", spec.spread));
        }
        if ask > 0.0 && spec.spread / ask > self.config.max_spread_pct {
            return Some(format!(
                "spread_ratio: {:.2} of ask",
                spec.spread / ask
            ));
        }

        let floor = match side {
            Side::Yes => self.config.min_ask_price,
            Side::No => self.config.min_no_ask_price,
        };
        if ask < floor {
            return Some(format!("ask_below_floor: {:.2} < {:.2}", ask, floor));
        }

        if forecast.hours_to_resolution < self.config.min_hours_to_resolution {
            return Some(format!(
                "too_close_to_resolution: {:.1}h",
                forecast.hours_to_resolution
            ));
        }

        // Model-overconfidence guardrail
        if probability > self.config.max_model_market_ratio * ask {
            return Some(format!(
                "model_market_ratio: p={:.3} > {:.1}x ask",
                probability, self.config.max_model_market_ratio
            ));
        }

        if let Some(reason) = eligibility.reject(spec.range_type()) {
            return Some(reason);
        }

        None
    }
}

struct CityEligibility {
    stats: Option<crate::db::ForecastErrorStats>,
    min_samples: u32,
    cap_bounded: f64,
    cap_unbounded: f64,
}

impl CityEligibility {
    /// Allow-all until enough samples exist; then the MAE must be under
    /// the per-range-type cap.
    fn reject(&self, range_type: RangeType) -> Option<String> {
        let stats = self.stats.as_ref()?;
        if stats.n < self.min_samples {
            return None;
        }
        let cap = match range_type {
            RangeType::Bounded => self.cap_bounded,
            RangeType::Unbounded => self.cap_unbounded,
        };
        if stats.mae > cap {
            Some(format!(
                "city_ineligible: mae {:.2} > cap {:.2} ({} samples)",
                stats.mae, cap, stats.n
            ))
        } else {
            None
        }
    }
}
