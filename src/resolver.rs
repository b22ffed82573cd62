use anyhow::Result;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::authoritative::{AuthoritativeHigh, ResolutionChain};
use crate::calibration;
use crate::cities::{find_city, CITIES};
use crate::config::Config;
use crate::db::{SharedDb, TradeRow};
use crate::executor::Executor;
use crate::notifier::Notifier;
use crate::range::{Side, Venue};
use crate::venue::VenueAdapter;
use crate::wunderground::WuClient;

const BACKFILL_BATCH: i64 = 200;

#[derive(Debug, Default)]
pub struct ResolveStats {
    pub resolved: usize,
    pub wins: usize,
    pub backfilled: usize,
    pub accuracy_rows: usize,
}

/// Settles past-due trades against authoritative observations, backfills
/// opportunity outcomes, and feeds the calibration tables.
pub struct Resolver {
    chain: ResolutionChain,
    wu: WuClient,
}

impl Resolver {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Resolver {
            chain: ResolutionChain::new(
                &config.nws_api_url,
                &config.open_meteo_api_url,
                config.weather_request_timeout_secs,
            )?,
            wu: WuClient::new(
                &config.wu_api_url,
                config.weather_request_timeout_secs,
                Some(config.wu_slow_min_spacing_ms),
            )?,
        })
    }

    #[cfg(test)]
    pub fn with_clients(chain: ResolutionChain, wu: WuClient) -> Self {
        Resolver { chain, wu }
    }

    pub async fn tick(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        executor: &Executor,
        notifier: &Notifier,
    ) -> Result<ResolveStats> {
        let now = Utc::now();
        let mut stats = ResolveStats::default();

        // Earliest "today" across all configured timezones: anything
        // before this is past-due everywhere it could matter.
        let earliest_today = CITIES
            .iter()
            .map(|c| c.local_date(now))
            .min()
            .unwrap_or_else(|| now.date_naive());

        let open = db.lock().unwrap().get_open_trades()?;
        let past_due: Vec<TradeRow> = open
            .into_iter()
            .filter(|t| {
                find_city(&t.city)
                    .map(|c| t.target_date < c.local_date(now))
                    .unwrap_or(false)
            })
            .collect();

        // One authoritative fetch per (city, date, venue) per cycle.
        let mut cache: HashMap<(String, NaiveDate, Venue), Option<AuthoritativeHigh>> =
            HashMap::new();

        for trade in &past_due {
            let high = match self
                .actual_for(db, &mut cache, &trade.city, trade.target_date, trade.venue)
                .await?
            {
                Some(high) => high,
                None => {
                    warn!(
                        "No authoritative high yet for {}/{}/{} — retrying next tick",
                        trade.city, trade.target_date, trade.venue,
                    );
                    continue;
                }
            };

            let actual = high.in_unit(trade.range_unit);
            let yes_won = trade.range_min.map_or(true, |lo| actual >= lo)
                && trade.range_max.map_or(true, |hi| actual <= hi);
            let won = match trade.side {
                Side::Yes => yes_won,
                Side::No => !yes_won,
            };
            let shares = trade.shares as f64;
            let fees = shares * adapter.fee_per_contract(trade.venue, trade.entry_ask);
            let pnl = if won { shares } else { 0.0 } - trade.cost - fees;

            {
                let db = db.lock().unwrap();
                if let Err(e) = db.resolve_trade(
                    trade.id,
                    actual,
                    won,
                    pnl,
                    fees,
                    &high.source_tag,
                    None,
                ) {
                    // Fatal for this trade only.
                    warn!("Resolution write failed for trade {}: {}", trade.id, e);
                    continue;
                }
            }
            executor.release(trade);
            stats.resolved += 1;
            if won {
                stats.wins += 1;
            }

            notifier.queue(
                "resolutions",
                format!(
                    "{} {} {} {} → {} (actual {:.1}, pnl ${:.2})",
                    trade.city,
                    trade.target_date,
                    trade.side,
                    trade.range_name,
                    if won { "WON" } else { "LOST" },
                    actual,
                    pnl,
                ),
            );

            stats.accuracy_rows += self.record_forecast_accuracy(db, trade, actual)?;
        }

        stats.backfilled = self
            .backfill_opportunities(db, &mut cache, earliest_today)
            .await?;

        // Calibration refresh once per cycle.
        {
            let db = db.lock().unwrap();
            calibration::recompute(&db)?;
        }

        if stats.resolved > 0 || stats.backfilled > 0 {
            info!(
                "Resolver: {} resolved ({} wins), {} opportunities backfilled, {} accuracy rows",
                stats.resolved, stats.wins, stats.backfilled, stats.accuracy_rows,
            );
        }
        Ok(stats)
    }

    /// Authoritative high for a group, from the cycle cache, an earlier
    /// resolution, or the venue's fetch chain — in that order.
    async fn actual_for(
        &self,
        db: &SharedDb,
        cache: &mut HashMap<(String, NaiveDate, Venue), Option<AuthoritativeHigh>>,
        city_key: &str,
        target_date: NaiveDate,
        venue: Venue,
    ) -> Result<Option<AuthoritativeHigh>> {
        let key = (city_key.to_string(), target_date, venue);
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }

        let Some(city) = find_city(city_key) else {
            return Ok(None);
        };

        // Prior resolution wins over a fresh fetch to avoid drift.
        let prior = db
            .lock()
            .unwrap()
            .get_resolved_actual_temp(city_key, target_date, venue)?;
        let high = if let Some((actual, station)) = prior {
            let (high_f, high_c) = match city.unit {
                crate::range::TempUnit::F => (actual, crate::range::f_to_c(actual)),
                crate::range::TempUnit::C => (crate::range::c_to_f(actual), actual),
            };
            Some(AuthoritativeHigh {
                high_f,
                high_c,
                source_tag: if station.is_empty() {
                    "prior_resolution".to_string()
                } else {
                    station
                },
                observation_count: 0,
            })
        } else {
            self.chain
                .fetch(db, &self.wu, city, venue, target_date)
                .await?
        };

        cache.insert(key, high.clone());
        Ok(high)
    }

    /// One forecast_accuracy row per ensemble source on the trade.
    fn record_forecast_accuracy(
        &self,
        db: &SharedDb,
        trade: &TradeRow,
        actual: f64,
    ) -> Result<usize> {
        let Some(ensemble_json) = &trade.entry_ensemble else {
            return Ok(0);
        };
        let sources: HashMap<String, f64> = match serde_json::from_str(ensemble_json) {
            Ok(map) => map,
            Err(e) => {
                warn!("Unparseable ensemble on trade {}: {}", trade.id, e);
                return Ok(0);
            }
        };

        let db = db.lock().unwrap();
        let mut rows = 0;
        for (source, forecast_temp) in sources {
            db.insert_forecast_accuracy(
                &trade.city,
                trade.target_date,
                &source,
                forecast_temp,
                actual,
                trade.range_unit,
                trade.hours_to_resolution,
            )?;
            rows += 1;
        }
        Ok(rows)
    }

    /// Backfill would-have-won outcomes onto stale opportunity rows.
    async fn backfill_opportunities(
        &self,
        db: &SharedDb,
        cache: &mut HashMap<(String, NaiveDate, Venue), Option<AuthoritativeHigh>>,
        cutoff: NaiveDate,
    ) -> Result<usize> {
        let pending = db
            .lock()
            .unwrap()
            .get_unresolved_opportunities(cutoff, BACKFILL_BATCH)?;

        let mut backfilled = 0;
        for opp in pending {
            let Some(high) = self
                .actual_for(db, cache, &opp.city, opp.target_date, opp.venue)
                .await?
            else {
                continue;
            };

            let unit = find_city(&opp.city)
                .map(|c| c.unit)
                .unwrap_or(crate::range::TempUnit::F);
            let actual = high.in_unit(unit);
            let yes_won = opp.range_min.map_or(true, |lo| actual >= lo)
                && opp.range_max.map_or(true, |hi| actual <= hi);
            let would_have_won = match opp.side {
                Side::Yes => yes_won,
                Side::No => !yes_won,
            };

            db.lock()
                .unwrap()
                .set_opportunity_outcome(opp.id, actual, would_have_won)?;
            backfilled += 1;
        }
        Ok(backfilled)
    }
}
