use anyhow::Result;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::cities::City;
use crate::config::Config;
use crate::db::SharedDb;
use crate::executor::{EntryCandidate, ExecutionOutcome, Executor};
use crate::notifier::Notifier;
use crate::range::{RangeSpec, Side, TempUnit, Venue};
use crate::venue::VenueAdapter;

/// Latest observed highs for one station, in the city's unit.
#[derive(Debug, Clone, Copy)]
pub struct StationHighs {
    pub metar: f64,
    pub wu: Option<f64>,
}

#[derive(Debug, Default)]
pub struct GwStats {
    pub candidates: usize,
    pub entered: usize,
    pub missed: usize,
}

/// A settled outcome and the side that provably wins.
#[derive(Debug)]
struct SettledOutcome {
    spec: RangeSpec,
    side: Side,
    gap: f64,
    effective_high: f64,
    wu_triggered: bool,
    dual_confirmed: bool,
    metar_high: f64,
    wu_high: Option<f64>,
}

/// Enumerates outcomes whose settlement is already determined by the
/// running high and enters them when the economics clear.
pub struct GwScanner {
    config: Config,
}

impl GwScanner {
    pub fn new(config: &Config) -> Self {
        GwScanner {
            config: config.clone(),
        }
    }

    /// Scan one city's outcomes against the latest station highs,
    /// entering every provable winner that passes the entry filters.
    pub async fn scan_city(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        executor: &Executor,
        notifier: &Notifier,
        city: &'static City,
        target_date: NaiveDate,
        highs: &HashMap<String, StationHighs>,
    ) -> Result<GwStats> {
        let mut stats = GwStats::default();
        if !self.config.gw_enabled {
            return Ok(stats);
        }

        let today = city.local_date(Utc::now());
        for venue in [Venue::Polymarket, Venue::Kalshi] {
            let station = city.station_for(venue);
            let Some(station_highs) = highs.get(station) else {
                continue;
            };

            let outcomes = adapter.venue_outcomes(venue, city, target_date, today).await;
            for spec in outcomes {
                let Some(settled) = self.settle(city, &spec, *station_highs) else {
                    continue;
                };
                stats.candidates += 1;

                match self.entry_filter(adapter, &settled) {
                    None => {
                        let candidate = self.candidate(city, &settled, target_date);
                        let outcome = {
                            let db_guard = db.lock().unwrap();
                            executor.execute(&db_guard, adapter, &candidate)?
                        };
                        match outcome {
                            ExecutionOutcome::Entered(entered) => {
                                stats.entered += 1;
                                notifier.queue(
                                    "guaranteed",
                                    format!(
                                        "GW entry: {} {} {} {} @ {:.2} x{} (high={:.1})",
                                        city.key,
                                        target_date,
                                        settled.side,
                                        settled.spec.range_name,
                                        entered.price,
                                        entered.shares,
                                        settled.effective_high,
                                    ),
                                );
                            }
                            ExecutionOutcome::Rejected(reason) => {
                                // Dedup and bankroll rejects are routine
                                debug!(
                                    "GW executor reject for {} {}: {}",
                                    settled.spec.range_name, settled.side, reason
                                );
                            }
                        }
                    }
                    Some(reason) => {
                        stats.missed += 1;
                        notifier.queue(
                            "gw_missed",
                            format!(
                                "GW missed: {} {} {} {} — {}",
                                city.key,
                                target_date,
                                settled.side,
                                settled.spec.range_name,
                                reason,
                            ),
                        );
                    }
                }
            }
        }

        if stats.candidates > 0 {
            info!(
                "GW scan {}/{}: {} settled candidates, {} entered, {} missed",
                city.key, target_date, stats.candidates, stats.entered, stats.missed,
            );
        }
        Ok(stats)
    }

    /// Which side, if any, is provably settled by the current high.
    fn settle(
        &self,
        city: &City,
        spec: &RangeSpec,
        highs: StationHighs,
    ) -> Option<SettledOutcome> {
        // WU counts only toward the venue that resolves against WU.
        let wu_applies = spec.venue.resolves_against_wu();
        let effective_high = if wu_applies {
            highs.wu.map_or(highs.metar, |wu| wu.max(highs.metar))
        } else {
            highs.metar
        };
        let wu_triggered = wu_applies && highs.wu.is_some_and(|wu| wu > highs.metar);

        let (side, threshold) = if spec.yes_settled_by_high(effective_high) {
            (Side::Yes, spec.range_min?)
        } else if spec.no_settled_by_high(effective_high) {
            (Side::No, spec.range_max?)
        } else {
            return None;
        };

        let gap = effective_high - threshold;
        if gap < self.min_gap(city, spec.venue) {
            return None;
        }

        // Dual confirmation: both sources independently past the
        // threshold. For NO the bar is a strict crossing.
        let crossing = |value: f64| match side {
            Side::Yes => value >= threshold,
            Side::No => value > threshold,
        };
        let dual_confirmed = crossing(highs.metar) && highs.wu.is_some_and(crossing);

        Some(SettledOutcome {
            spec: spec.clone(),
            side,
            gap,
            effective_high,
            wu_triggered,
            dual_confirmed,
            metar_high: highs.metar,
            wu_high: highs.wu,
        })
    }

    /// Minimum observed gap over the threshold, doubled when the
    /// structured venue settles against a different airport than the
    /// flat-fee venue.
    fn min_gap(&self, city: &City, venue: Venue) -> f64 {
        let split = venue == Venue::Kalshi && city.dual_station();
        match (city.unit, split) {
            (TempUnit::F, false) => self.config.gw_min_gap_f,
            (TempUnit::C, false) => self.config.gw_min_gap_c,
            (TempUnit::F, true) => self.config.gw_min_gap_split_station_f,
            (TempUnit::C, true) => self.config.gw_min_gap_split_station_c,
        }
    }

    /// Economic filters, independent of model edge.
    fn entry_filter(&self, adapter: &VenueAdapter, settled: &SettledOutcome) -> Option<String> {
        let ask = settled.spec.ask_for_side(settled.side);
        let fee = adapter.fee_per_contract(settled.spec.venue, ask);

        let margin = 1.0 - ask - fee;
        if margin < self.config.gw_min_margin_cents / 100.0 {
            return Some(format!("margin {:.3} below minimum", margin));
        }
        if ask < self.config.gw_min_ask {
            // A too-cheap ask on a "settled" outcome means the market
            // disagrees with the observation — likely a wrong reading.
            return Some(format!("ask {:.2} below floor", ask));
        }
        if ask > self.config.gw_max_ask {
            return Some(format!("ask {:.2} above cap (repriced)", ask));
        }

        if self.config.gw_require_dual_confirmation
            && settled.spec.venue.resolves_against_wu()
            && !settled.dual_confirmed
        {
            return Some("awaiting dual confirmation".to_string());
        }

        None
    }

    fn candidate(
        &self,
        city: &'static City,
        settled: &SettledOutcome,
        target_date: NaiveDate,
    ) -> EntryCandidate {
        let now = Utc::now();
        let (_, resolution) = city.local_day_bounds_utc(target_date);
        let hours = (resolution - now).num_minutes() as f64 / 60.0;

        let entry_reason = if settled.wu_triggered {
            "guaranteed_win_pws"
        } else {
            "guaranteed_win"
        };

        EntryCandidate {
            spec: settled.spec.clone(),
            side: settled.side,
            probability: 1.0,
            forecast: None,
            entry_reason: entry_reason.to_string(),
            wu_triggered: settled.wu_triggered,
            dual_confirmed: settled.dual_confirmed,
            observation_high: Some(settled.metar_high),
            wu_high: settled.wu_high,
            hours_to_resolution: hours.max(0.0),
            max_bankroll_pct: self.config.gw_max_bankroll_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cities::find_city;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn spec(venue: Venue, min: Option<f64>, max: Option<f64>, bid: f64, ask: f64) -> RangeSpec {
        RangeSpec {
            venue,
            market_id: "m".to_string(),
            token_id: "t".to_string(),
            city: "NYC".to_string(),
            target_date: date("2026-02-20"),
            range_name: "≥49°F".to_string(),
            range_min: min,
            range_max: max,
            range_unit: TempUnit::F,
            bid,
            ask,
            spread: ask - bid,
            volume: 10_000.0,
        }
    }

    fn scanner() -> GwScanner {
        GwScanner::new(&Config::from_env().unwrap())
    }

    fn adapter() -> VenueAdapter {
        VenueAdapter::with_clients(None, None, 0.07)
    }

    #[test]
    fn test_settle_yes_unbounded_upper() {
        let s = scanner();
        let city = find_city("NYC").unwrap();
        // running high 52, threshold 49, dual confirmed
        let settled = s
            .settle(
                city,
                &spec(Venue::Polymarket, Some(49.0), None, 0.84, 0.88),
                StationHighs {
                    metar: 52.0,
                    wu: Some(52.0),
                },
            )
            .unwrap();
        assert_eq!(settled.side, Side::Yes);
        assert!((settled.gap - 3.0).abs() < 1e-9);
        assert!(settled.dual_confirmed);
        assert!(!settled.wu_triggered);
    }

    #[test]
    fn test_settle_no_on_bounded_range() {
        let s = scanner();
        let city = find_city("NYC").unwrap();
        // high 56 strictly above the 54-55 range → NO wins
        let settled = s
            .settle(
                city,
                &spec(Venue::Polymarket, Some(54.0), Some(55.0), 0.20, 0.25),
                StationHighs {
                    metar: 56.0,
                    wu: Some(56.5),
                },
            )
            .unwrap();
        assert_eq!(settled.side, Side::No);
        assert!(settled.wu_triggered);
    }

    #[test]
    fn test_settle_respects_min_gap() {
        let s = scanner();
        let city = find_city("NYC").unwrap();
        // gap 0.3 < 0.5 minimum → not settled yet
        assert!(s
            .settle(
                city,
                &spec(Venue::Polymarket, Some(49.0), None, 0.84, 0.88),
                StationHighs {
                    metar: 49.3,
                    wu: None,
                },
            )
            .is_none());
    }

    #[test]
    fn test_split_station_gap_doubled_for_kalshi() {
        let s = scanner();
        let nyc = find_city("NYC").unwrap(); // dual-station city
        // gap 1.0 clears the flat-fee venue minimum but not the 1.5
        // split-station minimum on the structured venue
        let highs = StationHighs {
            metar: 50.0,
            wu: None,
        };
        assert!(s
            .settle(nyc, &spec(Venue::Polymarket, Some(49.0), None, 0.84, 0.88), highs)
            .is_some());
        assert!(s
            .settle(nyc, &spec(Venue::Kalshi, Some(49.0), None, 0.84, 0.88), highs)
            .is_none());
    }

    #[test]
    fn test_wu_never_contaminates_metar_venue() {
        let s = scanner();
        let city = find_city("NYC").unwrap();
        // WU says 52 but METAR only 47: the structured venue sees 47
        let highs = StationHighs {
            metar: 47.0,
            wu: Some(52.0),
        };
        assert!(s
            .settle(city, &spec(Venue::Kalshi, Some(49.0), None, 0.84, 0.88), highs)
            .is_none());
        // The narrative venue (WU resolution) does settle
        assert!(s
            .settle(city, &spec(Venue::Polymarket, Some(49.0), None, 0.84, 0.88), highs)
            .is_some());
    }

    #[test]
    fn test_entry_filter_margin_and_ask_window() {
        let s = scanner();
        let adapter = adapter();
        let city = find_city("NYC").unwrap();
        let highs = StationHighs {
            metar: 52.0,
            wu: Some(52.0),
        };

        // ask 0.88: margin 0.12 ≥ 0.05, inside [0.30, 0.97] → accepted
        let ok = s
            .settle(city, &spec(Venue::Polymarket, Some(49.0), None, 0.84, 0.88), highs)
            .unwrap();
        assert!(s.entry_filter(&adapter, &ok).is_none());

        // ask 0.98 above MAX_ASK → repriced
        let repriced = s
            .settle(city, &spec(Venue::Polymarket, Some(49.0), None, 0.94, 0.98), highs)
            .unwrap();
        assert!(s
            .entry_filter(&adapter, &repriced)
            .unwrap()
            .contains("above cap"));

        // ask 0.25 below MIN_ASK → wrong-observation protection
        let cheap = s
            .settle(city, &spec(Venue::Polymarket, Some(49.0), None, 0.20, 0.25), highs)
            .unwrap();
        assert!(s
            .entry_filter(&adapter, &cheap)
            .unwrap()
            .contains("below floor"));

        // margin below 5¢: ask 0.96 → margin 0.04
        let thin = s
            .settle(city, &spec(Venue::Polymarket, Some(49.0), None, 0.92, 0.96), highs)
            .unwrap();
        assert!(s
            .entry_filter(&adapter, &thin)
            .unwrap()
            .contains("margin"));
    }

    #[test]
    fn test_dual_confirmation_required_for_wu_venue() {
        let s = scanner();
        let adapter = adapter();
        let city = find_city("NYC").unwrap();

        // METAR crossed, WU not yet → narrative venue must wait
        let metar_only = s
            .settle(
                city,
                &spec(Venue::Polymarket, Some(49.0), None, 0.84, 0.88),
                StationHighs {
                    metar: 52.0,
                    wu: Some(48.0),
                },
            )
            .unwrap();
        assert!(!metar_only.dual_confirmed);
        assert!(s
            .entry_filter(&adapter, &metar_only)
            .unwrap()
            .contains("dual confirmation"));
    }

    #[tokio::test]
    async fn test_scenario_guaranteed_win_entry() {
        use crate::venue::polymarket::PolymarketClient;
        use reqwest::Client;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // NYC, running high 52 on METAR and WU, "≥49°F" at ask 0.88
        let server = MockServer::start().await;
        let city = find_city("NYC").unwrap();
        let target = city.local_date(Utc::now());
        let question = format!(
            "Will the highest temperature in New York City be 49\u{00b0}F or higher on {}?",
            target
        );
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "markets": [{
                    "question": question,
                    "conditionId": "0xgw",
                    "clobTokenIds": "[\"tok_yes\", \"tok_no\"]",
                    "bestBid": 0.84,
                    "bestAsk": 0.88,
                    "volume": 20_000.0,
                    "closed": false,
                    "active": true
                }]
            }])))
            .mount(&server)
            .await;

        let config = Config::from_env().unwrap();
        let db = crate::db::shared(crate::db::Database::open_in_memory().unwrap());
        let adapter = VenueAdapter::with_clients(
            Some(PolymarketClient::with_client(Client::new(), server.uri())),
            None,
            0.07,
        );
        let executor = Executor::new(&config);
        let notifier = Notifier::from_env();
        let gw = GwScanner::new(&config);

        let mut highs = HashMap::new();
        highs.insert(
            "KLGA".to_string(),
            StationHighs {
                metar: 52.0,
                wu: Some(52.0),
            },
        );

        let stats = gw
            .scan_city(&db, &adapter, &executor, &notifier, city, target, &highs)
            .await
            .unwrap();
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.entered, 1);

        let db = db.lock().unwrap();
        let open = db.get_open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entry_reason, "guaranteed_win");
        assert!((open[0].entry_ask - 0.88).abs() < 1e-9);
        assert!(open[0].dual_confirmed);
        assert_eq!(open[0].observation_high, Some(52.0));
    }
}
