use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cities::{City, CITIES};
use crate::config::Config;
use crate::db::SharedDb;
use crate::executor::Executor;
use crate::guaranteed::{GwScanner, StationHighs};
use crate::metar::{MetarClient, MetarObservation};
use crate::notifier::Notifier;
use crate::range::{c_to_f, RangeSpec, Side, TempUnit, Venue};
use crate::venue::VenueAdapter;
use crate::wunderground::{WuClient, WuDailyHigh};

#[derive(Debug, Default)]
pub struct ObserveStats {
    pub stations_polled: usize,
    pub cities_processed: usize,
    pub detections: usize,
    pub gw_entries: usize,
}

/// Per-process debounce state, reset on local-date rollover.
struct DebounceState {
    alerted: HashSet<String>,
    wu_leads_logged: HashSet<String>,
    pruned_on: Option<NaiveDate>,
}

/// A threshold crossing found this tick.
struct Crossing {
    spec: RangeSpec,
    side: Side,
    gap: f64,
    effective_high: f64,
    wu_crossed: bool,
    wu_high: Option<f64>,
}

/// The highest-frequency component: polls every active station, keeps
/// the running highs current, detects already-decided outcomes before
/// the market moves, and hands fresh detections straight to the
/// guaranteed-win scanner.
pub struct ObservationService {
    config: Config,
    metar: MetarClient,
    wu_fast: WuClient,
    wu_slow: WuClient,
    gw: GwScanner,
    state: Mutex<DebounceState>,
}

impl ObservationService {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(ObservationService {
            metar: MetarClient::new(&config.metar_api_url, config.weather_request_timeout_secs)?,
            wu_fast: WuClient::new(&config.wu_api_url, config.wu_fast_timeout_secs, None)?,
            wu_slow: WuClient::new(
                &config.wu_api_url,
                config.weather_request_timeout_secs,
                Some(config.wu_slow_min_spacing_ms),
            )?,
            gw: GwScanner::new(config),
            state: Mutex::new(DebounceState {
                alerted: HashSet::new(),
                wu_leads_logged: HashSet::new(),
                pruned_on: None,
            }),
            config: config.clone(),
        })
    }

    #[cfg(test)]
    pub fn with_clients(
        config: &Config,
        metar: MetarClient,
        wu_fast: WuClient,
        wu_slow: WuClient,
    ) -> Self {
        ObservationService {
            metar,
            wu_fast,
            wu_slow,
            gw: GwScanner::new(config),
            state: Mutex::new(DebounceState {
                alerted: HashSet::new(),
                wu_leads_logged: HashSet::new(),
                pruned_on: None,
            }),
            config: config.clone(),
        }
    }

    fn city_is_active(&self, city: &City, now: DateTime<Utc>) -> bool {
        let hour = city.local_hour(now);
        hour >= self.config.active_hours_start && hour < self.config.active_hours_end
    }

    fn prune_debounce(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let mut state = self.state.lock().unwrap();
        if state.pruned_on != Some(today) {
            state.alerted.clear();
            state.wu_leads_logged.clear();
            state.pruned_on = Some(today);
        }
    }

    /// Fast loop: batch METAR over all active stations, tier cities by
    /// boundary proximity, detect crossings, trigger the GW scanner
    /// synchronously on first detections.
    pub async fn fast_tick(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        executor: &Executor,
        notifier: &Notifier,
    ) -> Result<ObserveStats> {
        let now = Utc::now();
        self.prune_debounce(now);
        let mut stats = ObserveStats::default();

        let active: Vec<&'static City> = CITIES
            .iter()
            .filter(|c| self.city_is_active(c, now))
            .collect();
        if active.is_empty() {
            return Ok(stats);
        }

        let stations = crate::cities::all_stations(&active);
        let readings = match self.metar.batch_fetch(&stations).await {
            Ok(map) => map,
            Err(e) => {
                // A failed batch aborts the whole tick.
                warn!("METAR batch fetch failed, aborting fast tick: {}", e);
                return Ok(stats);
            }
        };
        stats.stations_polled = readings.len();

        for city in active {
            let target_date = city.local_date(now);
            let highs = self.station_highs(db, city, target_date, &readings, None)?;

            let today = city.local_date(now);
            let near = self
                .near_boundary(adapter, city, target_date, today, &highs)
                .await;
            if !near {
                self.write_lightweight(db, city, target_date, &readings, now)?;
                continue;
            }
            stats.cities_processed += 1;

            // Opportunistic WU augmentation with a hard per-city budget.
            let wu = if self.wu_fast.is_enabled() {
                match tokio::time::timeout(
                    std::time::Duration::from_secs(self.config.wu_fast_timeout_secs),
                    self.wu_fast.fetch_daily_high(city, target_date),
                )
                .await
                {
                    Ok(Ok(high)) => high,
                    Ok(Err(e)) => {
                        debug!("WU fast fetch failed for {}: {} — METAR only", city.key, e);
                        None
                    }
                    Err(_) => {
                        debug!("WU fast fetch timed out for {} — METAR only", city.key);
                        None
                    }
                }
            } else {
                None
            };

            let highs = self.station_highs(db, city, target_date, &readings, wu)?;
            let detections = self
                .detect_crossings(db, adapter, notifier, city, target_date, &highs, "fast_poll")
                .await?;
            stats.detections += detections;

            self.write_observations(db, city, target_date, &readings, wu, now, false)?;

            // Fresh detection: run the GW scanner now, not on its timer.
            if detections > 0 {
                let gw_stats = self
                    .gw
                    .scan_city(db, adapter, executor, notifier, city, target_date, &highs)
                    .await?;
                stats.gw_entries += gw_stats.entered;
            }
        }

        info!(
            "Fast observe: {} stations, {} near-boundary cities, {} detections, {} GW entries",
            stats.stations_polled, stats.cities_processed, stats.detections, stats.gw_entries,
        );
        Ok(stats)
    }

    /// Slow loop: every city, full observation rows with the crowd
    /// high, WU-vs-METAR mismatch logging and the WU-leads pattern.
    pub async fn slow_tick(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        notifier: &Notifier,
    ) -> Result<ObserveStats> {
        let now = Utc::now();
        self.prune_debounce(now);
        let mut stats = ObserveStats::default();

        let all: Vec<&'static City> = CITIES.iter().collect();
        let stations = crate::cities::all_stations(&all);
        let readings = match self.metar.batch_fetch(&stations).await {
            Ok(map) => map,
            Err(e) => {
                warn!("METAR batch fetch failed, aborting slow tick: {}", e);
                return Ok(stats);
            }
        };
        stats.stations_polled = readings.len();

        for city in all {
            let target_date = city.local_date(now);
            let wu = if self.wu_slow.is_enabled() {
                match self.wu_slow.fetch_daily_high(city, target_date).await {
                    Ok(high) => high,
                    Err(e) => {
                        debug!("WU slow fetch failed for {}: {}", city.key, e);
                        None
                    }
                }
            } else {
                None
            };

            let highs = self.station_highs(db, city, target_date, &readings, wu)?;
            stats.cities_processed += 1;

            let detections = self
                .detect_crossings(db, adapter, notifier, city, target_date, &highs, "regular")
                .await?;
            stats.detections += detections;

            self.write_observations(db, city, target_date, &readings, wu, now, true)?;
            self.check_wu_leads(db, city, target_date, &readings, wu, now)?;
        }

        info!(
            "Slow observe: {} stations, {} cities, {} detections",
            stats.stations_polled, stats.cities_processed, stats.detections,
        );
        Ok(stats)
    }

    /// Effective highs per station in the city's unit: stored running
    /// high lifted by the fresh reading. WU attaches only to the
    /// flat-fee venue's declared station.
    fn station_highs(
        &self,
        db: &SharedDb,
        city: &City,
        target_date: NaiveDate,
        readings: &HashMap<String, MetarObservation>,
        wu: Option<WuDailyHigh>,
    ) -> Result<HashMap<String, StationHighs>> {
        let db = db.lock().unwrap();
        let mut highs = HashMap::new();
        for station in [city.polymarket_station, city.kalshi_station] {
            if highs.contains_key(station) {
                continue;
            }
            let stored = db.get_running_high(city.key, target_date, station)?;
            let stored_unit = stored.as_ref().map(|h| match city.unit {
                TempUnit::F => h.high_f,
                TempUnit::C => h.high_c,
            });
            let fresh_unit = readings.get(station).and_then(|r| r.temp).map(|c| match city.unit {
                TempUnit::F => c_to_f(c),
                TempUnit::C => c,
            });
            let metar = match (stored_unit, fresh_unit) {
                (Some(s), Some(f)) => s.max(f),
                (Some(s), None) => s,
                (None, Some(f)) => f,
                (None, None) => continue,
            };
            let wu_unit = if station == city.polymarket_station {
                wu.map(|w| WuClient::high_in_unit(&w, city.unit))
            } else {
                None
            };
            highs.insert(station.to_string(), StationHighs { metar, wu: wu_unit });
        }
        Ok(highs)
    }

    /// Tiering: a city enters full processing only when some outcome's
    /// threshold sits within the buffer of the effective high.
    async fn near_boundary(
        &self,
        adapter: &VenueAdapter,
        city: &'static City,
        target_date: NaiveDate,
        today: NaiveDate,
        highs: &HashMap<String, StationHighs>,
    ) -> bool {
        let buffer = match city.unit {
            TempUnit::F => self.config.gw_near_threshold_buffer_f,
            TempUnit::C => self.config.gw_near_threshold_buffer_c,
        };
        for venue in [Venue::Polymarket, Venue::Kalshi] {
            let station = city.station_for(venue);
            let Some(station_highs) = highs.get(station) else {
                continue;
            };
            let high = effective_for_venue(venue, station_highs);
            let outcomes = adapter.venue_outcomes(venue, city, target_date, today).await;
            for spec in &outcomes {
                let thresholds = [spec.range_min, spec.range_max];
                if thresholds
                    .iter()
                    .flatten()
                    .any(|threshold| threshold - high <= buffer)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Boundary detection over every outcome of every venue. Fresh
    /// detections insert pending events with orderbook snapshots;
    /// existing ones get their latched fields refreshed.
    #[allow(clippy::too_many_arguments)]
    async fn detect_crossings(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        notifier: &Notifier,
        city: &'static City,
        target_date: NaiveDate,
        highs: &HashMap<String, StationHighs>,
        poll_source: &str,
    ) -> Result<usize> {
        let today = target_date;
        let existing = db.lock().unwrap().get_pending_events(city.key, target_date)?;
        let mut detections = 0;

        for venue in [Venue::Polymarket, Venue::Kalshi] {
            let station = city.station_for(venue);
            let Some(station_highs) = highs.get(station) else {
                continue;
            };

            let outcomes = adapter.venue_outcomes(venue, city, target_date, today).await;
            let crossings: Vec<Crossing> = outcomes
                .iter()
                .filter_map(|spec| self.crossing(city, spec, *station_highs))
                .collect();

            for crossing in crossings {
                let known = existing.iter().find(|e| {
                    e.venue == venue
                        && e.range_name == crossing.spec.range_name
                        && e.side == crossing.side
                });

                if let Some(event) = known {
                    let db = db.lock().unwrap();
                    db.update_pending_event_highs(
                        event.id,
                        crossing.effective_high,
                        crossing.wu_high,
                    )?;
                    if crossing.wu_crossed {
                        db.mark_pending_wu_confirmed(event.id)?;
                    }
                    if crossing.spec.ask_for_side(crossing.side) > self.config.gw_max_ask {
                        db.mark_pending_market_repriced(event.id, venue)?;
                    }
                    continue;
                }

                // Snapshot this venue's book and, when the other venue
                // carries an equivalent range, that book too.
                let orderbook = match adapter.get_orderbook(venue, &crossing.spec.token_id).await {
                    Ok(book) => serde_json::to_string(&book.ask_depth).ok(),
                    Err(e) => {
                        debug!("Orderbook snapshot failed for {}: {}", crossing.spec.token_id, e);
                        None
                    }
                };
                let other_orderbook = match adapter.cached_matching_outcome(&crossing.spec) {
                    Some(other) => match adapter.get_orderbook(other.venue, &other.token_id).await {
                        Ok(book) => serde_json::to_string(&book.ask_depth).ok(),
                        Err(_) => None,
                    },
                    None => None,
                };

                let first = {
                    let db = db.lock().unwrap();
                    db.insert_pending_event(
                        city.key,
                        target_date,
                        venue,
                        &crossing.spec.range_name,
                        crossing.side,
                        crossing.effective_high,
                        crossing.wu_high,
                        crossing.gap,
                        crossing.spec.ask_for_side(crossing.side),
                        orderbook.as_deref(),
                        other_orderbook.as_deref(),
                        poll_source,
                        crossing.wu_crossed,
                    )?
                };

                if first {
                    detections += 1;
                    let key = format!(
                        "{}|{}|{}|{}|{}",
                        city.key, target_date, venue, crossing.spec.range_name, crossing.side
                    );
                    let fresh_alert = self.state.lock().unwrap().alerted.insert(key);
                    if fresh_alert {
                        notifier
                            .send_critical(&format!(
                                "Boundary crossed: {} {} {} {} (high {:.1}, gap {:.1}, ask {:.2})",
                                city.key,
                                target_date,
                                crossing.side,
                                crossing.spec.range_name,
                                crossing.effective_high,
                                crossing.gap,
                                crossing.spec.ask_for_side(crossing.side),
                            ))
                            .await;
                    }
                }
            }
        }
        Ok(detections)
    }

    /// Whether the effective high settles one side of this outcome,
    /// with the venue's minimum gap.
    fn crossing(&self, city: &City, spec: &RangeSpec, highs: StationHighs) -> Option<Crossing> {
        let high = effective_for_venue(spec.venue, &highs);

        let (side, threshold) = if spec.yes_settled_by_high(high) {
            (Side::Yes, spec.range_min?)
        } else if spec.no_settled_by_high(high) {
            (Side::No, spec.range_max?)
        } else {
            return None;
        };

        let gap = high - threshold;
        let split = spec.venue == Venue::Kalshi && city.dual_station();
        let min_gap = match (city.unit, split) {
            (TempUnit::F, false) => self.config.gw_min_gap_f,
            (TempUnit::C, false) => self.config.gw_min_gap_c,
            (TempUnit::F, true) => self.config.gw_min_gap_split_station_f,
            (TempUnit::C, true) => self.config.gw_min_gap_split_station_c,
        };
        if gap < min_gap {
            return None;
        }

        let crossing_test = |value: f64| match side {
            Side::Yes => value >= threshold,
            Side::No => value > threshold,
        };
        Some(Crossing {
            spec: spec.clone(),
            side,
            gap,
            effective_high: high,
            wu_crossed: highs.wu.is_some_and(crossing_test),
            wu_high: highs.wu,
        })
    }

    /// Observation rows for the fast path: write only when a station
    /// reports a new high.
    fn write_lightweight(
        &self,
        db: &SharedDb,
        city: &City,
        target_date: NaiveDate,
        readings: &HashMap<String, MetarObservation>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write_observations(db, city, target_date, readings, None, now, false)
    }

    fn write_observations(
        &self,
        db: &SharedDb,
        city: &City,
        target_date: NaiveDate,
        readings: &HashMap<String, MetarObservation>,
        wu: Option<WuDailyHigh>,
        now: DateTime<Utc>,
        write_all: bool,
    ) -> Result<()> {
        let db = db.lock().unwrap();
        for station in [city.polymarket_station, city.kalshi_station] {
            let Some(reading) = readings.get(station) else {
                continue;
            };
            let Some(temp_c) = reading.temp else {
                continue;
            };
            let temp_f = c_to_f(temp_c);

            let stored = db.get_running_high(city.key, target_date, station)?;
            let is_new_high = stored.as_ref().map_or(true, |h| temp_f > h.high_f);
            let wu_for_station = (station == city.polymarket_station)
                .then_some(wu)
                .flatten();
            let wu_is_news = match (&stored, wu_for_station) {
                (Some(_), Some(w)) => {
                    let prior_wu = db.get_latest_wu_high(city.key, target_date, station)?;
                    prior_wu.map_or(true, |(f, _)| w.high_f > f)
                }
                (None, Some(_)) => true,
                _ => false,
            };
            if !write_all && !is_new_high && !wu_is_news {
                continue;
            }

            // Retractions never lower the stored high; log and move on.
            if let Some(w) = wu_for_station {
                if let Some((prior_f, _)) = db.get_latest_wu_high(city.key, target_date, station)? {
                    if w.high_f < prior_f {
                        warn!(
                            "WU retraction for {}/{}: reported {:.1}F below stored {:.1}F — keeping stored",
                            city.key, station, w.high_f, prior_f,
                        );
                    }
                }
            }

            let observed_at = reading
                .obs_time
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
                .unwrap_or(now)
                .to_rfc3339();
            db.upsert_observation(
                city.key,
                target_date,
                station,
                &observed_at,
                temp_c,
                temp_f,
                wu_for_station.map(|w| w.high_f),
                wu_for_station.map(|w| w.high_c),
            )?;

            // Same-station cities write once; the second venue reads the
            // same rows.
            if city.polymarket_station == city.kalshi_station {
                break;
            }
        }
        Ok(())
    }

    /// The crowd-leads-airport pattern: WU reports a high well beyond
    /// METAR before local noon. Log it once, and stamp confirmation
    /// when METAR catches up.
    fn check_wu_leads(
        &self,
        db: &SharedDb,
        city: &City,
        target_date: NaiveDate,
        readings: &HashMap<String, MetarObservation>,
        wu: Option<WuDailyHigh>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(wu) = wu else {
            return Ok(());
        };
        let station = city.polymarket_station;
        let db_guard = db.lock().unwrap();

        let stored = db_guard.get_running_high(city.key, target_date, station)?;
        let fresh_f = readings
            .get(station)
            .and_then(|r| r.temp)
            .map(c_to_f)
            .unwrap_or(f64::MIN);
        let metar_f = stored.as_ref().map(|h| h.high_f).unwrap_or(f64::MIN).max(fresh_f);
        if metar_f == f64::MIN {
            return Ok(());
        }

        let gap = wu.high_f - metar_f;
        let min_gap = match city.unit {
            TempUnit::F => self.config.wu_lead_min_gap_f,
            TempUnit::C => self.config.wu_lead_min_gap_c * 1.8,
        };
        let local_hour = city.local_hour(now);

        if gap >= min_gap && local_hour < self.config.wu_lead_max_local_hour {
            let key = format!("{}|{}|{}", city.key, target_date, station);
            let fresh_log = self.state.lock().unwrap().wu_leads_logged.insert(key);
            let inserted = db_guard.insert_wu_leads_event(
                city.key,
                target_date,
                station,
                wu.high_f,
                metar_f,
                gap,
                local_hour,
            )?;
            if inserted || fresh_log {
                info!(
                    "WU leads METAR at {}/{}: {:.1}F vs {:.1}F (gap {:.1})",
                    city.key, station, wu.high_f, metar_f, gap,
                );
            }
        } else if gap < min_gap && db_guard.has_unconfirmed_wu_lead(city.key, target_date, station)
        {
            db_guard.mark_wu_leads_metar_confirmed(city.key, target_date, station)?;
            info!("METAR caught up to WU at {}/{}", city.key, station);
        }
        Ok(())
    }
}

fn effective_for_venue(venue: Venue, highs: &StationHighs) -> f64 {
    if venue.resolves_against_wu() {
        highs.wu.map_or(highs.metar, |wu| wu.max(highs.metar))
    } else {
        highs.metar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::venue::polymarket::PolymarketClient;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> Config {
        Config::from_env().unwrap()
    }

    fn service_with(metar_url: &str, wu_url: Option<&str>) -> ObservationService {
        let metar = MetarClient::with_client(Client::new(), metar_url.to_string());
        let (wu_fast, wu_slow) = match wu_url {
            Some(url) => (
                WuClient::with_client(Client::new(), url.to_string(), None),
                WuClient::with_client(Client::new(), url.to_string(), None),
            ),
            None => (
                WuClient::new("http://unused", 1, None).unwrap(),
                WuClient::new("http://unused", 1, None).unwrap(),
            ),
        };
        ObservationService::with_clients(&test_config(), metar, wu_fast, wu_slow)
    }

    async fn mount_metar(server: &MockServer, station: &str, temp_c: f64) {
        let body = serde_json::json!([
            {"icaoId": station, "temp": temp_c, "obsTime": 1771600000}
        ]);
        Mock::given(method("GET"))
            .and(path("/metar"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_fast_tick_aborts_on_batch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let service = service_with(&format!("{}/metar", server.uri()), None);
        let db = crate::db::shared(Database::open_in_memory().unwrap());
        let adapter = VenueAdapter::with_clients(None, None, 0.07);
        let executor = Executor::new(&test_config());
        let notifier = Notifier::from_env();

        let stats = service
            .fast_tick(&db, &adapter, &executor, &notifier)
            .await
            .unwrap();
        assert_eq!(stats.stations_polled, 0);
        assert_eq!(stats.detections, 0);
    }

    #[tokio::test]
    async fn test_crossing_detection_and_pending_event() {
        let service = service_with("http://unused", None);
        let db = crate::db::shared(Database::open_in_memory().unwrap());
        let notifier = Notifier::from_env();

        let city = crate::cities::find_city("NYC").unwrap();
        let target = city.local_date(Utc::now());

        // Venue serves one outcome whose threshold the high has crossed
        let server = MockServer::start().await;
        let question = format!(
            "Will the highest temperature in New York City be 38\u{00b0}F or higher on {}?",
            target
        );
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "markets": [{
                    "question": question,
                    "conditionId": "0xev",
                    "clobTokenIds": "[\"tok_yes\", \"tok_no\"]",
                    "bestBid": 0.55,
                    "bestAsk": 0.60,
                    "volume": 9000.0,
                    "closed": false,
                    "active": true
                }]
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "asks": [{"price": "0.60", "size": "500"}]
            })))
            .mount(&server)
            .await;

        let adapter = VenueAdapter::with_clients(
            Some(PolymarketClient::with_client(Client::new(), server.uri())),
            None,
            0.07,
        );

        let mut highs = HashMap::new();
        highs.insert(
            "KLGA".to_string(),
            StationHighs {
                metar: 39.2,
                wu: None,
            },
        );

        let detections = service
            .detect_crossings(&db, &adapter, &notifier, city, target, &highs, "fast_poll")
            .await
            .unwrap();
        assert_eq!(detections, 1);

        {
            let db = db.lock().unwrap();
            let events = db.get_pending_events("NYC", target).unwrap();
            assert_eq!(events.len(), 1);
            let ev = &events[0];
            assert_eq!(ev.side, Side::Yes);
            assert!((ev.metar_gap - 1.2).abs() < 1e-9);
            assert!((ev.ask_at_detection - 0.60).abs() < 1e-9);
            assert_eq!(ev.poll_source, "fast_poll");
            assert!(!ev.wu_triggered);
            assert!(ev.wu_confirmed_at.is_none());
        }

        // Second pass: same crossing is not a new detection
        let again = service
            .detect_crossings(&db, &adapter, &notifier, city, target, &highs, "fast_poll")
            .await
            .unwrap();
        assert_eq!(again, 0);

        // WU catches up: latched confirmation is set, once
        let mut highs_wu = highs.clone();
        highs_wu.insert(
            "KLGA".to_string(),
            StationHighs {
                metar: 39.2,
                wu: Some(38.5),
            },
        );
        service
            .detect_crossings(&db, &adapter, &notifier, city, target, &highs_wu, "fast_poll")
            .await
            .unwrap();
        {
            let db = db.lock().unwrap();
            let ev = &db.get_pending_events("NYC", target).unwrap()[0];
            assert!(ev.wu_confirmed_at.is_some());
            assert!(ev.market_repriced_at.is_none());
        }
    }

    #[tokio::test]
    async fn test_repricing_latched_once() {
        let service = service_with("http://unused", None);
        let db = crate::db::shared(Database::open_in_memory().unwrap());
        let notifier = Notifier::from_env();
        let city = crate::cities::find_city("NYC").unwrap();
        let target = city.local_date(Utc::now());

        // Ask above MAX_ASK (0.97): the event records but is repriced
        let server = MockServer::start().await;
        let question = format!(
            "Will the highest temperature in New York City be 38\u{00b0}F or higher on {}?",
            target
        );
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "markets": [{
                    "question": question,
                    "conditionId": "0xev",
                    "clobTokenIds": "[\"tok_yes\", \"tok_no\"]",
                    "bestBid": 0.97,
                    "bestAsk": 0.98,
                    "volume": 9000.0,
                    "closed": false,
                    "active": true
                }]
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"asks": []})))
            .mount(&server)
            .await;

        let adapter = VenueAdapter::with_clients(
            Some(PolymarketClient::with_client(Client::new(), server.uri())),
            None,
            0.07,
        );
        let mut highs = HashMap::new();
        highs.insert(
            "KLGA".to_string(),
            StationHighs {
                metar: 39.2,
                wu: None,
            },
        );

        // First pass inserts, second pass marks repriced
        service
            .detect_crossings(&db, &adapter, &notifier, city, target, &highs, "fast_poll")
            .await
            .unwrap();
        service
            .detect_crossings(&db, &adapter, &notifier, city, target, &highs, "fast_poll")
            .await
            .unwrap();

        let db = db.lock().unwrap();
        let ev = &db.get_pending_events("NYC", target).unwrap()[0];
        assert!(ev.market_repriced_at.is_some());
        assert!(ev.kalshi_market_repriced_at.is_none());
    }

    #[tokio::test]
    async fn test_write_observations_only_on_new_high() {
        let server = MockServer::start().await;
        mount_metar(&server, "KLGA", 10.0).await; // 50°F

        let service = service_with(&format!("{}/metar", server.uri()), None);
        let db = crate::db::shared(Database::open_in_memory().unwrap());
        let city = crate::cities::find_city("NYC").unwrap();
        let target = city.local_date(Utc::now());
        let now = Utc::now();

        let readings = service.metar.batch_fetch(&["KLGA"]).await.unwrap();

        // Seed a higher stored high: the fresh 50°F is not news
        {
            let db_guard = db.lock().unwrap();
            db_guard
                .upsert_observation(
                    "NYC",
                    target,
                    "KLGA",
                    "2026-02-20T10:00:00Z",
                    12.0,
                    54.0,
                    None,
                    None,
                )
                .unwrap();
        }
        service
            .write_observations(&db, city, target, &readings, None, now, false)
            .unwrap();
        {
            let db_guard = db.lock().unwrap();
            let count: i64 = db_guard
                .conn
                .query_row("SELECT COUNT(*) FROM metar_observations", [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 1, "no new high, no new row");
        }

        // Slow path writes regardless (fresh report time)
        let mut readings2 = readings.clone();
        readings2.get_mut("KLGA").unwrap().obs_time = Some(1771600300);
        service
            .write_observations(&db, city, target, &readings2, None, now, true)
            .unwrap();
        let db_guard = db.lock().unwrap();
        let count: i64 = db_guard
            .conn
            .query_row("SELECT COUNT(*) FROM metar_observations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_wu_leads_event_lifecycle() {
        let service = service_with("http://unused", None);
        let db = crate::db::shared(Database::open_in_memory().unwrap());
        let city = crate::cities::find_city("NYC").unwrap();
        let target = city.local_date(Utc::now());

        // Choose a UTC instant mapping to a local morning hour
        let morning = target
            .and_hms_opt(14, 0, 0)
            .unwrap()
            .and_utc(); // 09:00 EST

        // METAR says 50, WU says 53.5: gap 3.5 ≥ 2.5 before noon
        {
            let db_guard = db.lock().unwrap();
            db_guard
                .upsert_observation(
                    "NYC",
                    target,
                    "KLGA",
                    "2026-02-20T13:00:00Z",
                    10.0,
                    50.0,
                    None,
                    None,
                )
                .unwrap();
        }
        let readings = HashMap::new();
        let wu = Some(WuDailyHigh {
            high_f: 53.5,
            high_c: 11.9,
            observation_count: 100,
        });
        service
            .check_wu_leads(&db, city, target, &readings, wu, morning)
            .unwrap();
        {
            let db_guard = db.lock().unwrap();
            assert!(db_guard.has_unconfirmed_wu_lead("NYC", target, "KLGA"));
        }

        // METAR catches up: gap collapses, confirmation stamps
        {
            let db_guard = db.lock().unwrap();
            db_guard
                .upsert_observation(
                    "NYC",
                    target,
                    "KLGA",
                    "2026-02-20T15:00:00Z",
                    11.9,
                    53.0,
                    None,
                    None,
                )
                .unwrap();
        }
        let wu = Some(WuDailyHigh {
            high_f: 53.5,
            high_c: 11.9,
            observation_count: 120,
        });
        service
            .check_wu_leads(&db, city, target, &readings, wu, morning)
            .unwrap();
        let db_guard = db.lock().unwrap();
        assert!(!db_guard.has_unconfirmed_wu_lead("NYC", target, "KLGA"));
    }
}
