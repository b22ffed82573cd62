use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::calibration;
use crate::cities::find_city;
use crate::config::Config;
use crate::db::{CalibrationRow, SharedDb, TradeRow};
use crate::executor::Executor;
use crate::forecast::{probability_for_range, probability_for_side, ForecastEngine};
use crate::peak_hour::PeakHourEstimator;
use crate::range::{RangeSpec, Side, TempUnit};
use crate::venue::VenueAdapter;

const EDGE_GONE_THRESHOLD: f64 = -0.05;
const NEAR_RESOLUTION_BID: f64 = 0.85;
const NEAR_RESOLUTION_HOURS: f64 = 12.0;
const BOUNDARY_RISK_DISTANCE: f64 = 1.0;

/// Final call for one position on one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Recommendation {
    Hold,
    EdgeGone,
    TakeProfit,
    GuaranteedWin,
    GuaranteedLoss,
}

impl Recommendation {
    pub fn signal_name(&self) -> &'static str {
        match self {
            Recommendation::Hold => "hold",
            Recommendation::EdgeGone => "edge_gone",
            Recommendation::TakeProfit => "take_profit",
            Recommendation::GuaranteedWin => "guaranteed_win",
            Recommendation::GuaranteedLoss => "guaranteed_loss",
        }
    }
}

/// Everything the evaluator fuses for one trade on one pass.
#[derive(Debug, Clone, Default)]
pub struct TradeView {
    /// Proceeds per contract selling this side now.
    pub sell_now: f64,
    /// Cost per contract to add to this side now.
    pub ask_for_side: f64,
    /// Fresh model probability for this side, when a forecast exists.
    pub probability: Option<f64>,
    pub hours_remaining: f64,
    /// Running high per the venue's station (WU blended only where the
    /// venue resolves against WU), in the range's unit.
    pub venue_high: Option<f64>,
    /// High per the venue's declared resolution source only; gates
    /// guaranteed-loss calls.
    pub resolution_high: Option<f64>,
    /// Latest raw station reading.
    pub latest_temp: Option<f64>,
    /// Whether the city is already past its estimated peak hour.
    pub past_peak: bool,
    pub calibration: Option<CalibrationRow>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub recommendation: Recommendation,
    pub signals: Vec<String>,
    pub ev_advantage: Option<f64>,
}

#[derive(Debug, Default)]
pub struct MonitorStats {
    pub checked: usize,
    pub exits: usize,
    pub resolved: usize,
    pub holds: usize,
}

/// Per-position exit evaluator. Each open trade is processed strictly
/// sequentially within a pass.
pub struct ExitEvaluator {
    config: Config,
}

impl ExitEvaluator {
    pub fn new(config: &Config) -> Self {
        ExitEvaluator {
            config: config.clone(),
        }
    }

    /// Pure decision core, §4.7 order.
    pub fn evaluate(&self, trade: &TradeRow, view: &TradeView) -> Decision {
        let mut signals = Vec::new();
        let ev_advantage = view.probability.map(|p| p - view.sell_now);

        // Observation signals first: a settled outcome dominates
        // everything else.
        if let Some(guaranteed) = self.observation_signal(trade, view) {
            return Decision {
                recommendation: guaranteed,
                signals,
                ev_advantage,
            };
        }

        // Near-resolution hold: a high bid close to settlement is worth
        // more held to $1 than sold.
        if view.sell_now >= NEAR_RESOLUTION_BID && view.hours_remaining <= NEAR_RESOLUTION_HOURS {
            signals.push("near_resolution_hold".to_string());
            return Decision {
                recommendation: Recommendation::Hold,
                signals,
                ev_advantage,
            };
        }

        // Base recommendation: edge gone when holding expects less than
        // selling, beyond the noise band.
        let mut edge_gone = ev_advantage.is_some_and(|adv| adv < EDGE_GONE_THRESHOLD);

        // Calibration override, YES only: the market's own track record
        // at this bucket says these contracts win more often than the
        // bid implies.
        if edge_gone && trade.side == Side::Yes {
            if let Some(cal) = &view.calibration {
                if cal.n >= self.config.cal_confirms_min_n as i64
                    && cal.empirical_win_rate > view.sell_now
                {
                    signals.push("cal_confirms".to_string());
                    edge_gone = false;
                }
            }
        }

        if edge_gone {
            signals.push("edge_gone".to_string());
            return Decision {
                recommendation: Recommendation::EdgeGone,
                signals,
                ev_advantage,
            };
        }

        // Take-profit signal set.
        let obs_signals = self.observation_take_profit_signals(trade, view);
        let market_signals = self.market_take_profit_signals(trade, view);
        let fired = !obs_signals.is_empty() || !market_signals.is_empty();
        if !obs_signals.is_empty() && !market_signals.is_empty() {
            signals.push("combined_obs_market".to_string());
        }
        signals.extend(obs_signals);
        signals.extend(market_signals);

        if fired {
            return Decision {
                recommendation: Recommendation::TakeProfit,
                signals,
                ev_advantage,
            };
        }

        Decision {
            recommendation: Recommendation::Hold,
            signals,
            ev_advantage,
        }
    }

    /// Guaranteed win/loss from the running high. Wins use the venue's
    /// blended high; losses only the declared resolution source.
    fn observation_signal(&self, trade: &TradeRow, view: &TradeView) -> Option<Recommendation> {
        let range = trade_range(trade);

        if let Some(high) = view.venue_high {
            match trade.side {
                // YES on an unbounded-upper outcome settles once the
                // high reaches the threshold.
                Side::Yes if range.yes_settled_by_high(high) => {
                    return Some(Recommendation::GuaranteedWin);
                }
                // NO settles once the high strictly clears the max.
                Side::No if range.no_settled_by_high(high) => {
                    return Some(Recommendation::GuaranteedWin);
                }
                _ => {}
            }
        }

        if let Some(res_high) = view.resolution_high {
            match trade.side {
                Side::Yes if range.no_settled_by_high(res_high) => {
                    return Some(Recommendation::GuaranteedLoss);
                }
                Side::No if range.yes_settled_by_high(res_high) => {
                    return Some(Recommendation::GuaranteedLoss);
                }
                _ => {}
            }
        }

        None
    }

    fn observation_take_profit_signals(&self, trade: &TradeRow, view: &TradeView) -> Vec<String> {
        let mut signals = Vec::new();
        let range = trade_range(trade);

        let Some(high) = view.venue_high else {
            // One market-independent spike check still applies
            if trade.side == Side::Yes
                && range.is_unbounded_upper()
                && view.sell_now >= self.config.take_profit_trigger_bid
            {
                signals.push("observation_unconfirmed_spike".to_string());
            }
            return signals;
        };

        // obs_in_range_strong: high already inside a bounded range,
        // settlement close, bid doubled.
        if trade.side == Side::Yes && range.is_bounded() {
            let inside = range.range_min.is_some_and(|lo| high >= lo)
                && range.range_max.is_some_and(|hi| high <= hi);
            if inside
                && view.hours_remaining < 4.0
                && view.sell_now > 2.0 * trade.entry_ask
            {
                signals.push("obs_in_range_strong".to_string());
            }
        }

        // obs_near_boundary_risk: the high sits within a degree of a
        // boundary while the temperature is still climbing (latest
        // reading at the high, city not yet past its peak hour).
        if let Some(latest) = view.latest_temp {
            let still_climbing = latest >= high && !view.past_peak;
            let near_boundary = [range.range_min, range.range_max]
                .iter()
                .flatten()
                .any(|b| (b - high).abs() <= BOUNDARY_RISK_DISTANCE);
            if still_climbing && near_boundary {
                signals.push("obs_near_boundary_risk".to_string());
            }
        }

        // observation_unconfirmed_spike: market pricing a crossing the
        // observations have not shown.
        if trade.side == Side::Yes && range.is_unbounded_upper() {
            let threshold = range.range_min.unwrap_or(f64::MAX);
            if view.sell_now >= self.config.take_profit_trigger_bid && high < threshold {
                signals.push("observation_unconfirmed_spike".to_string());
            }
        }

        signals
    }

    fn market_take_profit_signals(&self, trade: &TradeRow, view: &TradeView) -> Vec<String> {
        let mut signals = Vec::new();
        let entry = trade.entry_ask;

        if entry > 0.0 && view.sell_now >= 3.0 * entry {
            signals.push("bid_3x_entry".to_string());
        }

        if let Some(max_seen) = trade.max_price_seen {
            if max_seen > 1.5 * entry && view.sell_now < 0.8 * max_seen {
                signals.push("bid_declining_from_peak".to_string());
            }
        }

        if view.sell_now > 0.50 && entry < 0.20 {
            signals.push("bid_high_value".to_string());
        }

        signals
    }

    /// One full monitoring pass over the open book.
    pub async fn tick(
        &self,
        db: &SharedDb,
        adapter: &VenueAdapter,
        forecasts: &ForecastEngine,
        executor: &Executor,
        peak_hours: &PeakHourEstimator,
    ) -> Result<MonitorStats> {
        let now = Utc::now();
        let open = db.lock().unwrap().get_open_trades()?;
        let mut stats = MonitorStats {
            checked: open.len(),
            ..Default::default()
        };

        for trade in &open {
            let Some(city) = find_city(&trade.city) else {
                warn!("Trade {} references unknown city {}", trade.id, trade.city);
                continue;
            };

            // 1. Latest market price; unavailable → hold.
            let quote = match adapter.get_price(trade.venue, &trade.market_id).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(
                        "Price refresh failed for trade {} ({}): {} — holding",
                        trade.id, trade.market_id, e
                    );
                    stats.holds += 1;
                    continue;
                }
            };
            let mut spec = trade_range(trade);
            spec.bid = quote.bid;
            spec.ask = quote.ask;
            let sell_now = spec.bid_for_side(trade.side);
            let ask_for_side = spec.ask_for_side(trade.side);

            // 2. Fresh forecast probability.
            let forecast = forecasts.get(db, city, trade.target_date, now).await?;
            let probability = forecast
                .as_ref()
                .map(|f| probability_for_side(probability_for_range(f, &spec), trade.side));

            {
                let db = db.lock().unwrap();
                db.update_trade_live_state(
                    trade.id,
                    sell_now,
                    ask_for_side,
                    probability.unwrap_or(trade.entry_probability),
                )?;
            }

            let (_, resolution) = city.local_day_bounds_utc(trade.target_date);
            let hours_remaining = ((resolution - now).num_minutes() as f64 / 60.0).max(0.0);

            let station = city.station_for(trade.venue);
            let view = {
                let db = db.lock().unwrap();
                let running = db.get_running_high(&trade.city, trade.target_date, station)?;
                let wu = db.get_latest_wu_high(&trade.city, trade.target_date, station)?;
                let latest = db.get_latest_temp(&trade.city, trade.target_date, station)?;

                let in_unit = |f: f64, c: f64| match trade.range_unit {
                    TempUnit::F => f,
                    TempUnit::C => c,
                };
                let metar_high = running.as_ref().map(|h| in_unit(h.high_f, h.high_c));
                let wu_high = wu.map(|(f, c)| in_unit(f, c));
                // The WU blend applies only to the venue that resolves
                // against WU; losses gate on the declared source alone.
                let (venue_high, resolution_high) = if trade.venue.resolves_against_wu() {
                    let blended = match (metar_high, wu_high) {
                        (Some(m), Some(w)) => Some(m.max(w)),
                        (m, w) => m.or(w),
                    };
                    (blended, wu_high)
                } else {
                    (metar_high, metar_high)
                };

                TradeView {
                    sell_now,
                    ask_for_side,
                    probability,
                    hours_remaining,
                    venue_high,
                    resolution_high,
                    latest_temp: latest.map(|(f, c)| in_unit(f, c)),
                    past_peak: city.local_hour(now) > peak_hours.peak_hour(city),
                    calibration: calibration::lookup(
                        &db,
                        trade.venue,
                        spec.range_type(),
                        hours_remaining,
                        trade.entry_ask,
                    )?,
                }
            };

            let decision = self.evaluate(trade, &view);

            // Evaluator log entry, latest 500 retained.
            {
                let db = db.lock().unwrap();
                db.append_evaluator_log(
                    trade.id,
                    &json!({
                        "at": now.to_rfc3339(),
                        "bid": sell_now,
                        "ask": ask_for_side,
                        "probability": probability,
                        "ev_advantage": decision.ev_advantage,
                        "recommendation": decision.recommendation.signal_name(),
                        "signals": decision.signals.clone(),
                        "hours_remaining": hours_remaining,
                    }),
                )?;
            }

            // Action dispatch.
            match decision.recommendation {
                Recommendation::Hold => stats.holds += 1,
                Recommendation::GuaranteedWin => {
                    let high = view.venue_high.unwrap_or_default();
                    let db = db.lock().unwrap();
                    executor.resolve_won_in_place(&db, adapter, trade, high, station)?;
                    stats.resolved += 1;
                }
                Recommendation::GuaranteedLoss => {
                    // Force-dump: spread and bid-floor gates skipped.
                    let db = db.lock().unwrap();
                    executor.exit_trade(
                        &db,
                        adapter,
                        trade,
                        "guaranteed_loss",
                        sell_now,
                        ask_for_side,
                        quote.volume,
                        probability,
                        forecast.as_ref().map(|f| f.temp),
                    )?;
                    stats.exits += 1;
                }
                Recommendation::EdgeGone | Recommendation::TakeProfit => {
                    let signal = decision.recommendation.signal_name();
                    if self.config.signal_is_active(signal) {
                        let db = db.lock().unwrap();
                        executor.exit_trade(
                            &db,
                            adapter,
                            trade,
                            signal,
                            sell_now,
                            ask_for_side,
                            quote.volume,
                            probability,
                            forecast.as_ref().map(|f| f.temp),
                        )?;
                        stats.exits += 1;
                    } else {
                        info!(
                            "Monitor log-only [{}] trade {}: {} (signals: {:?})",
                            signal, trade.id, trade.range_name, decision.signals,
                        );
                        stats.holds += 1;
                    }
                }
            }
        }

        info!(
            "Monitor: {} checked, {} holds, {} exits, {} resolved",
            stats.checked, stats.holds, stats.exits, stats.resolved,
        );
        Ok(stats)
    }
}

/// Rebuild a RangeSpec view of a stored trade (prices filled by caller).
fn trade_range(trade: &TradeRow) -> RangeSpec {
    RangeSpec {
        venue: trade.venue,
        market_id: trade.market_id.clone(),
        token_id: trade.token_id.clone(),
        city: trade.city.clone(),
        target_date: trade.target_date,
        range_name: trade.range_name.clone(),
        range_min: trade.range_min,
        range_max: trade.range_max,
        range_unit: trade.range_unit,
        bid: 0.0,
        ask: 1.0,
        spread: 0.0,
        volume: 0.0,
    }
}
