use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
#[error("{0}")]
pub struct ParseConfigError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Paper,
    Shadow,
    Live,
}

impl FromStr for TradingMode {
    type Err = ParseConfigError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "shadow" => Ok(TradingMode::Shadow),
            // Live must be spelled out; anything else fails startup.
            "live" => Ok(TradingMode::Live),
            _ => Err(ParseConfigError(format!(
                "Invalid trading mode: '{}'. Must be 'paper', 'shadow' or 'live'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Shadow => write!(f, "shadow"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorMode {
    LogOnly,
    Active,
}

impl FromStr for EvaluatorMode {
    type Err = ParseConfigError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log_only" => Ok(EvaluatorMode::LogOnly),
            "active" => Ok(EvaluatorMode::Active),
            _ => Err(ParseConfigError(format!(
                "Invalid evaluator mode: '{}'. Must be 'log_only' or 'active'",
                s
            ))),
        }
    }
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Failed to parse {}", key))
}

fn parse_opt_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(s) if !s.is_empty() => Ok(Some(
            s.parse()
                .with_context(|| format!("Failed to parse {}", key))?,
        )),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // General
    pub trading_mode: TradingMode,
    pub scan_interval_minutes: u64,
    pub scan_days_ahead: u32,
    pub database_path: String,

    // Entry filters
    pub min_edge_pct: f64,
    pub max_spread: f64,
    pub max_spread_pct: f64,
    pub min_ask_price: f64,
    pub min_no_ask_price: f64,
    pub min_hours_to_resolution: f64,
    pub max_model_market_ratio: f64,

    // Sizing
    pub kelly_fraction: f64,
    pub yes_bankroll: f64,
    pub no_bankroll: f64,
    pub no_max_per_date: f64,
    pub max_bankroll_pct: f64,
    pub min_bet: f64,
    pub hard_reject_volume_pct: f64,
    pub warn_volume_pct: f64,
    pub max_volume_pct: Option<f64>,

    // Exit evaluator
    pub evaluator_mode: EvaluatorMode,
    pub active_signals: Vec<String>,
    pub take_profit_trigger_bid: f64,

    // Forecasts
    pub forecast_cache_minutes: u64,
    pub calibration_window_days: u32,
    pub min_city_stddev_samples: u32,
    pub eligibility_min_samples: u32,
    pub mae_cap_bounded_f: f64,
    pub mae_cap_bounded_c: f64,
    pub mae_cap_unbounded_f: f64,
    pub mae_cap_unbounded_c: f64,
    pub source_demotion_mae_f: f64,
    pub source_demotion_min_samples: u32,
    pub ensemble_spread_enabled: bool,
    pub ensemble_spread_floor: f64,
    pub ensemble_spread_ceiling: f64,

    // Calibration
    pub cal_blocks_min_n: u32,
    pub cal_confirms_min_n: u32,

    // Observer
    pub poll_interval_minutes: u64,
    pub fast_poll_seconds: u64,
    pub active_hours_start: u32,
    pub active_hours_end: u32,
    pub cooling_hour: u32,
    pub dynamic_peak_hour: bool,
    pub peak_hour_buffer: i64,
    pub peak_hour_min: u32,
    pub peak_hour_max: u32,
    pub peak_hour_min_samples: usize,
    pub wu_lead_max_local_hour: u32,
    pub wu_lead_min_gap_f: f64,
    pub wu_lead_min_gap_c: f64,
    pub gw_near_threshold_buffer_f: f64,
    pub gw_near_threshold_buffer_c: f64,
    pub gw_min_gap_f: f64,
    pub gw_min_gap_c: f64,
    pub gw_min_gap_split_station_f: f64,
    pub gw_min_gap_split_station_c: f64,

    // Guaranteed-win entry
    pub gw_enabled: bool,
    pub gw_min_margin_cents: f64,
    pub gw_min_ask: f64,
    pub gw_max_ask: f64,
    pub gw_max_bankroll_pct: f64,
    pub gw_require_dual_confirmation: bool,

    // Resolver
    pub resolve_interval_seconds: u64,

    // Platforms
    pub polymarket_enabled: bool,
    pub kalshi_enabled: bool,
    pub polymarket_api_url: String,
    pub kalshi_api_url: String,
    pub kalshi_fee_multiplier: f64,
    pub venue_request_timeout_secs: u64,
    pub venue_throttle_ms: u64,

    // Weather services
    pub metar_api_url: String,
    pub wu_api_url: String,
    pub nws_api_url: String,
    pub open_meteo_api_url: String,
    pub weather_request_timeout_secs: u64,
    pub wu_fast_timeout_secs: u64,
    pub wu_slow_min_spacing_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env missing

        let active_signals = env::var("ACTIVE_SIGNALS")
            .unwrap_or_else(|_| "guaranteed_loss,guaranteed_win".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            trading_mode: parse_var("TRADING_MODE", "paper")?,
            scan_interval_minutes: parse_var("SCAN_INTERVAL_MINUTES", "5")?,
            scan_days_ahead: parse_var("SCAN_DAYS_AHEAD", "3")?,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/tempedge.db".to_string()),

            min_edge_pct: parse_var("MIN_EDGE_PCT", "10")?,
            max_spread: parse_var("MAX_SPREAD", "0.15")?,
            max_spread_pct: parse_var("MAX_SPREAD_PCT", "0.50")?,
            min_ask_price: parse_var("MIN_ASK_PRICE", "0.10")?,
            min_no_ask_price: parse_var("MIN_NO_ASK_PRICE", "0.05")?,
            min_hours_to_resolution: parse_var("MIN_HOURS_TO_RESOLUTION", "8")?,
            max_model_market_ratio: parse_var("MAX_MODEL_MARKET_RATIO", "3.0")?,

            kelly_fraction: parse_var("KELLY_FRACTION", "0.5")?,
            yes_bankroll: parse_var("YES_BANKROLL", "1000")?,
            no_bankroll: parse_var("NO_BANKROLL", "1000")?,
            no_max_per_date: parse_var("NO_MAX_PER_DATE", "200")?,
            max_bankroll_pct: parse_var("MAX_BANKROLL_PCT", "0.20")?,
            min_bet: parse_var("MIN_BET", "10")?,
            hard_reject_volume_pct: parse_var("HARD_REJECT_VOLUME_PCT", "75")?,
            warn_volume_pct: parse_var("WARN_VOLUME_PCT", "50")?,
            max_volume_pct: parse_opt_var("MAX_VOLUME_PCT")?,

            evaluator_mode: parse_var("EVALUATOR_MODE", "log_only")?,
            active_signals,
            take_profit_trigger_bid: parse_var("TAKE_PROFIT_TRIGGER_BID", "0.50")?,

            forecast_cache_minutes: parse_var("FORECAST_CACHE_MINUTES", "15")?,
            calibration_window_days: parse_var("CALIBRATION_WINDOW_DAYS", "21")?,
            min_city_stddev_samples: parse_var("MIN_CITY_STDDEV_SAMPLES", "10")?,
            eligibility_min_samples: parse_var("ELIGIBILITY_MIN_SAMPLES", "5")?,
            mae_cap_bounded_f: parse_var("MAE_CAP_BOUNDED_F", "2.5")?,
            mae_cap_bounded_c: parse_var("MAE_CAP_BOUNDED_C", "1.5")?,
            mae_cap_unbounded_f: parse_var("MAE_CAP_UNBOUNDED_F", "4.0")?,
            mae_cap_unbounded_c: parse_var("MAE_CAP_UNBOUNDED_C", "2.0")?,
            source_demotion_mae_f: parse_var("SOURCE_DEMOTION_MAE_F", "5.0")?,
            source_demotion_min_samples: parse_var("SOURCE_DEMOTION_MIN_SAMPLES", "5")?,
            ensemble_spread_enabled: parse_var("ENSEMBLE_SPREAD_ENABLED", "false")?,
            ensemble_spread_floor: parse_var("ENSEMBLE_SPREAD_FLOOR", "1.0")?,
            ensemble_spread_ceiling: parse_var("ENSEMBLE_SPREAD_CEILING", "1.5")?,

            cal_blocks_min_n: parse_var("CAL_BLOCKS_MIN_N", "25")?,
            cal_confirms_min_n: parse_var("CAL_CONFIRMS_MIN_N", "50")?,

            poll_interval_minutes: parse_var("POLL_INTERVAL_MINUTES", "10")?,
            fast_poll_seconds: parse_var("FAST_POLL_SECONDS", "20")?,
            active_hours_start: parse_var("ACTIVE_HOURS_START", "6")?,
            active_hours_end: parse_var("ACTIVE_HOURS_END", "23")?,
            cooling_hour: parse_var("COOLING_HOUR", "17")?,
            dynamic_peak_hour: parse_var("DYNAMIC_PEAK_HOUR", "true")?,
            peak_hour_buffer: parse_var("PEAK_HOUR_BUFFER", "2")?,
            peak_hour_min: parse_var("PEAK_HOUR_MIN", "14")?,
            peak_hour_max: parse_var("PEAK_HOUR_MAX", "20")?,
            peak_hour_min_samples: parse_var("PEAK_HOUR_MIN_SAMPLES", "3")?,
            wu_lead_max_local_hour: parse_var("WU_LEAD_MAX_LOCAL_HOUR", "12")?,
            wu_lead_min_gap_f: parse_var("WU_LEAD_MIN_GAP_F", "2.5")?,
            wu_lead_min_gap_c: parse_var("WU_LEAD_MIN_GAP_C", "1.5")?,
            gw_near_threshold_buffer_f: parse_var("GW_NEAR_THRESHOLD_BUFFER_F", "1.0")?,
            gw_near_threshold_buffer_c: parse_var("GW_NEAR_THRESHOLD_BUFFER_C", "0.5")?,
            gw_min_gap_f: parse_var("GW_MIN_GAP_F", "0.5")?,
            gw_min_gap_c: parse_var("GW_MIN_GAP_C", "0.5")?,
            gw_min_gap_split_station_f: parse_var("GW_MIN_GAP_SPLIT_STATION_F", "1.5")?,
            gw_min_gap_split_station_c: parse_var("GW_MIN_GAP_SPLIT_STATION_C", "0.8")?,

            gw_enabled: parse_var("GW_ENABLED", "true")?,
            gw_min_margin_cents: parse_var("GW_MIN_MARGIN_CENTS", "5")?,
            gw_min_ask: parse_var("GW_MIN_ASK", "0.30")?,
            gw_max_ask: parse_var("GW_MAX_ASK", "0.97")?,
            gw_max_bankroll_pct: parse_var("GW_MAX_BANKROLL_PCT", "0.15")?,
            gw_require_dual_confirmation: parse_var("GW_REQUIRE_DUAL_CONFIRMATION", "true")?,

            resolve_interval_seconds: parse_var("RESOLVE_INTERVAL_SECONDS", "60")?,

            polymarket_enabled: parse_var("POLYMARKET_ENABLED", "true")?,
            kalshi_enabled: parse_var("KALSHI_ENABLED", "true")?,
            polymarket_api_url: env::var("POLYMARKET_API_URL")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            kalshi_api_url: env::var("KALSHI_API_URL")
                .unwrap_or_else(|_| "https://api.elections.kalshi.com/trade-api/v2".to_string()),
            kalshi_fee_multiplier: parse_var("KALSHI_FEE_MULTIPLIER", "0.07")?,
            venue_request_timeout_secs: parse_var("VENUE_REQUEST_TIMEOUT_SECS", "15")?,
            venue_throttle_ms: parse_var("VENUE_THROTTLE_MS", "125")?,

            metar_api_url: env::var("METAR_API_URL")
                .unwrap_or_else(|_| "https://aviationweather.gov/api/data/metar".to_string()),
            wu_api_url: env::var("WU_API_URL")
                .unwrap_or_else(|_| "https://api.weather.com/v2".to_string()),
            nws_api_url: env::var("NWS_API_URL")
                .unwrap_or_else(|_| "https://api.weather.gov".to_string()),
            open_meteo_api_url: env::var("OPEN_METEO_API_URL")
                .unwrap_or_else(|_| "https://api.open-meteo.com/v1".to_string()),
            weather_request_timeout_secs: parse_var("WEATHER_REQUEST_TIMEOUT_SECS", "10")?,
            wu_fast_timeout_secs: parse_var("WU_FAST_TIMEOUT_SECS", "3")?,
            wu_slow_min_spacing_ms: parse_var("WU_SLOW_MIN_SPACING_MS", "2500")?,
        })
    }

    /// Minimum edge as a price fraction (MIN_EDGE_PCT is in percentage
    /// points).
    pub fn min_edge(&self) -> f64 {
        self.min_edge_pct / 100.0
    }

    pub fn signal_is_active(&self, signal: &str) -> bool {
        self.evaluator_mode == EvaluatorMode::Active
            || self.active_signals.iter().any(|s| s == signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.trading_mode, TradingMode::Paper);
        assert_eq!(config.scan_interval_minutes, 5);
        assert_eq!(config.min_edge_pct, 10.0);
        assert_eq!(config.max_spread, 0.15);
        assert_eq!(config.max_spread_pct, 0.50);
        assert_eq!(config.min_ask_price, 0.10);
        assert_eq!(config.min_no_ask_price, 0.05);
        assert_eq!(config.min_hours_to_resolution, 8.0);
        assert_eq!(config.max_model_market_ratio, 3.0);
        assert_eq!(config.kelly_fraction, 0.5);
        assert_eq!(config.yes_bankroll, 1000.0);
        assert_eq!(config.no_max_per_date, 200.0);
        assert_eq!(config.max_bankroll_pct, 0.20);
        assert_eq!(config.min_bet, 10.0);
        assert_eq!(config.hard_reject_volume_pct, 75.0);
        assert!(config.max_volume_pct.is_none());
        assert_eq!(config.evaluator_mode, EvaluatorMode::LogOnly);
        assert_eq!(
            config.active_signals,
            vec!["guaranteed_loss".to_string(), "guaranteed_win".to_string()]
        );
        assert_eq!(config.forecast_cache_minutes, 15);
        assert_eq!(config.calibration_window_days, 21);
        assert_eq!(config.cal_blocks_min_n, 25);
        assert_eq!(config.cal_confirms_min_n, 50);
        assert_eq!(config.gw_min_margin_cents, 5.0);
        assert_eq!(config.gw_min_ask, 0.30);
        assert_eq!(config.gw_max_ask, 0.97);
        assert_eq!(config.gw_max_bankroll_pct, 0.15);
        assert!(config.gw_require_dual_confirmation);
        assert_eq!(config.kalshi_fee_multiplier, 0.07);
        assert_eq!(config.active_hours_start, 6);
        assert_eq!(config.active_hours_end, 23);
        assert_eq!(config.cooling_hour, 17);
        assert_eq!(config.peak_hour_min, 14);
        assert_eq!(config.peak_hour_max, 20);
        assert_eq!(config.wu_lead_min_gap_f, 2.5);
    }

    #[test]
    fn test_trading_mode_parsing() {
        assert_eq!("paper".parse::<TradingMode>().unwrap(), TradingMode::Paper);
        assert_eq!(
            "shadow".parse::<TradingMode>().unwrap(),
            TradingMode::Shadow
        );
        assert_eq!("LIVE".parse::<TradingMode>().unwrap(), TradingMode::Live);
        assert!("yolo".parse::<TradingMode>().is_err());
    }

    #[test]
    fn test_evaluator_mode_parsing() {
        assert_eq!(
            "log_only".parse::<EvaluatorMode>().unwrap(),
            EvaluatorMode::LogOnly
        );
        assert_eq!(
            "active".parse::<EvaluatorMode>().unwrap(),
            EvaluatorMode::Active
        );
        assert!("maybe".parse::<EvaluatorMode>().is_err());
    }

    #[test]
    fn test_min_edge_fraction() {
        let config = Config::from_env().unwrap();
        assert!((config.min_edge() - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn test_signal_allow_list() {
        let mut config = Config::from_env().unwrap();
        config.evaluator_mode = EvaluatorMode::LogOnly;
        assert!(config.signal_is_active("guaranteed_loss"));
        assert!(config.signal_is_active("guaranteed_win"));
        assert!(!config.signal_is_active("edge_gone"));

        config.evaluator_mode = EvaluatorMode::Active;
        assert!(config.signal_is_active("edge_gone"));
    }
}
