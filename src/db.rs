use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use std::path::Path;

use crate::range::{RangeType, Side, TempUnit, Venue};

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: i64,
    pub city: String,
    pub target_date: NaiveDate,
    pub venue: Venue,
    pub range_name: String,
    pub side: Side,
    pub status: String,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub range_unit: TempUnit,
    pub market_id: String,
    pub token_id: String,
    pub entry_ask: f64,
    pub entry_bid: f64,
    pub entry_spread: f64,
    pub entry_volume: f64,
    pub shares: i64,
    pub cost: f64,
    pub entry_probability: f64,
    pub entry_edge_pct: f64,
    pub entry_kelly: f64,
    pub entry_forecast_temp: Option<f64>,
    pub entry_forecast_confidence: Option<String>,
    pub entry_ensemble: Option<String>,
    pub pct_of_volume: f64,
    pub hours_to_resolution: f64,
    pub entry_reason: String,
    pub wu_triggered: bool,
    pub dual_confirmed: bool,
    pub observation_high: Option<f64>,
    pub wu_high: Option<f64>,
    pub current_bid: Option<f64>,
    pub current_ask: Option<f64>,
    pub current_probability: Option<f64>,
    pub max_price_seen: Option<f64>,
    pub min_probability_seen: Option<f64>,
}

/// Entry-state fields for a new open trade. Live/exit/resolution state
/// starts empty.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub city: String,
    pub target_date: NaiveDate,
    pub venue: Venue,
    pub range_name: String,
    pub side: Side,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub range_unit: TempUnit,
    pub market_id: String,
    pub token_id: String,
    pub entry_ask: f64,
    pub entry_bid: f64,
    pub entry_spread: f64,
    pub entry_volume: f64,
    pub shares: i64,
    pub cost: f64,
    pub entry_probability: f64,
    pub entry_edge_pct: f64,
    pub entry_kelly: f64,
    pub entry_forecast_temp: Option<f64>,
    pub entry_forecast_confidence: Option<String>,
    pub entry_ensemble: Option<String>,
    pub pct_of_volume: f64,
    pub hours_to_resolution: f64,
    pub entry_reason: String,
    pub wu_triggered: bool,
    pub dual_confirmed: bool,
    pub observation_high: Option<f64>,
    pub wu_high: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewOpportunity {
    pub city: String,
    pub target_date: NaiveDate,
    pub venue: Venue,
    pub range_name: String,
    pub side: Side,
    pub range_type: RangeType,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub range_unit: TempUnit,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
    pub probability: f64,
    pub edge: f64,
    pub forecast_temp: f64,
    pub forecast_std_dev: f64,
    pub forecast_confidence: String,
    pub forecast_sources: String,
    pub hours_to_resolution: f64,
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpportunityOutcomeRow {
    pub id: i64,
    pub city: String,
    pub target_date: NaiveDate,
    pub venue: Venue,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub side: Side,
}

#[derive(Debug, Clone)]
pub struct ResolvedOpportunityRow {
    pub venue: Venue,
    pub range_type: RangeType,
    pub ask: f64,
    pub hours_to_resolution: f64,
    pub would_have_won: bool,
}

#[derive(Debug, Clone)]
pub struct RunningHigh {
    pub high_f: f64,
    pub high_c: f64,
    pub observation_count: i64,
}

#[derive(Debug, Clone)]
pub struct PendingEventRow {
    pub id: i64,
    pub city: String,
    pub target_date: NaiveDate,
    pub venue: Venue,
    pub range_name: String,
    pub side: Side,
    pub metar_high: f64,
    pub wu_high: Option<f64>,
    pub metar_gap: f64,
    pub ask_at_detection: f64,
    pub poll_source: String,
    pub wu_triggered: bool,
    pub wu_confirmed_at: Option<String>,
    pub market_repriced_at: Option<String>,
    pub kalshi_market_repriced_at: Option<String>,
    pub metar_confirmed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CalibrationRow {
    pub venue: Venue,
    pub range_type: RangeType,
    pub lead_time_bucket: String,
    pub price_bucket: String,
    pub wins: i64,
    pub n: i64,
    pub empirical_win_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ForecastErrorStats {
    pub mae: f64,
    pub n: u32,
}

/// Handle shared across the async pipelines. The lock is held only
/// around synchronous statements, never across an await point.
pub type SharedDb = std::sync::Arc<std::sync::Mutex<Database>>;

pub fn shared(db: Database) -> SharedDb {
    std::sync::Arc::new(std::sync::Mutex::new(db))
}

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database: {}", path))?;

        let db = Database { conn };
        db.run_migrations()?;
        db.enable_wal()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn enable_wal(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                venue TEXT NOT NULL,
                range_name TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                range_min REAL,
                range_max REAL,
                range_unit TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                entry_ask REAL NOT NULL,
                entry_bid REAL NOT NULL,
                entry_spread REAL NOT NULL,
                entry_volume REAL NOT NULL,
                shares INTEGER NOT NULL,
                cost REAL NOT NULL,
                entry_probability REAL NOT NULL,
                entry_edge_pct REAL NOT NULL,
                entry_kelly REAL NOT NULL,
                entry_forecast_temp REAL,
                entry_forecast_confidence TEXT,
                entry_ensemble TEXT,
                pct_of_volume REAL NOT NULL DEFAULT 0.0,
                hours_to_resolution REAL NOT NULL,
                entry_reason TEXT NOT NULL DEFAULT 'model',
                wu_triggered INTEGER NOT NULL DEFAULT 0,
                dual_confirmed INTEGER NOT NULL DEFAULT 0,
                observation_high REAL,
                wu_high REAL,
                current_bid REAL,
                current_ask REAL,
                current_probability REAL,
                max_price_seen REAL,
                min_probability_seen REAL,
                evaluator_log TEXT,
                exit_reason TEXT,
                exit_price REAL,
                exit_bid REAL,
                exit_ask REAL,
                exit_spread REAL,
                exit_volume REAL,
                exit_probability REAL,
                exit_forecast_temp REAL,
                exited_at TEXT,
                actual_temp REAL,
                won INTEGER,
                pnl REAL,
                fees REAL,
                resolved_at TEXT,
                resolution_station TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_open_dedup
                ON trades(city, target_date, venue, range_name, side)
                WHERE status = 'open';

            CREATE TABLE IF NOT EXISTS opportunities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                venue TEXT NOT NULL,
                range_name TEXT NOT NULL,
                side TEXT NOT NULL,
                range_type TEXT NOT NULL,
                range_min REAL,
                range_max REAL,
                range_unit TEXT NOT NULL,
                bid REAL NOT NULL,
                ask REAL NOT NULL,
                spread REAL NOT NULL,
                volume REAL NOT NULL,
                probability REAL NOT NULL,
                edge REAL NOT NULL,
                forecast_temp REAL NOT NULL,
                forecast_std_dev REAL NOT NULL,
                forecast_confidence TEXT NOT NULL,
                forecast_sources TEXT NOT NULL,
                hours_to_resolution REAL NOT NULL,
                accepted INTEGER NOT NULL DEFAULT 0,
                reject_reason TEXT,
                trade_id INTEGER REFERENCES trades(id),
                actual_temp REAL,
                would_have_won INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS metar_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                station_id TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                temp_c REAL NOT NULL,
                temp_f REAL NOT NULL,
                running_high_c REAL NOT NULL,
                running_high_f REAL NOT NULL,
                wu_high_f REAL,
                wu_high_c REAL,
                observation_count INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, target_date, station_id, observed_at)
            );

            CREATE TABLE IF NOT EXISTS metar_pending_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                venue TEXT NOT NULL,
                range_name TEXT NOT NULL,
                side TEXT NOT NULL,
                metar_high REAL NOT NULL,
                wu_high REAL,
                metar_gap REAL NOT NULL,
                ask_at_detection REAL NOT NULL,
                orderbook TEXT,
                other_orderbook TEXT,
                poll_source TEXT NOT NULL DEFAULT 'regular',
                wu_triggered INTEGER NOT NULL DEFAULT 0,
                wu_confirmed_at TEXT,
                market_repriced_at TEXT,
                kalshi_market_repriced_at TEXT,
                metar_confirmed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, target_date, venue, range_name, side)
            );

            CREATE TABLE IF NOT EXISTS wu_leads_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                station_id TEXT NOT NULL,
                wu_high REAL NOT NULL,
                metar_high REAL NOT NULL,
                gap REAL NOT NULL,
                local_hour INTEGER NOT NULL,
                metar_confirmed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, target_date, station_id)
            );

            CREATE TABLE IF NOT EXISTS forecast_accuracy (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                source TEXT NOT NULL,
                forecast_temp REAL NOT NULL,
                actual_temp REAL NOT NULL,
                error REAL NOT NULL,
                abs_error REAL NOT NULL,
                unit TEXT NOT NULL,
                hours_before_resolution REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, target_date, source)
            );

            CREATE TABLE IF NOT EXISTS market_calibration (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                venue TEXT NOT NULL,
                range_type TEXT NOT NULL,
                lead_time_bucket TEXT NOT NULL,
                price_bucket TEXT NOT NULL,
                wins INTEGER NOT NULL DEFAULT 0,
                n INTEGER NOT NULL DEFAULT 0,
                empirical_win_rate REAL NOT NULL DEFAULT 0.0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(venue, range_type, lead_time_bucket, price_bucket)
            );

            CREATE TABLE IF NOT EXISTS wu_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                station_id TEXT NOT NULL,
                target_date TEXT NOT NULL,
                high_f REAL,
                high_c REAL,
                source_tag TEXT NOT NULL,
                observation_count INTEGER,
                fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, station_id, target_date)
            );

            CREATE TABLE IF NOT EXISTS cli_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                station_id TEXT NOT NULL,
                target_date TEXT NOT NULL,
                high_f REAL,
                high_c REAL,
                source_tag TEXT NOT NULL,
                observation_count INTEGER,
                fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, station_id, target_date)
            );
            ",
            )
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ── Trades ──

    pub fn insert_trade(&self, t: &NewTrade) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO trades (
                city, target_date, venue, range_name, side, status,
                range_min, range_max, range_unit, market_id, token_id,
                entry_ask, entry_bid, entry_spread, entry_volume, shares, cost,
                entry_probability, entry_edge_pct, entry_kelly,
                entry_forecast_temp, entry_forecast_confidence, entry_ensemble,
                pct_of_volume, hours_to_resolution, entry_reason,
                wu_triggered, dual_confirmed, observation_high, wu_high
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, 'open',
                ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19,
                ?20, ?21, ?22,
                ?23, ?24, ?25,
                ?26, ?27, ?28, ?29
            )",
                rusqlite::params![
                    t.city,
                    t.target_date.to_string(),
                    t.venue.as_str(),
                    t.range_name,
                    t.side.as_str(),
                    t.range_min,
                    t.range_max,
                    t.range_unit.to_string(),
                    t.market_id,
                    t.token_id,
                    t.entry_ask,
                    t.entry_bid,
                    t.entry_spread,
                    t.entry_volume,
                    t.shares,
                    t.cost,
                    t.entry_probability,
                    t.entry_edge_pct,
                    t.entry_kelly,
                    t.entry_forecast_temp,
                    t.entry_forecast_confidence,
                    t.entry_ensemble,
                    t.pct_of_volume,
                    t.hours_to_resolution,
                    t.entry_reason,
                    t.wu_triggered,
                    t.dual_confirmed,
                    t.observation_high,
                    t.wu_high,
                ],
            )
            .context("Failed to insert trade")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
        let date_str: String = row.get("target_date")?;
        let venue_str: String = row.get("venue")?;
        let side_str: String = row.get("side")?;
        let unit_str: String = row.get("range_unit")?;
        Ok(TradeRow {
            id: row.get("id")?,
            city: row.get("city")?,
            target_date: date_str.parse().unwrap_or_default(),
            venue: venue_str.parse().unwrap_or(Venue::Polymarket),
            range_name: row.get("range_name")?,
            side: side_str.parse().unwrap_or(Side::Yes),
            status: row.get("status")?,
            range_min: row.get("range_min")?,
            range_max: row.get("range_max")?,
            range_unit: unit_str.parse().unwrap_or(TempUnit::F),
            market_id: row.get("market_id")?,
            token_id: row.get("token_id")?,
            entry_ask: row.get("entry_ask")?,
            entry_bid: row.get("entry_bid")?,
            entry_spread: row.get("entry_spread")?,
            entry_volume: row.get("entry_volume")?,
            shares: row.get("shares")?,
            cost: row.get("cost")?,
            entry_probability: row.get("entry_probability")?,
            entry_edge_pct: row.get("entry_edge_pct")?,
            entry_kelly: row.get("entry_kelly")?,
            entry_forecast_temp: row.get("entry_forecast_temp")?,
            entry_forecast_confidence: row.get("entry_forecast_confidence")?,
            entry_ensemble: row.get("entry_ensemble")?,
            pct_of_volume: row.get("pct_of_volume")?,
            hours_to_resolution: row.get("hours_to_resolution")?,
            entry_reason: row.get("entry_reason")?,
            wu_triggered: row.get("wu_triggered")?,
            dual_confirmed: row.get("dual_confirmed")?,
            observation_high: row.get("observation_high")?,
            wu_high: row.get("wu_high")?,
            current_bid: row.get("current_bid")?,
            current_ask: row.get("current_ask")?,
            current_probability: row.get("current_probability")?,
            max_price_seen: row.get("max_price_seen")?,
            min_probability_seen: row.get("min_probability_seen")?,
        })
    }

    pub fn get_open_trades(&self) -> Result<Vec<TradeRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM trades WHERE status = 'open' ORDER BY id")
            .context("Failed to prepare open trades query")?;
        let rows = stmt
            .query_map([], Self::trade_from_row)
            .context("Failed to query open trades")?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.context("Failed to read trade row")?);
        }
        Ok(trades)
    }

    pub fn get_trade(&self, id: i64) -> Result<TradeRow> {
        self.conn
            .query_row(
                "SELECT * FROM trades WHERE id = ?1",
                [id],
                Self::trade_from_row,
            )
            .context("Failed to get trade")
    }

    pub fn has_open_trade(
        &self,
        city: &str,
        target_date: NaiveDate,
        venue: Venue,
        range_name: &str,
        side: Side,
    ) -> bool {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trades
                 WHERE city = ?1 AND target_date = ?2 AND venue = ?3
                   AND range_name = ?4 AND side = ?5 AND status = 'open'",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    venue.as_str(),
                    range_name,
                    side.as_str()
                ],
                |row| row.get(0),
            )
            .unwrap_or(0);
        count > 0
    }

    /// Aggregate cost of open NO trades for one target date, across all
    /// cities and venues. Drives the per-date NO exposure cap.
    pub fn open_no_cost_for_date(&self, target_date: NaiveDate) -> Result<f64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM trades
                 WHERE side = 'NO' AND status = 'open' AND target_date = ?1",
                [target_date.to_string()],
                |row| row.get(0),
            )
            .context("Failed to sum open NO cost")
    }

    pub fn open_cost_for_side(&self, side: Side) -> Result<f64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM trades
                 WHERE side = ?1 AND status = 'open'",
                [side.as_str()],
                |row| row.get(0),
            )
            .context("Failed to sum open cost")
    }

    pub fn update_trade_live_state(
        &self,
        id: i64,
        current_bid: f64,
        current_ask: f64,
        current_probability: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE trades SET
                    current_bid = ?1,
                    current_ask = ?2,
                    current_probability = ?3,
                    max_price_seen = MAX(COALESCE(max_price_seen, 0.0), ?1),
                    min_probability_seen = MIN(COALESCE(min_probability_seen, 1.0), ?3)
                 WHERE id = ?4 AND status = 'open'",
                rusqlite::params![current_bid, current_ask, current_probability, id],
            )
            .context("Failed to update trade live state")?;
        Ok(())
    }

    /// Append one decision record to the trade's evaluator log, keeping
    /// only the latest 500 entries.
    pub fn append_evaluator_log(&self, id: i64, entry: &serde_json::Value) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row("SELECT evaluator_log FROM trades WHERE id = ?1", [id], |r| {
                r.get(0)
            })
            .context("Failed to read evaluator log")?;

        let mut log: Vec<serde_json::Value> = existing
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        log.push(entry.clone());
        let excess = log.len().saturating_sub(500);
        if excess > 0 {
            log.drain(..excess);
        }

        self.conn
            .execute(
                "UPDATE trades SET evaluator_log = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&log)?, id],
            )
            .context("Failed to write evaluator log")?;
        Ok(())
    }

    pub fn evaluator_log_len(&self, id: i64) -> Result<usize> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT evaluator_log FROM trades WHERE id = ?1", [id], |r| {
                r.get(0)
            })
            .context("Failed to read evaluator log")?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<Vec<serde_json::Value>>(&s).ok())
            .map(|v| v.len())
            .unwrap_or(0))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn exit_trade(
        &self,
        id: i64,
        exit_reason: &str,
        exit_price: f64,
        exit_bid: f64,
        exit_ask: f64,
        exit_spread: f64,
        exit_volume: f64,
        exit_probability: Option<f64>,
        exit_forecast_temp: Option<f64>,
        pnl: f64,
        fees: f64,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE trades SET
                    status = 'exited', exit_reason = ?1, exit_price = ?2,
                    exit_bid = ?3, exit_ask = ?4, exit_spread = ?5,
                    exit_volume = ?6, exit_probability = ?7,
                    exit_forecast_temp = ?8, pnl = ?9, fees = ?10,
                    exited_at = datetime('now')
                 WHERE id = ?11 AND status = 'open'",
                rusqlite::params![
                    exit_reason,
                    exit_price,
                    exit_bid,
                    exit_ask,
                    exit_spread,
                    exit_volume,
                    exit_probability,
                    exit_forecast_temp,
                    pnl,
                    fees,
                    id
                ],
            )
            .context("Failed to exit trade")?;
        if changed == 0 {
            anyhow::bail!("Trade {} is not open", id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn resolve_trade(
        &self,
        id: i64,
        actual_temp: f64,
        won: bool,
        pnl: f64,
        fees: f64,
        resolution_station: &str,
        exit_reason: Option<&str>,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE trades SET
                    status = 'resolved', actual_temp = ?1, won = ?2,
                    pnl = ?3, fees = ?4, resolution_station = ?5,
                    exit_reason = COALESCE(?6, exit_reason),
                    resolved_at = datetime('now')
                 WHERE id = ?7 AND status = 'open'",
                rusqlite::params![actual_temp, won, pnl, fees, resolution_station, exit_reason, id],
            )
            .context("Failed to resolve trade")?;
        if changed == 0 {
            anyhow::bail!("Trade {} is not open", id);
        }
        Ok(())
    }

    /// A temperature an earlier trade in the same (city, date, venue)
    /// group already resolved against. Reusing it keeps one cycle's
    /// resolutions consistent.
    pub fn get_resolved_actual_temp(
        &self,
        city: &str,
        target_date: NaiveDate,
        venue: Venue,
    ) -> Result<Option<(f64, String)>> {
        let result = self.conn.query_row(
            "SELECT actual_temp, COALESCE(resolution_station, '') FROM trades
             WHERE city = ?1 AND target_date = ?2 AND venue = ?3
               AND status = 'resolved' AND actual_temp IS NOT NULL
             ORDER BY resolved_at DESC LIMIT 1",
            rusqlite::params![city, target_date.to_string(), venue.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get resolved actual temp"),
        }
    }

    // ── Opportunities ──

    pub fn insert_opportunity(&self, o: &NewOpportunity) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO opportunities (
                city, target_date, venue, range_name, side, range_type,
                range_min, range_max, range_unit, bid, ask, spread, volume,
                probability, edge, forecast_temp, forecast_std_dev,
                forecast_confidence, forecast_sources, hours_to_resolution,
                accepted, reject_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                rusqlite::params![
                    o.city,
                    o.target_date.to_string(),
                    o.venue.as_str(),
                    o.range_name,
                    o.side.as_str(),
                    o.range_type.as_str(),
                    o.range_min,
                    o.range_max,
                    o.range_unit.to_string(),
                    o.bid,
                    o.ask,
                    o.spread,
                    o.volume,
                    o.probability,
                    o.edge,
                    o.forecast_temp,
                    o.forecast_std_dev,
                    o.forecast_confidence,
                    o.forecast_sources,
                    o.hours_to_resolution,
                    o.accepted,
                    o.reject_reason,
                ],
            )
            .context("Failed to insert opportunity")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn link_opportunity_trade(&self, opportunity_id: i64, trade_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE opportunities SET trade_id = ?1 WHERE id = ?2",
                rusqlite::params![trade_id, opportunity_id],
            )
            .context("Failed to link opportunity to trade")?;
        Ok(())
    }

    /// Opportunities with no recorded outcome whose target date is older
    /// than the cutoff, oldest first, capped.
    pub fn get_unresolved_opportunities(
        &self,
        cutoff: NaiveDate,
        limit: i64,
    ) -> Result<Vec<OpportunityOutcomeRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, city, target_date, venue, range_min, range_max, side
                 FROM opportunities
                 WHERE actual_temp IS NULL AND target_date < ?1
                 ORDER BY target_date ASC, id ASC
                 LIMIT ?2",
            )
            .context("Failed to prepare unresolved opportunities query")?;
        let rows = stmt
            .query_map(rusqlite::params![cutoff.to_string(), limit], |row| {
                let date_str: String = row.get(2)?;
                let venue_str: String = row.get(3)?;
                let side_str: String = row.get(6)?;
                Ok(OpportunityOutcomeRow {
                    id: row.get(0)?,
                    city: row.get(1)?,
                    target_date: date_str.parse().unwrap_or_default(),
                    venue: venue_str.parse().unwrap_or(Venue::Polymarket),
                    range_min: row.get(4)?,
                    range_max: row.get(5)?,
                    side: side_str.parse().unwrap_or(Side::Yes),
                })
            })
            .context("Failed to query unresolved opportunities")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read opportunity row")?);
        }
        Ok(out)
    }

    pub fn set_opportunity_outcome(
        &self,
        id: i64,
        actual_temp: f64,
        would_have_won: bool,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE opportunities SET actual_temp = ?1, would_have_won = ?2 WHERE id = ?3",
                rusqlite::params![actual_temp, would_have_won, id],
            )
            .context("Failed to set opportunity outcome")?;
        Ok(())
    }

    /// Resolved YES-side opportunities, the input to calibration.
    pub fn get_resolved_yes_opportunities(&self) -> Result<Vec<ResolvedOpportunityRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT venue, range_type, ask, hours_to_resolution, would_have_won
                 FROM opportunities
                 WHERE side = 'YES' AND would_have_won IS NOT NULL",
            )
            .context("Failed to prepare resolved opportunities query")?;
        let rows = stmt
            .query_map([], |row| {
                let venue_str: String = row.get(0)?;
                let rt_str: String = row.get(1)?;
                Ok(ResolvedOpportunityRow {
                    venue: venue_str.parse().unwrap_or(Venue::Polymarket),
                    range_type: rt_str.parse().unwrap_or(RangeType::Bounded),
                    ask: row.get(2)?,
                    hours_to_resolution: row.get(3)?,
                    would_have_won: row.get(4)?,
                })
            })
            .context("Failed to query resolved opportunities")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read resolved opportunity")?);
        }
        Ok(out)
    }

    // ── Observations ──

    /// Insert an observation row. The running high is the greatest of
    /// the stored high and the new station reading; the upsert keeps it
    /// monotone under concurrent writers. The crowd high rides along in
    /// its own columns — blending it in per venue happens at read time,
    /// so a shared-station city cannot leak WU into the venue that
    /// resolves against the airport.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_observation(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
        observed_at: &str,
        temp_c: f64,
        temp_f: f64,
        wu_high_f: Option<f64>,
        wu_high_c: Option<f64>,
    ) -> Result<RunningHigh> {
        let prior = self.get_running_high(city, target_date, station_id)?;
        let prior_f = prior.as_ref().map(|h| h.high_f).unwrap_or(f64::MIN);
        let prior_c = prior.as_ref().map(|h| h.high_c).unwrap_or(f64::MIN);
        let count = prior.as_ref().map(|h| h.observation_count).unwrap_or(0) + 1;

        let running_f = temp_f.max(prior_f);
        let running_c = temp_c.max(prior_c);

        self.conn
            .execute(
                "INSERT INTO metar_observations (
                    city, target_date, station_id, observed_at,
                    temp_c, temp_f, running_high_c, running_high_f,
                    wu_high_f, wu_high_c, observation_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(city, target_date, station_id, observed_at) DO UPDATE SET
                    running_high_c = MAX(running_high_c, excluded.running_high_c),
                    running_high_f = MAX(running_high_f, excluded.running_high_f),
                    wu_high_f = COALESCE(excluded.wu_high_f, wu_high_f),
                    wu_high_c = COALESCE(excluded.wu_high_c, wu_high_c)",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    station_id,
                    observed_at,
                    temp_c,
                    temp_f,
                    running_c,
                    running_f,
                    wu_high_f,
                    wu_high_c,
                ],
            )
            .context("Failed to upsert observation")?;

        Ok(RunningHigh {
            high_f: running_f,
            high_c: running_c,
            observation_count: count,
        })
    }

    pub fn get_running_high(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
    ) -> Result<Option<RunningHigh>> {
        let result = self.conn.query_row(
            "SELECT MAX(running_high_f), MAX(running_high_c), COUNT(*)
             FROM metar_observations
             WHERE city = ?1 AND target_date = ?2 AND station_id = ?3",
            rusqlite::params![city, target_date.to_string(), station_id],
            |row| {
                let f: Option<f64> = row.get(0)?;
                let c: Option<f64> = row.get(1)?;
                let n: i64 = row.get(2)?;
                Ok(f.zip(c).map(|(high_f, high_c)| RunningHigh {
                    high_f,
                    high_c,
                    observation_count: n,
                }))
            },
        );
        result.context("Failed to get running high")
    }

    /// Latest crowd-reported high folded into this station's rows, in
    /// both units. The declared-resolution-source check for guaranteed
    /// losses reads this, never the blended running high.
    pub fn get_latest_wu_high(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
    ) -> Result<Option<(f64, f64)>> {
        self.conn
            .query_row(
                "SELECT MAX(wu_high_f), MAX(wu_high_c) FROM metar_observations
                 WHERE city = ?1 AND target_date = ?2 AND station_id = ?3",
                rusqlite::params![city, target_date.to_string(), station_id],
                |row| {
                    let f: Option<f64> = row.get(0)?;
                    let c: Option<f64> = row.get(1)?;
                    Ok(f.zip(c))
                },
            )
            .context("Failed to get latest WU high")
    }

    /// The most recent raw reading for a station, used to judge whether
    /// the temperature is still climbing.
    pub fn get_latest_temp(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
    ) -> Result<Option<(f64, f64)>> {
        let result = self.conn.query_row(
            "SELECT temp_f, temp_c FROM metar_observations
             WHERE city = ?1 AND target_date = ?2 AND station_id = ?3
             ORDER BY observed_at DESC LIMIT 1",
            rusqlite::params![city, target_date.to_string(), station_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get latest temp"),
        }
    }

    /// Timestamps of observations where the reading equaled the running
    /// high at that moment, i.e. the moments the daily peak was set.
    /// Input to the peak-hour estimator.
    pub fn get_peak_observation_times(&self, city: &str, since: NaiveDate) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT observed_at FROM metar_observations
                 WHERE city = ?1 AND target_date >= ?2 AND temp_f = running_high_f
                 ORDER BY observed_at",
            )
            .context("Failed to prepare peak times query")?;
        let rows = stmt
            .query_map(rusqlite::params![city, since.to_string()], |row| {
                row.get(0)
            })
            .context("Failed to query peak times")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read peak time")?);
        }
        Ok(out)
    }

    // ── Pending events ──

    /// First-detection insert: ON CONFLICT DO NOTHING. Returns true when
    /// this call created the row, i.e. this is a fresh detection.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_pending_event(
        &self,
        city: &str,
        target_date: NaiveDate,
        venue: Venue,
        range_name: &str,
        side: Side,
        metar_high: f64,
        wu_high: Option<f64>,
        metar_gap: f64,
        ask_at_detection: f64,
        orderbook: Option<&str>,
        other_orderbook: Option<&str>,
        poll_source: &str,
        wu_triggered: bool,
    ) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO metar_pending_events (
                    city, target_date, venue, range_name, side,
                    metar_high, wu_high, metar_gap, ask_at_detection,
                    orderbook, other_orderbook, poll_source, wu_triggered
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(city, target_date, venue, range_name, side) DO NOTHING",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    venue.as_str(),
                    range_name,
                    side.as_str(),
                    metar_high,
                    wu_high,
                    metar_gap,
                    ask_at_detection,
                    orderbook,
                    other_orderbook,
                    poll_source,
                    wu_triggered,
                ],
            )
            .context("Failed to insert pending event")?;
        Ok(inserted > 0)
    }

    pub fn get_pending_events(
        &self,
        city: &str,
        target_date: NaiveDate,
    ) -> Result<Vec<PendingEventRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, city, target_date, venue, range_name, side,
                        metar_high, wu_high, metar_gap, ask_at_detection,
                        poll_source, wu_triggered, wu_confirmed_at,
                        market_repriced_at, kalshi_market_repriced_at,
                        metar_confirmed_at
                 FROM metar_pending_events
                 WHERE city = ?1 AND target_date = ?2",
            )
            .context("Failed to prepare pending events query")?;
        let rows = stmt
            .query_map(rusqlite::params![city, target_date.to_string()], |row| {
                let date_str: String = row.get(2)?;
                let venue_str: String = row.get(3)?;
                let side_str: String = row.get(5)?;
                Ok(PendingEventRow {
                    id: row.get(0)?,
                    city: row.get(1)?,
                    target_date: date_str.parse().unwrap_or_default(),
                    venue: venue_str.parse().unwrap_or(Venue::Polymarket),
                    range_name: row.get(4)?,
                    side: side_str.parse().unwrap_or(Side::Yes),
                    metar_high: row.get(6)?,
                    wu_high: row.get(7)?,
                    metar_gap: row.get(8)?,
                    ask_at_detection: row.get(9)?,
                    poll_source: row.get(10)?,
                    wu_triggered: row.get(11)?,
                    wu_confirmed_at: row.get(12)?,
                    market_repriced_at: row.get(13)?,
                    kalshi_market_repriced_at: row.get(14)?,
                    metar_confirmed_at: row.get(15)?,
                })
            })
            .context("Failed to query pending events")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read pending event")?);
        }
        Ok(out)
    }

    /// Refresh the latest observed highs on an existing pending event.
    pub fn update_pending_event_highs(
        &self,
        id: i64,
        metar_high: f64,
        wu_high: Option<f64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE metar_pending_events SET
                    metar_high = MAX(metar_high, ?1),
                    wu_high = COALESCE(MAX(wu_high, ?2), wu_high, ?2)
                 WHERE id = ?3",
                rusqlite::params![metar_high, wu_high, id],
            )
            .context("Failed to update pending event highs")?;
        Ok(())
    }

    /// Latched timestamp set: only writes when the column is still NULL.
    pub fn mark_pending_wu_confirmed(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE metar_pending_events
                 SET wu_confirmed_at = COALESCE(wu_confirmed_at, datetime('now'))
                 WHERE id = ?1",
                [id],
            )
            .context("Failed to mark wu_confirmed_at")?;
        Ok(())
    }

    pub fn mark_pending_market_repriced(&self, id: i64, venue: Venue) -> Result<()> {
        let column = match venue {
            Venue::Polymarket => "market_repriced_at",
            Venue::Kalshi => "kalshi_market_repriced_at",
        };
        self.conn
            .execute(
                &format!(
                    "UPDATE metar_pending_events
                     SET {col} = COALESCE({col}, datetime('now'))
                     WHERE id = ?1",
                    col = column
                ),
                [id],
            )
            .context("Failed to mark market repriced")?;
        Ok(())
    }

    pub fn mark_pending_metar_confirmed(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE metar_pending_events
                 SET metar_confirmed_at = COALESCE(metar_confirmed_at, datetime('now'))
                 WHERE id = ?1",
                [id],
            )
            .context("Failed to mark metar_confirmed_at")?;
        Ok(())
    }

    // ── WU-leads events ──

    #[allow(clippy::too_many_arguments)]
    pub fn insert_wu_leads_event(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
        wu_high: f64,
        metar_high: f64,
        gap: f64,
        local_hour: u32,
    ) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO wu_leads_events (
                    city, target_date, station_id, wu_high, metar_high, gap, local_hour
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(city, target_date, station_id) DO NOTHING",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    station_id,
                    wu_high,
                    metar_high,
                    gap,
                    local_hour
                ],
            )
            .context("Failed to insert wu_leads event")?;
        Ok(inserted > 0)
    }

    pub fn mark_wu_leads_metar_confirmed(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE wu_leads_events
                 SET metar_confirmed_at = COALESCE(metar_confirmed_at, datetime('now'))
                 WHERE city = ?1 AND target_date = ?2 AND station_id = ?3",
                rusqlite::params![city, target_date.to_string(), station_id],
            )
            .context("Failed to mark wu_leads metar confirmed")?;
        Ok(())
    }

    pub fn has_unconfirmed_wu_lead(
        &self,
        city: &str,
        target_date: NaiveDate,
        station_id: &str,
    ) -> bool {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM wu_leads_events
                 WHERE city = ?1 AND target_date = ?2 AND station_id = ?3
                   AND metar_confirmed_at IS NULL",
                rusqlite::params![city, target_date.to_string(), station_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        count > 0
    }

    // ── Forecast accuracy ──

    #[allow(clippy::too_many_arguments)]
    pub fn insert_forecast_accuracy(
        &self,
        city: &str,
        target_date: NaiveDate,
        source: &str,
        forecast_temp: f64,
        actual_temp: f64,
        unit: TempUnit,
        hours_before_resolution: f64,
    ) -> Result<()> {
        let error = forecast_temp - actual_temp;
        self.conn
            .execute(
                "INSERT INTO forecast_accuracy (
                    city, target_date, source, forecast_temp, actual_temp,
                    error, abs_error, unit, hours_before_resolution
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(city, target_date, source) DO NOTHING",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    source,
                    forecast_temp,
                    actual_temp,
                    error,
                    error.abs(),
                    unit.to_string(),
                    hours_before_resolution,
                ],
            )
            .context("Failed to insert forecast accuracy")?;
        Ok(())
    }

    /// Mean signed error for one source over the rolling window. The
    /// forecast engine subtracts this bias before ensembling.
    pub fn source_bias(&self, source: &str, since: NaiveDate) -> Result<Option<f64>> {
        self.conn
            .query_row(
                "SELECT AVG(error) FROM forecast_accuracy
                 WHERE source = ?1 AND target_date >= ?2",
                rusqlite::params![source, since.to_string()],
                |row| row.get(0),
            )
            .context("Failed to compute source bias")
    }

    /// Rolling MAE for one source, across all cities. Sources whose
    /// error runs away get demoted out of the ensemble.
    pub fn source_mae(&self, source: &str, since: NaiveDate) -> Result<Option<ForecastErrorStats>> {
        let (n, mae): (i64, Option<f64>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(abs_error) FROM forecast_accuracy
                 WHERE source = ?1 AND target_date >= ?2",
                rusqlite::params![source, since.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to compute source MAE")?;
        Ok(mae.map(|mae| ForecastErrorStats { mae, n: n as u32 }))
    }

    /// Residual standard deviation of the ensemble error for a city
    /// (sample std-dev across sources and dates in the window).
    pub fn city_residual_std(&self, city: &str, since: NaiveDate) -> Result<Option<(f64, u32)>> {
        let (n, mean, m2): (i64, Option<f64>, Option<f64>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(error), AVG(error * error)
                 FROM forecast_accuracy
                 WHERE city = ?1 AND target_date >= ?2",
                rusqlite::params![city, since.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to compute residual std")?;
        if n < 2 {
            return Ok(None);
        }
        let (mean, m2) = (mean.unwrap_or(0.0), m2.unwrap_or(0.0));
        let variance = (m2 - mean * mean) * n as f64 / (n - 1) as f64;
        Ok(Some((variance.max(0.0).sqrt(), n as u32)))
    }

    /// Mean absolute error for a city's forecasts over the window. Drives
    /// the city eligibility gate.
    pub fn city_mae(&self, city: &str, since: NaiveDate) -> Result<Option<ForecastErrorStats>> {
        let (n, mae): (i64, Option<f64>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(abs_error) FROM forecast_accuracy
                 WHERE city = ?1 AND target_date >= ?2",
                rusqlite::params![city, since.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to compute city MAE")?;
        Ok(mae.map(|mae| ForecastErrorStats { mae, n: n as u32 }))
    }

    // ── Market calibration ──

    pub fn upsert_calibration(&self, row: &CalibrationRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO market_calibration (
                    venue, range_type, lead_time_bucket, price_bucket,
                    wins, n, empirical_win_rate, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                ON CONFLICT(venue, range_type, lead_time_bucket, price_bucket) DO UPDATE SET
                    wins = excluded.wins,
                    n = excluded.n,
                    empirical_win_rate = excluded.empirical_win_rate,
                    updated_at = datetime('now')",
                rusqlite::params![
                    row.venue.as_str(),
                    row.range_type.as_str(),
                    row.lead_time_bucket,
                    row.price_bucket,
                    row.wins,
                    row.n,
                    row.empirical_win_rate,
                ],
            )
            .context("Failed to upsert calibration")?;
        Ok(())
    }

    pub fn get_calibration(
        &self,
        venue: Venue,
        range_type: RangeType,
        lead_time_bucket: &str,
        price_bucket: &str,
    ) -> Result<Option<CalibrationRow>> {
        let result = self.conn.query_row(
            "SELECT venue, range_type, lead_time_bucket, price_bucket,
                    wins, n, empirical_win_rate
             FROM market_calibration
             WHERE venue = ?1 AND range_type = ?2
               AND lead_time_bucket = ?3 AND price_bucket = ?4",
            rusqlite::params![
                venue.as_str(),
                range_type.as_str(),
                lead_time_bucket,
                price_bucket
            ],
            |row| {
                let venue_str: String = row.get(0)?;
                let rt_str: String = row.get(1)?;
                Ok(CalibrationRow {
                    venue: venue_str.parse().unwrap_or(Venue::Polymarket),
                    range_type: rt_str.parse().unwrap_or(RangeType::Bounded),
                    lead_time_bucket: row.get(2)?,
                    price_bucket: row.get(3)?,
                    wins: row.get(4)?,
                    n: row.get(5)?,
                    empirical_win_rate: row.get(6)?,
                })
            },
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get calibration"),
        }
    }

    // ── Audit tables ──

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_audit(
        &self,
        table: AuditTable,
        city: &str,
        station_id: &str,
        target_date: NaiveDate,
        high_f: Option<f64>,
        high_c: Option<f64>,
        source_tag: &str,
        observation_count: Option<i64>,
    ) -> Result<()> {
        let table_name = match table {
            AuditTable::Wu => "wu_audit",
            AuditTable::Cli => "cli_audit",
        };
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (
                        city, station_id, target_date, high_f, high_c,
                        source_tag, observation_count, fetched_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                    ON CONFLICT(city, station_id, target_date) DO UPDATE SET
                        high_f = excluded.high_f,
                        high_c = excluded.high_c,
                        source_tag = excluded.source_tag,
                        observation_count = excluded.observation_count,
                        fetched_at = datetime('now')",
                    table_name
                ),
                rusqlite::params![
                    city,
                    station_id,
                    target_date.to_string(),
                    high_f,
                    high_c,
                    source_tag,
                    observation_count,
                ],
            )
            .context("Failed to upsert audit row")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AuditTable {
    Wu,
    Cli,
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    pub fn sample_trade(city: &str, side: Side) -> NewTrade {
        NewTrade {
            city: city.to_string(),
            target_date: date("2026-02-20"),
            venue: Venue::Polymarket,
            range_name: "50-51°F".to_string(),
            side,
            range_min: Some(50.0),
            range_max: Some(51.0),
            range_unit: TempUnit::F,
            market_id: "0xmkt".to_string(),
            token_id: "tok_1".to_string(),
            entry_ask: 0.40,
            entry_bid: 0.36,
            entry_spread: 0.04,
            entry_volume: 10_000.0,
            shares: 125,
            cost: 50.0,
            entry_probability: 0.55,
            entry_edge_pct: 15.0,
            entry_kelly: 0.10,
            entry_forecast_temp: Some(50.5),
            entry_forecast_confidence: Some("high".to_string()),
            entry_ensemble: Some(r#"{"nws":50.0,"open_meteo":51.0}"#.to_string()),
            pct_of_volume: 0.0125,
            hours_to_resolution: 18.0,
            entry_reason: "model".to_string(),
            wu_triggered: false,
            dual_confirmed: false,
            observation_high: None,
            wu_high: None,
        }
    }

    #[test]
    fn test_tables_created() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for t in [
            "trades",
            "opportunities",
            "metar_observations",
            "metar_pending_events",
            "wu_leads_events",
            "forecast_accuracy",
            "market_calibration",
            "wu_audit",
            "cli_audit",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {}", t);
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_insert_and_read_trade() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        let trade = db.get_trade(id).unwrap();
        assert_eq!(trade.city, "NYC");
        assert_eq!(trade.side, Side::Yes);
        assert_eq!(trade.status, "open");
        assert_eq!(trade.shares, 125);
        assert!((trade.cost - 50.0).abs() < f64::EPSILON);
        assert_eq!(trade.entry_reason, "model");
    }

    #[test]
    fn test_open_trade_dedup_index() {
        let db = Database::open_in_memory().unwrap();
        db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        // Same key while open: rejected by the partial unique index
        assert!(db.insert_trade(&sample_trade("NYC", Side::Yes)).is_err());
        // Different side is fine
        db.insert_trade(&sample_trade("NYC", Side::No)).unwrap();
    }

    #[test]
    fn test_dedup_released_after_exit() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        db.exit_trade(id, "edge_gone", 0.30, 0.30, 0.34, 0.04, 900.0, None, None, -13.0, 0.0)
            .unwrap();
        // Closed trade no longer blocks a new open one
        db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
    }

    #[test]
    fn test_has_open_trade() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.has_open_trade(
            "NYC",
            date("2026-02-20"),
            Venue::Polymarket,
            "50-51°F",
            Side::Yes
        ));
        db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        assert!(db.has_open_trade(
            "NYC",
            date("2026-02-20"),
            Venue::Polymarket,
            "50-51°F",
            Side::Yes
        ));
    }

    #[test]
    fn test_open_no_cost_for_date() {
        let db = Database::open_in_memory().unwrap();
        db.insert_trade(&sample_trade("NYC", Side::No)).unwrap();
        db.insert_trade(&sample_trade("CHI", Side::No)).unwrap();
        db.insert_trade(&sample_trade("MIA", Side::Yes)).unwrap();
        let no_cost = db.open_no_cost_for_date(date("2026-02-20")).unwrap();
        assert!((no_cost - 100.0).abs() < 1e-9);
        assert!((db.open_no_cost_for_date(date("2026-02-21")).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_open_cost_for_side() {
        let db = Database::open_in_memory().unwrap();
        db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        db.insert_trade(&sample_trade("CHI", Side::Yes)).unwrap();
        assert!((db.open_cost_for_side(Side::Yes).unwrap() - 100.0).abs() < 1e-9);
        assert!((db.open_cost_for_side(Side::No).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_live_state_high_water_marks() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();

        db.update_trade_live_state(id, 0.50, 0.55, 0.60).unwrap();
        db.update_trade_live_state(id, 0.45, 0.50, 0.70).unwrap();

        let trade = db.get_trade(id).unwrap();
        assert_eq!(trade.current_bid, Some(0.45));
        // max_price_seen keeps the peak bid, min_probability_seen the trough
        assert_eq!(trade.max_price_seen, Some(0.50));
        assert_eq!(trade.min_probability_seen, Some(0.60));
    }

    #[test]
    fn test_evaluator_log_bounded() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        for i in 0..510 {
            db.append_evaluator_log(id, &serde_json::json!({"tick": i}))
                .unwrap();
        }
        assert_eq!(db.evaluator_log_len(id).unwrap(), 500);
    }

    #[test]
    fn test_resolve_trade() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_trade(&sample_trade("NYC", Side::Yes)).unwrap();
        db.resolve_trade(id, 50.0, true, 75.0, 0.0, "KLGA", None)
            .unwrap();
        let trade = db.get_trade(id).unwrap();
        assert_eq!(trade.status, "resolved");
        // Resolver re-run is a no-op failure, not a double resolution
        assert!(db
            .resolve_trade(id, 50.0, true, 75.0, 0.0, "KLGA", None)
            .is_err());
    }

    #[test]
    fn test_opportunity_roundtrip_and_backfill() {
        let db = Database::open_in_memory().unwrap();
        let opp = NewOpportunity {
            city: "NYC".to_string(),
            target_date: date("2026-02-18"),
            venue: Venue::Kalshi,
            range_name: "50-51".to_string(),
            side: Side::Yes,
            range_type: RangeType::Bounded,
            range_min: Some(50.0),
            range_max: Some(51.0),
            range_unit: TempUnit::F,
            bid: 0.10,
            ask: 0.14,
            spread: 0.04,
            volume: 5000.0,
            probability: 0.30,
            edge: 0.16,
            forecast_temp: 50.5,
            forecast_std_dev: 2.0,
            forecast_confidence: "high".to_string(),
            forecast_sources: r#"{"nws":50.0}"#.to_string(),
            hours_to_resolution: 20.0,
            accepted: false,
            reject_reason: Some("spread".to_string()),
        };
        let id = db.insert_opportunity(&opp).unwrap();

        let unresolved = db
            .get_unresolved_opportunities(date("2026-02-20"), 200)
            .unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, id);

        db.set_opportunity_outcome(id, 50.4, true).unwrap();
        assert!(db
            .get_unresolved_opportunities(date("2026-02-20"), 200)
            .unwrap()
            .is_empty());

        let resolved = db.get_resolved_yes_opportunities().unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].would_have_won);
    }

    #[test]
    fn test_running_high_monotone() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");

        let h1 = db
            .upsert_observation("NYC", d, "KLGA", "2026-02-20T15:00:00Z", 10.0, 50.0, None, None)
            .unwrap();
        assert!((h1.high_f - 50.0).abs() < f64::EPSILON);

        let h2 = db
            .upsert_observation("NYC", d, "KLGA", "2026-02-20T16:00:00Z", 11.1, 52.0, None, None)
            .unwrap();
        assert!((h2.high_f - 52.0).abs() < f64::EPSILON);

        // A cooler later reading never lowers the running high
        let h3 = db
            .upsert_observation("NYC", d, "KLGA", "2026-02-20T17:00:00Z", 9.0, 48.0, None, None)
            .unwrap();
        assert!((h3.high_f - 52.0).abs() < f64::EPSILON);
        assert_eq!(h3.observation_count, 3);
    }

    #[test]
    fn test_wu_high_kept_separate_from_running_high() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");
        let h = db
            .upsert_observation(
                "NYC",
                d,
                "KLGA",
                "2026-02-20T15:00:00Z",
                10.0,
                50.0,
                Some(53.0),
                Some(11.7),
            )
            .unwrap();
        // Station running high stays METAR-only
        assert!((h.high_f - 50.0).abs() < f64::EPSILON);
        // The crowd high is readable on its own
        let (wu_f, _) = db.get_latest_wu_high("NYC", d, "KLGA").unwrap().unwrap();
        assert!((wu_f - 53.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_observation_upsert_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");
        for _ in 0..3 {
            db.upsert_observation("NYC", d, "KLGA", "2026-02-20T15:00:00Z", 10.0, 50.0, None, None)
                .unwrap();
        }
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM metar_observations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_pending_event_first_detection_only() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");
        let first = db
            .insert_pending_event(
                "NYC",
                d,
                Venue::Polymarket,
                "≥38°F",
                Side::Yes,
                39.2,
                None,
                1.2,
                0.60,
                Some("[]"),
                None,
                "fast_poll",
                false,
            )
            .unwrap();
        assert!(first);

        let second = db
            .insert_pending_event(
                "NYC",
                d,
                Venue::Polymarket,
                "≥38°F",
                Side::Yes,
                40.0,
                Some(38.0),
                2.0,
                0.80,
                None,
                None,
                "fast_poll",
                true,
            )
            .unwrap();
        assert!(!second, "second insert must not re-detect");
    }

    #[test]
    fn test_pending_event_latched_fields() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");
        db.insert_pending_event(
            "NYC",
            d,
            Venue::Polymarket,
            "≥38°F",
            Side::Yes,
            39.2,
            None,
            1.2,
            0.60,
            None,
            None,
            "fast_poll",
            false,
        )
        .unwrap();
        let ev = &db.get_pending_events("NYC", d).unwrap()[0];
        assert!(ev.wu_confirmed_at.is_none());

        db.mark_pending_wu_confirmed(ev.id).unwrap();
        let first_ts = db.get_pending_events("NYC", d).unwrap()[0]
            .wu_confirmed_at
            .clone()
            .unwrap();

        // Second confirmation attempt keeps the original timestamp
        db.mark_pending_wu_confirmed(ev.id).unwrap();
        let second_ts = db.get_pending_events("NYC", d).unwrap()[0]
            .wu_confirmed_at
            .clone()
            .unwrap();
        assert_eq!(first_ts, second_ts);

        db.mark_pending_market_repriced(ev.id, Venue::Polymarket)
            .unwrap();
        let ev = &db.get_pending_events("NYC", d).unwrap()[0];
        assert!(ev.market_repriced_at.is_some());
        assert!(ev.kalshi_market_repriced_at.is_none());
    }

    #[test]
    fn test_wu_leads_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");
        assert!(db
            .insert_wu_leads_event("NYC", d, "KLGA", 55.0, 51.5, 3.5, 10)
            .unwrap());
        assert!(!db
            .insert_wu_leads_event("NYC", d, "KLGA", 56.0, 52.0, 4.0, 11)
            .unwrap());
        assert!(db.has_unconfirmed_wu_lead("NYC", d, "KLGA"));

        db.mark_wu_leads_metar_confirmed("NYC", d, "KLGA").unwrap();
        assert!(!db.has_unconfirmed_wu_lead("NYC", d, "KLGA"));
    }

    #[test]
    fn test_forecast_accuracy_and_bias() {
        let db = Database::open_in_memory().unwrap();
        db.insert_forecast_accuracy("NYC", date("2026-02-18"), "nws", 52.0, 50.0, TempUnit::F, 18.0)
            .unwrap();
        db.insert_forecast_accuracy("NYC", date("2026-02-19"), "nws", 49.0, 48.0, TempUnit::F, 20.0)
            .unwrap();
        // Duplicate (city, date, source) is ignored
        db.insert_forecast_accuracy("NYC", date("2026-02-19"), "nws", 60.0, 48.0, TempUnit::F, 20.0)
            .unwrap();

        let bias = db.source_bias("nws", date("2026-02-01")).unwrap().unwrap();
        assert!((bias - 1.5).abs() < 1e-9); // (+2 + +1) / 2

        let mae = db.city_mae("NYC", date("2026-02-01")).unwrap().unwrap();
        assert_eq!(mae.n, 2);
        assert!((mae.mae - 1.5).abs() < 1e-9);

        let (std, n) = db
            .city_residual_std("NYC", date("2026-02-01"))
            .unwrap()
            .unwrap();
        assert_eq!(n, 2);
        assert!(std > 0.0);
    }

    #[test]
    fn test_calibration_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let row = CalibrationRow {
            venue: Venue::Polymarket,
            range_type: RangeType::Bounded,
            lead_time_bucket: "12-24h".to_string(),
            price_bucket: "0.10-0.15".to_string(),
            wins: 12,
            n: 40,
            empirical_win_rate: 0.30,
        };
        db.upsert_calibration(&row).unwrap();

        let got = db
            .get_calibration(Venue::Polymarket, RangeType::Bounded, "12-24h", "0.10-0.15")
            .unwrap()
            .unwrap();
        assert_eq!(got.n, 40);

        // Upsert replaces counts in place
        let mut row2 = row.clone();
        row2.wins = 20;
        row2.n = 60;
        row2.empirical_win_rate = 20.0 / 60.0;
        db.upsert_calibration(&row2).unwrap();
        let got = db
            .get_calibration(Venue::Polymarket, RangeType::Bounded, "12-24h", "0.10-0.15")
            .unwrap()
            .unwrap();
        assert_eq!(got.n, 60);

        assert!(db
            .get_calibration(Venue::Kalshi, RangeType::Bounded, "12-24h", "0.10-0.15")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_audit_upsert() {
        let db = Database::open_in_memory().unwrap();
        let d = date("2026-02-20");
        db.upsert_audit(AuditTable::Wu, "NYC", "KLGA", d, Some(52.0), Some(11.1), "wu", Some(24))
            .unwrap();
        db.upsert_audit(AuditTable::Wu, "NYC", "KLGA", d, Some(53.0), Some(11.7), "wu", Some(25))
            .unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM wu_audit", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let high: f64 = db
            .conn
            .query_row("SELECT high_f FROM wu_audit", [], |r| r.get(0))
            .unwrap();
        assert!((high - 53.0).abs() < f64::EPSILON);
    }
}
