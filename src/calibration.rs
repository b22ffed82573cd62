use anyhow::Result;
use std::collections::HashMap;
use tracing::info;

use crate::db::{CalibrationRow, Database};
use crate::range::{RangeType, Venue};

/// Lead-time buckets keyed by hours to resolution.
pub fn lead_time_bucket(hours: f64) -> &'static str {
    if hours < 12.0 {
        "<12h"
    } else if hours < 24.0 {
        "12-24h"
    } else if hours < 36.0 {
        "24-36h"
    } else {
        "36h+"
    }
}

/// Ask-price buckets: 5-cent bins from 0, open-ended above 55 cents.
pub fn price_bucket(ask: f64) -> String {
    if ask >= 0.55 {
        return "0.55+".to_string();
    }
    let bin = (ask.max(0.0) / 0.05).floor() as u32;
    let lo = bin as f64 * 0.05;
    format!("{:.2}-{:.2}", lo, lo + 0.05)
}

/// Recompute every market-calibration bucket from resolved YES-side
/// opportunities and upsert the aggregate rows.
pub fn recompute(db: &Database) -> Result<usize> {
    let resolved = db.get_resolved_yes_opportunities()?;

    let mut buckets: HashMap<(Venue, RangeType, &'static str, String), (i64, i64)> = HashMap::new();
    for opp in &resolved {
        let key = (
            opp.venue,
            opp.range_type,
            lead_time_bucket(opp.hours_to_resolution),
            price_bucket(opp.ask),
        );
        let entry = buckets.entry(key).or_insert((0, 0));
        entry.1 += 1;
        if opp.would_have_won {
            entry.0 += 1;
        }
    }

    let count = buckets.len();
    for ((venue, range_type, lead, price), (wins, n)) in buckets {
        db.upsert_calibration(&CalibrationRow {
            venue,
            range_type,
            lead_time_bucket: lead.to_string(),
            price_bucket: price,
            wins,
            n,
            empirical_win_rate: if n > 0 { wins as f64 / n as f64 } else { 0.0 },
        })?;
    }

    if count > 0 {
        info!(
            "Calibration recomputed: {} buckets from {} resolved opportunities",
            count,
            resolved.len()
        );
    }
    Ok(count)
}

/// Look up the calibration bucket an open position falls into.
pub fn lookup(
    db: &Database,
    venue: Venue,
    range_type: RangeType,
    hours_remaining: f64,
    ask: f64,
) -> Result<Option<CalibrationRow>> {
    db.get_calibration(
        venue,
        range_type,
        lead_time_bucket(hours_remaining),
        &price_bucket(ask),
    )
}
