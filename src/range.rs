use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Polymarket,
    Kalshi,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Polymarket => "polymarket",
            Venue::Kalshi => "kalshi",
        }
    }

    /// Whether this venue settles against the crowd (WU) observation
    /// rather than the airport METAR / NWS CLI chain.
    pub fn resolves_against_wu(&self) -> bool {
        matches!(self, Venue::Polymarket)
    }
}

impl FromStr for Venue {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "polymarket" => Ok(Venue::Polymarket),
            "kalshi" => Ok(Venue::Kalshi),
            _ => bail!("Unknown venue: '{}'", s),
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            _ => bail!("Unknown side: '{}'", s),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TempUnit {
    F,
    C,
}

impl TempUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            TempUnit::F => "°F",
            TempUnit::C => "°C",
        }
    }
}

impl std::fmt::Display for TempUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TempUnit::F => write!(f, "F"),
            TempUnit::C => write!(f, "C"),
        }
    }
}

impl FromStr for TempUnit {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "F" => Ok(TempUnit::F),
            "C" => Ok(TempUnit::C),
            _ => bail!("Unknown temperature unit: '{}'", s),
        }
    }
}

pub fn c_to_f(c: f64) -> f64 {
    (c * 9.0 / 5.0 + 32.0).round()
}

pub fn f_to_c(f: f64) -> f64 {
    ((f - 32.0) * 5.0 / 9.0 * 10.0).round() / 10.0
}

/// Convert a temperature between units. Identity when units match.
pub fn convert_temp(value: f64, from: TempUnit, to: TempUnit) -> f64 {
    match (from, to) {
        (TempUnit::C, TempUnit::F) => c_to_f(value),
        (TempUnit::F, TempUnit::C) => f_to_c(value),
        _ => value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeType {
    Bounded,
    Unbounded,
}

impl RangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeType::Bounded => "bounded",
            RangeType::Unbounded => "unbounded",
        }
    }
}

impl FromStr for RangeType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bounded" => Ok(RangeType::Bounded),
            "unbounded" => Ok(RangeType::Unbounded),
            _ => bail!("Unknown range type: '{}'", s),
        }
    }
}

/// One outcome of one market on one venue, normalized to a pair of
/// nullable temperature bounds. At least one bound is always set.
#[derive(Debug, Clone)]
pub struct RangeSpec {
    pub venue: Venue,
    pub market_id: String,
    pub token_id: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub range_name: String,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub range_unit: TempUnit,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
}

impl RangeSpec {
    pub fn range_type(&self) -> RangeType {
        if self.range_min.is_some() && self.range_max.is_some() {
            RangeType::Bounded
        } else {
            RangeType::Unbounded
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.range_type() == RangeType::Bounded
    }

    pub fn is_unbounded_upper(&self) -> bool {
        self.range_min.is_some() && self.range_max.is_none()
    }

    pub fn is_unbounded_lower(&self) -> bool {
        self.range_min.is_none() && self.range_max.is_some()
    }

    /// Price invariants: 0 <= bid <= ask <= 1, bounds ordered.
    pub fn validate(&self) -> Result<()> {
        if self.range_min.is_none() && self.range_max.is_none() {
            bail!("Range '{}' has no bounds", self.range_name);
        }
        if let (Some(lo), Some(hi)) = (self.range_min, self.range_max) {
            if lo > hi {
                bail!("Range '{}' has min {} > max {}", self.range_name, lo, hi);
            }
        }
        if self.bid < 0.0 || self.ask > 1.0 || self.bid > self.ask {
            bail!(
                "Range '{}' violates price invariant: bid={} ask={}",
                self.range_name,
                self.bid,
                self.ask
            );
        }
        Ok(())
    }

    /// YES on an unbounded-upper outcome is settled once the running high
    /// reaches the threshold (inclusive).
    pub fn yes_settled_by_high(&self, high: f64) -> bool {
        match (self.range_min, self.range_max) {
            (Some(min), None) => high >= min,
            _ => false,
        }
    }

    /// NO is settled once the running high strictly exceeds the upper
    /// bound: the day's high can only go up from here.
    pub fn no_settled_by_high(&self, high: f64) -> bool {
        match self.range_max {
            Some(max) => high > max,
            None => false,
        }
    }

    /// Cost per contract to enter this side. Buying NO at the complement
    /// of the YES bid.
    pub fn ask_for_side(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.ask,
            Side::No => 1.0 - self.bid,
        }
    }

    /// Proceeds per contract when selling this side now.
    pub fn bid_for_side(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.bid,
            Side::No => 1.0 - self.ask,
        }
    }

    /// Whether `other` describes the same outcome on the other venue:
    /// unit-converted bounds within one degree of this range's unit.
    pub fn matches_range(&self, other: &RangeSpec) -> bool {
        let tol = 1.0;
        let close = |a: Option<f64>, b: Option<f64>| match (a, b) {
            (Some(x), Some(y)) => {
                (x - convert_temp(y, other.range_unit, self.range_unit)).abs() <= tol
            }
            (None, None) => true,
            _ => false,
        };
        close(self.range_min, other.range_min) && close(self.range_max, other.range_max)
    }
}

/// Map structured-venue strike metadata to bounds.
///
/// `greater` and `between` are disjoint by construction: a reading of
/// exactly `cap` settles `between[floor, cap]` and not `greater(cap)`.
pub fn bounds_from_strike(
    strike_type: &str,
    floor: Option<f64>,
    cap: Option<f64>,
) -> Option<(Option<f64>, Option<f64>)> {
    match strike_type {
        "greater" => floor.map(|f| (Some(f + 1.0), None)),
        "less" => cap.map(|c| (None, Some(c - 1.0))),
        "between" => match (floor, cap) {
            (Some(f), Some(c)) => Some((Some(f), Some(c))),
            _ => None,
        },
        _ => None,
    }
}
