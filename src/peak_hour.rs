use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::cities::{City, CITIES};
use crate::config::Config;
use crate::db::Database;

/// Per-city estimate of the local hour the daily high tends to be set,
/// from observation history. Exit heuristics read the cached values.
pub struct PeakHourEstimator {
    window_days: i64,
    buffer: i64,
    hour_min: u32,
    hour_max: u32,
    min_samples: usize,
    fallback_hour: u32,
    dynamic: bool,
    cache: Mutex<HashMap<String, u32>>,
}

impl PeakHourEstimator {
    pub fn new(config: &Config) -> Self {
        PeakHourEstimator {
            window_days: config.calibration_window_days as i64,
            buffer: config.peak_hour_buffer,
            hour_min: config.peak_hour_min,
            hour_max: config.peak_hour_max,
            min_samples: config.peak_hour_min_samples,
            fallback_hour: config.cooling_hour,
            dynamic: config.dynamic_peak_hour,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Recompute every city's estimate. Called at startup and on a slow
    /// timer.
    pub fn refresh(&self, db: &Database, now: DateTime<Utc>) -> Result<()> {
        if !self.dynamic {
            return Ok(());
        }
        let mut cache = self.cache.lock().unwrap();
        for city in CITIES {
            let hour = self.estimate(db, city, now)?;
            debug!("Peak hour for {}: {}:00 local", city.key, hour);
            cache.insert(city.key.to_string(), hour);
        }
        Ok(())
    }

    /// Cached value, or the static fallback before the first refresh.
    pub fn peak_hour(&self, city: &City) -> u32 {
        self.cache
            .lock()
            .unwrap()
            .get(city.key)
            .copied()
            .unwrap_or(self.fallback_hour)
    }

    fn estimate(&self, db: &Database, city: &City, now: DateTime<Utc>) -> Result<u32> {
        let since = now.date_naive() - Duration::days(self.window_days);
        let peak_times = db.get_peak_observation_times(city.key, since)?;

        let local_hours: Vec<u32> = peak_times
            .iter()
            .filter_map(|t| t.parse::<DateTime<Utc>>().ok())
            .map(|t| t.with_timezone(&city.tz).hour())
            .collect();

        if local_hours.len() < self.min_samples {
            return Ok(self.fallback_hour);
        }

        let mean = local_hours.iter().sum::<u32>() as f64 / local_hours.len() as f64;
        let estimate = (mean.round() as i64 + self.buffer)
            .clamp(self.hour_min as i64, self.hour_max as i64);
        Ok(estimate as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cities::find_city;
    use chrono::NaiveDate;

    fn insert_peak(db: &Database, date: &str, observed_at: &str, temp_f: f64) {
        db.upsert_observation(
            "NYC",
            date.parse::<NaiveDate>().unwrap(),
            "KLGA",
            observed_at,
            (temp_f - 32.0) * 5.0 / 9.0,
            temp_f,
            None,
            None,
        )
        .unwrap();
    }

    fn estimator() -> PeakHourEstimator {
        PeakHourEstimator::new(&Config::from_env().unwrap())
    }

    #[test]
    fn test_fallback_without_samples() {
        let db = Database::open_in_memory().unwrap();
        let est = estimator();
        let now = "2026-02-20T12:00:00Z".parse().unwrap();
        est.refresh(&db, now).unwrap();
        // No history → static cooling hour
        assert_eq!(est.peak_hour(find_city("NYC").unwrap()), 17);
    }

    #[test]
    fn test_estimate_from_peak_times() {
        let db = Database::open_in_memory().unwrap();
        // Peaks set at 20:00 UTC = 15:00 EST on three days
        insert_peak(&db, "2026-02-17", "2026-02-17T20:00:00Z", 50.0);
        insert_peak(&db, "2026-02-18", "2026-02-18T20:00:00Z", 48.0);
        insert_peak(&db, "2026-02-19", "2026-02-19T20:00:00Z", 52.0);

        let est = estimator();
        let now = "2026-02-20T12:00:00Z".parse().unwrap();
        est.refresh(&db, now).unwrap();
        // mean 15 + buffer 2 = 17, inside [14, 20]
        assert_eq!(est.peak_hour(find_city("NYC").unwrap()), 17);
    }

    #[test]
    fn test_estimate_clamped_to_bounds() {
        let db = Database::open_in_memory().unwrap();
        // Peaks at 16:00 UTC = 11:00 EST → mean 11 + 2 = 13, clamps to 14
        insert_peak(&db, "2026-02-17", "2026-02-17T16:00:00Z", 50.0);
        insert_peak(&db, "2026-02-18", "2026-02-18T16:00:00Z", 48.0);
        insert_peak(&db, "2026-02-19", "2026-02-19T16:00:00Z", 52.0);

        let est = estimator();
        let now = "2026-02-20T12:00:00Z".parse().unwrap();
        est.refresh(&db, now).unwrap();
        assert_eq!(est.peak_hour(find_city("NYC").unwrap()), 14);
    }

    #[test]
    fn test_below_min_samples_uses_fallback() {
        let db = Database::open_in_memory().unwrap();
        insert_peak(&db, "2026-02-19", "2026-02-19T20:00:00Z", 52.0);

        let est = estimator();
        let now = "2026-02-20T12:00:00Z".parse().unwrap();
        est.refresh(&db, now).unwrap();
        assert_eq!(est.peak_hour(find_city("NYC").unwrap()), 17);
    }
}
