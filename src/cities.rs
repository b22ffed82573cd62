use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::range::{TempUnit, Venue};

/// One tradeable city: coordinates, timezone, resolution unit, and the
/// authoritative station each venue settles against. Dual-station cities
/// (the two venues resolve against different airports) are supported.
#[derive(Debug, Clone)]
pub struct City {
    pub key: &'static str,
    pub name: &'static str,
    pub lat: f64,
    pub lon: f64,
    pub tz: Tz,
    pub unit: TempUnit,
    pub polymarket_station: &'static str,
    pub kalshi_station: &'static str,
    pub country: &'static str,
}

impl City {
    pub fn station_for(&self, venue: Venue) -> &'static str {
        match venue {
            Venue::Polymarket => self.polymarket_station,
            Venue::Kalshi => self.kalshi_station,
        }
    }

    pub fn dual_station(&self) -> bool {
        self.polymarket_station != self.kalshi_station
    }

    /// UTC offset of this city's timezone at 12:00 UTC of the given date.
    /// Anchoring at noon UTC sidesteps DST-transition ambiguity.
    pub fn utc_offset_at_noon(&self, date: NaiveDate) -> FixedOffset {
        let noon = date.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        self.tz.offset_from_utc_datetime(&noon).fix()
    }

    /// The UTC window covering the city-local calendar day.
    pub fn local_day_bounds_utc(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let offset = self.utc_offset_at_noon(date);
        let start_local = date.and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        let start_utc = Utc
            .from_utc_datetime(&(start_local - Duration::seconds(offset.local_minus_utc() as i64)));
        (start_utc, start_utc + Duration::days(1))
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    pub fn local_hour(&self, now: DateTime<Utc>) -> u32 {
        use chrono::Timelike;
        now.with_timezone(&self.tz).hour()
    }
}

/// The city registry. Keys are the codes used across the venues, the
/// database and the question parsers.
pub const CITIES: &[City] = &[
    City {
        key: "NYC",
        name: "New York City",
        lat: 40.7790,
        lon: -73.8740,
        tz: Tz::America__New_York,
        unit: TempUnit::F,
        polymarket_station: "KLGA",
        kalshi_station: "KNYC",
        country: "US",
    },
    City {
        key: "LAX",
        name: "Los Angeles",
        lat: 33.9382,
        lon: -118.3866,
        tz: Tz::America__Los_Angeles,
        unit: TempUnit::F,
        polymarket_station: "KLAX",
        kalshi_station: "KLAX",
        country: "US",
    },
    City {
        key: "CHI",
        name: "Chicago",
        lat: 41.7842,
        lon: -87.7553,
        tz: Tz::America__Chicago,
        unit: TempUnit::F,
        polymarket_station: "KMDW",
        kalshi_station: "KMDW",
        country: "US",
    },
    City {
        key: "MIA",
        name: "Miami",
        lat: 25.7905,
        lon: -80.3164,
        tz: Tz::America__New_York,
        unit: TempUnit::F,
        polymarket_station: "KMIA",
        kalshi_station: "KMIA",
        country: "US",
    },
    City {
        key: "PHL",
        name: "Philadelphia",
        lat: 39.8683,
        lon: -75.2311,
        tz: Tz::America__New_York,
        unit: TempUnit::F,
        polymarket_station: "KPHL",
        kalshi_station: "KPHL",
        country: "US",
    },
    City {
        key: "DEN",
        name: "Denver",
        lat: 39.8466,
        lon: -104.6562,
        tz: Tz::America__Denver,
        unit: TempUnit::F,
        polymarket_station: "KDEN",
        kalshi_station: "KDEN",
        country: "US",
    },
    City {
        key: "HOU",
        name: "Houston",
        lat: 29.6461,
        lon: -95.2772,
        tz: Tz::America__Chicago,
        unit: TempUnit::F,
        polymarket_station: "KHOU",
        kalshi_station: "KHOU",
        country: "US",
    },
    City {
        key: "ATL",
        name: "Atlanta",
        lat: 33.6301,
        lon: -84.4418,
        tz: Tz::America__New_York,
        unit: TempUnit::F,
        polymarket_station: "KATL",
        kalshi_station: "KATL",
        country: "US",
    },
    City {
        key: "SEA",
        name: "Seattle",
        lat: 47.4444,
        lon: -122.3139,
        tz: Tz::America__Los_Angeles,
        unit: TempUnit::F,
        polymarket_station: "KSEA",
        kalshi_station: "KSEA",
        country: "US",
    },
    City {
        key: "LON",
        name: "London",
        lat: 51.4775,
        lon: -0.4614,
        tz: Tz::Europe__London,
        unit: TempUnit::C,
        polymarket_station: "EGLL",
        kalshi_station: "EGLL",
        country: "GB",
    },
];

pub fn find_city(key: &str) -> Option<&'static City> {
    CITIES.iter().find(|c| c.key == key)
}

pub fn city_keys() -> Vec<&'static str> {
    CITIES.iter().map(|c| c.key).collect()
}

/// All stations referenced by any enabled venue, deduplicated, in
/// registry order. Used for the batched METAR fetch.
pub fn all_stations(cities: &[&'static City]) -> Vec<&'static str> {
    let mut stations = Vec::new();
    for city in cities {
        for s in [city.polymarket_station, city.kalshi_station] {
            if !stations.contains(&s) {
                stations.push(s);
            }
        }
    }
    stations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_find_city() {
        let nyc = find_city("NYC").unwrap();
        assert_eq!(nyc.name, "New York City");
        assert_eq!(nyc.unit, TempUnit::F);
        assert!(find_city("XXX").is_none());
    }

    #[test]
    fn test_dual_station_city() {
        let nyc = find_city("NYC").unwrap();
        assert!(nyc.dual_station());
        assert_eq!(nyc.station_for(Venue::Polymarket), "KLGA");
        assert_eq!(nyc.station_for(Venue::Kalshi), "KNYC");

        let chi = find_city("CHI").unwrap();
        assert!(!chi.dual_station());
    }

    #[test]
    fn test_all_stations_dedup() {
        let cities: Vec<&City> = CITIES.iter().collect();
        let stations = all_stations(&cities);
        assert!(stations.contains(&"KLGA"));
        assert!(stations.contains(&"KNYC"));
        // KMDW appears once even though both venues use it
        assert_eq!(stations.iter().filter(|s| **s == "KMDW").count(), 1);
    }

    #[test]
    fn test_noon_anchor_offset_winter_vs_summer() {
        let nyc = find_city("NYC").unwrap();
        let winter = nyc.utc_offset_at_noon(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
        let summer = nyc.utc_offset_at_noon(NaiveDate::from_ymd_opt(2026, 7, 15).unwrap());
        assert_eq!(winter.local_minus_utc(), -5 * 3600); // EST
        assert_eq!(summer.local_minus_utc(), -4 * 3600); // EDT
    }

    #[test]
    fn test_local_day_bounds() {
        let nyc = find_city("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let (start, end) = nyc.local_day_bounds_utc(date);
        // Local midnight EST is 05:00 UTC
        assert_eq!(start.to_rfc3339(), "2026-01-15T05:00:00+00:00");
        assert_eq!((end - start).num_hours(), 24);
    }

    #[test]
    fn test_celsius_city() {
        let lon = find_city("LON").unwrap();
        assert_eq!(lon.unit, TempUnit::C);
        assert_eq!(lon.country, "GB");
    }
}
