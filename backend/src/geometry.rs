//! Geometry oracle: hour angles and predicted per-antenna delays.
//!
//! The oracle itself is an external service; this module holds the trait
//! the delay tracker consumes, the sidereal-time and delay math applied
//! to its cached answers, and a static in-process implementation used by
//! the simulated block.

use std::collections::HashMap;
use std::f64::consts::PI;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Instrumental delay every prediction is referenced to, ns.
pub const DELAY_OFFSET_NS: f64 = 4000.0;

/// Entries in the oracle's per-antenna coefficient arrays.
pub const ORACLE_SLOTS: usize = 11;

/// Steps in one Walsh phase-switching cycle.
pub const WALSH_STEPS: usize = 64;

/// Cached answer from the oracle's query call: baseline coefficients per
/// antenna slot plus the source position.
#[derive(Debug, Clone, Default)]
pub struct OracleQuery {
    pub a: [f64; ORACLE_SLOTS],
    pub b: [f64; ORACLE_SLOTS],
    pub c: [f64; ORACLE_SLOTS],
    pub antenna_exists: [bool; ORACLE_SLOTS],
    /// Source right ascension, rad.
    pub ra: f64,
    /// Reference longitude, rad.
    pub ref_long: f64,
}

#[async_trait]
pub trait GeometryOracle: Send + Sync {
    async fn walsh_pattern(&self) -> anyhow::Result<HashMap<u8, [i64; WALSH_STEPS]>>;
    async fn query(&self, phases: &[f64]) -> anyhow::Result<OracleQuery>;
}

/// Local sidereal time in hours, from the Duffet-Smith procedure:
/// UT -> Julian date -> GMST -> LST.
pub fn local_sidereal_time(at_unix: f64, longitude_rad: f64) -> f64 {
    let when = DateTime::<Utc>::from_timestamp(
        at_unix.floor() as i64,
        ((at_unix.fract()) * 1e9) as u32,
    )
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let ut_hours = when.hour() as f64
        + (when.minute() as f64 + when.second() as f64 / 60.0) / 60.0;

    let (mut year, mut month) = (when.year() as f64, when.month() as f64);
    let day = when.day() as f64 + ut_hours / 24.0;
    if month <= 2.0 {
        year -= 1.0;
        month += 12.0;
    }
    let a = (year / 100.0).trunc();
    let b = 2.0 - a + (a / 4.0).trunc();
    let c = (365.25 * year).trunc();
    let d = (30.6001 * (month + 1.0)).trunc();
    let jd = b + c + d + day.trunc() + 1_720_994.5;

    let t = (jd - 2_451_545.0) / 36_525.0;
    let mut t0 = 6.697_374_558 + 2_400.051_336 * t + 0.000_025_862 * t * t;
    t0 -= (t0 / 24.0).trunc() * 24.0;
    if t0 < 0.0 {
        t0 += 24.0;
    }
    let ut = 1.002_737_909 * ut_hours;
    let mut lst = ut + t0;
    lst -= (lst / 24.0).trunc() * 24.0;

    lst += longitude_rad.to_degrees() / 15.0;
    if lst > 24.0 {
        lst -= 24.0;
    }
    if lst < 0.0 {
        lst += 24.0;
    }
    lst
}

/// Hour angle of a source, rad.
pub fn hour_angle(source_ra: f64, longitude_rad: f64, at_unix: f64) -> f64 {
    local_sidereal_time(at_unix, longitude_rad) * (PI / 12.0) - source_ra
}

/// Predicted delay for one antenna at one time, ns.
pub fn predicted_delay_ns(query: &OracleQuery, antenna: u8, at_unix: f64) -> f64 {
    let slot = antenna as usize;
    if slot >= ORACLE_SLOTS || !query.antenna_exists[slot] {
        return DELAY_OFFSET_NS;
    }
    let h = hour_angle(query.ra, query.ref_long, at_unix);
    let geometric = 1e9 * (query.a[slot] + query.b[slot] * h.cos() + query.c[slot] * h.sin());
    DELAY_OFFSET_NS - geometric
}

/// Fixed-coefficient oracle for the simulated block and tests. Walsh
/// rows are Rademacher square waves, one period doubling per antenna.
pub struct StaticOracle {
    query: OracleQuery,
    walsh: HashMap<u8, [i64; WALSH_STEPS]>,
}

impl StaticOracle {
    pub fn new(antennas: &[u8]) -> Self {
        let mut query = OracleQuery::default();
        for &antenna in antennas {
            if (antenna as usize) < ORACLE_SLOTS {
                query.antenna_exists[antenna as usize] = true;
            }
        }
        let walsh = antennas
            .iter()
            .map(|&antenna| {
                let mut row = [0i64; WALSH_STEPS];
                let bit = u32::from(antenna) % 6;
                for (step, slot) in row.iter_mut().enumerate() {
                    *slot = if (step >> bit) & 1 == 0 { 1 } else { -1 };
                }
                (antenna, row)
            })
            .collect();
        Self { query, walsh }
    }

    pub fn with_query(mut self, query: OracleQuery) -> Self {
        self.query = query;
        self
    }
}

#[async_trait]
impl GeometryOracle for StaticOracle {
    async fn walsh_pattern(&self) -> anyhow::Result<HashMap<u8, [i64; WALSH_STEPS]>> {
        Ok(self.walsh.clone())
    }

    async fn query(&self, _phases: &[f64]) -> anyhow::Result<OracleQuery> {
        Ok(self.query.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lst_stays_in_range_and_advances() {
        // 2026-03-01 00:00:00 UTC
        let t0 = 1_772_323_200.0;
        let lst0 = local_sidereal_time(t0, 0.0);
        assert!((0.0..24.0).contains(&lst0));
        // One sidereal hour later the LST moved by about an hour.
        let lst1 = local_sidereal_time(t0 + 3600.0, 0.0);
        let delta = (lst1 - lst0).rem_euclid(24.0);
        assert!((delta - 1.0027).abs() < 0.01);
    }

    #[test]
    fn zero_coefficients_leave_the_instrumental_offset() {
        let mut query = OracleQuery::default();
        query.antenna_exists[3] = true;
        assert_eq!(predicted_delay_ns(&query, 3, 1_772_323_200.0), DELAY_OFFSET_NS);
    }

    #[test]
    fn coefficients_modulate_around_the_offset() {
        let mut query = OracleQuery::default();
        query.antenna_exists[1] = true;
        query.a[1] = 1e-7; // 100 ns constant term
        let delay = predicted_delay_ns(&query, 1, 1_772_323_200.0);
        assert!((delay - (DELAY_OFFSET_NS - 100.0)).abs() < 1e-6);
    }

    #[test]
    fn walsh_rows_are_bipolar_and_complete() {
        let oracle = StaticOracle::new(&[6, 1, 2]);
        assert_eq!(oracle.walsh.len(), 3);
        for row in oracle.walsh.values() {
            assert!(row.iter().all(|&v| v == 1 || v == -1));
        }
        // Different antennas get different switching periods.
        assert_ne!(oracle.walsh[&1], oracle.walsh[&2]);
    }
}
