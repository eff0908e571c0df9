//! Shared mutable server state.
//!
//! Everything mutable in the server lives in one `ServerState` behind one
//! `tokio::sync::Mutex`. Command handlers take the lock once for all
//! their state work; background loops snapshot under the lock and apply
//! their writes in a single lock scope, so a handler observes the state
//! before or after a loop iteration, never a mix.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

pub type SharedState = Arc<Mutex<ServerState>>;

#[derive(Debug)]
pub struct ServerState {
    /// Active antennas, in insertion order. Empty-argument gets answer in
    /// this order.
    pub antennas: Vec<u8>,
    /// The antenna every produced baseline is formed against.
    pub reference: u8,
    /// Antenna id -> input index on the input-processing boards.
    pub mapping: HashMap<u8, u8>,
    /// Tracked baselines, (i, j) with i < j, fixed at startup.
    pub baselines: Vec<(u8, u8)>,

    pub delays: HashMap<u8, f64>,
    pub delay_offsets: HashMap<u8, f64>,
    pub phases: HashMap<u8, f64>,
    pub phase_offsets: HashMap<u8, f64>,
    pub gains: HashMap<u8, f64>,
    pub thresholds: HashMap<u8, u8>,
    /// Kelvin, informational only.
    pub system_temp: HashMap<u8, f64>,

    /// UDP destinations for the correlation fan-out.
    pub subscribers: HashSet<SocketAddr>,
    /// True while the correlation provider worker is alive.
    pub started: bool,
    /// Cached integration time in seconds, refreshed from the board.
    pub integration_time: f64,
    /// Fringe-stopping rate in GHz; 0 disables fringe-rotation phases.
    pub fstop_ghz: f64,
    /// Unix seconds of the most recent completed integration.
    pub last_correlation: Option<f64>,
    /// Most recent serialized correlation datagram, for command 128.
    pub last_packet: Option<Bytes>,
}

impl ServerState {
    pub fn new(antennas: Vec<u8>, reference: u8, baselines: Vec<(u8, u8)>, fstop_ghz: f64) -> Self {
        let float_map = |v: f64| antennas.iter().map(|&a| (a, v)).collect::<HashMap<_, _>>();
        // Default mapping puts the reference first on input 0, then the
        // rest in listed order.
        let mapping = antennas
            .iter()
            .enumerate()
            .map(|(i, &a)| (a, i as u8))
            .collect();
        Self {
            mapping,
            delays: float_map(2000.0),
            delay_offsets: float_map(0.0),
            phases: float_map(0.0),
            phase_offsets: float_map(0.0),
            gains: float_map(1.0),
            thresholds: antennas.iter().map(|&a| (a, 16)).collect(),
            system_temp: float_map(150.0),
            subscribers: HashSet::new(),
            started: false,
            integration_time: 1.0,
            fstop_ghz,
            last_correlation: None,
            last_packet: None,
            antennas,
            reference,
            baselines,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn has_antenna(&self, antenna: u8) -> bool {
        self.antennas.contains(&antenna)
    }

    /// Baselines that include the reference antenna; the only ones the
    /// correlator image produces lags for.
    pub fn tracked_baselines(&self) -> Vec<(u8, u8)> {
        self.baselines
            .iter()
            .copied()
            .filter(|&(i, j)| i == self.reference || j == self.reference)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ServerState {
        ServerState::new(vec![6, 1, 2, 3, 4, 5, 7, 8], 6, vec![(1, 6), (2, 6)], -0.256)
    }

    #[test]
    fn every_antenna_has_an_entry_in_every_map() {
        let st = state();
        for &a in &st.antennas {
            assert!(st.mapping.contains_key(&a));
            assert!(st.delays.contains_key(&a));
            assert!(st.delay_offsets.contains_key(&a));
            assert!(st.phases.contains_key(&a));
            assert!(st.phase_offsets.contains_key(&a));
            assert!(st.gains.contains_key(&a));
            assert!(st.thresholds.contains_key(&a));
            assert!(st.system_temp.contains_key(&a));
        }
    }

    #[test]
    fn default_mapping_is_a_bijection() {
        let st = state();
        let inputs: HashSet<u8> = st.mapping.values().copied().collect();
        assert_eq!(inputs.len(), st.antennas.len());
    }

    #[test]
    fn tracked_baselines_include_the_reference() {
        let mut st = state();
        st.baselines = vec![(1, 6), (2, 3), (6, 7)];
        assert_eq!(st.tracked_baselines(), vec![(1, 6), (6, 7)]);
    }
}
