//! The phase tracker: a feedback controller that watches the measured
//! mean phase on every reference-inclusive baseline (through a loopback
//! UDP subscription to the correlation fan-out) and trims the non-
//! reference antenna's phase offset to hold the fringe stopped.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use fringe_proto::CorrelationPacket;

use crate::boards::Boards;
use crate::correlator::unix_now;
use crate::loops::LoopHandle;
use crate::params::{get_param, set_param, Param};
use crate::state::SharedState;

/// Mean phases remembered per antenna before a correction is considered.
pub const HISTORY_LEN: usize = 10;
/// Baselines noisier than this RMS (radians) are left alone.
pub const RMS_GATE_RAD: f64 = PI / 8.0;
/// Corrections smaller than the phase-register granularity are skipped.
pub const MIN_CORRECTION_DEG: f64 = 1.0;
/// Integrations that must pass between corrections on one antenna.
pub const RATE_LIMIT_INTEGRATIONS: f64 = 3.0;

/// The decision logic, kept free of I/O so the gating laws are directly
/// testable.
#[derive(Debug, Default)]
pub struct PhaseController {
    history: HashMap<u8, VecDeque<f64>>,
    corrections: HashMap<u8, Option<f64>>,
}

impl PhaseController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one measured mean phase (radians) for the non-reference
    /// antenna of a baseline. Returns the correction in degrees once the
    /// history is full and quiet enough.
    pub fn observe(&mut self, other: u8, phase_rad: f64) -> Option<f64> {
        if !self.history.contains_key(&other) {
            self.corrections.insert(other, None);
        }
        let history = self.history.entry(other).or_default();
        history.push_back(phase_rad);
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }
        if history.len() < HISTORY_LEN {
            return None;
        }

        let phases: Vec<f64> = history.iter().copied().collect();
        let unwrapped = crate::dsp::unwrap_phases(&phases);
        if crate::dsp::std_dev(&unwrapped) > RMS_GATE_RAD {
            return None;
        }
        Some(-crate::dsp::mean(&unwrapped).to_degrees())
    }

    /// Rate limit: at most one applied correction per antenna every
    /// `RATE_LIMIT_INTEGRATIONS` integration times.
    pub fn may_apply(&self, other: u8, now: f64, integration_time: f64) -> bool {
        match self.corrections.get(&other).copied().flatten() {
            Some(last) => now - last >= RATE_LIMIT_INTEGRATIONS * integration_time,
            None => true,
        }
    }

    pub fn mark_applied(&mut self, other: u8, at: f64) {
        self.corrections.insert(other, Some(at));
    }
}

/// Bind the loopback subscriber, register it with the fan-out, and start
/// the feedback loop. Returns the handle and the bound loopback address
/// (port 0 asks the OS for one), which is removed from the subscriber
/// set when the tracker stops.
pub async fn start(
    state: SharedState,
    boards: Boards,
    port: u16,
) -> anyhow::Result<(LoopHandle, SocketAddr)> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    let address = socket.local_addr()?;
    {
        let mut st = state.lock().await;
        st.subscribers.insert(address);
    }
    info!("phase tracker listening on {address}");

    let handle = LoopHandle::spawn(move |mut stop| async move {
        let mut controller = PhaseController::new();
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _)) => {
                            handle_packet(&state, &boards, &mut controller, &buf[..len]).await;
                        }
                        Err(e) => warn!("phase tracker receive failed: {e}"),
                    }
                }
            }
        }
    });
    Ok((handle, address))
}

async fn handle_packet(
    state: &SharedState,
    boards: &Boards,
    controller: &mut PhaseController,
    datagram: &[u8],
) {
    let packet = match CorrelationPacket::from_bytes(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("malformed correlation datagram: {e}");
            return;
        }
    };

    let reference = {
        let st = state.lock().await;
        st.reference
    };
    let other = if packet.left == reference {
        packet.right
    } else if packet.right == reference {
        packet.left
    } else {
        return;
    };

    let Some(correction) = controller.observe(other, f64::from(packet.phase)) else {
        return;
    };

    // The rate limit runs on the board's current integration time.
    let integration_time = match boards.integration_time().await {
        Ok(t) => t,
        Err(e) => {
            warn!("could not read the integration time: {e}");
            return;
        }
    };
    let now = unix_now();
    if !controller.may_apply(other, now, integration_time) {
        debug!("correction on antenna {other} suppressed by the rate limit");
        return;
    }
    if correction.abs() < MIN_CORRECTION_DEG {
        return;
    }

    let mut st = state.lock().await;
    let current = match get_param(boards, &st, Param::PhaseOffset, other).await {
        Ok(v) => v,
        Err(e) => {
            warn!("phase offset read for antenna {other} failed: {e}");
            return;
        }
    };
    match set_param(boards, &mut st, Param::PhaseOffset, other, current + correction).await {
        Ok(applied) => {
            controller.mark_applied(other, now);
            info!("antenna {other}: phase offset {current:.2} -> {applied:.2} deg");
        }
        Err(e) => warn!("phase offset write for antenna {other} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noisy_history_is_gated() {
        let mut controller = PhaseController::new();
        let noisy = [0.0, PI / 2.0, -PI / 2.0, PI, 0.0, PI / 2.0, -PI / 2.0, PI, 0.0, PI / 2.0];
        let mut produced = None;
        for &p in &noisy {
            produced = controller.observe(2, p);
        }
        assert_eq!(produced, None);
    }

    #[test]
    fn steady_phase_produces_the_expected_correction() {
        let mut controller = PhaseController::new();
        let mut produced = None;
        for i in 0..HISTORY_LEN {
            let jitter = if i % 2 == 0 { 0.005 } else { -0.005 };
            produced = controller.observe(2, 0.5 + jitter);
        }
        let correction = produced.expect("full quiet history yields a correction");
        assert!((correction - (-0.5f64.to_degrees())).abs() < 1.0);
    }

    #[test]
    fn short_history_yields_nothing() {
        let mut controller = PhaseController::new();
        for _ in 0..HISTORY_LEN - 1 {
            assert_eq!(controller.observe(2, 0.5), None);
        }
    }

    #[test]
    fn rate_limit_spaces_corrections() {
        let mut controller = PhaseController::new();
        let integration = 2.0;
        assert!(controller.may_apply(2, 100.0, integration));
        controller.mark_applied(2, 100.0);
        assert!(!controller.may_apply(2, 100.0 + 5.9, integration));
        assert!(controller.may_apply(2, 100.0 + 6.0, integration));
    }

    #[test]
    fn history_is_bounded() {
        let mut controller = PhaseController::new();
        for _ in 0..HISTORY_LEN * 3 {
            controller.observe(2, 0.0);
        }
        assert_eq!(controller.history[&2].len(), HISTORY_LEN);
    }

    #[test]
    fn wrapped_but_quiet_phases_still_correct() {
        // Phases hugging +/- pi are quiet after unwrapping.
        let mut controller = PhaseController::new();
        let mut produced = None;
        for i in 0..HISTORY_LEN {
            let jitter = 0.01 * if i % 2 == 0 { 1.0 } else { -1.0 };
            let phase = PI - 0.005 + jitter;
            let wrapped = if phase > PI { phase - 2.0 * PI } else { phase };
            produced = controller.observe(4, wrapped);
        }
        let correction = produced.expect("quiet wrapped history yields a correction");
        assert!((correction.abs() - 180.0).abs() < 2.0);
    }
}
