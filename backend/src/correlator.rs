//! The correlation provider: integration-synchronized lag reads,
//! per-baseline DSP, and the UDP fan-out to subscribers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use num_complex::Complex64;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fringe_proto::CorrelationPacket;

use crate::boards::RegisterBoard;
use crate::dsp;
use crate::loops::wait_stop;
use crate::state::SharedState;

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct CorrelationProvider {
    board: Arc<dyn RegisterBoard>,
    state: SharedState,
    lags: usize,
    bandwidth_hz: f64,
    stop: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl CorrelationProvider {
    pub fn new(board: Arc<dyn RegisterBoard>, state: SharedState, lags: usize, bandwidth_hz: f64) -> Self {
        Self {
            board,
            state,
            lags,
            bandwidth_hz,
            stop: None,
            worker: None,
        }
    }

    pub fn start(&mut self) {
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(provider_loop(
            self.board.clone(),
            self.state.clone(),
            self.lags,
            self.bandwidth_hz,
            rx,
        ));
        self.stop = Some(tx);
        self.worker = Some(worker);
        info!("correlation provider started");
    }

    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        info!("correlation provider stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

async fn provider_loop(
    board: Arc<dyn RegisterBoard>,
    state: SharedState,
    lags: usize,
    bandwidth_hz: f64,
    mut stop: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("provider could not bind its fan-out socket: {e}");
            return;
        }
    };

    while !*stop.borrow() {
        // Snapshot shared inputs in one lock scope.
        let (mapping, reference, tracked) = {
            let st = state.lock().await;
            (st.mapping.clone(), st.reference, st.tracked_baselines())
        };

        // Wait for the integration counter to pass its snapshot.
        let Ok(start_cnt) = log_reg_err(board.read_reg("integ_cnt").await) else {
            if wait_stop(&mut stop, Duration::from_secs(1)).await {
                return;
            }
            continue;
        };
        loop {
            match log_reg_err(board.read_reg("integ_cnt").await) {
                Ok(count) if count > start_cnt => break,
                _ => {}
            }
            if wait_stop(&mut stop, Duration::from_secs(1)).await {
                return;
            }
        }

        let correlation_time = unix_now();
        let total = tracked.len() as u16;
        let mut packets = Vec::with_capacity(tracked.len());
        for (index, &(left, right)) in tracked.iter().enumerate() {
            let other = if left == reference { right } else { left };
            let Some(&input) = mapping.get(&other) else {
                warn!("baseline ({left},{right}): antenna {other} has no input mapping");
                continue;
            };
            match read_baseline(&*board, input, lags).await {
                Ok(lag_vec) => {
                    let packet = process_baseline(
                        lag_vec,
                        (left, right),
                        index as u16,
                        total,
                        correlation_time,
                        bandwidth_hz,
                    );
                    packets.push(packet.to_bytes());
                }
                Err(e) => warn!("baseline ({left},{right}): lag read failed: {e}"),
            }
        }

        // Subscribers are read at broadcast time, so additions land on
        // the very next fan-out.
        let subscribers: Vec<SocketAddr> = {
            let mut st = state.lock().await;
            st.last_correlation = Some(correlation_time);
            if let Some(last) = packets.last() {
                st.last_packet = Some(last.clone());
            }
            st.subscribers.iter().copied().collect()
        };

        // Fan out without holding the lock; datagram loss is acceptable.
        for packet in &packets {
            for subscriber in &subscribers {
                if let Err(e) = socket.send_to(packet, subscriber).await {
                    warn!("udp send to {subscriber} failed: {e}");
                }
            }
        }
    }
}

fn log_reg_err<T>(result: Result<T, crate::boards::BoardError>) -> Result<T, ()> {
    result.map_err(|e| warn!("correlator register read failed: {e}"))
}

async fn read_baseline(
    board: &dyn RegisterBoard,
    input: u8,
    lags: usize,
) -> Result<Vec<Complex64>, crate::boards::BoardError> {
    let real = board.read_bram(&format!("rx{input}_usb_real"), lags).await?;
    let imag = board.read_bram(&format!("rx{input}_usb_imag"), lags).await?;
    Ok(real
        .into_iter()
        .zip(imag)
        .map(|(re, im)| Complex64::new(re as f64, im as f64))
        .collect())
}

fn process_baseline(
    lags: Vec<Complex64>,
    (left, right): (u8, u8),
    current: u16,
    total: u16,
    time: f64,
    bandwidth_hz: f64,
) -> CorrelationPacket {
    let count = lags.len();
    let norms: Vec<f64> = lags.iter().map(|v| v.norm()).collect();
    let span = 100.0 * (norms.iter().cloned().fold(0.0, f64::max)
        - norms.iter().cloned().fold(f64::INFINITY, f64::min))
        / (1u64 << 31) as f64;
    info!("baseline ({left},{right}): span={span:.4}%");

    let vis = dsp::visibility(&lags);
    let freqs = dsp::visibility_freqs(count);
    let angles: Vec<f64> = vis.iter().map(|v| v.arg()).collect();
    let ((slope, intercept), fitted) = dsp::phase_fit(&freqs, &angles);
    let delay = dsp::slope_to_delay_ns(slope, bandwidth_hz, count);

    CorrelationPacket {
        time: time as f32,
        left,
        right,
        current,
        total,
        lags,
        visibility: vis,
        phase_fit: fitted,
        delay: delay as f32,
        phase: intercept as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_carries_header_laws() {
        let lags: Vec<Complex64> = (0..16)
            .map(|k: i32| Complex64::new(((1 << 10) >> (k - 8).unsigned_abs().min(20)) as f64, 0.0))
            .collect();
        let packet = process_baseline(lags, (1, 6), 0, 1, 1_700_000_000.0, 512e6);
        assert_eq!(packet.left, 1);
        assert_eq!(packet.right, 6);
        assert!(packet.current < packet.total);
        assert_eq!(packet.lags.len(), 16);
        assert_eq!(packet.visibility.len(), 15);
        assert_eq!(packet.phase_fit.len(), 15);
    }

    #[test]
    fn symmetric_lags_fit_to_zero_delay() {
        let lags: Vec<Complex64> = (0..16)
            .map(|k: i32| Complex64::new(((1 << 20) >> (k - 8).unsigned_abs().min(20)) as f64, 0.0))
            .collect();
        let packet = process_baseline(lags, (1, 6), 0, 1, 0.0, 512e6);
        assert!(packet.delay.abs() < 1e-6);
        assert!(packet.phase.abs() < 1e-6);
    }
}
