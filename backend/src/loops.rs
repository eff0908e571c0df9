//! Background loop runtime: the stop-signal/join pattern shared by the
//! health checks, the delay tracker and the phase tracker, plus the
//! first two loops themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::boards::{read_xaui_lane, Boards, RegisterBoard, ShellBoard, XAUI_LANES};
use crate::correlator::unix_now;
use crate::geometry::{predicted_delay_ns, GeometryOracle, OracleQuery};
use crate::params::{set_param, Param};
use crate::state::SharedState;

pub const CHECKS_PERIOD: Duration = Duration::from_secs(30);
pub const DELAY_TRACKER_PERIOD: Duration = Duration::from_secs(4);
/// Oracle cache refresh cadence, in delay-tracker iterations.
const ORACLE_REFRESH_ITERATIONS: u64 = 20;

/// A background worker with a stop signal; stopping sets the signal and
/// joins the task.
pub struct LoopHandle {
    stop: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl LoopHandle {
    pub fn spawn<F>(build: impl FnOnce(watch::Receiver<bool>) -> F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, rx) = watch::channel(false);
        let worker = tokio::spawn(build(rx));
        Self { stop, worker }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.worker.await;
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }
}

/// Wait up to `period` for the stop signal; true means stop.
pub async fn wait_stop(stop: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
        _ = tokio::time::sleep(period) => *stop.borrow(),
    }
}

// ── Health checks ──────────────────────────────────────────────────────

pub fn start_checks_loop(boards: Boards, period: Duration) -> LoopHandle {
    LoopHandle::spawn(move |mut stop| async move {
        info!("starting XAUI health checks (period {:.0?})", period);
        loop {
            run_checks(&boards).await;
            if wait_stop(&mut stop, period).await {
                return;
            }
        }
    })
}

pub async fn run_checks(boards: &Boards) {
    for lane in XAUI_LANES {
        let correlator = boards.correlator.clone();
        let outcome = read_xaui_lane(lane, '_', move |reg| {
            let board = correlator.clone();
            async move { board.read_reg(&reg).await }
        })
        .await;
        report_lane("BEE", lane, outcome);
    }
    for lane in XAUI_LANES {
        let dbe = boards.dbe.clone();
        let outcome = read_xaui_lane(lane, '/', move |reg| {
            let board = dbe.clone();
            async move { board.read_reg(&reg).await }
        })
        .await;
        report_lane("DBE", lane, outcome);
    }
}

fn report_lane(
    board: &str,
    lane: &str,
    outcome: Result<crate::boards::XauiHealth, crate::boards::BoardError>,
) {
    match outcome {
        Ok(health) => {
            if health.link_down {
                error!("{board} {lane} link is down!");
            }
            info!(
                "{board}/{lane}: (period {})(syncs {})(errors {})(linkdowns {})",
                health.period, health.sync_cnt, health.period_err_cnt, health.linkdown_cnt
            );
        }
        Err(e) => warn!("{board} {lane} health read failed: {e}"),
    }
}

// ── Delay tracker ──────────────────────────────────────────────────────

pub fn start_delay_tracker(
    state: SharedState,
    boards: Boards,
    oracle: Arc<dyn GeometryOracle>,
    period: Duration,
) -> LoopHandle {
    LoopHandle::spawn(move |mut stop| async move {
        info!("starting delay tracker (period {:.0?})", period);
        let mut cache: Option<OracleQuery> = None;
        let mut iteration: u64 = 0;
        loop {
            let pass_started = Instant::now();
            if iteration % ORACLE_REFRESH_ITERATIONS == 0 {
                cache = None;
            }
            iteration += 1;

            let query = match &cache {
                Some(query) => query.clone(),
                None => match oracle.query(&[0.0; 11]).await {
                    Ok(query) => {
                        cache = Some(query.clone());
                        query
                    }
                    Err(e) => {
                        // Skip this period and retry on the next.
                        error!("problem communicating with the geometry oracle: {e}");
                        if wait_stop(&mut stop, period).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            let (antennas, fstop) = {
                let st = state.lock().await;
                (st.antennas.clone(), st.fstop_ghz)
            };

            // Predict for the moment the writes land.
            let at = unix_now() + period.as_secs_f64();
            let delays: HashMap<u8, f64> = antennas
                .iter()
                .map(|&a| (a, predicted_delay_ns(&query, a, at)))
                .collect();
            let phases: Option<HashMap<u8, f64>> = (fstop != 0.0).then(|| {
                antennas
                    .iter()
                    .map(|&a| (a, fringe_phase_deg(delays[&a], fstop)))
                    .collect()
            });

            // Burn the rest of the period, polling the stop signal.
            while pass_started.elapsed() < period {
                let remaining = period - pass_started.elapsed();
                if wait_stop(&mut stop, remaining.min(period / 10)).await {
                    return;
                }
            }

            // Apply everything in one lock scope.
            {
                let mut st = state.lock().await;
                for &antenna in &antennas {
                    if let Err(e) = set_param(&boards, &mut st, Param::Delay, antenna, delays[&antenna]).await {
                        warn!("delay write for antenna {antenna} failed: {e}");
                    }
                    if let Some(phases) = &phases {
                        if let Err(e) =
                            set_param(&boards, &mut st, Param::Phase, antenna, phases[&antenna]).await
                        {
                            warn!("fringe phase write for antenna {antenna} failed: {e}");
                        }
                    }
                }
            }
            info!(
                "{}",
                antennas
                    .iter()
                    .map(|a| format!("{a}:{:.2}", delays[a]))
                    .collect::<Vec<_>>()
                    .join("|")
            );

            if *stop.borrow() {
                return;
            }
        }
    })
}

/// Fringe-rotation phase for one antenna, degrees.
pub fn fringe_phase_deg(delay_ns: f64, fstop_ghz: f64) -> f64 {
    fstop_ghz.signum() * ((360.0 * delay_ns * fstop_ghz.abs()) % 360.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fringe_phase_follows_the_rate_sign() {
        let positive = fringe_phase_deg(4000.0, 0.256);
        let negative = fringe_phase_deg(4000.0, -0.256);
        assert!((positive + negative).abs() < 1e-9);
        assert!((0.0..360.0).contains(&positive.abs()));
        // 4000 ns * 0.256 GHz = 1024 whole turns
        assert!(positive.abs() < 1e-6);
    }

    #[test]
    fn fringe_phase_partial_turn() {
        // 1001.5 ns * 0.5 GHz = 500.75 turns -> 270 degrees
        let phase = fringe_phase_deg(1001.5, 0.5);
        assert!((phase - 270.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn loop_handle_stops_promptly() {
        let started = Instant::now();
        let handle = LoopHandle::spawn(|mut stop| async move {
            loop {
                if wait_stop(&mut stop, Duration::from_secs(60)).await {
                    return;
                }
            }
        });
        assert!(handle.is_running());
        handle.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
