//! The TCP command server: accept loop, per-connection tasks, framing
//! glue and the dispatch critical section, plus the `Backend` aggregate
//! that owns the boards, the oracle, the provider and the loop handles.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use fringe_proto::{read_frame, write_frame, Command, FrameError, STATUS_INVALID};

use crate::boards::{connect_block, Boards};
use crate::config::{BackendConfig, Block};
use crate::correlator::CorrelationProvider;
use crate::geometry::{GeometryOracle, StaticOracle};
use crate::handlers;
use crate::loops::{start_checks_loop, LoopHandle, CHECKS_PERIOD};
use crate::sim::sim_block;
use crate::state::{ServerState, SharedState};

/// Lag channels per baseline on the correlator image.
pub const CORRELATOR_LAGS: usize = 16;
/// Analog bandwidth of one sideband, Hz.
pub const ANALOG_BANDWIDTH_HZ: f64 = 512e6;
/// Idle receive bound on a command connection.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Backend {
    pub state: SharedState,
    pub boards: Boards,
    pub oracle: Arc<dyn GeometryOracle>,
    pub config: BackendConfig,
    pub provider: Mutex<CorrelationProvider>,
    pub checks: Mutex<Option<LoopHandle>>,
    pub delay_tracker: Mutex<Option<LoopHandle>>,
    /// The running tracker and its loopback subscriber address.
    pub phase_tracker: Mutex<Option<(LoopHandle, std::net::SocketAddr)>>,
    /// Serializes command handling across connections.
    dispatch: Mutex<()>,
    pub shutdown: watch::Sender<bool>,
}

impl Backend {
    /// Assemble a backend for one block: boards, state, provider, and
    /// the health-check loop (which runs for the server's lifetime).
    pub fn build(
        block: Block,
        config: BackendConfig,
        antennas: Vec<u8>,
        reference: u8,
        baselines: Vec<(u8, u8)>,
    ) -> Arc<Self> {
        let boards = match block {
            Block::Sim => sim_block(config.syncsel),
            _ => connect_block(&config),
        };
        let oracle: Arc<dyn GeometryOracle> = Arc::new(StaticOracle::new(&antennas));
        let state = ServerState::new(antennas, reference, baselines, config.fstop_ghz).shared();
        let provider = CorrelationProvider::new(
            boards.correlator.clone(),
            state.clone(),
            CORRELATOR_LAGS,
            ANALOG_BANDWIDTH_HZ,
        );
        let (shutdown, _) = watch::channel(false);
        let checks = start_checks_loop(boards.clone(), CHECKS_PERIOD);
        Arc::new(Self {
            state,
            boards,
            oracle,
            config,
            provider: Mutex::new(provider),
            checks: Mutex::new(Some(checks)),
            delay_tracker: Mutex::new(None),
            phase_tracker: Mutex::new(None),
            dispatch: Mutex::new(()),
            shutdown,
        })
    }

    /// One-time board initialization: input selects, monitor taps, XAUI
    /// start and the correlator sync source. Failures are logged so a
    /// partially absent block still serves commands.
    pub async fn setup(&self) {
        use crate::boards::{RegisterBoard, ShellBoard};
        for (name, board) in self.boards.input_boards() {
            for (reg, value) in [("insel", 0u32), ("smasel", 0), ("monsel", 2), ("start_xaui", 1)] {
                if let Err(e) = board.write_reg(reg, value).await {
                    warn!("{name}: setup write {reg} failed: {e}");
                    break;
                }
            }
        }
        if let Err(e) = self.boards.dbe.write_reg("insel", 0).await {
            warn!("dbe: setup write insel failed: {e}");
        }
        if let Err(e) = self
            .boards
            .correlator
            .write_reg("syncsel", self.config.syncsel)
            .await
        {
            warn!("bee2: setup write syncsel failed: {e}");
        }
    }

    /// Stop every worker: loops first, then the provider; the loopback
    /// subscriber goes with the phase tracker.
    pub async fn stop_workers(&self) {
        if let Some(handle) = self.checks.lock().await.take() {
            handle.stop().await;
        }
        if let Some(handle) = self.delay_tracker.lock().await.take() {
            handle.stop().await;
        }
        let loopback = match self.phase_tracker.lock().await.take() {
            Some((handle, loopback)) => {
                handle.stop().await;
                Some(loopback)
            }
            None => None,
        };
        {
            let mut st = self.state.lock().await;
            st.started = false;
            if let Some(loopback) = loopback {
                st.subscribers.remove(&loopback);
            }
        }
        self.provider.lock().await.stop().await;
    }

    /// True once command 255 has been accepted.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Accept connections until shutdown, then stop every worker.
pub async fn serve(backend: Arc<Backend>, listener: TcpListener) -> anyhow::Result<()> {
    let mut shutdown = backend.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("connection from {peer}");
                    let backend = backend.clone();
                    tokio::spawn(async move {
                        handle_connection(backend, stream).await;
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }
    drop(listener);
    backend.stop_workers().await;
    info!("server stopped");
    Ok(())
}

async fn handle_connection(backend: Arc<Backend>, mut stream: TcpStream) {
    loop {
        let payload = match timeout(RECV_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(FrameError::Closed)) => return,
            Ok(Err(e)) => {
                error!("framing error: {e}");
                let _ = write_frame(&mut stream, &handlers::status(STATUS_INVALID)).await;
                return;
            }
            Err(_) => {
                debug!("connection idle past the receive bound");
                let _ = write_frame(&mut stream, &handlers::status(STATUS_INVALID)).await;
                return;
            }
        };
        let response = dispatch(&backend, &payload).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!("response write failed: {e}");
            return;
        }
        if backend.is_shutting_down() {
            return;
        }
    }
}

/// Route one request payload to its handler under the dispatch lock.
pub async fn dispatch(backend: &Arc<Backend>, payload: &[u8]) -> Bytes {
    let Some((&code, args)) = payload.split_first() else {
        error!("empty request payload");
        return handlers::status(STATUS_INVALID);
    };
    let Some(command) = Command::from_code(code) else {
        error!("no such command word {code}");
        return handlers::status(STATUS_INVALID);
    };
    let _serialized = backend.dispatch.lock().await;
    handlers::handle(backend, command, args).await
}
