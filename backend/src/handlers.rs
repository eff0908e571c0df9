//! Command handler bodies for the TCP control protocol.
//!
//! Dispatch hands every request to `handle` under the process-wide
//! dispatch critical section. Handler bodies take the state lock once
//! for all their state work; lifecycle operations that join a worker
//! (commands 7, 9, 19, 255) do so after the state lock is released,
//! since those workers take the same lock inside their iterations.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use fringe_proto::{Command, STATUS_BAD_LENGTH, STATUS_INVALID, STATUS_OK};

use crate::boards::{read_dbe_gains, sync_period, write_dbe_gains, RegisterBoard, ShellBoard};
use crate::loops::{start_delay_tracker, DELAY_TRACKER_PERIOD};
use crate::params::{get_values, set_values, Param};
use crate::phase_tracker;
use crate::server::Backend;

pub fn status(code: i8) -> Bytes {
    Bytes::copy_from_slice(&[code as u8])
}

fn ok_payload(build: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i8(STATUS_OK);
    build(&mut buf);
    buf.freeze()
}

pub async fn handle(backend: &Backend, cmd: Command, args: &[u8]) -> Bytes {
    match cmd {
        Command::Subscribe => edit_subscribers(backend, args, true).await,
        Command::Unsubscribe => edit_subscribers(backend, args, false).await,
        Command::GetMapping => value_get(backend, Param::Mapping, args).await,
        Command::SetMapping => value_set(backend, Param::Mapping, args).await,
        Command::LoadWalshTable => load_walsh_table(backend).await,
        Command::ClearWalshTable => clear_walsh_table(backend).await,
        Command::DelayTracker => delay_tracker(backend, args).await,
        Command::StartCorrelator => start_correlator(backend).await,
        Command::StopCorrelator => stop_correlator(backend).await,
        Command::GetIntegrationTime => get_integration_time(backend).await,
        Command::SetIntegrationTime => set_integration_time(backend, args).await,
        Command::ResetXaui => reset_xaui(backend, args).await,
        Command::ArmSync => arm_sync(backend).await,
        Command::NoiseMode => noise_mode(backend, args).await,
        Command::BoardShell => board_shell(backend, args).await,
        Command::GetReference => get_reference(backend).await,
        Command::SetupFstopping => setup_fstopping(backend, args).await,
        Command::StartFstopping => start_fstopping(backend).await,
        Command::StopFstopping => stop_fstopping(backend).await,
        Command::GetPhaseOffsets => value_get(backend, Param::PhaseOffset, args).await,
        Command::SetPhaseOffsets => value_set(backend, Param::PhaseOffset, args).await,
        Command::GetDelayOffsets => value_get(backend, Param::DelayOffset, args).await,
        Command::SetDelayOffsets => value_set(backend, Param::DelayOffset, args).await,
        Command::GetDelays => value_get(backend, Param::Delay, args).await,
        Command::SetDelays => value_set(backend, Param::Delay, args).await,
        Command::GetPhases => value_get(backend, Param::Phase, args).await,
        Command::SetPhases => value_set(backend, Param::Phase, args).await,
        Command::GetGains => value_get(backend, Param::Gain, args).await,
        Command::SetGains => value_set(backend, Param::Gain, args).await,
        Command::GetThresholds => value_get(backend, Param::Threshold, args).await,
        Command::SetThresholds => value_set(backend, Param::Threshold, args).await,
        Command::GetDbeGains => get_dbe_gains(backend).await,
        Command::SetDbeGains => set_dbe_gains(backend, args).await,
        Command::OperationsLog => operations_log(args).await,
        Command::GetCorrelation => get_correlation(backend).await,
        Command::Shutdown => shutdown(backend).await,
    }
}

// ── Subscribers ────────────────────────────────────────────────────────

fn parse_address(args: &[u8]) -> Option<SocketAddr> {
    if args.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(args[0], args[1], args[2], args[3]);
    let port = u16::from_be_bytes([args[4], args[5]]);
    Some(SocketAddr::from((ip, port)))
}

async fn edit_subscribers(backend: &Backend, args: &[u8], add: bool) -> Bytes {
    let Some(address) = parse_address(args) else {
        error!("subscriber address should be 6 bytes but is {}", args.len());
        return status(STATUS_BAD_LENGTH);
    };
    let mut st = backend.state.lock().await;
    let changed = if add {
        st.subscribers.insert(address)
    } else {
        st.subscribers.remove(&address)
    };
    if changed {
        info!("subscriber {address} {}", if add { "added" } else { "removed" });
        status(STATUS_OK)
    } else {
        warn!(
            "{address} is {} a subscriber",
            if add { "already" } else { "not" }
        );
        status(STATUS_INVALID)
    }
}

// ── Parameter families ─────────────────────────────────────────────────

async fn value_get(backend: &Backend, param: Param, args: &[u8]) -> Bytes {
    let st = backend.state.lock().await;
    get_values(&backend.boards, &st, param, args).await
}

async fn value_set(backend: &Backend, param: Param, args: &[u8]) -> Bytes {
    let mut st = backend.state.lock().await;
    set_values(&backend.boards, &mut st, param, args).await
}

// ── Walsh tables ───────────────────────────────────────────────────────

async fn load_walsh_table(backend: &Backend) -> Bytes {
    let pattern = match backend.oracle.walsh_pattern().await {
        Ok(pattern) => pattern,
        Err(e) => {
            error!("could not fetch the walsh pattern: {e}");
            return status(STATUS_INVALID);
        }
    };
    let mapping = backend.state.lock().await.mapping.clone();
    for (antenna, row) in pattern {
        let Some(&input) = mapping.get(&antenna) else {
            continue;
        };
        let (board, port) = backend.boards.input_board(input);
        let words: Vec<u32> = row.iter().map(|&step| step as i32 as u32).collect();
        if let Err(e) = board.write_bram(&format!("walsh{port}"), &words).await {
            warn!("walsh write for antenna {antenna} failed: {e}");
            return status(STATUS_INVALID);
        }
    }
    info!("walsh tables loaded");
    status(STATUS_OK)
}

async fn clear_walsh_table(backend: &Backend) -> Bytes {
    let mapping = backend.state.lock().await.mapping.clone();
    let zeros = vec![0u32; crate::geometry::WALSH_STEPS];
    for (antenna, input) in mapping {
        let (board, port) = backend.boards.input_board(input);
        if let Err(e) = board.write_bram(&format!("walsh{port}"), &zeros).await {
            warn!("walsh clear for antenna {antenna} failed: {e}");
            return status(STATUS_INVALID);
        }
    }
    info!("walsh tables cleared");
    status(STATUS_OK)
}

// ── Background-loop lifecycles ─────────────────────────────────────────

async fn delay_tracker(backend: &Backend, args: &[u8]) -> Bytes {
    if args.len() != 1 {
        return status(STATUS_BAD_LENGTH);
    }
    let turn_on = args[0] != 0;
    let mut tracker = backend.delay_tracker.lock().await;
    let running = tracker.as_ref().is_some_and(|h| h.is_running());
    if turn_on {
        if running {
            warn!("delay tracker already started");
            return status(STATUS_INVALID);
        }
        *tracker = Some(start_delay_tracker(
            backend.state.clone(),
            backend.boards.clone(),
            backend.oracle.clone(),
            DELAY_TRACKER_PERIOD,
        ));
        info!("delay tracker started");
    } else {
        if !running {
            warn!("delay tracker has not been started");
            return status(STATUS_INVALID);
        }
        if let Some(handle) = tracker.take() {
            handle.stop().await;
        }
        info!("delay tracker stopped");
    }
    status(STATUS_OK)
}

async fn start_fstopping(backend: &Backend) -> Bytes {
    let mut tracker = backend.phase_tracker.lock().await;
    if tracker.as_ref().is_some_and(|(handle, _)| handle.is_running()) {
        warn!("phase tracker already started");
        return status(STATUS_INVALID);
    }
    match phase_tracker::start(
        backend.state.clone(),
        backend.boards.clone(),
        backend.config.phase_tracker_port,
    )
    .await
    {
        Ok(started) => {
            *tracker = Some(started);
            status(STATUS_OK)
        }
        Err(e) => {
            error!("phase tracker failed to start: {e}");
            status(STATUS_INVALID)
        }
    }
}

async fn stop_fstopping(backend: &Backend) -> Bytes {
    let (handle, loopback) = {
        let mut tracker = backend.phase_tracker.lock().await;
        match tracker.take() {
            Some((handle, loopback)) if handle.is_running() => (handle, loopback),
            _ => {
                warn!("phase tracker has not been started");
                return status(STATUS_INVALID);
            }
        }
    };
    handle.stop().await;
    backend.state.lock().await.subscribers.remove(&loopback);
    info!("phase tracker stopped");
    status(STATUS_OK)
}

// ── Correlator lifecycle ───────────────────────────────────────────────

async fn start_correlator(backend: &Backend) -> Bytes {
    {
        let mut st = backend.state.lock().await;
        if st.started {
            warn!("correlator already started");
            return status(STATUS_INVALID);
        }
        st.started = true;
    }
    backend.provider.lock().await.start();
    info!("correlator started");
    status(STATUS_OK)
}

async fn stop_correlator(backend: &Backend) -> Bytes {
    {
        let mut st = backend.state.lock().await;
        if !st.started {
            warn!("correlator has not been started");
            return status(STATUS_INVALID);
        }
        st.started = false;
    }
    backend.provider.lock().await.stop().await;
    info!("correlator stopped");
    status(STATUS_OK)
}

// ── Correlator parameters ──────────────────────────────────────────────

async fn get_integration_time(backend: &Backend) -> Bytes {
    let mut st = backend.state.lock().await;
    match backend.boards.integration_time().await {
        Ok(seconds) => {
            st.integration_time = seconds;
            ok_payload(|buf| buf.put_f32(seconds as f32))
        }
        Err(e) => {
            warn!("integration time read failed: {e}");
            status(STATUS_INVALID)
        }
    }
}

async fn set_integration_time(backend: &Backend, args: &[u8]) -> Bytes {
    if args.len() != 4 {
        return status(STATUS_BAD_LENGTH);
    }
    let seconds = f64::from(f32::from_be_bytes([args[0], args[1], args[2], args[3]]));
    let mut st = backend.state.lock().await;
    let outcome = async {
        let syncsel = backend.boards.correlator.read_reg("syncsel").await?;
        let period = sync_period(syncsel);
        let counts = (seconds / period).round().max(1.0) as u32;
        backend.boards.correlator.write_reg("integ_time", counts).await?;
        Ok::<f64, crate::boards::BoardError>(f64::from(counts) * period)
    }
    .await;
    match outcome {
        Ok(actual) => {
            st.integration_time = actual;
            info!("integration time set to {actual:.3} s");
            status(STATUS_OK)
        }
        Err(e) => {
            warn!("integration time write failed: {e}");
            status(STATUS_INVALID)
        }
    }
}

async fn reset_xaui(backend: &Backend, args: &[u8]) -> Bytes {
    if args.len() != 1 {
        return status(STATUS_BAD_LENGTH);
    }
    let level = u32::from(args[0]);
    let correlator = &backend.boards.correlator;
    let dbe = &backend.boards.dbe;
    let outcome = async {
        correlator.write_reg("xaui_rst", level).await?;
        debug!("bee2 xaui_rst={}", correlator.read_reg("xaui_rst").await?);
        correlator.write_reg("xaui_rst", 0).await?;
        dbe.write_reg("xaui_rst", level).await?;
        debug!("dbe xaui_rst={}", dbe.read_reg("xaui_rst").await?);
        dbe.write_reg("xaui_rst", 0).await?;
        Ok::<(), crate::boards::BoardError>(())
    }
    .await;
    match outcome {
        Ok(()) => {
            info!("XAUI links pulsed with level {level}");
            status(STATUS_OK)
        }
        Err(e) => {
            warn!("XAUI reset failed: {e}");
            status(STATUS_INVALID)
        }
    }
}

async fn arm_sync(backend: &Backend) -> Bytes {
    let mut healthy = true;
    for (name, board) in backend.boards.shell_boards() {
        match board.shell("arm1pps").await {
            Ok(reply) => log_last_line(name, &reply),
            Err(e) => {
                warn!("{name}: arm1pps failed: {e}");
                healthy = false;
            }
        }
    }
    for (name, board) in backend.boards.input_boards() {
        match board.shell("armsowf").await {
            Ok(reply) => log_last_line(name, &reply),
            Err(e) => {
                warn!("{name}: armsowf failed: {e}");
                healthy = false;
            }
        }
    }
    if healthy {
        status(STATUS_OK)
    } else {
        status(STATUS_INVALID)
    }
}

fn log_last_line(board: &str, reply: &str) {
    if let Some(line) = reply.lines().rev().find(|l| !l.trim().is_empty()) {
        info!("{board}: {}", line.trim());
    }
}

async fn noise_mode(backend: &Backend, args: &[u8]) -> Bytes {
    if args.len() != 1 {
        return status(STATUS_BAD_LENGTH);
    }
    let insel = u32::from(args[0]);
    // One shared seed keeps the generated noise correlated across inputs.
    let seed = (u32::from(rand::random::<u16>()) << 16) + u32::from(rand::random::<u16>());
    let outcome = async {
        for (_, board) in backend.boards.input_boards() {
            for slot in 0..4 {
                board.write_reg(&format!("noise/seed/{slot}"), seed).await?;
            }
        }
        for (_, board) in backend.boards.input_boards() {
            board.write_reg("noise/arm", 0).await?;
        }
        for (_, board) in backend.boards.input_boards() {
            board.write_reg("noise/arm", 0x1111).await?;
        }
        for (_, board) in backend.boards.input_boards() {
            board.write_reg("insel", insel.wrapping_mul(0x5555_5555)).await?;
        }
        Ok::<(), crate::boards::BoardError>(())
    }
    .await;
    match outcome {
        Ok(()) => {
            info!(
                "noise mode {} (seed 0x{seed:08x})",
                if insel != 0 { "on" } else { "off" }
            );
            status(STATUS_OK)
        }
        Err(e) => {
            warn!("noise mode switch failed: {e}");
            status(STATUS_INVALID)
        }
    }
}

async fn board_shell(backend: &Backend, args: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(args);
    let (pattern, line) = match text.split_once(' ') {
        Some((pattern, line)) => (pattern.trim(), line.trim()),
        None => (text.trim(), ""),
    };
    if pattern.is_empty() {
        return status(STATUS_BAD_LENGTH);
    }

    let mut response = String::new();
    let stamp = chrono::Utc::now().format("%a %b %e %H:%M:%S %Y");
    for (name, board) in backend.boards.shell_boards() {
        if !name.starts_with(pattern) {
            continue;
        }
        match board.shell(line).await {
            Ok(reply) => {
                response.push_str(&reply);
                response.push_str(&format!("\r### {name} {line} @({stamp})\n\r"));
            }
            Err(e) => warn!("{name}: shell `{line}` failed: {e}"),
        }
    }
    if "bee2".starts_with(pattern) {
        match backend.boards.correlator.shell(line).await {
            Ok(reply) => {
                response.push_str(&reply);
                response.push_str(&format!("\r### bee2 {line} @({stamp})\n\r"));
            }
            Err(e) => warn!("bee2: shell `{line}` failed: {e}"),
        }
    }
    ok_payload(|buf| buf.put_slice(response.as_bytes()))
}

async fn get_reference(backend: &Backend) -> Bytes {
    let reference = backend.state.lock().await.reference;
    ok_payload(|buf| buf.put_u8(reference))
}

async fn setup_fstopping(backend: &Backend, args: &[u8]) -> Bytes {
    if args.len() != 4 {
        return status(STATUS_BAD_LENGTH);
    }
    let rate = f64::from(f32::from_be_bytes([args[0], args[1], args[2], args[3]]));
    backend.state.lock().await.fstop_ghz = rate;
    info!("fringe stopping rate set to {rate} GHz");
    status(STATUS_OK)
}

// ── DBE channelizer gains ──────────────────────────────────────────────

async fn get_dbe_gains(backend: &Backend) -> Bytes {
    match read_dbe_gains(&backend.boards.dbe).await {
        Ok(gains) => ok_payload(|buf| {
            for gain in gains {
                buf.put_u32(gain);
            }
        }),
        Err(e) => {
            warn!("DBE gain read failed: {e}");
            status(STATUS_INVALID)
        }
    }
}

async fn set_dbe_gains(backend: &Backend, args: &[u8]) -> Bytes {
    if args.len() != 64 {
        return status(STATUS_BAD_LENGTH);
    }
    let mut gains = [0u32; 16];
    for (i, chunk) in args.chunks_exact(4).enumerate() {
        gains[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    if let Err(e) = write_dbe_gains(&backend.boards.dbe, &gains).await {
        warn!("DBE gain write failed: {e}");
        return status(STATUS_INVALID);
    }
    get_dbe_gains(backend).await
}

// ── Logging and data access ────────────────────────────────────────────

async fn operations_log(args: &[u8]) -> Bytes {
    let Some((&level, text)) = args.split_first() else {
        return status(STATUS_BAD_LENGTH);
    };
    let text = String::from_utf8_lossy(text);
    let Some((name, message)) = text.split_once('\r') else {
        return status(STATUS_BAD_LENGTH);
    };
    // Levels follow the client-side convention: 10 debug, 20 info,
    // 30 warning, anything higher is an error.
    match level {
        0..=10 => debug!(client = name, "{message}"),
        11..=20 => info!(client = name, "{message}"),
        21..=30 => warn!(client = name, "{message}"),
        _ => error!(client = name, "{message}"),
    }
    status(STATUS_OK)
}

async fn get_correlation(backend: &Backend) -> Bytes {
    let last = backend.state.lock().await.last_packet.clone();
    match last {
        Some(packet) => ok_payload(|buf| buf.put_slice(&packet)),
        None => status(STATUS_INVALID),
    }
}

async fn shutdown(backend: &Backend) -> Bytes {
    info!("shutdown requested");
    let _ = backend.shutdown.send(true);
    status(STATUS_OK)
}
