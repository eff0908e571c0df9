//! Board transports.
//!
//! Two kinds of hardware sit behind the server: the correlator board,
//! which exposes typed registers and BRAMs over a borph-style request
//! protocol, and the input/DBE boards, which expose a telnet-like tiny
//! shell. Both are modelled as trait objects so the simulated block can
//! stand in for either.
//!
//! Transports hold one connection each, serialize requests through an
//! internal lock, and on an I/O failure reconnect in place and retry a
//! bounded number of times before surfacing the error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

const RETRIES: u32 = 3;
const IO_TIMEOUT: Duration = Duration::from_secs(3);
/// Idle gap that ends a tiny-shell reply.
const SHELL_IDLE: Duration = Duration::from_millis(200);

/// Heartbeat and sync-word periods selectable through `syncsel`.
pub fn sync_period(syncsel: u32) -> f64 {
    match syncsel {
        0 => 1.0 / 1024.0,
        1 => (1u64 << 19) as f64 / 52_000_000.0,
        2 => (1u64 << 25) as f64 / 52_000_000.0,
        _ => 1.0,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("{board}: i/o failed after {attempts} attempts: {message}")]
    Io {
        board: String,
        attempts: u32,
        message: String,
    },
    #[error("{board}: malformed reply to `{request}`: {reply:?}")]
    BadReply {
        board: String,
        request: String,
        reply: String,
    },
}

pub type BoardResult<T> = Result<T, BoardError>;

/// Typed register and BRAM access on the correlator board.
#[async_trait]
pub trait RegisterBoard: Send + Sync {
    fn name(&self) -> &str;
    async fn read_reg(&self, reg: &str) -> BoardResult<u32>;
    async fn write_reg(&self, reg: &str, value: u32) -> BoardResult<()>;
    async fn read_bram(&self, name: &str, words: usize) -> BoardResult<Vec<i32>>;
    async fn write_bram(&self, name: &str, words: &[i32]) -> BoardResult<()>;
    /// Shell-style access for command 15.
    async fn shell(&self, line: &str) -> BoardResult<String>;
}

/// Tiny-shell access on the input-processing and DBE boards.
#[async_trait]
pub trait ShellBoard: Send + Sync {
    fn name(&self) -> &str;
    async fn shell(&self, line: &str) -> BoardResult<String>;
    async fn read_reg(&self, reg: &str) -> BoardResult<u32>;
    async fn write_reg(&self, reg: &str, value: u32) -> BoardResult<()>;
    async fn read_bram(&self, name: &str, words: usize) -> BoardResult<Vec<u32>>;
    async fn write_bram(&self, name: &str, words: &[u32]) -> BoardResult<()>;
    async fn get_delay_offset(&self, input: u8) -> BoardResult<f64>;
    async fn set_delay_offset(&self, input: u8, value: f64) -> BoardResult<()>;
    async fn get_phase_offset(&self, input: u8) -> BoardResult<f64>;
    async fn set_phase_offset(&self, input: u8, value: f64) -> BoardResult<()>;
}

/// The full board complement of one block.
#[derive(Clone)]
pub struct Boards {
    pub correlator: Arc<dyn RegisterBoard>,
    pub ipa0: Arc<dyn ShellBoard>,
    pub ipa1: Arc<dyn ShellBoard>,
    pub dbe: Arc<dyn ShellBoard>,
}

impl Boards {
    /// The input-processing board and local port carrying a given input.
    pub fn input_board(&self, input: u8) -> (Arc<dyn ShellBoard>, u8) {
        if input < 4 {
            (self.ipa0.clone(), input)
        } else {
            (self.ipa1.clone(), input - 4)
        }
    }

    pub fn input_boards(&self) -> [(&'static str, Arc<dyn ShellBoard>); 2] {
        [("ipa0", self.ipa0.clone()), ("ipa1", self.ipa1.clone())]
    }

    pub fn shell_boards(&self) -> [(&'static str, Arc<dyn ShellBoard>); 3] {
        [
            ("ipa0", self.ipa0.clone()),
            ("ipa1", self.ipa1.clone()),
            ("dbe", self.dbe.clone()),
        ]
    }

    /// Integration time in seconds from the correlator's registers.
    pub async fn integration_time(&self) -> BoardResult<f64> {
        let counts = self.correlator.read_reg("integ_time").await?;
        let syncsel = self.correlator.read_reg("syncsel").await?;
        Ok(counts as f64 * sync_period(syncsel))
    }
}

/// One TCP connection speaking a line-oriented protocol, shared by both
/// concrete transports.
struct LineTransport {
    board: String,
    addr: String,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl LineTransport {
    fn new(board: &str, addr: &str) -> Self {
        Self {
            board: board.to_string(),
            addr: addr.to_string(),
            conn: Mutex::new(None),
        }
    }

    fn io_error(&self, attempts: u32, message: String) -> BoardError {
        BoardError::Io {
            board: self.board.clone(),
            attempts,
            message,
        }
    }

    fn bad_reply(&self, request: &str, reply: &str) -> BoardError {
        BoardError::BadReply {
            board: self.board.clone(),
            request: request.to_string(),
            reply: reply.to_string(),
        }
    }

    async fn connect(&self) -> std::io::Result<BufStream<TcpStream>> {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(BufStream::new(stream))
    }

    /// Send one line and read one reply line.
    async fn request_line(&self, line: &str) -> BoardResult<String> {
        let mut last = String::from("never attempted");
        for attempt in 1..=RETRIES {
            match self.try_request_line(line).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(board = %self.board, attempt, "transport error: {e}, reconnecting");
                    last = e.to_string();
                }
            }
        }
        Err(self.io_error(RETRIES, last))
    }

    async fn try_request_line(&self, line: &str) -> std::io::Result<String> {
        let mut guard = self.conn.lock().await;
        let mut io = match guard.take() {
            Some(io) => io,
            None => self.connect().await?,
        };
        let outcome = async {
            io.write_all(line.as_bytes()).await?;
            io.write_all(b"\n").await?;
            io.flush().await?;
            let mut reply = String::new();
            let n = timeout(IO_TIMEOUT, io.read_line(&mut reply))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))??;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "board closed the connection",
                ));
            }
            Ok(reply)
        }
        .await;
        if outcome.is_ok() {
            *guard = Some(io);
        }
        outcome
    }

    /// Send one line and read until the board goes quiet; telnet-like
    /// shells neither frame nor terminate their output.
    async fn request_text(&self, line: &str) -> BoardResult<String> {
        let mut last = String::from("never attempted");
        for attempt in 1..=RETRIES {
            match self.try_request_text(line).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(board = %self.board, attempt, "transport error: {e}, reconnecting");
                    last = e.to_string();
                }
            }
        }
        Err(self.io_error(RETRIES, last))
    }

    async fn try_request_text(&self, line: &str) -> std::io::Result<String> {
        let mut guard = self.conn.lock().await;
        let mut io = match guard.take() {
            Some(io) => io,
            None => self.connect().await?,
        };
        let outcome = async {
            io.write_all(line.as_bytes()).await?;
            io.write_all(b"\n").await?;
            io.flush().await?;
            let mut collected = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let wait = if collected.is_empty() { IO_TIMEOUT } else { SHELL_IDLE };
                match timeout(wait, io.read(&mut chunk)).await {
                    Ok(Ok(0)) => {
                        if collected.is_empty() {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "board closed the connection",
                            ));
                        }
                        break;
                    }
                    Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
                    Ok(Err(e)) => return Err(e),
                    Err(_) if collected.is_empty() => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "no reply before timeout",
                        ))
                    }
                    Err(_) => break,
                }
            }
            Ok(String::from_utf8_lossy(&collected).into_owned())
        }
        .await;
        if outcome.is_ok() {
            *guard = Some(io);
        }
        outcome
    }
}

/// Correlator-board client speaking `?verb args` / `!verb ok ...` lines.
pub struct BorphBoard {
    transport: LineTransport,
}

impl BorphBoard {
    pub fn new(name: &str, addr: &str) -> Self {
        Self {
            transport: LineTransport::new(name, addr),
        }
    }

    /// Strip `!verb ok` and return the remaining tokens.
    fn reply_args<'a>(&self, request: &str, reply: &'a str) -> BoardResult<Vec<&'a str>> {
        let mut tokens = reply.split_whitespace();
        let verb = tokens.next().unwrap_or("");
        let status = tokens.next().unwrap_or("");
        if !verb.starts_with('!') || status != "ok" {
            return Err(self.transport.bad_reply(request, reply));
        }
        Ok(tokens.collect())
    }

    fn parse_word(&self, request: &str, reply: &str, token: &str) -> BoardResult<u32> {
        let parsed = if let Some(hex) = token.strip_prefix("0x") {
            u32::from_str_radix(hex, 16)
        } else {
            token.parse::<u32>()
        };
        parsed.map_err(|_| self.transport.bad_reply(request, reply))
    }
}

#[async_trait]
impl RegisterBoard for BorphBoard {
    fn name(&self) -> &str {
        &self.transport.board
    }

    async fn read_reg(&self, reg: &str) -> BoardResult<u32> {
        let request = format!("?wordread {reg}");
        let reply = self.transport.request_line(&request).await?;
        let args = self.reply_args(&request, &reply)?;
        let token = args.first().ok_or_else(|| self.transport.bad_reply(&request, &reply))?;
        let value = self.parse_word(&request, &reply, token)?;
        debug!(board = %self.name(), reg, value, "regread");
        Ok(value)
    }

    async fn write_reg(&self, reg: &str, value: u32) -> BoardResult<()> {
        let request = format!("?wordwrite {reg} 0x{value:x}");
        let reply = self.transport.request_line(&request).await?;
        self.reply_args(&request, &reply)?;
        Ok(())
    }

    async fn read_bram(&self, name: &str, words: usize) -> BoardResult<Vec<i32>> {
        let request = format!("?bramread {name} {words}");
        let reply = self.transport.request_line(&request).await?;
        let args = self.reply_args(&request, &reply)?;
        if args.len() < words {
            return Err(self.transport.bad_reply(&request, &reply));
        }
        args[..words]
            .iter()
            .map(|t| self.parse_word(&request, &reply, t).map(|w| w as i32))
            .collect()
    }

    async fn write_bram(&self, name: &str, words: &[i32]) -> BoardResult<()> {
        let mut request = format!("?bramwrite {name}");
        for w in words {
            request.push_str(&format!(" 0x{:x}", *w as u32));
        }
        let reply = self.transport.request_line(&request).await?;
        self.reply_args(&request, &reply)?;
        Ok(())
    }

    async fn shell(&self, line: &str) -> BoardResult<String> {
        // Emulate a tiny shell over the register protocol so command 15
        // can address this board like the others.
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("regread"), Some(reg), None) => {
                let value = self.read_reg(reg).await?;
                Ok(format!("{reg} = {value}\n"))
            }
            (Some("regwrite"), Some(reg), Some(value)) => {
                let value = value
                    .parse::<u32>()
                    .map_err(|_| self.transport.bad_reply(line, value))?;
                self.write_reg(reg, value).await?;
                Ok(String::new())
            }
            _ => Ok(format!("no match: {line}\n")),
        }
    }
}

/// Input/DBE board client over the lwIP tiny shell.
pub struct TinyShellBoard {
    transport: LineTransport,
}

impl TinyShellBoard {
    pub fn new(name: &str, addr: &str) -> Self {
        Self {
            transport: LineTransport::new(name, addr),
        }
    }

    /// Offset replies look like `DO0=12.-34567`: an integer part, then
    /// the 10^-5-scaled remainder printed with a stray sign. The value
    /// is the integer part plus the sign-stripped remainder times 10^-5,
    /// whatever the integer part's sign.
    fn parse_offset(&self, request: &str, reply: &str, tag: &str) -> BoardResult<f64> {
        let start = reply
            .find(tag)
            .ok_or_else(|| self.transport.bad_reply(request, reply))?;
        let rest = &reply[start + tag.len()..];
        let text: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        let (int_text, frac_text) = text.split_once('.').unwrap_or((text.as_str(), ""));
        let int_part = int_text
            .parse::<f64>()
            .map_err(|_| self.transport.bad_reply(request, reply))?;
        let frac_digits = frac_text.trim_start_matches('-');
        let frac_part = if frac_digits.is_empty() {
            0.0
        } else {
            frac_digits
                .parse::<f64>()
                .map_err(|_| self.transport.bad_reply(request, reply))?
        };
        Ok(int_part + frac_part * 1e-5)
    }
}

#[async_trait]
impl ShellBoard for TinyShellBoard {
    fn name(&self) -> &str {
        &self.transport.board
    }

    async fn shell(&self, line: &str) -> BoardResult<String> {
        self.transport.request_text(line).await
    }

    async fn read_reg(&self, reg: &str) -> BoardResult<u32> {
        let request = format!("regread {reg}");
        let reply = self.transport.request_text(&request).await?;
        let token = reply
            .split_whitespace()
            .last()
            .ok_or_else(|| self.transport.bad_reply(&request, &reply))?;
        token
            .parse::<u32>()
            .map_err(|_| self.transport.bad_reply(&request, &reply))
    }

    async fn write_reg(&self, reg: &str, value: u32) -> BoardResult<()> {
        self.transport
            .request_text(&format!("regwrite {reg} {value}"))
            .await?;
        Ok(())
    }

    async fn read_bram(&self, name: &str, words: usize) -> BoardResult<Vec<u32>> {
        let request = format!("bramdump {name} {words} 0");
        let reply = self.transport.request_text(&request).await?;
        let parsed: Vec<u32> = reply
            .split_whitespace()
            .filter_map(|t| {
                let t = t.strip_prefix("0x").unwrap_or(t);
                u32::from_str_radix(t, 16).ok()
            })
            .collect();
        if parsed.len() < words {
            return Err(self.transport.bad_reply(&request, &reply));
        }
        Ok(parsed[..words].to_vec())
    }

    async fn write_bram(&self, name: &str, words: &[u32]) -> BoardResult<()> {
        for (location, word) in words.iter().enumerate() {
            self.transport
                .request_text(&format!("bramwrite {name} {location} {word}"))
                .await?;
        }
        Ok(())
    }

    async fn get_delay_offset(&self, input: u8) -> BoardResult<f64> {
        let request = format!("get_delay_offset {input}");
        let reply = self.transport.request_text(&request).await?;
        self.parse_offset(&request, &reply, &format!("DO{input}="))
    }

    async fn set_delay_offset(&self, input: u8, value: f64) -> BoardResult<()> {
        let scaled = (value * 1e5).round() as i64;
        self.transport
            .request_text(&format!("set_delay_offset {input} {scaled}"))
            .await?;
        Ok(())
    }

    async fn get_phase_offset(&self, input: u8) -> BoardResult<f64> {
        let request = format!("get_phase_offset {input}");
        let reply = self.transport.request_text(&request).await?;
        self.parse_offset(&request, &reply, &format!("PO{input}="))
    }

    async fn set_phase_offset(&self, input: u8, value: f64) -> BoardResult<()> {
        let scaled = (value * 1e5).round() as i64;
        self.transport
            .request_text(&format!("set_phase_offset {input} {scaled}"))
            .await?;
        Ok(())
    }
}

/// Connect the hardware block described by a config.
pub fn connect_block(cfg: &crate::config::BackendConfig) -> Boards {
    Boards {
        correlator: Arc::new(BorphBoard::new("bee2", &cfg.correlator_addr)),
        ipa0: Arc::new(TinyShellBoard::new("ipa0", &cfg.ipa0_addr)),
        ipa1: Arc::new(TinyShellBoard::new("ipa1", &cfg.ipa1_addr)),
        dbe: Arc::new(TinyShellBoard::new("dbe", &cfg.dbe_addr)),
    }
}

/// DBE channelizer gains live interleaved across two BRAMs: even
/// channels in `pol0/gainctrl0`, odd in `pol0/gainctrl1`.
pub async fn read_dbe_gains(dbe: &Arc<dyn ShellBoard>) -> BoardResult<[u32; 16]> {
    let even = dbe.read_bram("pol0/gainctrl0", 8).await?;
    let odd = dbe.read_bram("pol0/gainctrl1", 8).await?;
    let mut gains = [0u32; 16];
    for i in 0..8 {
        gains[2 * i] = even[i];
        gains[2 * i + 1] = odd[i];
    }
    Ok(gains)
}

pub async fn write_dbe_gains(dbe: &Arc<dyn ShellBoard>, gains: &[u32; 16]) -> BoardResult<()> {
    let even: Vec<u32> = gains.iter().copied().step_by(2).collect();
    let odd: Vec<u32> = gains.iter().copied().skip(1).step_by(2).collect();
    dbe.write_bram("pol0/gainctrl0", &even).await?;
    dbe.write_bram("pol0/gainctrl1", &odd).await?;
    Ok(())
}

/// Per-lane XAUI health counters surfaced by the checks loop.
#[derive(Debug)]
pub struct XauiHealth {
    pub lane: &'static str,
    pub link_down: bool,
    pub period: u32,
    pub sync_cnt: u32,
    pub period_err_cnt: u32,
    pub linkdown_cnt: u32,
}

pub const XAUI_LANES: [&str; 2] = ["xaui0", "xaui1"];

/// Read one lane's counters given the board's register separator (`_` on
/// the correlator, `/` on the DBE).
pub async fn read_xaui_lane<F, Fut>(lane: &'static str, sep: char, read: F) -> BoardResult<XauiHealth>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = BoardResult<u32>>,
{
    let reg = |name: &str| format!("{lane}{sep}{name}");
    Ok(XauiHealth {
        lane,
        link_down: read(reg("rx_linkdown")).await? != 0,
        period: read(reg("period")).await?,
        sync_cnt: read(reg("sync_cnt")).await?,
        period_err_cnt: read(reg("period_err_cnt")).await?,
        linkdown_cnt: read(reg("linkdown_cnt")).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> TinyShellBoard {
        TinyShellBoard::new("ipa0", "unreached:0")
    }

    #[test]
    fn offset_reply_with_positive_integer_part() {
        let value = board()
            .parse_offset("get_delay_offset 0", "\r\nDO0=12.-34567\n\r", "DO0=")
            .unwrap();
        assert!((value - 12.34567).abs() < 1e-9);
    }

    #[test]
    fn offset_reply_with_negative_integer_part_adds_the_fraction() {
        // -5 plus 0.6789, not -5.6789.
        let value = board()
            .parse_offset("get_delay_offset 0", "\r\nDO0=-5.-67890\n\r", "DO0=")
            .unwrap();
        assert!((value - (-4.3211)).abs() < 1e-9);
    }

    #[test]
    fn offset_reply_without_a_fraction() {
        let value = board()
            .parse_offset("get_phase_offset 3", "PO3=7\r\n", "PO3=")
            .unwrap();
        assert_eq!(value, 7.0);
    }

    #[test]
    fn offset_reply_with_unsigned_fraction() {
        let value = board()
            .parse_offset("get_phase_offset 1", "PO1=0.50000\r\n", "PO1=")
            .unwrap();
        assert!((value - 0.5).abs() < 1e-9);
    }

    #[test]
    fn malformed_offset_reply_is_rejected() {
        assert!(board()
            .parse_offset("get_delay_offset 0", "no match: get_delay_offset\r\n", "DO0=")
            .is_err());
    }

    #[test]
    fn sync_periods_cover_every_select() {
        assert_eq!(sync_period(3), 1.0);
        assert!((sync_period(0) - 1.0 / 1024.0).abs() < 1e-12);
        assert!(sync_period(1) < sync_period(2));
    }
}
