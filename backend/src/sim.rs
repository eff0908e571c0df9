//! In-process simulated boards.
//!
//! `--block sim` attaches these instead of the hardware so the whole
//! server can run (and be integration-tested) without a rack. The
//! simulated correlator advances `integ_cnt` from the wall clock at the
//! configured integration period and serves a deterministic, noise-free
//! lag pattern; the simulated shell boards store registers, BRAMs and
//! offsets in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use crate::boards::{sync_period, BoardResult, Boards, RegisterBoard, ShellBoard};

const SIM_LAGS: usize = 16;

pub struct SimCorrelatorBoard {
    name: String,
    started: Instant,
    regs: Mutex<HashMap<String, u32>>,
    brams: Mutex<HashMap<String, Vec<i32>>>,
}

impl SimCorrelatorBoard {
    pub fn new(syncsel: u32) -> Self {
        let mut regs = HashMap::new();
        regs.insert("integ_time".to_string(), 1);
        regs.insert("syncsel".to_string(), syncsel);
        Self {
            name: "bee2".to_string(),
            started: Instant::now(),
            regs: Mutex::new(regs),
            brams: Mutex::new(HashMap::new()),
        }
    }

    fn integration_seconds(regs: &HashMap<String, u32>) -> f64 {
        let counts = regs.get("integ_time").copied().unwrap_or(1).max(1);
        let syncsel = regs.get("syncsel").copied().unwrap_or(3);
        counts as f64 * sync_period(syncsel)
    }

    /// Symmetric peak at the center lag; angle(visibility) comes out
    /// flat, which keeps the phase fit at zero.
    fn lag_pattern(name: &str) -> Vec<i32> {
        if name.ends_with("_imag") {
            return vec![0; SIM_LAGS];
        }
        (0..SIM_LAGS)
            .map(|k| {
                let distance = (k as i32 - SIM_LAGS as i32 / 2).unsigned_abs();
                (1 << 20) >> distance.min(20)
            })
            .collect()
    }
}

#[async_trait]
impl RegisterBoard for SimCorrelatorBoard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_reg(&self, reg: &str) -> BoardResult<u32> {
        let regs = self.regs.lock().expect("sim register map poisoned");
        if reg == "integ_cnt" {
            let period = Self::integration_seconds(&regs);
            return Ok((self.started.elapsed().as_secs_f64() / period) as u32);
        }
        Ok(regs.get(reg).copied().unwrap_or(0))
    }

    async fn write_reg(&self, reg: &str, value: u32) -> BoardResult<()> {
        self.regs
            .lock()
            .expect("sim register map poisoned")
            .insert(reg.to_string(), value);
        Ok(())
    }

    async fn read_bram(&self, name: &str, words: usize) -> BoardResult<Vec<i32>> {
        let brams = self.brams.lock().expect("sim bram map poisoned");
        let mut data = match brams.get(name) {
            Some(stored) => stored.clone(),
            None if name.starts_with("rx") => Self::lag_pattern(name),
            None => vec![0; words],
        };
        data.resize(words, 0);
        Ok(data)
    }

    async fn write_bram(&self, name: &str, words: &[i32]) -> BoardResult<()> {
        self.brams
            .lock()
            .expect("sim bram map poisoned")
            .insert(name.to_string(), words.to_vec());
        Ok(())
    }

    async fn shell(&self, line: &str) -> BoardResult<String> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("regread"), Some(reg)) => {
                let value = self.read_reg(reg).await?;
                Ok(format!("{reg} = {value}\n"))
            }
            _ => Ok(format!("no match: {line}\n")),
        }
    }
}

#[derive(Default)]
struct ShellStore {
    regs: HashMap<String, u32>,
    brams: HashMap<String, Vec<u32>>,
    delay_offsets: HashMap<u8, f64>,
    phase_offsets: HashMap<u8, f64>,
}

pub struct SimShellBoard {
    name: String,
    store: Mutex<ShellStore>,
}

impl SimShellBoard {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: Mutex::new(ShellStore::default()),
        }
    }

    /// Offsets travel as 10^-5-scaled integers; quantize the stored value
    /// the same way so readbacks match the wire.
    fn quantize(value: f64) -> f64 {
        (value * 1e5).round() / 1e5
    }
}

#[async_trait]
impl ShellBoard for SimShellBoard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shell(&self, line: &str) -> BoardResult<String> {
        match line.split_whitespace().next() {
            Some("arm1pps") | Some("armsowf") => Ok(format!("{}: armed\n", self.name)),
            _ => Ok(format!("no match: {line}\n")),
        }
    }

    async fn read_reg(&self, reg: &str) -> BoardResult<u32> {
        let store = self.store.lock().expect("sim shell store poisoned");
        Ok(store.regs.get(reg).copied().unwrap_or(0))
    }

    async fn write_reg(&self, reg: &str, value: u32) -> BoardResult<()> {
        let mut store = self.store.lock().expect("sim shell store poisoned");
        store.regs.insert(reg.to_string(), value);
        Ok(())
    }

    async fn read_bram(&self, name: &str, words: usize) -> BoardResult<Vec<u32>> {
        let store = self.store.lock().expect("sim shell store poisoned");
        let mut data = store.brams.get(name).cloned().unwrap_or_default();
        data.resize(words, 0);
        Ok(data)
    }

    async fn write_bram(&self, name: &str, words: &[u32]) -> BoardResult<()> {
        let mut store = self.store.lock().expect("sim shell store poisoned");
        store.brams.insert(name.to_string(), words.to_vec());
        Ok(())
    }

    async fn get_delay_offset(&self, input: u8) -> BoardResult<f64> {
        let store = self.store.lock().expect("sim shell store poisoned");
        Ok(store.delay_offsets.get(&input).copied().unwrap_or(0.0))
    }

    async fn set_delay_offset(&self, input: u8, value: f64) -> BoardResult<()> {
        let mut store = self.store.lock().expect("sim shell store poisoned");
        store.delay_offsets.insert(input, Self::quantize(value));
        Ok(())
    }

    async fn get_phase_offset(&self, input: u8) -> BoardResult<f64> {
        let store = self.store.lock().expect("sim shell store poisoned");
        Ok(store.phase_offsets.get(&input).copied().unwrap_or(0.0))
    }

    async fn set_phase_offset(&self, input: u8, value: f64) -> BoardResult<()> {
        let mut store = self.store.lock().expect("sim shell store poisoned");
        store.phase_offsets.insert(input, Self::quantize(value));
        Ok(())
    }
}

/// A complete simulated block.
pub fn sim_block(syncsel: u32) -> Boards {
    Boards {
        correlator: Arc::new(SimCorrelatorBoard::new(syncsel)),
        ipa0: Arc::new(SimShellBoard::new("ipa0")),
        ipa1: Arc::new(SimShellBoard::new("ipa1")),
        dbe: Arc::new(SimShellBoard::new("dbe")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_read_back_what_was_written() {
        let board = SimCorrelatorBoard::new(3);
        board.write_reg("integ_time", 4).await.unwrap();
        assert_eq!(board.read_reg("integ_time").await.unwrap(), 4);
        assert_eq!(board.read_reg("xaui0_rx_linkdown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lag_pattern_is_centered_and_real() {
        let board = SimCorrelatorBoard::new(3);
        let real = board.read_bram("rx1_usb_real", SIM_LAGS).await.unwrap();
        let imag = board.read_bram("rx1_usb_imag", SIM_LAGS).await.unwrap();
        assert_eq!(real.len(), SIM_LAGS);
        assert!(imag.iter().all(|&v| v == 0));
        let peak = real.iter().position(|&v| v == 1 << 20).unwrap();
        assert_eq!(peak, SIM_LAGS / 2);
    }

    #[tokio::test]
    async fn integ_cnt_advances_with_time() {
        let board = SimCorrelatorBoard::new(3);
        // 50 integrations per second
        board.write_reg("syncsel", 0).await.unwrap();
        board.write_reg("integ_time", 20).await.unwrap();
        let first = board.read_reg("integ_cnt").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = board.read_reg("integ_cnt").await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn offsets_are_quantized_to_wire_precision() {
        let board = SimShellBoard::new("ipa0");
        board.set_phase_offset(2, 1.2345678).await.unwrap();
        let back = board.get_phase_offset(2).await.unwrap();
        assert!((back - 1.23457).abs() < 1e-9);
    }
}
