//! Block selection, board addresses and the baselines pattern.

use std::path::Path;

use clap::ValueEnum;
use serde::Deserialize;

/// Which set of boards the process attaches to. `high` and `low` are the
/// two hardware blocks with their usual ports; `sim` runs against
/// in-process simulated boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Block {
    High,
    Low,
    Sim,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub correlator_addr: String,
    pub ipa0_addr: String,
    pub ipa1_addr: String,
    pub dbe_addr: String,
    /// Fringe-stopping rate handed to the delay tracker, GHz.
    pub fstop_ghz: f64,
    /// Loopback port the phase tracker listens on.
    pub phase_tracker_port: u16,
    /// Sync-select register value written during setup.
    pub syncsel: u32,
}

impl BackendConfig {
    pub fn for_block(block: Block) -> Self {
        match block {
            Block::High => Self {
                correlator_addr: "bee2:7150".into(),
                ipa0_addr: "ipahi0:23".into(),
                ipa1_addr: "ipahi1:23".into(),
                dbe_addr: "dbehi:23".into(),
                fstop_ghz: -0.256,
                phase_tracker_port: 9454,
                syncsel: 2,
            },
            Block::Low => Self {
                correlator_addr: "bee2:7147".into(),
                ipa0_addr: "ipalo0:23".into(),
                ipa1_addr: "ipalo1:23".into(),
                dbe_addr: "dbelo:23".into(),
                fstop_ghz: -0.256,
                phase_tracker_port: 9453,
                syncsel: 2,
            },
            // The simulated block keeps integration times on whole
            // seconds so command round trips are exact.
            Block::Sim => Self {
                correlator_addr: "sim".into(),
                ipa0_addr: "sim".into(),
                ipa1_addr: "sim".into(),
                dbe_addr: "sim".into(),
                fstop_ghz: -0.256,
                // Ephemeral, so several simulated servers can coexist.
                phase_tracker_port: 0,
                syncsel: 3,
            },
        }
    }

    pub fn load(block: Block, file: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = Self::for_block(block);
        if let Some(path) = file {
            let text = std::fs::read_to_string(path)?;
            let overrides: ConfigFile = toml::from_str(&text)?;
            cfg.apply(overrides);
        }
        Ok(cfg)
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(boards) = file.boards {
            if let Some(v) = boards.correlator {
                self.correlator_addr = v;
            }
            if let Some(v) = boards.ipa0 {
                self.ipa0_addr = v;
            }
            if let Some(v) = boards.ipa1 {
                self.ipa1_addr = v;
            }
            if let Some(v) = boards.dbe {
                self.dbe_addr = v;
            }
        }
        if let Some(tracking) = file.tracking {
            if let Some(v) = tracking.fstop_ghz {
                self.fstop_ghz = v;
            }
            if let Some(v) = tracking.phase_tracker_port {
                self.phase_tracker_port = v;
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub boards: Option<BoardsSection>,
    pub tracking: Option<TrackingSection>,
}

#[derive(Debug, Deserialize)]
pub struct BoardsSection {
    pub correlator: Option<String>,
    pub ipa0: Option<String>,
    pub ipa1: Option<String>,
    pub dbe: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrackingSection {
    pub fstop_ghz: Option<f64>,
    pub phase_tracker_port: Option<u16>,
}

/// Parse a baselines pattern into the set of tracked baselines.
///
/// Tokens look like `A-B` or `AxB` where either side may be `*`. A fully
/// numeric token contributes that single pair; a token with one wildcard
/// contributes every pair containing the numeric antenna; `*-*` is all
/// pairs. Pairs are normalized to (i, j) with i < j and sorted.
pub fn parse_baselines(pattern: &str, antennas: &[u8]) -> Vec<(u8, u8)> {
    let mut include_antennas: Vec<u8> = Vec::new();
    let mut baselines: Vec<(u8, u8)> = Vec::new();
    let mut all_antennas = false;

    for token in pattern.split(|c: char| c == ',' || c.is_whitespace()) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((a, b)) = token
            .split_once('-')
            .or_else(|| token.split_once('x'))
            .or_else(|| token.split_once('×'))
        else {
            continue;
        };
        match (a.trim().parse::<u8>(), b.trim().parse::<u8>()) {
            (Ok(a), Ok(b)) if a != b => {
                baselines.push((a.min(b), a.max(b)));
            }
            (Ok(a), Err(_)) if b.trim() == "*" => include_antennas.push(a),
            (Err(_), Ok(b)) if a.trim() == "*" => include_antennas.push(b),
            (Err(_), Err(_)) if a.trim() == "*" && b.trim() == "*" => all_antennas = true,
            _ => {}
        }
    }

    for (i, &a) in antennas.iter().enumerate() {
        for &b in &antennas[i + 1..] {
            let pair = (a.min(b), a.max(b));
            if all_antennas || include_antennas.contains(&a) || include_antennas.contains(&b) {
                baselines.push(pair);
            }
        }
    }

    baselines.sort_unstable();
    baselines.dedup();
    baselines
        .into_iter()
        .filter(|&(a, b)| antennas.contains(&a) && antennas.contains(&b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANTENNAS: [u8; 8] = [6, 1, 2, 3, 4, 5, 7, 8];

    #[test]
    fn wildcard_pair_is_all_pairs() {
        let all = parse_baselines("*-*", &ANTENNAS);
        assert_eq!(all.len(), 8 * 7 / 2);
        assert!(all.iter().all(|&(i, j)| i < j));
    }

    #[test]
    fn single_wildcard_selects_every_pair_with_that_antenna() {
        let got = parse_baselines("6-*", &ANTENNAS);
        assert_eq!(got.len(), 7);
        assert!(got.iter().all(|&(i, j)| i == 6 || j == 6));
    }

    #[test]
    fn numeric_tokens_add_single_pairs() {
        assert_eq!(parse_baselines("1-6, 2x6", &ANTENNAS), vec![(1, 6), (2, 6)]);
        // order inside a token does not matter
        assert_eq!(parse_baselines("6-1", &ANTENNAS), vec![(1, 6)]);
    }

    #[test]
    fn unknown_antennas_are_dropped() {
        assert_eq!(parse_baselines("1-9", &ANTENNAS), Vec::<(u8, u8)>::new());
    }

    #[test]
    fn config_file_overrides_board_addresses() {
        let mut cfg = BackendConfig::for_block(Block::High);
        let file: ConfigFile = toml::from_str(
            r#"
            [boards]
            dbe = "10.0.0.9:23"

            [tracking]
            fstop_ghz = 0.128
            "#,
        )
        .unwrap();
        cfg.apply(file);
        assert_eq!(cfg.dbe_addr, "10.0.0.9:23");
        assert_eq!(cfg.fstop_ghz, 0.128);
        assert_eq!(cfg.ipa0_addr, "ipahi0:23");
    }
}
