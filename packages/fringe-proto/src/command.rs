//! Command codes and status bytes for the TCP command protocol.
//!
//! Request payload: `u8` command code followed by command-specific
//! arguments. Response payload: `i8` status followed by optional data.
//!
//! Code ranges by convention: 0-7 data handling, 8-31 correlator,
//! 32-127 feedback parameters, 128-254 site specific, 255 shutdown.

/// Request handled successfully.
pub const STATUS_OK: i8 = 0;
/// Invalid argument, unknown item, or already-in-state.
pub const STATUS_INVALID: i8 = -1;
/// Argument byte count does not match the command.
pub const STATUS_BAD_LENGTH: i8 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Subscribe = 0,
    Unsubscribe = 1,
    GetMapping = 2,
    SetMapping = 3,
    LoadWalshTable = 5,
    ClearWalshTable = 6,
    DelayTracker = 7,
    StartCorrelator = 8,
    StopCorrelator = 9,
    GetIntegrationTime = 10,
    SetIntegrationTime = 11,
    ResetXaui = 12,
    ArmSync = 13,
    NoiseMode = 14,
    BoardShell = 15,
    GetReference = 16,
    SetupFstopping = 17,
    StartFstopping = 18,
    StopFstopping = 19,
    GetPhaseOffsets = 32,
    SetPhaseOffsets = 33,
    GetDelayOffsets = 34,
    SetDelayOffsets = 35,
    GetDelays = 36,
    SetDelays = 37,
    GetPhases = 38,
    SetPhases = 39,
    GetGains = 40,
    SetGains = 41,
    GetThresholds = 42,
    SetThresholds = 43,
    GetDbeGains = 64,
    SetDbeGains = 65,
    OperationsLog = 96,
    GetCorrelation = 128,
    Shutdown = 255,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Subscribe,
            1 => Self::Unsubscribe,
            2 => Self::GetMapping,
            3 => Self::SetMapping,
            5 => Self::LoadWalshTable,
            6 => Self::ClearWalshTable,
            7 => Self::DelayTracker,
            8 => Self::StartCorrelator,
            9 => Self::StopCorrelator,
            10 => Self::GetIntegrationTime,
            11 => Self::SetIntegrationTime,
            12 => Self::ResetXaui,
            13 => Self::ArmSync,
            14 => Self::NoiseMode,
            15 => Self::BoardShell,
            16 => Self::GetReference,
            17 => Self::SetupFstopping,
            18 => Self::StartFstopping,
            19 => Self::StopFstopping,
            32 => Self::GetPhaseOffsets,
            33 => Self::SetPhaseOffsets,
            34 => Self::GetDelayOffsets,
            35 => Self::SetDelayOffsets,
            36 => Self::GetDelays,
            37 => Self::SetDelays,
            38 => Self::GetPhases,
            39 => Self::SetPhases,
            40 => Self::GetGains,
            41 => Self::SetGains,
            42 => Self::GetThresholds,
            43 => Self::SetThresholds,
            64 => Self::GetDbeGains,
            65 => Self::SetDbeGains,
            96 => Self::OperationsLog,
            128 => Self::GetCorrelation,
            255 => Self::Shutdown,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=255u8 {
            if let Some(cmd) = Command::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(Command::from_code(128), Some(Command::GetCorrelation));
        assert_eq!(Command::from_code(4), None);
        assert_eq!(Command::from_code(200), None);
    }
}
