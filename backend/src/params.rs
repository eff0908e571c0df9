//! Parameter mediation: register quantization math and the uniform
//! per-antenna get/set plumbing behind the feedback commands.
//!
//! Each parameter either lives in an in-process map (`mapping`,
//! `system_temp`) or routes through a board handler that encodes the
//! value into the owning input board's registers and returns the
//! quantized readback.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use fringe_proto::{STATUS_BAD_LENGTH, STATUS_INVALID, STATUS_OK};

use crate::boards::{BoardResult, Boards, ShellBoard};
use crate::state::ServerState;

/// Register encodings, all rounding to nearest.
pub mod quant {
    /// ADC samples per nanosecond of delay.
    pub const ADC_PER_NS: f64 = 1.024;
    const DELAY_SPAN: f64 = (1u32 << 17) as f64;
    /// Phase register granularity, degrees.
    pub const PHASE_STEP_DEG: f64 = 360.0 / (1 << 12) as f64;

    pub fn delay_to_reg(total_ns: f64) -> u32 {
        ((16.0 * ADC_PER_NS * total_ns).round() + 64.0).rem_euclid(DELAY_SPAN) as u32
    }

    pub fn reg_to_delay(reg: u32) -> f64 {
        let reg = if reg < 64 { reg as f64 + DELAY_SPAN } else { reg as f64 };
        ((reg - 64.0) / (16.0 * ADC_PER_NS)).rem_euclid(DELAY_SPAN)
    }

    pub fn phase_to_reg(total_deg: f64) -> u32 {
        ((total_deg / PHASE_STEP_DEG).round() as i64).rem_euclid(1 << 12) as u32
    }

    pub fn reg_to_phase(reg: u32) -> f64 {
        reg as f64 * PHASE_STEP_DEG
    }

    pub fn gain_to_reg(gain: f64) -> u32 {
        ((gain * 128.0).round() as i64).rem_euclid(256) as u32
    }

    pub fn reg_to_gain(reg: u32) -> f64 {
        (reg % 256) as f64 / 128.0
    }
}

/// Per-antenna parameters addressable through the uniform get/set
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Mapping,
    Delay,
    DelayOffset,
    Phase,
    PhaseOffset,
    Gain,
    Threshold,
}

/// How a parameter's values travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Float,
    Byte,
}

impl Param {
    pub fn wire(self) -> WireType {
        match self {
            Param::Mapping | Param::Threshold => WireType::Byte,
            _ => WireType::Float,
        }
    }

    fn value_size(self) -> usize {
        match self.wire() {
            WireType::Float => 4,
            WireType::Byte => 1,
        }
    }
}

/// Read one antenna's value, through the board handler where one exists.
pub async fn get_param(boards: &Boards, st: &ServerState, param: Param, antenna: u8) -> BoardResult<f64> {
    match param {
        Param::Mapping => Ok(f64::from(st.mapping.get(&antenna).copied().unwrap_or(0))),
        Param::Delay => {
            let (board, input) = input_of(boards, st, antenna);
            let reg = board.read_reg(&format!("delay{input}")).await?;
            Ok(quant::reg_to_delay(reg))
        }
        Param::Phase => {
            let (board, input) = input_of(boards, st, antenna);
            let reg = board.read_reg(&format!("phase{input}")).await?;
            Ok(quant::reg_to_phase(reg))
        }
        Param::Gain => {
            let (board, input) = input_of(boards, st, antenna);
            let reg = board.read_reg(&format!("gain{input}")).await?;
            Ok(quant::reg_to_gain(reg))
        }
        Param::Threshold => {
            let (board, input) = input_of(boards, st, antenna);
            let reg = board.read_reg(&format!("quant/thresh{input}")).await?;
            Ok(f64::from(reg & 0xff))
        }
        Param::DelayOffset => {
            let (board, input) = input_of(boards, st, antenna);
            board.get_delay_offset(input).await
        }
        Param::PhaseOffset => {
            let (board, input) = input_of(boards, st, antenna);
            board.get_phase_offset(input).await
        }
    }
}

/// Write one antenna's value and return the quantized readback. The
/// in-process mirrors are updated so the delay/phase totals and the
/// trackers see the value just written.
pub async fn set_param(
    boards: &Boards,
    st: &mut ServerState,
    param: Param,
    antenna: u8,
    value: f64,
) -> BoardResult<f64> {
    match param {
        Param::Mapping => {
            st.mapping.insert(antenna, value as u8);
            Ok(f64::from(value as u8))
        }
        Param::Delay => {
            let total = value + st.delay_offsets.get(&antenna).copied().unwrap_or(0.0);
            let (board, input) = input_of(boards, st, antenna);
            board
                .write_reg(&format!("delay{input}"), quant::delay_to_reg(total))
                .await?;
            st.delays.insert(antenna, value);
            get_param(boards, st, param, antenna).await
        }
        Param::Phase => {
            let total = value + st.phase_offsets.get(&antenna).copied().unwrap_or(0.0);
            let (board, input) = input_of(boards, st, antenna);
            board
                .write_reg(&format!("phase{input}"), quant::phase_to_reg(total))
                .await?;
            st.phases.insert(antenna, value);
            get_param(boards, st, param, antenna).await
        }
        Param::Gain => {
            let (board, input) = input_of(boards, st, antenna);
            board
                .write_reg(&format!("gain{input}"), quant::gain_to_reg(value))
                .await?;
            st.gains.insert(antenna, value);
            get_param(boards, st, param, antenna).await
        }
        Param::Threshold => {
            let (board, input) = input_of(boards, st, antenna);
            board
                .write_reg(&format!("quant/thresh{input}"), value as u32 & 0xff)
                .await?;
            st.thresholds.insert(antenna, value as u8);
            get_param(boards, st, param, antenna).await
        }
        Param::DelayOffset => {
            let (board, input) = input_of(boards, st, antenna);
            board.set_delay_offset(input, value).await?;
            let readback = board.get_delay_offset(input).await?;
            st.delay_offsets.insert(antenna, readback);
            Ok(readback)
        }
        Param::PhaseOffset => {
            let (board, input) = input_of(boards, st, antenna);
            board.set_phase_offset(input, value).await?;
            let readback = board.get_phase_offset(input).await?;
            st.phase_offsets.insert(antenna, readback);
            Ok(readback)
        }
    }
}

fn input_of(
    boards: &Boards,
    st: &ServerState,
    antenna: u8,
) -> (std::sync::Arc<dyn crate::boards::ShellBoard>, u8) {
    let input = st.mapping.get(&antenna).copied().unwrap_or(0);
    boards.input_board(input)
}

fn pack_value(buf: &mut BytesMut, wire: WireType, value: f64) {
    match wire {
        WireType::Float => buf.put_f32(value as f32),
        WireType::Byte => buf.put_u8(value as u8),
    }
}

fn error_response(status: i8, offenders: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + offenders.len());
    buf.put_i8(status);
    buf.put_slice(offenders);
    buf.freeze()
}

/// Uniform get: empty args means every active antenna, in insertion
/// order; otherwise the args are the requested antenna bytes. Unknown
/// antennas are collected and reported after a `-1`.
pub async fn get_values(boards: &Boards, st: &ServerState, param: Param, args: &[u8]) -> Bytes {
    let antennas: Vec<u8> = if args.is_empty() {
        st.antennas.clone()
    } else {
        args.to_vec()
    };

    let mut values = Vec::with_capacity(antennas.len());
    let mut unknown = Vec::new();
    for antenna in antennas {
        if !st.has_antenna(antenna) {
            unknown.push(antenna);
            continue;
        }
        match get_param(boards, st, param, antenna).await {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!("get failed for antenna {antenna}: {e}");
                return error_response(STATUS_INVALID, &[]);
            }
        }
    }
    if !unknown.is_empty() {
        warn!("antennas not in the system: {unknown:?}");
        return error_response(STATUS_INVALID, &unknown);
    }

    let mut buf = BytesMut::with_capacity(1 + values.len() * param.value_size());
    buf.put_i8(STATUS_OK);
    for value in values {
        pack_value(&mut buf, param.wire(), value);
    }
    buf.freeze()
}

/// Uniform set: args are (antenna, value) pairs; a length that is not a
/// whole number of pairs earns `-2`. Valid antennas are written in
/// order and answered with their readbacks; unknown antennas are
/// collected and reported after a `-1`.
pub async fn set_values(boards: &Boards, st: &mut ServerState, param: Param, args: &[u8]) -> Bytes {
    let pair_size = 1 + param.value_size();
    if args.len() % pair_size != 0 {
        warn!("unmatched antenna/value pairs ({} bytes)", args.len());
        return error_response(STATUS_BAD_LENGTH, &[]);
    }

    let mut readbacks = Vec::with_capacity(args.len() / pair_size);
    let mut unknown = Vec::new();
    for pair in args.chunks_exact(pair_size) {
        let antenna = pair[0];
        let value = match param.wire() {
            WireType::Float => f64::from(f32::from_be_bytes([pair[1], pair[2], pair[3], pair[4]])),
            WireType::Byte => f64::from(pair[1]),
        };
        if !st.has_antenna(antenna) {
            unknown.push(antenna);
            continue;
        }
        match set_param(boards, st, param, antenna, value).await {
            Ok(readback) => readbacks.push(readback),
            Err(e) => {
                warn!("set failed for antenna {antenna}: {e}");
                return error_response(STATUS_INVALID, &[]);
            }
        }
    }
    if !unknown.is_empty() {
        warn!("antennas not in the system: {unknown:?}");
        return error_response(STATUS_INVALID, &unknown);
    }

    let mut buf = BytesMut::with_capacity(1 + readbacks.len() * param.value_size());
    buf.put_i8(STATUS_OK);
    for value in readbacks {
        pack_value(&mut buf, param.wire(), value);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::quant::*;
    use super::*;
    use crate::sim::sim_block;
    use crate::state::ServerState;

    #[test]
    fn delay_round_trips_within_one_lsb() {
        let lsb = 1.0 / (16.0 * ADC_PER_NS);
        for &delay in &[0.0, 1.0, 123.456, 2000.0, 7999.9] {
            let back = reg_to_delay(delay_to_reg(delay));
            assert!((back - delay).abs() <= lsb / 2.0 + 1e-9, "delay {delay} -> {back}");
        }
    }

    #[test]
    fn delay_register_low_values_wrap_up() {
        // Registers below 64 borrow from the top of the 17-bit range.
        assert!(reg_to_delay(0) > reg_to_delay(64));
    }

    #[test]
    fn phase_round_trips_within_one_step() {
        for &phase in &[0.0, 10.0, 359.9, 123.456] {
            let back = reg_to_phase(phase_to_reg(phase));
            assert!((back - phase).abs() <= PHASE_STEP_DEG / 2.0 + 1e-9);
        }
        // Negative totals land on the equivalent positive register.
        let back = reg_to_phase(phase_to_reg(-90.0));
        assert!((back - 270.0).abs() <= PHASE_STEP_DEG / 2.0 + 1e-9);
    }

    #[test]
    fn gain_quantizes_to_half_on_the_published_example() {
        let reg = gain_to_reg(0.501);
        assert_eq!(reg, 64);
        assert_eq!(reg_to_gain(reg), 0.5);
    }

    fn test_state() -> ServerState {
        ServerState::new(vec![6, 1, 2, 3, 4, 5, 7, 8], 6, vec![(1, 6)], 0.0)
    }

    #[tokio::test]
    async fn set_then_get_is_idempotent() {
        let boards = sim_block(3);
        let mut st = test_state();
        for param in [Param::Delay, Param::Phase, Param::Gain, Param::Threshold] {
            let readback = set_param(&boards, &mut st, param, 3, 17.0).await.unwrap();
            let again = get_param(&boards, &st, param, 3).await.unwrap();
            assert_eq!(readback, again, "{param:?}");
        }
    }

    #[tokio::test]
    async fn get_values_empty_args_covers_all_antennas_in_order() {
        let boards = sim_block(3);
        let st = test_state();
        let response = get_values(&boards, &st, Param::Mapping, &[]).await;
        assert_eq!(response[0] as i8, STATUS_OK);
        // Mapping of [6,1,2,...] in insertion order is 0,1,2,...
        assert_eq!(&response[1..], &[0, 1, 2, 3, 4, 5, 6, 7][..]);
    }

    #[tokio::test]
    async fn unknown_antennas_are_reported() {
        let boards = sim_block(3);
        let mut st = test_state();
        let response = get_values(&boards, &st, Param::Phase, &[99]).await;
        assert_eq!(response[0] as i8, STATUS_INVALID);
        assert_eq!(&response[1..], &[99][..]);

        let mut args = vec![3u8];
        args.extend_from_slice(&1.0f32.to_be_bytes());
        args.push(77);
        args.extend_from_slice(&1.0f32.to_be_bytes());
        let response = set_values(&boards, &mut st, Param::Gain, &args).await;
        assert_eq!(response[0] as i8, STATUS_INVALID);
        assert_eq!(&response[1..], &[77][..]);
    }

    #[tokio::test]
    async fn ragged_pairs_are_rejected() {
        let boards = sim_block(3);
        let mut st = test_state();
        let response = set_values(&boards, &mut st, Param::Gain, &[3, 0, 0]).await;
        assert_eq!(response[0] as i8, STATUS_BAD_LENGTH);
    }

    #[tokio::test]
    async fn offsets_feed_the_delay_total() {
        let boards = sim_block(3);
        let mut st = test_state();
        set_param(&boards, &mut st, Param::DelayOffset, 3, 10.0).await.unwrap();
        let with_offset = set_param(&boards, &mut st, Param::Delay, 3, 100.0).await.unwrap();
        // The register holds user + offset; readback is the total.
        assert!((with_offset - 110.0).abs() < 0.1);
    }
}
