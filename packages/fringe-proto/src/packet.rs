//! The UDP correlation datagram.
//!
//! One datagram is sent per baseline per integration per subscriber.
//! Layout, all big-endian:
//!
//! ```text
//! f32  time                 seconds since the unix epoch
//! u8   left antenna
//! u8   right antenna
//! u16  current              index of this baseline within the integration
//! u16  total                baselines in this integration
//! u16  lag count L          then L pairs of f64 (re, im)
//! u16  visibility count     then L-1 pairs of f64 (re, im)
//! u16  phase-fit count      then L-1 f64 values (radians)
//! f32  delay                group delay, ns
//! f32  phase                mean phase, rad
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_complex::Complex64;

/// Fixed header size preceding the serialized arrays.
pub const HEADER_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than the {HEADER_SIZE}-byte header")]
    ShortHeader(usize),
    #[error("datagram truncated inside the {0} section")]
    Truncated(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationPacket {
    pub time: f32,
    pub left: u8,
    pub right: u8,
    pub current: u16,
    pub total: u16,
    pub lags: Vec<Complex64>,
    pub visibility: Vec<Complex64>,
    pub phase_fit: Vec<f64>,
    /// Group delay from the phase slope, ns.
    pub delay: f32,
    /// Mean interferometric phase, rad.
    pub phase: f32,
}

impl CorrelationPacket {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            HEADER_SIZE
                + 6
                + 16 * (self.lags.len() + self.visibility.len())
                + 8 * self.phase_fit.len()
                + 8,
        );
        buf.put_f32(self.time);
        buf.put_u8(self.left);
        buf.put_u8(self.right);
        buf.put_u16(self.current);
        buf.put_u16(self.total);
        put_complex_array(&mut buf, &self.lags);
        put_complex_array(&mut buf, &self.visibility);
        buf.put_u16(self.phase_fit.len() as u16);
        for &v in &self.phase_fit {
            buf.put_f64(v);
        }
        buf.put_f32(self.delay);
        buf.put_f32(self.phase);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::ShortHeader(data.len()));
        }
        let mut buf = data;
        let time = buf.get_f32();
        let left = buf.get_u8();
        let right = buf.get_u8();
        let current = buf.get_u16();
        let total = buf.get_u16();
        let lags = get_complex_array(&mut buf, "lags")?;
        let visibility = get_complex_array(&mut buf, "visibility")?;
        let phase_fit = get_f64_array(&mut buf, "phase fit")?;
        if buf.remaining() < 8 {
            return Err(PacketError::Truncated("trailer"));
        }
        let delay = buf.get_f32();
        let phase = buf.get_f32();
        Ok(Self {
            time,
            left,
            right,
            current,
            total,
            lags,
            visibility,
            phase_fit,
            delay,
            phase,
        })
    }
}

fn put_complex_array(buf: &mut BytesMut, values: &[Complex64]) {
    buf.put_u16(values.len() as u16);
    for v in values {
        buf.put_f64(v.re);
        buf.put_f64(v.im);
    }
}

fn get_complex_array(buf: &mut &[u8], section: &'static str) -> Result<Vec<Complex64>, PacketError> {
    if buf.remaining() < 2 {
        return Err(PacketError::Truncated(section));
    }
    let count = buf.get_u16() as usize;
    if buf.remaining() < count * 16 {
        return Err(PacketError::Truncated(section));
    }
    Ok((0..count)
        .map(|_| {
            let re = buf.get_f64();
            let im = buf.get_f64();
            Complex64::new(re, im)
        })
        .collect())
}

fn get_f64_array(buf: &mut &[u8], section: &'static str) -> Result<Vec<f64>, PacketError> {
    if buf.remaining() < 2 {
        return Err(PacketError::Truncated(section));
    }
    let count = buf.get_u16() as usize;
    if buf.remaining() < count * 8 {
        return Err(PacketError::Truncated(section));
    }
    Ok((0..count).map(|_| buf.get_f64()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CorrelationPacket {
        CorrelationPacket {
            time: 1_700_000_000.0,
            left: 1,
            right: 6,
            current: 0,
            total: 1,
            lags: (0..16).map(|i| Complex64::new(i as f64, -(i as f64))).collect(),
            visibility: (0..15).map(|i| Complex64::new(0.5 * i as f64, 0.25)).collect(),
            phase_fit: (0..15).map(|i| 0.01 * i as f64).collect(),
            delay: 12.5,
            phase: -0.3,
        }
    }

    #[test]
    fn round_trip() {
        let pkt = sample();
        let bytes = pkt.to_bytes();
        let parsed = CorrelationPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn header_layout_is_stable() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 6);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 0);
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 1);
        assert_eq!(u16::from_be_bytes([bytes[10], bytes[11]]), 16);
    }

    #[test]
    fn truncation_is_detected() {
        let bytes = sample().to_bytes();
        assert!(CorrelationPacket::from_bytes(&bytes[..HEADER_SIZE - 1]).is_err());
        assert!(CorrelationPacket::from_bytes(&bytes[..bytes.len() - 4]).is_err());
    }
}
