//! Length-prefixed framing for the TCP command port.
//!
//! A frame is a big-endian u16 byte count `N` (which includes the two
//! length bytes themselves) followed by `N - 2` payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted on the command port, length bytes included.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - 2;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE}-byte limit")]
    TooLarge(usize),
    #[error("frame length {0} is shorter than its own header")]
    BadLength(u16),
    #[error("connection closed")]
    Closed,
    #[error("peer closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wrap a payload in a length frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(payload.len() + 2));
    }
    let mut buf = BytesMut::with_capacity(payload.len() + 2);
    buf.put_u16(payload.len() as u16 + 2);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder for callers that read in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete payload, if one has fully arrived.
    pub fn next_payload(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let size = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        if size < 2 {
            return Err(FrameError::BadLength(size));
        }
        if size as usize > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(size as usize));
        }
        if self.buf.len() < size as usize {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(size as usize);
        frame.advance(2);
        Ok(Some(frame.freeze()))
    }
}

/// Read one frame and return its payload.
///
/// A clean close at a frame boundary yields `FrameError::Closed`; a close
/// inside a frame yields `FrameError::Truncated`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, FrameError> {
    let mut header = [0u8; 2];
    let mut got = 0;
    while got < 2 {
        let n = reader.read(&mut header[got..]).await?;
        if n == 0 {
            return Err(if got == 0 { FrameError::Closed } else { FrameError::Truncated });
        }
        got += n;
    }
    let size = u16::from_be_bytes(header);
    if size < 2 {
        return Err(FrameError::BadLength(size));
    }
    if size as usize > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(size as usize));
    }
    let mut payload = vec![0u8; size as usize - 2];
    if let Err(e) = reader.read_exact(&mut payload).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            e.into()
        });
    }
    Ok(Bytes::from(payload))
}

/// Frame a payload and write it out.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_max_payload() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD).map(|i| i as u8).collect();
        let framed = encode_frame(&payload).unwrap();
        assert_eq!(framed.len(), MAX_FRAME_SIZE);

        let mut dec = FrameDecoder::new();
        dec.feed(&framed);
        let out = dec.next_payload().unwrap().unwrap();
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn decoder_handles_split_feeds() {
        let framed = encode_frame(b"hello").unwrap();
        let mut dec = FrameDecoder::new();
        dec.feed(&framed[..3]);
        assert!(dec.next_payload().unwrap().is_none());
        dec.feed(&framed[3..]);
        assert_eq!(&dec.next_payload().unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn decoder_yields_back_to_back_frames() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode_frame(&[1u8]).unwrap());
        stream.extend_from_slice(&encode_frame(&[2u8, 3u8]).unwrap());
        let mut dec = FrameDecoder::new();
        dec.feed(&stream);
        assert_eq!(&dec.next_payload().unwrap().unwrap()[..], &[1]);
        assert_eq!(&dec.next_payload().unwrap().unwrap()[..], &[2, 3]);
        assert!(dec.next_payload().unwrap().is_none());
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(encode_frame(&payload), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn undersized_length_rejected() {
        let mut dec = FrameDecoder::new();
        dec.feed(&[0, 1, 0xff]);
        assert!(matches!(dec.next_payload(), Err(FrameError::BadLength(1))));
    }

    #[tokio::test]
    async fn async_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(2048);
        write_frame(&mut a, b"ping").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(&payload[..], b"ping");
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Closed)));
    }
}
