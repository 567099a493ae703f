use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame a peer may send before being treated as misbehaving.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// One subprotocol frame: message code plus RLP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

/// Length-prefixed framing for the peer transport. The encrypted RLPx
/// framing and its handshake live behind this seam; the session logic only
/// ever sees (code, payload) frames.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty frame"));
        }
        if frame_len > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {frame_len} bytes exceeds limit"),
            ));
        }
        if src.len() < LEN_PREFIX + frame_len {
            src.reserve(LEN_PREFIX + frame_len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let code = src.get_u8();
        let payload = src.split_to(frame_len - 1).freeze();
        Ok(Some(Frame { code, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let frame_len = frame.payload.len() + 1;
        if frame_len > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "outbound frame exceeds limit",
            ));
        }
        dst.reserve(LEN_PREFIX + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u8(frame.code);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
