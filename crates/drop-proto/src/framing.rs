//! Length-prefixed framing for the target handoff.
//!
//! A bare `recv` on a TCP stream may return a partial JSON payload; the
//! u32 big-endian length prefix lets the reader reassemble exactly one
//! message regardless of how the bytes arrive.

use bytes::{BufMut, BytesMut};
use std::io::Read;

use crate::TargetMessage;

/// Upper bound on a frame body. A TargetMessage is well under 1 KiB; a
/// larger prefix means a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds {MAX_FRAME_LEN}")]
    TooLarge(usize),
    #[error("frame decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Encode one message as `u32 len || json`.
pub fn encode_frame(msg: &TargetMessage) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(msg)?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

/// Read exactly one framed message. Loops internally over partial reads;
/// any timeout configured on the underlying stream surfaces as `Io`.
pub fn read_frame<R: Read>(r: &mut R) -> Result<TargetMessage, FrameError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
