//! WebSocket frame codec (RFC 6455 §5).

use crate::errors::{ws_close, WsError};
use bytes::{Buf, BytesMut};

/// Frame opcodes. Reserved opcodes fail the connection with 1002.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, WsError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            _ => Err(WsError::fail(ws_close::PROTOCOL_ERROR, "reserved opcode")),
        }
    }

    #[inline]
    pub(crate) fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One parsed frame. The payload is already unmasked.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WsFrame {
    pub(crate) fin: bool,
    pub(crate) opcode: OpCode,
    pub(crate) masked: bool,
    pub(crate) payload: Vec<u8>,
}

impl WsFrame {
    pub(crate) fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            opcode,
            masked: false,
            payload,
        }
    }

    pub(crate) fn close(code: u16, reason: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, payload)
    }
}

/// XORs `payload` with the 4-byte key; its own inverse.
#[inline]
pub(crate) fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Tries to parse one frame out of `buf`. Returns `None` when the buffer
/// does not yet hold a complete frame; the caller reads more and retries.
pub(crate) fn parse(buf: &mut BytesMut, max_payload: usize) -> Result<Option<WsFrame>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(WsError::fail(
            ws_close::PROTOCOL_ERROR,
            "reserved bits must be zero",
        ));
    }
    let opcode = OpCode::from_bits(b0 & 0x0f)?;

    let masked = b1 & 0x80 != 0;
    let len7 = (b1 & 0x7f) as usize;
    let (extra_len, header_len) = match len7 {
        126 => (2, 4),
        127 => (8, 10),
        _ => (0, 2),
    };
    let header_len = header_len + if masked { 4 } else { 0 };
    if buf.len() < header_len {
        return Ok(None);
    }

    let payload_len = match extra_len {
        0 => len7,
        2 => u16::from_be_bytes([buf[2], buf[3]]) as usize,
        _ => {
            let len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            usize::try_from(len)
                .map_err(|_| WsError::fail(ws_close::MESSAGE_TOO_BIG, "payload too large"))?
        }
    };

    if opcode.is_control() {
        if payload_len > 125 {
            return Err(WsError::fail(
                ws_close::PROTOCOL_ERROR,
                "control frame above 125 bytes",
            ));
        }
        if !fin {
            return Err(WsError::fail(
                ws_close::PROTOCOL_ERROR,
                "fragmented control frame",
            ));
        }
    }
    if payload_len > max_payload {
        return Err(WsError::fail(ws_close::MESSAGE_TOO_BIG, "payload too large"));
    }

    if buf.len() < header_len + payload_len {
        return Ok(None);
    }

    let mask = if masked {
        let at = header_len - 4;
        Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    } else {
        None
    };

    buf.advance(header_len);
    let mut payload = buf.split_to(payload_len).to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(WsFrame {
        fin,
        opcode,
        masked,
        payload,
    }))
}

/// Serializes a frame. Server frames carry no mask; tests exercise the
/// masked form by passing a key.
pub(crate) fn encode(frame: &WsFrame, mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    let b0 = if frame.fin { 0x80 } else { 0 } | frame.opcode as u8;
    out.push(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    let len = frame.payload.len();
    match len {
        0..=125 => out.push(mask_bit | len as u8),
        126..=65_535 => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }
}
