//! HTTP/2 frame codec (RFC 7540 §4, §6).
//!
//! Sans-I/O: the connection layer reads the 9-byte head plus payload off the
//! socket and hands complete frames here for typing and validation; encoding
//! appends wire bytes to an output buffer.

use crate::errors::{H2Error, H2ErrorCode};
use bytes::Bytes;

pub(crate) const FRAME_HEAD_LEN: usize = 9;

/// The 24-byte client connection preface.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) mod kind {
    pub(crate) const DATA: u8 = 0x0;
    pub(crate) const HEADERS: u8 = 0x1;
    pub(crate) const PRIORITY: u8 = 0x2;
    pub(crate) const RST_STREAM: u8 = 0x3;
    pub(crate) const SETTINGS: u8 = 0x4;
    pub(crate) const PUSH_PROMISE: u8 = 0x5;
    pub(crate) const PING: u8 = 0x6;
    pub(crate) const GOAWAY: u8 = 0x7;
    pub(crate) const WINDOW_UPDATE: u8 = 0x8;
    pub(crate) const CONTINUATION: u8 = 0x9;
}

pub(crate) mod flags {
    pub(crate) const END_STREAM: u8 = 0x1;
    pub(crate) const ACK: u8 = 0x1;
    pub(crate) const END_HEADERS: u8 = 0x4;
    pub(crate) const PADDED: u8 = 0x8;
    pub(crate) const PRIORITY: u8 = 0x20;
}

pub(crate) mod settings {
    pub(crate) const HEADER_TABLE_SIZE: u16 = 0x1;
    pub(crate) const ENABLE_PUSH: u16 = 0x2;
    pub(crate) const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub(crate) const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub(crate) const MAX_FRAME_SIZE: u16 = 0x5;
    pub(crate) const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// Fixed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FrameHead {
    pub(crate) length: u32,
    pub(crate) kind: u8,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHead {
    pub(crate) fn parse(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= FRAME_HEAD_LEN);
        Self {
            length: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            kind: bytes[3],
            flags: bytes[4],
            stream_id: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]])
                & 0x7fff_ffff,
        }
    }

    fn encode(length: usize, kind: u8, flags: u8, stream_id: u32, out: &mut Vec<u8>) {
        debug_assert!(length <= 0xff_ffff);
        out.extend_from_slice(&(length as u32).to_be_bytes()[1..]);
        out.push(kind);
        out.push(flags);
        out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    }
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
        /// Wire length before padding removal; this is what flow control
        /// charges.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        fragment: Bytes,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        code: H2ErrorCode,
    },
    Settings {
        entries: Vec<(u16, u32)>,
    },
    SettingsAck,
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: H2ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        end_headers: bool,
        fragment: Bytes,
    },
    /// Unknown frame types are ignored by the dispatch loop (RFC 7540 §4.1).
    Unknown,
}

/// Types a complete frame. `payload.len() == head.length` is the caller's
/// responsibility, as is the `length <= local MAX_FRAME_SIZE` check (which
/// must happen before the payload is even read).
pub(crate) fn decode(head: FrameHead, payload: Bytes) -> Result<Frame, H2Error> {
    let conn = |reason| Err(H2Error::conn(H2ErrorCode::Protocol, reason));
    let size = |reason| Err(H2Error::conn(H2ErrorCode::FrameSize, reason));

    match head.kind {
        kind::DATA => {
            if head.stream_id == 0 {
                return conn("DATA on stream 0");
            }
            let flow_len = head.length;
            let payload = strip_padding(&head, payload)?;
            Ok(Frame::Data {
                stream_id: head.stream_id,
                end_stream: head.flags & flags::END_STREAM != 0,
                payload,
                flow_len,
            })
        }

        kind::HEADERS => {
            if head.stream_id == 0 {
                return conn("HEADERS on stream 0");
            }
            let mut fragment = strip_padding(&head, payload)?;
            if head.flags & flags::PRIORITY != 0 {
                if fragment.len() < 5 {
                    return size("HEADERS priority fields truncated");
                }
                let _ = fragment.split_to(5);
            }
            Ok(Frame::Headers {
                stream_id: head.stream_id,
                end_stream: head.flags & flags::END_STREAM != 0,
                end_headers: head.flags & flags::END_HEADERS != 0,
                fragment,
            })
        }

        kind::PRIORITY => {
            if head.stream_id == 0 {
                return conn("PRIORITY on stream 0");
            }
            if head.length != 5 {
                return size("PRIORITY length must be 5");
            }
            Ok(Frame::Priority {
                stream_id: head.stream_id,
            })
        }

        kind::RST_STREAM => {
            if head.stream_id == 0 {
                return conn("RST_STREAM on stream 0");
            }
            if head.length != 4 {
                return size("RST_STREAM length must be 4");
            }
            let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(Frame::RstStream {
                stream_id: head.stream_id,
                code: code.into(),
            })
        }

        kind::SETTINGS => {
            if head.stream_id != 0 {
                return conn("SETTINGS on a stream");
            }
            if head.flags & flags::ACK != 0 {
                if head.length != 0 {
                    return size("SETTINGS ack with payload");
                }
                return Ok(Frame::SettingsAck);
            }
            if head.length % 6 != 0 {
                return size("SETTINGS length not a multiple of 6");
            }

            let mut entries = Vec::with_capacity(payload.len() / 6);
            for chunk in payload.chunks_exact(6) {
                let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                entries.push((id, value));
            }
            Ok(Frame::Settings { entries })
        }

        kind::PUSH_PROMISE => Ok(Frame::PushPromise {
            stream_id: head.stream_id,
        }),

        kind::PING => {
            if head.stream_id != 0 {
                return conn("PING on a stream");
            }
            if head.length != 8 {
                return size("PING length must be 8");
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Ok(Frame::Ping {
                ack: head.flags & flags::ACK != 0,
                payload: data,
            })
        }

        kind::GOAWAY => {
            if head.stream_id != 0 {
                return conn("GOAWAY on a stream");
            }
            if head.length < 8 {
                return size("GOAWAY too short");
            }
            let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                & 0x7fff_ffff;
            let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            Ok(Frame::GoAway {
                last_stream_id: last,
                code: code.into(),
            })
        }

        kind::WINDOW_UPDATE => {
            if head.length != 4 {
                return size("WINDOW_UPDATE length must be 4");
            }
            let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                & 0x7fff_ffff;
            if increment == 0 {
                // Zero increment is a stream error on a stream, a connection
                // error on stream 0 (RFC 7540 §6.9).
                return if head.stream_id == 0 {
                    conn("WINDOW_UPDATE increment 0")
                } else {
                    Err(H2Error::stream(head.stream_id, H2ErrorCode::Protocol))
                };
            }
            Ok(Frame::WindowUpdate {
                stream_id: head.stream_id,
                increment,
            })
        }

        kind::CONTINUATION => {
            if head.stream_id == 0 {
                return conn("CONTINUATION on stream 0");
            }
            Ok(Frame::Continuation {
                stream_id: head.stream_id,
                end_headers: head.flags & flags::END_HEADERS != 0,
                fragment: payload,
            })
        }

        _ => Ok(Frame::Unknown),
    }
}

fn strip_padding(head: &FrameHead, mut payload: Bytes) -> Result<Bytes, H2Error> {
    if head.flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::conn(
            H2ErrorCode::FrameSize,
            "padded frame without pad length",
        ));
    }

    let pad_len = payload.split_to(1)[0] as usize;
    if pad_len >= payload.len() + 1 {
        // Padding that swallows the whole payload (RFC 7540 §6.1).
        return Err(H2Error::conn(H2ErrorCode::Protocol, "padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

// Encoding

pub(crate) fn encode_data(
    stream_id: u32,
    end_stream: bool,
    payload: &[u8],
    out: &mut Vec<u8>,
) {
    let flags = if end_stream { flags::END_STREAM } else { 0 };
    FrameHead::encode(payload.len(), kind::DATA, flags, stream_id, out);
    out.extend_from_slice(payload);
}

pub(crate) fn encode_headers(
    stream_id: u32,
    end_stream: bool,
    fragment: &[u8],
    out: &mut Vec<u8>,
) {
    let mut flags = flags::END_HEADERS;
    if end_stream {
        flags |= flags::END_STREAM;
    }
    FrameHead::encode(fragment.len(), kind::HEADERS, flags, stream_id, out);
    out.extend_from_slice(fragment);
}

/// Emits a header block as one HEADERS frame, or HEADERS + CONTINUATION
/// when the fragment exceeds the peer's max frame size.
pub(crate) fn encode_headers_fragmented(
    stream_id: u32,
    end_stream: bool,
    fragment: &[u8],
    max_frame_size: usize,
    out: &mut Vec<u8>,
) {
    if fragment.len() <= max_frame_size {
        encode_headers(stream_id, end_stream, fragment, out);
        return;
    }

    let (first, mut rest) = fragment.split_at(max_frame_size);
    let mut flags = 0;
    if end_stream {
        flags |= flags::END_STREAM;
    }
    FrameHead::encode(first.len(), kind::HEADERS, flags, stream_id, out);
    out.extend_from_slice(first);

    while rest.len() > max_frame_size {
        let (chunk, tail) = rest.split_at(max_frame_size);
        FrameHead::encode(chunk.len(), kind::CONTINUATION, 0, stream_id, out);
        out.extend_from_slice(chunk);
        rest = tail;
    }
    FrameHead::encode(rest.len(), kind::CONTINUATION, flags::END_HEADERS, stream_id, out);
    out.extend_from_slice(rest);
}

pub(crate) fn encode_settings(entries: &[(u16, u32)], out: &mut Vec<u8>) {
    FrameHead::encode(entries.len() * 6, kind::SETTINGS, 0, 0, out);
    for &(id, value) in entries {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
}

pub(crate) fn encode_settings_ack(out: &mut Vec<u8>) {
    FrameHead::encode(0, kind::SETTINGS, flags::ACK, 0, out);
}

pub(crate) fn encode_ping(ack: bool, payload: &[u8; 8], out: &mut Vec<u8>) {
    let flags = if ack { flags::ACK } else { 0 };
    FrameHead::encode(8, kind::PING, flags, 0, out);
    out.extend_from_slice(payload);
}

pub(crate) fn encode_rst_stream(stream_id: u32, code: H2ErrorCode, out: &mut Vec<u8>) {
    FrameHead::encode(4, kind::RST_STREAM, 0, stream_id, out);
    out.extend_from_slice(&(code as u32).to_be_bytes());
}

pub(crate) fn encode_goaway(last_stream_id: u32, code: H2ErrorCode, out: &mut Vec<u8>) {
    FrameHead::encode(8, kind::GOAWAY, 0, 0, out);
    out.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(&(code as u32).to_be_bytes());
}

pub(crate) fn encode_window_update(stream_id: u32, increment: u32, out: &mut Vec<u8>) {
    FrameHead::encode(4, kind::WINDOW_UPDATE, 0, stream_id, out);
    out.extend_from_slice(&(increment & 0x7fff_ffff).to_be_bytes());
}
