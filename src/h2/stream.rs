//! Per-stream lifecycle and flow-control accounting (RFC 7540 §5, §6.9).

use crate::errors::{H2Error, H2ErrorCode};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::fs::File;

/// Tail of a file-backed response body, read lazily as window credit
/// arrives so large files never sit in memory.
#[derive(Debug)]
pub(crate) struct PendingFile {
    pub(crate) file: File,
    pub(crate) remaining: u64,
}

const MAX_WINDOW: i64 = 0x7fff_ffff;

/// RFC 7540 §5.1 stream states. The reserved-local/remote states only arise
/// from PUSH_PROMISE, which this server neither sends nor accepts, so they
/// cannot occur here. Idle and closed streams carry no `Stream` record; the
/// variants exist for the transitions that pass through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// One client-initiated stream.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) state: StreamState,

    /// Credit we have for sending DATA to the peer.
    pub(crate) send_window: i64,
    /// Credit the peer has for sending DATA to us.
    pub(crate) recv_window: i64,
    /// Received body bytes not yet returned to the peer as WINDOW_UPDATE.
    pub(crate) recv_unacked: u32,

    /// Accumulated request header block (HEADERS + CONTINUATION fragments).
    pub(crate) header_block: Vec<u8>,
    /// Decoded header list, filled once END_HEADERS arrives.
    pub(crate) request_headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// END_STREAM seen on the HEADERS frame.
    pub(crate) headers_end_stream: bool,
    /// Request body accumulated from DATA frames.
    pub(crate) body: Vec<u8>,
    /// The request handler has been dispatched (at most once per stream).
    pub(crate) dispatched: bool,

    /// Response DATA not yet passed flow control.
    pub(crate) pending: VecDeque<Bytes>,
    /// File-backed remainder of the response body.
    pub(crate) pending_file: Option<PendingFile>,
    pub(crate) pending_end_stream: bool,
}

impl Stream {
    fn new(id: u32, send_window: i64, recv_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Open,
            send_window,
            recv_window,
            recv_unacked: 0,
            header_block: Vec::new(),
            request_headers: Vec::new(),
            headers_end_stream: false,
            body: Vec::new(),
            dispatched: false,
            pending: VecDeque::new(),
            pending_file: None,
            pending_end_stream: false,
        }
    }

    /// Total queued response bytes awaiting window credit.
    pub(crate) fn pending_len(&self) -> u64 {
        let queued: u64 = self.pending.iter().map(|chunk| chunk.len() as u64).sum();
        queued
            + self
                .pending_file
                .as_ref()
                .map(|f| f.remaining)
                .unwrap_or(0)
    }

    /// Whether anything is ready to send once windows allow.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.pending_file.is_some() || self.pending_end_stream
    }
}

/// All streams of one connection, plus the connection-level bookkeeping the
/// state machine needs. Owned exclusively by the connection task.
#[derive(Debug)]
pub(crate) struct StreamMap {
    streams: HashMap<u32, Stream>,
    /// Highest client-initiated stream id seen.
    pub(crate) last_client_id: u32,
    /// Streams fully closed are dropped from the map but must stay
    /// distinguishable from idle ones; anything at or below this id was
    /// once alive.
    open_count: u32,
    max_concurrent: u32,
    /// Peer's INITIAL_WINDOW_SIZE; seeds the send window of new streams.
    initial_send_window: i64,
    /// Our INITIAL_WINDOW_SIZE; seeds the receive window of new streams.
    initial_recv_window: i64,
}

impl StreamMap {
    pub(crate) fn new(max_concurrent: u32, initial_send: u32, initial_recv: u32) -> Self {
        Self {
            streams: HashMap::new(),
            last_client_id: 0,
            open_count: 0,
            max_concurrent,
            initial_send_window: initial_send as i64,
            initial_recv_window: initial_recv as i64,
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    #[inline]
    pub(crate) fn active(&self) -> usize {
        self.streams.len()
    }

    /// Ids of every live stream, in no particular order.
    pub(crate) fn ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    /// Opens a stream for an inbound HEADERS frame.
    pub(crate) fn recv_headers(&mut self, id: u32, end_stream: bool) -> Result<&mut Stream, H2Error> {
        if id % 2 == 0 {
            return Err(H2Error::conn(
                H2ErrorCode::Protocol,
                "client stream id must be odd",
            ));
        }
        if id <= self.last_client_id {
            // HEADERS on an open stream are trailers; accepted only as the
            // end of the request body. Anything else re-opens a retired or
            // out-of-order id.
            let trailers = end_stream
                && self
                    .streams
                    .get(&id)
                    .is_some_and(|s| s.state == StreamState::Open);
            if trailers {
                let stream = self.streams.get_mut(&id).expect("stream present");
                stream.state = StreamState::HalfClosedRemote;
                return Ok(stream);
            }
            return Err(H2Error::conn(
                H2ErrorCode::Protocol,
                "stream id not strictly increasing",
            ));
        }
        if self.open_count >= self.max_concurrent {
            return Err(H2Error::stream(id, H2ErrorCode::RefusedStream));
        }

        self.last_client_id = id;
        self.open_count += 1;

        let mut stream = Stream::new(id, self.initial_send_window, self.initial_recv_window);
        stream.headers_end_stream = end_stream;
        if end_stream {
            stream.state = StreamState::HalfClosedRemote;
        }
        Ok(self.streams.entry(id).or_insert(stream))
    }

    /// Validates an inbound DATA frame and charges the stream-level receive
    /// window. The connection-level window is the caller's.
    pub(crate) fn recv_data(
        &mut self,
        id: u32,
        flow_len: u32,
        end_stream: bool,
        payload: &[u8],
        max_body: usize,
    ) -> Result<(), H2Error> {
        let known_closed = id <= self.last_client_id;
        let Some(stream) = self.streams.get_mut(&id) else {
            return if known_closed {
                // Closed and forgotten: stream error, connection survives.
                Err(H2Error::stream(id, H2ErrorCode::StreamClosed))
            } else {
                Err(H2Error::conn(H2ErrorCode::Protocol, "DATA on idle stream"))
            };
        };

        match stream.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            _ => return Err(H2Error::stream(id, H2ErrorCode::StreamClosed)),
        }

        stream.recv_window -= flow_len as i64;
        if stream.recv_window < 0 {
            return Err(H2Error::stream(id, H2ErrorCode::FlowControl));
        }
        stream.recv_unacked += flow_len;

        if stream.body.len() + payload.len() > max_body {
            return Err(H2Error::stream(id, H2ErrorCode::RefusedStream));
        }
        stream.body.extend_from_slice(payload);

        if end_stream {
            let retire = stream.state == StreamState::HalfClosedLocal;
            if retire {
                self.close(id);
            } else {
                stream.state = StreamState::HalfClosedRemote;
            }
        }
        Ok(())
    }

    /// Applies an inbound WINDOW_UPDATE to one stream.
    pub(crate) fn recv_window_update(&mut self, id: u32, increment: u32) -> Result<(), H2Error> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return if id <= self.last_client_id {
                // Updates racing a close are ignored (RFC 7540 §5.1).
                Ok(())
            } else {
                Err(H2Error::conn(
                    H2ErrorCode::Protocol,
                    "WINDOW_UPDATE on idle stream",
                ))
            };
        };

        stream.send_window += increment as i64;
        if stream.send_window > MAX_WINDOW {
            return Err(H2Error::stream(id, H2ErrorCode::FlowControl));
        }
        Ok(())
    }

    /// Applies an inbound RST_STREAM.
    pub(crate) fn recv_rst(&mut self, id: u32) -> Result<(), H2Error> {
        if id > self.last_client_id {
            return Err(H2Error::conn(
                H2ErrorCode::Protocol,
                "RST_STREAM on idle stream",
            ));
        }
        self.close(id);
        Ok(())
    }

    /// Re-seeds every active stream's send window when the peer changes
    /// SETTINGS_INITIAL_WINDOW_SIZE (RFC 7540 §6.9.2).
    pub(crate) fn apply_initial_send_window(&mut self, new_initial: u32) -> Result<(), H2Error> {
        let delta = new_initial as i64 - self.initial_send_window;
        self.initial_send_window = new_initial as i64;

        for stream in self.streams.values_mut() {
            stream.send_window += delta;
            if stream.send_window > MAX_WINDOW {
                return Err(H2Error::conn(
                    H2ErrorCode::FlowControl,
                    "initial window change overflows stream window",
                ));
            }
        }
        Ok(())
    }

    /// Marks the response finished on our side, retiring the stream when the
    /// peer is done too.
    pub(crate) fn close_local(&mut self, id: u32) {
        let done = match self.streams.get_mut(&id) {
            Some(stream) => match stream.state {
                StreamState::HalfClosedRemote | StreamState::Closed => true,
                _ => {
                    stream.state = StreamState::HalfClosedLocal;
                    false
                }
            },
            None => false,
        };

        if done {
            self.close(id);
        }
    }

    /// Fully closes and forgets a stream. Closed streams are never revived;
    /// `last_client_id` keeps their ids distinguishable from idle ones.
    pub(crate) fn close(&mut self, id: u32) {
        if self.streams.remove(&id).is_some() {
            self.open_count = self.open_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod stream_tests {
    use super::*;

    fn map() -> StreamMap {
        StreamMap::new(4, 65_535, 65_535)
    }

    #[test]
    fn headers_open_and_half_close() {
        let mut map = map();

        let stream = map.recv_headers(1, false).unwrap();
        assert_eq!(stream.state, StreamState::Open);

        let stream = map.recv_headers(3, true).unwrap();
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
        assert_eq!(map.active(), 2);
    }

    #[test]
    fn stream_ids_strictly_increasing_and_odd() {
        let mut map = map();
        map.recv_headers(5, true).unwrap();

        assert_eq!(
            map.recv_headers(2, false).unwrap_err(),
            H2Error::conn(H2ErrorCode::Protocol, "")
        );
        assert_eq!(
            map.recv_headers(3, false).unwrap_err(),
            H2Error::conn(H2ErrorCode::Protocol, "")
        );
    }

    #[test]
    fn concurrency_ceiling_refuses_stream() {
        let mut map = StreamMap::new(2, 65_535, 65_535);
        map.recv_headers(1, false).unwrap();
        map.recv_headers(3, false).unwrap();

        assert_eq!(
            map.recv_headers(5, false).unwrap_err(),
            H2Error::stream(5, H2ErrorCode::RefusedStream)
        );
    }

    #[test]
    fn data_on_idle_is_connection_error() {
        let mut map = map();
        assert_eq!(
            map.recv_data(1, 5, false, b"hello", 1024).unwrap_err(),
            H2Error::conn(H2ErrorCode::Protocol, "")
        );
    }

    #[test]
    fn data_after_end_stream_is_stream_closed() {
        let mut map = map();
        map.recv_headers(1, true).unwrap();

        assert_eq!(
            map.recv_data(1, 5, false, b"hello", 1024).unwrap_err(),
            H2Error::stream(1, H2ErrorCode::StreamClosed)
        );
    }

    #[test]
    fn data_on_forgotten_stream_is_stream_closed() {
        let mut map = map();
        map.recv_headers(1, true).unwrap();
        map.close(1);

        assert_eq!(
            map.recv_data(1, 5, false, b"hello", 1024).unwrap_err(),
            H2Error::stream(1, H2ErrorCode::StreamClosed)
        );
    }

    #[test]
    fn data_accumulates_and_charges_window() {
        let mut map = map();
        map.recv_headers(1, false).unwrap();

        map.recv_data(1, 5, false, b"hello", 1024).unwrap();
        map.recv_data(1, 6, true, b" world", 1024).unwrap();

        let stream = map.get_mut(1).unwrap();
        assert_eq!(stream.body, b"hello world");
        assert_eq!(stream.recv_window, 65_535 - 11);
        assert_eq!(stream.recv_unacked, 11);
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
    }

    #[test]
    fn window_update_rules() {
        let mut map = map();

        // Idle stream: connection error.
        assert_eq!(
            map.recv_window_update(1, 10).unwrap_err(),
            H2Error::conn(H2ErrorCode::Protocol, "")
        );

        map.recv_headers(1, false).unwrap();
        map.recv_window_update(1, 1000).unwrap();
        assert_eq!(map.get_mut(1).unwrap().send_window, 66_535);

        // Closed stream: ignored.
        map.close(1);
        map.recv_window_update(1, 10).unwrap();

        // Overflow past 2^31 - 1: stream error.
        map.recv_headers(3, false).unwrap();
        assert_eq!(
            map.recv_window_update(3, MAX_WINDOW as u32).unwrap_err(),
            H2Error::stream(3, H2ErrorCode::FlowControl)
        );
    }

    #[test]
    fn initial_window_delta_applies_to_active_streams() {
        let mut map = map();
        map.recv_headers(1, false).unwrap();
        map.get_mut(1).unwrap().send_window -= 10_000;

        map.apply_initial_send_window(30_000).unwrap();
        assert_eq!(map.get_mut(1).unwrap().send_window, 30_000 - 10_000);

        // New streams seed from the new initial value.
        map.recv_headers(3, false).unwrap();
        assert_eq!(map.get_mut(3).unwrap().send_window, 30_000);
    }

    #[test]
    fn initial_window_overflow_is_flow_control_error() {
        let mut map = map();
        map.recv_headers(1, false).unwrap();
        map.recv_window_update(1, (MAX_WINDOW - 65_535) as u32).unwrap();

        assert_eq!(
            map.apply_initial_send_window(65_536).unwrap_err(),
            H2Error::conn(H2ErrorCode::FlowControl, "")
        );
    }

    #[test]
    fn rst_rules() {
        let mut map = map();
        assert!(map.recv_rst(1).is_err());

        map.recv_headers(1, false).unwrap();
        map.recv_rst(1).unwrap();
        assert_eq!(map.active(), 0);

        // A second RST for the same id is tolerated.
        map.recv_rst(1).unwrap();
    }

    #[test]
    fn close_local_retires_when_both_sides_done() {
        let mut map = map();
        map.recv_headers(1, true).unwrap();
        map.close_local(1);
        assert_eq!(map.active(), 0);

        map.recv_headers(3, false).unwrap();
        map.close_local(3);
        assert_eq!(map.get_mut(3).unwrap().state, StreamState::HalfClosedLocal);
    }

    #[test]
    fn body_bound_refuses_stream() {
        let mut map = map();
        map.recv_headers(1, false).unwrap();

        assert_eq!(
            map.recv_data(1, 10, false, &[0; 10], 5).unwrap_err(),
            H2Error::stream(1, H2ErrorCode::RefusedStream)
        );
    }
}
