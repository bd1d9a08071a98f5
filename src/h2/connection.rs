//! HTTP/2 connection handler: preface, SETTINGS exchange, frame dispatch,
//! stream multiplexing and flow-controlled response emission (RFC 7540).
//!
//! One instance per connection, driven by that connection's task. The HPACK
//! codec pair, the stream map and the send queues all live here and are
//! never shared across tasks.

use crate::{
    errors::{H2Error, H2ErrorCode},
    h2::{
        frame::{self, settings, Frame, FrameHead, FRAME_HEAD_LEN, PREFACE},
        hpack,
        stream::{PendingFile, StreamMap, StreamState},
    },
    http::{
        request::Request,
        response::{Body, Response},
        types::{HeaderMap, Method, Url, Version},
    },
    metrics::Metrics,
    server::{
        context::ServerContext,
        handler::{run_request, Handler},
    },
};
use bytes::{Buf, Bytes, BytesMut};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// RFC 7540 default connection window; ours grows only via WINDOW_UPDATE.
const DEFAULT_WINDOW: i64 = 65_535;
const MAX_WINDOW: i64 = 0x7fff_ffff;
/// Hard cap on an accumulated (compressed) header block across HEADERS and
/// CONTINUATION frames.
const MAX_HEADER_BLOCK: usize = 256 * 1024;

pub(crate) async fn serve<S, H>(
    io: S,
    leftover: BytesMut,
    preface_consumed: bool,
    ctx: Arc<ServerContext>,
    handler: Arc<H>,
    peer: Option<IpAddr>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    Metrics::incr(&ctx.metrics.h2_connections);
    let mut conn = H2Connection::new(io, leftover, ctx.clone(), handler, peer, shutdown);

    if let Err(e) = conn.run(preface_consumed).await {
        match &e {
            H2Error::Io(err) => debug!(error = %err, "h2 transport error"),
            other => debug!(error = %other, "h2 connection ended with error"),
        }
    }
    Metrics::decr(&ctx.metrics.h2_connections);
}

struct H2Connection<S, H> {
    io: S,
    read_buf: BytesMut,
    write_buf: Vec<u8>,

    ctx: Arc<ServerContext>,
    handler: Arc<H>,
    peer: Option<IpAddr>,
    shutdown: watch::Receiver<bool>,

    decoder: hpack::Decoder,
    encoder: hpack::Encoder,

    streams: StreamMap,
    conn_send_window: i64,
    conn_recv_window: i64,
    conn_recv_unacked: u32,

    /// Peer limits learned from its SETTINGS.
    remote_max_frame: u32,
    local_max_frame: u32,

    /// In-flight header block: `(stream_id, end_headers pending)`.
    continuation: Option<u32>,
    hdr_accum: Vec<u8>,
    hdr_stream: u32,
    hdr_refused: Option<H2ErrorCode>,

    expect_settings: bool,
    goaway_sent: bool,
    peer_goaway: bool,
    rr_cursor: usize,
}

impl<S, H> H2Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    fn new(
        io: S,
        leftover: BytesMut,
        ctx: Arc<ServerContext>,
        handler: Arc<H>,
        peer: Option<IpAddr>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let h2 = &ctx.config.h2;
        Self {
            io,
            read_buf: leftover,
            write_buf: Vec::with_capacity(4096),

            decoder: hpack::Decoder::new(
                h2.header_table_size as usize,
                h2.max_header_list_size as usize,
            ),
            // The encoder starts at the RFC default until the peer's
            // SETTINGS raise or lower it.
            encoder: hpack::Encoder::new(4096),

            streams: StreamMap::new(
                h2.max_concurrent_streams,
                DEFAULT_WINDOW as u32,
                h2.initial_window_size,
            ),
            conn_send_window: DEFAULT_WINDOW,
            conn_recv_window: DEFAULT_WINDOW,
            conn_recv_unacked: 0,

            remote_max_frame: 16_384,
            local_max_frame: h2.max_frame_size,

            continuation: None,
            hdr_accum: Vec::new(),
            hdr_stream: 0,
            hdr_refused: None,

            expect_settings: true,
            goaway_sent: false,
            peer_goaway: false,
            rr_cursor: 0,

            ctx,
            handler,
            peer,
            shutdown,
        }
    }

    async fn run(&mut self, preface_consumed: bool) -> Result<(), H2Error> {
        if !preface_consumed && !self.read_preface().await? {
            debug!("invalid client preface");
            return Ok(());
        }

        self.send_initial_settings().await?;

        loop {
            if *self.shutdown.borrow() && !self.goaway_sent {
                self.send_goaway(H2ErrorCode::NoError).await?;
            }
            if self.goaway_sent && self.streams.active() == 0 {
                break;
            }

            let frame = tokio::select! {
                biased;

                _ = self.shutdown.changed() => continue,
                result = Self::read_frame(&mut self.io, &mut self.read_buf, self.local_max_frame) => {
                    match result {
                        Ok(frame) => frame,
                        Err(e) => return self.fail_connection(e).await,
                    }
                }
                _ = sleep(self.ctx.config.idle_timeout) => {
                    debug!("h2 idle timeout");
                    self.send_goaway(H2ErrorCode::NoError).await?;
                    break;
                }
            };

            match self.handle_frame(frame).await {
                Ok(()) => {}
                Err(H2Error::Stream(id, code)) => {
                    self.ctx.metrics.record_h2_error(code);
                    trace!(stream = id, code = ?code, "stream error");
                    frame::encode_rst_stream(id, code, &mut self.write_buf);
                    self.streams.close(id);
                    self.flush_io().await?;
                }
                Err(e) => return self.fail_connection(e).await,
            }
        }

        self.flush_io().await?;
        Ok(())
    }

    /// Sends GOAWAY for a fatal error, flushes, and surfaces the error.
    async fn fail_connection(&mut self, error: H2Error) -> Result<(), H2Error> {
        if let H2Error::Connection(code, reason) = &error {
            self.ctx.metrics.record_h2_error(*code);
            warn!(code = ?code, reason, "h2 connection error");
            let _ = self.send_goaway(*code).await;
            return Ok(());
        }
        Err(error)
    }

    async fn send_goaway(&mut self, code: H2ErrorCode) -> Result<(), H2Error> {
        if self.goaway_sent {
            return Ok(());
        }
        self.goaway_sent = true;
        frame::encode_goaway(self.streams.last_client_id, code, &mut self.write_buf);
        self.flush_io().await
    }

    async fn read_preface(&mut self) -> Result<bool, H2Error> {
        while self.read_buf.len() < PREFACE.len() {
            if self.io.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(false);
            }
        }
        let ok = self.read_buf[..PREFACE.len()] == *PREFACE;
        if ok {
            self.read_buf.advance(PREFACE.len());
        }
        Ok(ok)
    }

    async fn send_initial_settings(&mut self) -> Result<(), H2Error> {
        let h2 = &self.ctx.config.h2;
        frame::encode_settings(
            &[
                (settings::HEADER_TABLE_SIZE, h2.header_table_size),
                (settings::MAX_CONCURRENT_STREAMS, h2.max_concurrent_streams),
                (settings::INITIAL_WINDOW_SIZE, h2.initial_window_size),
                (settings::MAX_FRAME_SIZE, h2.max_frame_size),
                (settings::MAX_HEADER_LIST_SIZE, h2.max_header_list_size),
            ],
            &mut self.write_buf,
        );
        self.flush_io().await
    }

    /// Reads one complete frame head + payload off the wire.
    async fn read_frame(
        io: &mut S,
        buf: &mut BytesMut,
        local_max_frame: u32,
    ) -> Result<(FrameHead, Bytes), H2Error> {
        while buf.len() < FRAME_HEAD_LEN {
            if io.read_buf(buf).await? == 0 {
                return Err(H2Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
        let head = FrameHead::parse(&buf[..FRAME_HEAD_LEN]);

        if head.length > local_max_frame {
            return Err(H2Error::conn(
                H2ErrorCode::FrameSize,
                "frame exceeds local max frame size",
            ));
        }

        let total = FRAME_HEAD_LEN + head.length as usize;
        while buf.len() < total {
            if io.read_buf(buf).await? == 0 {
                return Err(H2Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }

        buf.advance(FRAME_HEAD_LEN);
        let payload = buf.split_to(head.length as usize).freeze();
        Ok((head, payload))
    }

    async fn handle_frame(&mut self, (head, payload): (FrameHead, Bytes)) -> Result<(), H2Error> {
        // A started header block admits nothing but its own CONTINUATION
        // frames (RFC 7540 §6.2).
        if let Some(id) = self.continuation {
            if head.kind != frame::kind::CONTINUATION || head.stream_id != id {
                return Err(H2Error::conn(
                    H2ErrorCode::Protocol,
                    "header block interrupted",
                ));
            }
        }

        let frame = frame::decode(head, payload)?;
        trace!(?frame, "h2 frame");

        if self.expect_settings {
            match frame {
                Frame::Settings { .. } => {}
                _ => {
                    return Err(H2Error::conn(
                        H2ErrorCode::Protocol,
                        "first frame must be SETTINGS",
                    ))
                }
            }
        }

        match frame {
            Frame::Settings { entries } => {
                self.expect_settings = false;
                self.apply_settings(&entries)?;
                frame::encode_settings_ack(&mut self.write_buf);
                self.flush_io().await?;
                self.flush_streams().await?;
            }
            Frame::SettingsAck => {}

            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                fragment,
            } => {
                self.begin_header_block(stream_id, end_stream, &fragment)?;
                if end_headers {
                    self.finish_header_block().await?;
                } else {
                    self.continuation = Some(stream_id);
                }
            }

            Frame::Continuation {
                stream_id: _,
                end_headers,
                fragment,
            } => {
                // Stream identity was verified against the open block above.
                if self.continuation.is_none() {
                    return Err(H2Error::conn(
                        H2ErrorCode::Protocol,
                        "CONTINUATION without HEADERS",
                    ));
                }
                self.append_header_fragment(&fragment)?;
                if end_headers {
                    self.continuation = None;
                    self.finish_header_block().await?;
                }
            }

            Frame::Data {
                stream_id,
                end_stream,
                payload,
                flow_len,
            } => {
                self.conn_recv_window -= flow_len as i64;
                if self.conn_recv_window < 0 {
                    return Err(H2Error::conn(
                        H2ErrorCode::FlowControl,
                        "connection receive window exhausted",
                    ));
                }
                self.conn_recv_unacked += flow_len;

                self.streams.recv_data(
                    stream_id,
                    flow_len,
                    end_stream,
                    &payload,
                    self.ctx.config.http1.max_body_bytes,
                )?;
                self.replenish_windows(stream_id).await?;

                if end_stream {
                    self.dispatch_request(stream_id).await?;
                }
            }

            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if stream_id == 0 {
                    self.conn_send_window += increment as i64;
                    if self.conn_send_window > MAX_WINDOW {
                        return Err(H2Error::conn(
                            H2ErrorCode::FlowControl,
                            "connection window overflow",
                        ));
                    }
                } else {
                    self.streams.recv_window_update(stream_id, increment)?;
                }
                self.flush_streams().await?;
            }

            Frame::Ping { ack, payload } => {
                if !ack {
                    frame::encode_ping(true, &payload, &mut self.write_buf);
                    self.flush_io().await?;
                }
            }

            Frame::RstStream { stream_id, code } => {
                trace!(stream = stream_id, code = ?code, "peer reset stream");
                self.streams.recv_rst(stream_id)?;
            }

            Frame::GoAway {
                last_stream_id,
                code,
            } => {
                debug!(last = last_stream_id, code = ?code, "peer sent GOAWAY");
                self.peer_goaway = true;
            }

            Frame::PushPromise { .. } => {
                return Err(H2Error::conn(
                    H2ErrorCode::Protocol,
                    "clients cannot push",
                ));
            }

            Frame::Priority { .. } | Frame::Unknown => {}
        }

        Ok(())
    }

    fn apply_settings(&mut self, entries: &[(u16, u32)]) -> Result<(), H2Error> {
        for &(id, value) in entries {
            match id {
                settings::HEADER_TABLE_SIZE => {
                    self.encoder.set_max_table_size(value as usize);
                }
                settings::ENABLE_PUSH => {
                    if value > 1 {
                        return Err(H2Error::conn(
                            H2ErrorCode::Protocol,
                            "ENABLE_PUSH must be 0 or 1",
                        ));
                    }
                }
                settings::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW as u32 {
                        return Err(H2Error::conn(
                            H2ErrorCode::FlowControl,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    self.streams.apply_initial_send_window(value)?;
                }
                settings::MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(H2Error::conn(
                            H2ErrorCode::Protocol,
                            "MAX_FRAME_SIZE out of range",
                        ));
                    }
                    self.remote_max_frame = value;
                }
                settings::MAX_CONCURRENT_STREAMS | settings::MAX_HEADER_LIST_SIZE => {}
                _ => {} // Unknown settings are ignored (RFC 7540 §6.5.2).
            }
        }
        Ok(())
    }

    // Header block assembly

    fn begin_header_block(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        fragment: &[u8],
    ) -> Result<(), H2Error> {
        self.hdr_accum.clear();
        self.hdr_stream = stream_id;
        self.hdr_refused = None;

        if self.goaway_sent || self.peer_goaway {
            // Draining: the block still has to feed the HPACK decoder to
            // keep table state in sync, but the stream is refused.
            self.hdr_refused = Some(H2ErrorCode::RefusedStream);
        } else {
            match self.streams.recv_headers(stream_id, end_stream) {
                Ok(_) => {}
                Err(H2Error::Stream(_, code)) => self.hdr_refused = Some(code),
                Err(e) => return Err(e),
            }
        }

        self.append_header_fragment(fragment)
    }

    fn append_header_fragment(&mut self, fragment: &[u8]) -> Result<(), H2Error> {
        if self.hdr_accum.len() + fragment.len() > MAX_HEADER_BLOCK {
            return Err(H2Error::conn(
                H2ErrorCode::Compression,
                "header block too large",
            ));
        }
        self.hdr_accum.extend_from_slice(fragment);
        Ok(())
    }

    async fn finish_header_block(&mut self) -> Result<(), H2Error> {
        let block = std::mem::take(&mut self.hdr_accum);
        let headers = self.decoder.decode(&block)?;
        let stream_id = self.hdr_stream;

        if let Some(code) = self.hdr_refused.take() {
            return Err(H2Error::stream(stream_id, code));
        }

        let dispatch = match self.streams.get_mut(stream_id) {
            Some(stream) => {
                // Trailers never replace the request headers.
                if stream.request_headers.is_empty() {
                    stream.request_headers = headers;
                }
                stream.state == StreamState::HalfClosedRemote
            }
            // Reset while the block was in flight.
            None => false,
        };

        if dispatch {
            self.dispatch_request(stream_id).await?;
        }
        Ok(())
    }

    // Request dispatch and response emission

    /// Runs the handler for a completed request. Guarded so a stream's
    /// handler runs exactly once.
    async fn dispatch_request(&mut self, stream_id: u32) -> Result<(), H2Error> {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        if stream.dispatched || stream.request_headers.is_empty() {
            return Ok(());
        }
        stream.dispatched = true;
        Metrics::incr(&self.ctx.metrics.h2_streams);

        let headers = std::mem::take(&mut stream.request_headers);
        let body = std::mem::take(&mut stream.body);

        if let Some(peer) = self.peer {
            if !self.ctx.limiter.try_acquire(peer).allowed {
                return Err(H2Error::stream(stream_id, H2ErrorCode::RefusedStream));
            }
        }

        let request = match build_request(headers, body, self.peer) {
            Ok(request) => request,
            Err(code) => return Err(H2Error::stream(stream_id, code)),
        };

        let mut response = Response::new();
        run_request(&*self.ctx, &*self.handler, &request, &mut response).await;

        self.send_response(stream_id, response).await
    }

    async fn send_response(&mut self, stream_id: u32, response: Response) -> Result<(), H2Error> {
        // Open file bodies before any header hits the wire so a failed open
        // can still turn into a clean 500.
        let mut response = response;
        let mut opened: Option<PendingFile> = None;
        let mut open_failed = false;
        if let Body::File { path, len } = &response.body {
            match tokio::fs::File::open(path).await {
                Ok(file) => {
                    opened = Some(PendingFile {
                        file,
                        remaining: *len,
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "file body open failed");
                    open_failed = true;
                }
            }
        }
        if open_failed {
            response.reset();
            response.status(crate::http::types::StatusCode::InternalServerError);
            response.empty();
        }

        let body_len = response.body.len();
        let end_stream = response.head_only || body_len == 0;

        // :status first, then the handler's headers, then framing metadata.
        let status = response.status.as_decimal().as_bytes();
        let length_value = body_len.to_string();
        let mut fields: Vec<(&[u8], &[u8], bool)> = Vec::with_capacity(8);
        fields.push((b":status", status, false));
        for (name, value) in response.header_pairs() {
            // Connection-specific headers never cross into HTTP/2 framing
            // (RFC 7540 §8.1.2.2).
            if name == b"connection" || name == b"transfer-encoding" || name == b"keep-alive" {
                continue;
            }
            let sensitive = name == b"set-cookie";
            fields.push((name, value, sensitive));
        }
        fields.push((b"content-length", length_value.as_bytes(), false));

        let mut block = Vec::new();
        self.encoder.encode(&fields, &mut block);
        frame::encode_headers_fragmented(
            stream_id,
            end_stream,
            &block,
            self.remote_max_frame as usize,
            &mut self.write_buf,
        );

        if end_stream {
            self.streams.close_local(stream_id);
            self.flush_io().await?;
            return Ok(());
        }

        if let Some(stream) = self.streams.get_mut(stream_id) {
            match response.body {
                Body::Bytes(bytes) => stream.pending.push_back(bytes),
                Body::File { .. } => stream.pending_file = opened,
                Body::Empty => {}
            }
            stream.pending_end_stream = true;
        }

        self.flush_io().await?;
        self.flush_streams().await
    }

    // Flow-controlled sending

    /// Drains queued response data round-robin across ready streams, within
    /// both the connection window and each stream's window. Stalled streams
    /// keep their data queued until WINDOW_UPDATE credit arrives.
    async fn flush_streams(&mut self) -> Result<(), H2Error> {
        loop {
            let mut ids = self.streams.ids();
            if ids.is_empty() {
                break;
            }
            ids.sort_unstable();
            if self.rr_cursor >= ids.len() {
                self.rr_cursor = 0;
            }
            ids.rotate_left(self.rr_cursor);
            self.rr_cursor = (self.rr_cursor + 1) % ids.len();

            let mut progressed = false;
            for id in ids {
                progressed |= self.flush_one(id).await?;
            }
            if !progressed {
                break;
            }
        }

        self.flush_io().await
    }

    /// Sends at most one DATA frame for `stream_id`. Returns whether any
    /// bytes (or a terminal empty frame) went out.
    async fn flush_one(&mut self, stream_id: u32) -> Result<bool, H2Error> {
        let max_frame = self.remote_max_frame as usize;
        let conn_window = self.conn_send_window;

        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(false);
        };
        if !stream.has_pending() {
            return Ok(false);
        }

        let allowance = conn_window.min(stream.send_window).min(max_frame as i64);
        let pending_len = stream.pending_len();

        // Terminal empty frame needs no window credit.
        if pending_len == 0 && stream.pending_end_stream {
            stream.pending_end_stream = false;
            frame::encode_data(stream_id, true, b"", &mut self.write_buf);
            self.streams.close_local(stream_id);
            return Ok(true);
        }

        if allowance <= 0 {
            return Ok(false);
        }
        let budget = (allowance as u64).min(pending_len) as usize;

        let chunk: Bytes = if let Some(front) = stream.pending.front_mut() {
            if front.len() > budget {
                front.split_to(budget)
            } else {
                stream.pending.pop_front().expect("front exists")
            }
        } else if let Some(tail) = stream.pending_file.as_mut() {
            let mut buf = self.ctx.pool.acquire();
            let want = budget.min(tail.remaining as usize).min(buf.len());
            let mut filled = 0;
            while filled < want {
                let n = tail
                    .file
                    .read(&mut buf[filled..want])
                    .await
                    .map_err(H2Error::Io)?;
                if n == 0 {
                    return Err(H2Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                filled += n;
            }
            tail.remaining -= want as u64;
            if tail.remaining == 0 {
                stream.pending_file = None;
            }
            Bytes::copy_from_slice(&buf[..want])
        } else {
            return Ok(false);
        };

        let last = stream.pending_len() == 0;
        let end_stream = last && stream.pending_end_stream;
        if end_stream {
            stream.pending_end_stream = false;
        }

        stream.send_window -= chunk.len() as i64;
        self.conn_send_window -= chunk.len() as i64;

        frame::encode_data(stream_id, end_stream, &chunk, &mut self.write_buf);
        if end_stream {
            self.streams.close_local(stream_id);
        }
        Ok(true)
    }

    /// Returns consumed receive credit once half a window has accumulated,
    /// at both connection and stream scope.
    async fn replenish_windows(&mut self, stream_id: u32) -> Result<(), H2Error> {
        if self.conn_recv_unacked as i64 >= DEFAULT_WINDOW / 2 {
            frame::encode_window_update(0, self.conn_recv_unacked, &mut self.write_buf);
            self.conn_recv_window += self.conn_recv_unacked as i64;
            self.conn_recv_unacked = 0;
        }

        let half_stream = (self.ctx.config.h2.initial_window_size / 2).max(1);
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.state == StreamState::Open && stream.recv_unacked >= half_stream {
                frame::encode_window_update(stream_id, stream.recv_unacked, &mut self.write_buf);
                stream.recv_window += stream.recv_unacked as i64;
                stream.recv_unacked = 0;
            }
        }

        self.flush_io().await
    }

    async fn flush_io(&mut self) -> Result<(), H2Error> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let result = tokio::select! {
            biased;

            result = async {
                self.io.write_all(&self.write_buf).await?;
                self.io.flush().await
            } => result.map_err(H2Error::Io),
            _ = sleep(self.ctx.config.write_timeout) => {
                Err(H2Error::Io(std::io::ErrorKind::TimedOut.into()))
            }
        };

        self.write_buf.clear();
        result
    }
}

/// Maps decoded pseudo-headers plus body into the shared request type.
fn build_request(
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body: Vec<u8>,
    peer: Option<IpAddr>,
) -> Result<Request, H2ErrorCode> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority: Option<Vec<u8>> = None;
    let mut map = HeaderMap::with_capacity(headers.len());
    let mut saw_regular = false;

    for (name, value) in &headers {
        match name.as_slice() {
            b":method" | b":path" | b":scheme" | b":authority" => {
                // Pseudo-headers after a regular field are malformed
                // (RFC 7540 §8.1.2.1).
                if saw_regular {
                    return Err(H2ErrorCode::Protocol);
                }
                match name.as_slice() {
                    b":method" => method = Some(value.clone()),
                    b":path" => path = Some(value.clone()),
                    b":scheme" => scheme = Some(value.clone()),
                    _ => authority = Some(value.clone()),
                }
            }
            name if name.starts_with(b":") => return Err(H2ErrorCode::Protocol),
            name => {
                saw_regular = true;
                map.append(name, value);
            }
        }
    }

    let method = Method::from_token(&method.ok_or(H2ErrorCode::Protocol)?)
        .map_err(|_| H2ErrorCode::Protocol)?;
    let url = Url::parse(&path.ok_or(H2ErrorCode::Protocol)?)
        .map_err(|_| H2ErrorCode::Protocol)?;
    if scheme.is_none() {
        return Err(H2ErrorCode::Protocol);
    }

    if let Some(authority) = authority {
        if map.get(b"host").is_none() {
            map.append(b"host", &authority);
        }
    }

    Ok(Request::new(method, url, Version::H2, map, body, peer))
}

#[cfg(test)]
mod h2_tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::handler::Handled;
    use crate::StatusCode;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct TestHandler;

    impl Handler for TestHandler {
        async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
            match req.url().path() {
                b"/" => resp.status(StatusCode::Ok).body("hello"),
                b"/big" => resp.status(StatusCode::Ok).body(vec![0x42u8; 200 * 1024]),
                b"/echo" => {
                    let body = req.body().to_vec();
                    resp.status(StatusCode::Ok).body(body)
                }
                _ => Handled::Unhandled,
            }
        }
    }

    fn spawn_server(config: ServerConfig) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let ctx = Arc::new(ServerContext::new(config).unwrap());
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            serve(
                server,
                BytesMut::new(),
                false,
                ctx,
                Arc::new(TestHandler),
                None,
                rx,
            )
            .await;
            // Keep the sender alive for the duration of the connection.
            drop(_tx);
        });
        (client, task)
    }

    async fn read_one_frame(client: &mut DuplexStream) -> (FrameHead, Vec<u8>) {
        use tokio::io::AsyncReadExt;

        let mut head = [0u8; FRAME_HEAD_LEN];
        client.read_exact(&mut head).await.unwrap();
        let head = FrameHead::parse(&head);
        let mut payload = vec![0u8; head.length as usize];
        client.read_exact(&mut payload).await.unwrap();
        (head, payload)
    }

    async fn handshake(client: &mut DuplexStream) {
        client.write_all(PREFACE).await.unwrap();
        let mut settings = Vec::new();
        frame::encode_settings(&[], &mut settings);
        client.write_all(&settings).await.unwrap();

        // Server SETTINGS (non-ack) followed by its ACK of ours.
        let (head, _) = read_one_frame(client).await;
        assert_eq!(head.kind, frame::kind::SETTINGS);
        assert_eq!(head.flags & frame::flags::ACK, 0);

        let (head, _) = read_one_frame(client).await;
        assert_eq!(head.kind, frame::kind::SETTINGS);
        assert_ne!(head.flags & frame::flags::ACK, 0);

        // Ack the server's settings.
        let mut ack = Vec::new();
        frame::encode_settings_ack(&mut ack);
        client.write_all(&ack).await.unwrap();
    }

    /// Indexed GET / with static-table fields; `:authority` as a literal.
    fn simple_get_block(path_index_or_literal: Option<&[u8]>) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new(4096);
        let path: &[u8] = path_index_or_literal.unwrap_or(b"/");
        let mut block = Vec::new();
        encoder.encode(
            &[
                (b":method", b"GET", false),
                (b":scheme", b"http", false),
                (b":path", path, false),
                (b":authority", b"localhost", false),
            ],
            &mut block,
        );
        block
    }

    #[tokio::test]
    async fn preface_and_settings_exchange() {
        let (mut client, _task) = spawn_server(ServerConfig::default());
        handshake(&mut client).await;

        // Connection stays open: a PING comes back as PING ACK.
        let mut ping = Vec::new();
        frame::encode_ping(false, b"01234567", &mut ping);
        client.write_all(&ping).await.unwrap();

        let (head, payload) = read_one_frame(&mut client).await;
        assert_eq!(head.kind, frame::kind::PING);
        assert_ne!(head.flags & frame::flags::ACK, 0);
        assert_eq!(&payload[..], b"01234567");
    }

    #[tokio::test]
    async fn get_request_yields_headers_and_data() {
        let (mut client, _task) = spawn_server(ServerConfig::default());
        handshake(&mut client).await;

        let block = simple_get_block(None);
        let mut wire = Vec::new();
        frame::encode_headers(1, true, &block, &mut wire);
        client.write_all(&wire).await.unwrap();

        let (head, payload) = read_one_frame(&mut client).await;
        assert_eq!(head.kind, frame::kind::HEADERS);
        assert_eq!(head.stream_id, 1);
        let mut decoder = hpack::Decoder::new(4096, 8 * 1024);
        let headers = decoder.decode(&payload).unwrap();
        assert_eq!(headers[0], (b":status".to_vec(), b"200".to_vec()));

        let (head, payload) = read_one_frame(&mut client).await;
        assert_eq!(head.kind, frame::kind::DATA);
        assert_ne!(head.flags & frame::flags::END_STREAM, 0);
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn flow_control_stall_and_resume() {
        let (mut client, _task) = spawn_server(ServerConfig::default());
        handshake(&mut client).await;

        let block = simple_get_block(Some(b"/big"));
        let mut wire = Vec::new();
        frame::encode_headers(3, true, &block, &mut wire);
        client.write_all(&wire).await.unwrap();

        // Response headers.
        let (head, _) = read_one_frame(&mut client).await;
        assert_eq!(head.kind, frame::kind::HEADERS);

        // Exactly the 65535-byte initial window arrives, then the stream
        // stalls.
        let mut received = 0u64;
        while received < 65_535 {
            let (head, payload) = read_one_frame(&mut client).await;
            assert_eq!(head.kind, frame::kind::DATA);
            assert_eq!(head.flags & frame::flags::END_STREAM, 0);
            received += payload.len() as u64;
        }
        assert_eq!(received, 65_535);

        // Grant the rest on both the stream and the connection.
        let remaining = 200 * 1024 - 65_535;
        let mut wire = Vec::new();
        frame::encode_window_update(3, remaining, &mut wire);
        frame::encode_window_update(0, remaining, &mut wire);
        client.write_all(&wire).await.unwrap();

        let mut end_seen = false;
        while !end_seen {
            let (head, payload) = read_one_frame(&mut client).await;
            assert_eq!(head.kind, frame::kind::DATA);
            received += payload.len() as u64;
            end_seen = head.flags & frame::flags::END_STREAM != 0;
        }
        assert_eq!(received, 200 * 1024);
    }

    #[tokio::test]
    async fn request_body_echoed() {
        let (mut client, _task) = spawn_server(ServerConfig::default());
        handshake(&mut client).await;

        let mut encoder = hpack::Encoder::new(4096);
        let mut block = Vec::new();
        encoder.encode(
            &[
                (b":method", b"POST", false),
                (b":scheme", b"http", false),
                (b":path", b"/echo", false),
                (b":authority", b"localhost", false),
            ],
            &mut block,
        );

        let mut wire = Vec::new();
        frame::encode_headers(1, false, &block, &mut wire);
        frame::encode_data(1, false, b"ping ", &mut wire);
        frame::encode_data(1, true, b"pong", &mut wire);
        client.write_all(&wire).await.unwrap();

        let (head, _) = read_one_frame(&mut client).await;
        assert_eq!(head.kind, frame::kind::HEADERS);
        let (_, payload) = read_one_frame(&mut client).await;
        assert_eq!(&payload[..], b"ping pong");
    }

    #[tokio::test]
    async fn hpack_bomb_closes_with_compression_error() {
        let (mut client, _task) = spawn_server(ServerConfig::default());
        handshake(&mut client).await;

        // Literal-with-indexing fields that decode far past the 8 KiB
        // header-list bound.
        let mut encoder = hpack::Encoder::new(1 << 20);
        let big = vec![b'z'; 4096];
        let mut block = Vec::new();
        encoder.encode(
            &[
                (b"x-bomb-1", &big, false),
                (b"x-bomb-2", &big, false),
                (b"x-bomb-3", &big, false),
            ],
            &mut block,
        );

        let mut wire = Vec::new();
        frame::encode_headers(1, true, &block, &mut wire);
        client.write_all(&wire).await.unwrap();

        // GOAWAY carrying COMPRESSION_ERROR.
        loop {
            let (head, payload) = read_one_frame(&mut client).await;
            if head.kind == frame::kind::GOAWAY {
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                assert_eq!(code, H2ErrorCode::Compression as u32);
                break;
            }
        }
    }

    #[tokio::test]
    async fn first_frame_must_be_settings() {
        let (mut client, _task) = spawn_server(ServerConfig::default());
        client.write_all(PREFACE).await.unwrap();

        let mut wire = Vec::new();
        frame::encode_ping(false, b"xxxxxxxx", &mut wire);
        client.write_all(&wire).await.unwrap();

        // Server SETTINGS first, then GOAWAY(PROTOCOL_ERROR).
        loop {
            let (head, payload) = read_one_frame(&mut client).await;
            if head.kind == frame::kind::GOAWAY {
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                assert_eq!(code, H2ErrorCode::Protocol as u32);
                break;
            }
        }
    }
}
