//! HTTP/1.1 connection handling: keep-alive request loop, bounded head
//! reads, body framing, and upgrade hand-off to HTTP/2 (h2c preface) and
//! WebSocket.

use crate::{
    errors::ErrorKind,
    h2::{self, frame::PREFACE},
    http::{
        request::{parse_head, Request},
        response::{Body, Response},
        types::{StatusCode, Version},
    },
    metrics::Metrics,
    server::{
        context::ServerContext,
        handler::{run_request, Handler, WsHandler},
    },
    ws,
};
use bytes::{Buf, BytesMut};
use memchr::memmem;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Byte stream a connection runs over, with an optional kernel descriptor
/// for the zero-copy path. TLS streams have no usable descriptor; they take
/// the buffered path transparently.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    fn as_tcp(&mut self) -> Option<&mut TcpStream> {
        None
    }
}

impl Transport for TcpStream {
    fn as_tcp(&mut self) -> Option<&mut TcpStream> {
        Some(self)
    }
}

impl Transport for tokio_rustls::server::TlsStream<TcpStream> {}

#[cfg(test)]
impl Transport for tokio::io::DuplexStream {}

enum HeadOutcome {
    Head(BytesMut),
    H2Preface,
    Eof,
}

/// Drives one plaintext or TLS-terminated connection in HTTP/1.1 framing
/// until it closes or upgrades.
pub(crate) async fn serve<S, H, W>(
    mut io: S,
    ctx: Arc<ServerContext>,
    handler: Arc<H>,
    ws_handler: Arc<W>,
    peer: Option<IpAddr>,
    shutdown: watch::Receiver<bool>,
) where
    S: Transport,
    H: Handler,
    W: WsHandler,
{
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut served: usize = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let head = match read_head(&mut io, &mut read_buf, &ctx).await {
            Ok(HeadOutcome::Head(head)) => head,
            Ok(HeadOutcome::H2Preface) => {
                trace!("cleartext h2 preface, handing off");
                h2::connection::serve(io, read_buf, true, ctx, handler, peer, shutdown).await;
                return;
            }
            Ok(HeadOutcome::Eof) => break,
            Err(kind) => {
                fail_request(&mut io, &ctx, kind).await;
                break;
            }
        };

        let parsed = match parse_head(&head, &ctx.config.http1) {
            Ok(parsed) => parsed,
            Err(kind) => {
                fail_request(&mut io, &ctx, kind).await;
                break;
            }
        };

        if let Some(peer) = peer {
            let decision = ctx.limiter.try_acquire(peer);
            if !decision.allowed {
                let mut resp = Response::new();
                resp.status(StatusCode::TooManyRequests)
                    .header("retry-after", decision.retry_after_secs().to_string())
                    .close()
                    .empty();
                let _ = write_response(&mut io, &ctx, &resp, parsed.version).await;
                break;
            }
        }

        if ws::handshake::is_upgrade(&parsed) {
            match ws::handshake::validate(&parsed) {
                Ok(accept) => {
                    let bytes = ws::handshake::response_bytes(&accept);
                    if write_all_timeout(&mut io, &bytes, ctx.config.write_timeout)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    ws::connection::serve(io, read_buf, ctx, ws_handler, shutdown).await;
                    return;
                }
                Err(kind) => {
                    fail_request(&mut io, &ctx, kind).await;
                    break;
                }
            }
        }

        // Body, by content-length or chunked framing.
        let body = if parsed.chunked {
            match read_chunked(&mut io, &mut read_buf, &ctx).await {
                Ok(body) => body,
                Err(kind) => {
                    fail_request(&mut io, &ctx, kind).await;
                    break;
                }
            }
        } else {
            match parsed.content_length {
                Some(len) => match read_exact_body(&mut io, &mut read_buf, len, &ctx).await {
                    Ok(body) => body,
                    Err(kind) => {
                        fail_request(&mut io, &ctx, kind).await;
                        break;
                    }
                },
                None => Vec::new(),
            }
        };

        let version = parsed.version;
        let keep_alive = parsed.keep_alive;
        let head_only = parsed.method == crate::http::types::Method::Head;

        let request = Request::new(
            parsed.method,
            parsed.url,
            parsed.version,
            parsed.headers,
            body,
            peer,
        );

        let mut response = Response::new();
        run_request(&*ctx, &*handler, &request, &mut response).await;
        if head_only {
            response.head_only = true;
        }

        served += 1;
        response.keep_alive = keep_alive
            && served < ctx.config.http1.max_requests_per_connection
            && !*shutdown.borrow();

        let closing = !response.keep_alive;
        if write_response(&mut io, &ctx, &response, version).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}

/// Answers a malformed request with its canned response and gives up on the
/// connection.
async fn fail_request<S: Transport>(io: &mut S, ctx: &ServerContext, kind: ErrorKind) {
    if let ErrorKind::Io(_) = kind {
        return;
    }
    Metrics::incr(&ctx.metrics.h1_protocol_errors);
    debug!(error = %kind, "rejecting http/1.1 request");
    let _ = write_all_timeout(io, kind.as_http(), ctx.config.write_timeout).await;
}

/// Reads until the blank line ending a request head, or detects the
/// cleartext HTTP/2 preface. Bounded by the configured head size (431 on
/// overflow) and the idle timeout.
async fn read_head<S: Transport>(
    io: &mut S,
    buf: &mut BytesMut,
    ctx: &ServerContext,
) -> Result<HeadOutcome, ErrorKind> {
    let max = ctx.config.http1.max_header_bytes;
    let finder = memmem::Finder::new(b"\r\n\r\n");

    loop {
        if buf.starts_with(PREFACE) {
            buf.advance(PREFACE.len());
            return Ok(HeadOutcome::H2Preface);
        }

        // Don't mistake a half-received preface for a bad request.
        let maybe_preface = PREFACE.starts_with(&buf[..buf.len().min(PREFACE.len())]);
        if !maybe_preface {
            if let Some(at) = finder.find(buf) {
                return Ok(HeadOutcome::Head(buf.split_to(at + 4)));
            }
            // Lenient framing: bare-LF heads are accepted too.
            if let Some(at) = memmem::find(buf, b"\n\n") {
                return Ok(HeadOutcome::Head(buf.split_to(at + 2)));
            }
        }

        if buf.len() > max {
            return Err(ErrorKind::HeadersTooLarge);
        }

        let n = read_more(io, buf, ctx.config.idle_timeout).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(HeadOutcome::Eof)
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
            };
        }
    }
}

async fn read_exact_body<S: Transport>(
    io: &mut S,
    buf: &mut BytesMut,
    len: usize,
    ctx: &ServerContext,
) -> Result<Vec<u8>, ErrorKind> {
    while buf.len() < len {
        if read_more(io, buf, ctx.config.idle_timeout).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
    Ok(buf.split_to(len).to_vec())
}

/// Decodes a chunked request body (RFC 7230 §4.1), bounded by the body
/// limit. Trailers are read and dropped.
async fn read_chunked<S: Transport>(
    io: &mut S,
    buf: &mut BytesMut,
    ctx: &ServerContext,
) -> Result<Vec<u8>, ErrorKind> {
    let max = ctx.config.http1.max_body_bytes;
    let mut body = Vec::new();

    loop {
        let line = read_line(io, buf, ctx).await?;
        let size_part = line
            .split(|&b| b == b';')
            .next()
            .ok_or(ErrorKind::InvalidChunk)?;
        let size = parse_hex(size_part).ok_or(ErrorKind::InvalidChunk)?;

        if size == 0 {
            // Trailer section: lines until the blank one.
            loop {
                let trailer = read_line(io, buf, ctx).await?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len() + size > max {
            return Err(ErrorKind::BodyTooLarge);
        }

        let chunk = read_exact_body(io, buf, size, ctx).await?;
        body.extend_from_slice(&chunk);

        // Chunk data ends with its own CRLF.
        let terminator = read_line(io, buf, ctx).await?;
        if !terminator.is_empty() {
            return Err(ErrorKind::InvalidChunk);
        }
    }
}

async fn read_line<S: Transport>(
    io: &mut S,
    buf: &mut BytesMut,
    ctx: &ServerContext,
) -> Result<Vec<u8>, ErrorKind> {
    loop {
        if let Some(at) = memchr::memchr(b'\n', buf) {
            let mut line = buf.split_to(at + 1).to_vec();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        if buf.len() > ctx.config.http1.max_header_bytes {
            return Err(ErrorKind::InvalidChunk);
        }
        if read_more(io, buf, ctx.config.idle_timeout).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut value = 0usize;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | digit as usize;
    }
    Some(value)
}

async fn read_more<S: Transport>(
    io: &mut S,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<usize, ErrorKind> {
    tokio::select! {
        biased;

        result = io.read_buf(buf) => Ok(result?),
        _ = sleep(timeout) => {
            Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into())
        }
    }
}

async fn write_all_timeout<S: Transport>(
    io: &mut S,
    bytes: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::select! {
        biased;

        result = async {
            io.write_all(bytes).await?;
            io.flush().await
        } => result,
        _ = sleep(timeout) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Serializes head and body. File bodies take the sendfile fast path when
/// the transport exposes a descriptor and the file is big enough, otherwise
/// a pooled buffered copy.
async fn write_response<S: Transport>(
    io: &mut S,
    ctx: &ServerContext,
    response: &Response,
    version: Version,
) -> std::io::Result<()> {
    let mut head = Vec::with_capacity(256);
    response.encode_h1_head(version, &mut head);
    write_all_timeout(io, &head, ctx.config.write_timeout).await?;

    if response.head_only {
        return Ok(());
    }

    match &response.body {
        Body::Empty => Ok(()),
        Body::Bytes(bytes) => write_all_timeout(io, bytes, ctx.config.write_timeout).await,
        Body::File { path, len } => {
            let mut file = tokio::fs::File::open(path).await?;
            let written = match io.as_tcp() {
                Some(tcp) if ctx.zero_copy.qualifies(*len) => {
                    ctx.zero_copy.transfer(&mut file, *len, tcp).await?
                }
                _ => ctx.zero_copy.copy_buffered(&mut file, *len, io).await?,
            };
            debug_assert_eq!(written, *len);
            io.flush().await
        }
    }
}
