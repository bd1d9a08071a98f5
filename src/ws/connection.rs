//! WebSocket connection lifecycle: message assembly, control frames, close
//! protocol and optional keepalive pings (RFC 6455).

use crate::{
    errors::{ws_close, WsError},
    metrics::Metrics,
    server::{context::ServerContext, handler::{WsHandler, WsMessage}},
    ws::frame::{self, OpCode, WsFrame},
};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Drives one upgraded connection until close. `leftover` carries bytes the
/// HTTP/1.1 layer read past the handshake.
pub(crate) async fn serve<S, W>(
    io: S,
    leftover: BytesMut,
    ctx: Arc<ServerContext>,
    handler: Arc<W>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    W: WsHandler,
{
    Metrics::incr(&ctx.metrics.ws_connections);
    let mut conn = WsConnection {
        io,
        read_buf: leftover,
        ctx: ctx.clone(),
        handler,
        shutdown,
        assembling: None,
        awaiting_pong: false,
    };

    match conn.run().await {
        Ok(()) => {}
        Err(WsError::Fail(code, reason)) => {
            Metrics::incr(&ctx.metrics.ws_protocol_errors);
            debug!(code, reason, "failing websocket connection");
            let _ = conn.close_with(code, reason.as_bytes()).await;
        }
        Err(WsError::Io(e)) => debug!(error = %e, "websocket transport error"),
    }
    Metrics::decr(&ctx.metrics.ws_connections);
}

struct WsConnection<S, W> {
    io: S,
    read_buf: BytesMut,
    ctx: Arc<ServerContext>,
    handler: Arc<W>,
    shutdown: watch::Receiver<bool>,

    /// Fragmented message being assembled: `(opcode, payload so far)`.
    assembling: Option<(OpCode, Vec<u8>)>,
    awaiting_pong: bool,
}

impl<S, W> WsConnection<S, W>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    W: WsHandler,
{
    async fn run(&mut self) -> Result<(), WsError> {
        loop {
            let frame = tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    return self.initiate_close(ws_close::GOING_AWAY, b"server shutdown").await;
                }
                result = Self::read_frame(
                    &mut self.io,
                    &mut self.read_buf,
                    self.ctx.config.ws.max_message_size,
                ) => result?,
                _ = keepalive(self.ctx.config.ws.ping_interval) => {
                    if self.awaiting_pong {
                        debug!("websocket keepalive timed out");
                        return self.initiate_close(ws_close::GOING_AWAY, b"ping timeout").await;
                    }
                    self.awaiting_pong = true;
                    self.write_frame(&WsFrame::new(true, OpCode::Ping, Vec::new())).await?;
                    continue;
                }
                _ = sleep(self.ctx.config.idle_timeout) => {
                    debug!("websocket idle timeout");
                    return self.initiate_close(ws_close::NORMAL, b"idle").await;
                }
            };

            // Client-to-server frames MUST be masked (RFC 6455 §5.1).
            if !frame.masked {
                return Err(WsError::fail(
                    ws_close::PROTOCOL_ERROR,
                    "client frame not masked",
                ));
            }
            trace!(opcode = ?frame.opcode, len = frame.payload.len(), fin = frame.fin, "ws frame");

            match frame.opcode {
                OpCode::Ping => {
                    self.write_frame(&WsFrame::new(true, OpCode::Pong, frame.payload))
                        .await?;
                }
                OpCode::Pong => {
                    self.awaiting_pong = false;
                }
                OpCode::Close => {
                    // Echo the peer's code, or 1000 when absent, then close.
                    let code = match frame.payload.len() {
                        0 => ws_close::NORMAL,
                        1 => {
                            return Err(WsError::fail(
                                ws_close::PROTOCOL_ERROR,
                                "close payload of one byte",
                            ))
                        }
                        _ => u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
                    };
                    self.close_with(code, b"").await?;
                    return Ok(());
                }
                OpCode::Text | OpCode::Binary => {
                    if self.assembling.is_some() {
                        return Err(WsError::fail(
                            ws_close::PROTOCOL_ERROR,
                            "data frame inside fragmented message",
                        ));
                    }
                    if frame.fin {
                        self.deliver(frame.opcode, frame.payload).await?;
                    } else {
                        self.assembling = Some((frame.opcode, frame.payload));
                    }
                }
                OpCode::Continuation => {
                    let Some((opcode, mut payload)) = self.assembling.take() else {
                        return Err(WsError::fail(
                            ws_close::PROTOCOL_ERROR,
                            "continuation without a message",
                        ));
                    };
                    if payload.len() + frame.payload.len() > self.ctx.config.ws.max_message_size {
                        return Err(WsError::fail(
                            ws_close::MESSAGE_TOO_BIG,
                            "fragmented message too large",
                        ));
                    }
                    payload.extend_from_slice(&frame.payload);

                    if frame.fin {
                        self.deliver(opcode, payload).await?;
                    } else {
                        self.assembling = Some((opcode, payload));
                    }
                }
            }
        }
    }

    /// Hands one complete message to the application and sends any reply.
    async fn deliver(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), WsError> {
        let message = match opcode {
            OpCode::Text => {
                if simdutf8::basic::from_utf8(&payload).is_err() {
                    return Err(WsError::fail(
                        ws_close::INVALID_PAYLOAD,
                        "text message is not valid utf-8",
                    ));
                }
                // Validated above; the unchecked conversion skips a second pass.
                WsMessage::Text(unsafe { String::from_utf8_unchecked(payload) })
            }
            _ => WsMessage::Binary(payload),
        };

        if let Some(reply) = self.handler.on_message(message).await {
            let frame = match reply {
                WsMessage::Text(text) => WsFrame::new(true, OpCode::Text, text.into_bytes()),
                WsMessage::Binary(bytes) => WsFrame::new(true, OpCode::Binary, bytes),
            };
            self.write_frame(&frame).await?;
        }
        Ok(())
    }

    async fn read_frame(
        io: &mut S,
        buf: &mut BytesMut,
        max_payload: usize,
    ) -> Result<WsFrame, WsError> {
        loop {
            if let Some(frame) = frame::parse(buf, max_payload)? {
                return Ok(frame);
            }
            if io.read_buf(buf).await? == 0 {
                return Err(WsError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    async fn write_frame(&mut self, frame: &WsFrame) -> Result<(), WsError> {
        let mut wire = Vec::with_capacity(frame.payload.len() + 14);
        frame::encode(frame, None, &mut wire);

        tokio::select! {
            biased;

            result = async {
                self.io.write_all(&wire).await?;
                self.io.flush().await
            } => result.map_err(WsError::Io),
            _ = sleep(self.ctx.config.write_timeout) => {
                Err(WsError::Io(std::io::ErrorKind::TimedOut.into()))
            }
        }
    }

    /// Sends CLOSE and drops the transport. Used both for echoing a peer's
    /// CLOSE and for failing the connection.
    async fn close_with(&mut self, code: u16, reason: &[u8]) -> Result<(), WsError> {
        self.write_frame(&WsFrame::close(code, reason)).await
    }

    /// Server-initiated close: send CLOSE, then wait for the peer's echo up
    /// to the configured timeout before force-closing.
    async fn initiate_close(&mut self, code: u16, reason: &[u8]) -> Result<(), WsError> {
        self.close_with(code, reason).await?;

        let deadline = sleep(self.ctx.config.ws.close_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    debug!("close reply timed out, force-closing");
                    return Ok(());
                }
                result = Self::read_frame(
                    &mut self.io,
                    &mut self.read_buf,
                    self.ctx.config.ws.max_message_size,
                ) => {
                    match result {
                        Ok(frame) if frame.opcode == OpCode::Close => return Ok(()),
                        Ok(_) => continue, // drain in-flight frames
                        Err(_) => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Pending keepalive tick, or forever-pending when disabled.
async fn keepalive(interval: Option<std::time::Duration>) {
    match interval {
        Some(interval) => sleep(interval).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod ws_conn_tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::handler::EchoWs;
    use tokio::io::DuplexStream;

    fn spawn_ws(config: ServerConfig) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let ctx = Arc::new(ServerContext::new(config).unwrap());
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            serve(server, BytesMut::new(), ctx, Arc::new(EchoWs), rx).await;
            drop(tx);
        });
        (client, task)
    }

    async fn send_masked(client: &mut DuplexStream, frame: &WsFrame) {
        let mut wire = Vec::new();
        frame::encode(frame, Some([0x11, 0x22, 0x33, 0x44]), &mut wire);
        client.write_all(&wire).await.unwrap();
    }

    async fn read_reply(client: &mut DuplexStream) -> WsFrame {
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = frame::parse(&mut buf, 64 << 20).unwrap() {
                return frame;
            }
            client.read_buf(&mut buf).await.unwrap();
        }
    }

    #[tokio::test]
    async fn echoes_text_unmasked() {
        let (mut client, _task) = spawn_ws(ServerConfig::default());

        send_masked(&mut client, &WsFrame::new(true, OpCode::Text, b"hello".to_vec())).await;

        let reply = read_reply(&mut client).await;
        assert!(reply.fin);
        assert_eq!(reply.opcode, OpCode::Text);
        assert!(!reply.masked);
        assert_eq!(reply.payload, b"hello");
    }

    #[tokio::test]
    async fn assembles_fragmented_message() {
        let (mut client, _task) = spawn_ws(ServerConfig::default());

        send_masked(&mut client, &WsFrame::new(false, OpCode::Text, b"hel".to_vec())).await;
        send_masked(
            &mut client,
            &WsFrame::new(false, OpCode::Continuation, b"lo ".to_vec()),
        )
        .await;
        send_masked(
            &mut client,
            &WsFrame::new(true, OpCode::Continuation, b"world".to_vec()),
        )
        .await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.payload, b"hello world");
    }

    #[tokio::test]
    async fn control_frames_interleave_fragments() {
        let (mut client, _task) = spawn_ws(ServerConfig::default());

        send_masked(&mut client, &WsFrame::new(false, OpCode::Text, b"ab".to_vec())).await;
        send_masked(&mut client, &WsFrame::new(true, OpCode::Ping, b"mark".to_vec())).await;

        // Pong arrives while the message is still open.
        let pong = read_reply(&mut client).await;
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload, b"mark");

        send_masked(
            &mut client,
            &WsFrame::new(true, OpCode::Continuation, b"cd".to_vec()),
        )
        .await;
        let reply = read_reply(&mut client).await;
        assert_eq!(reply.payload, b"abcd");
    }

    #[tokio::test]
    async fn unmasked_client_frame_fails_1002() {
        let (mut client, _task) = spawn_ws(ServerConfig::default());

        let mut wire = Vec::new();
        frame::encode(&WsFrame::new(true, OpCode::Text, b"bare".to_vec()), None, &mut wire);
        client.write_all(&wire).await.unwrap();

        let close = read_reply(&mut client).await;
        assert_eq!(close.opcode, OpCode::Close);
        let code = u16::from_be_bytes([close.payload[0], close.payload[1]]);
        assert_eq!(code, ws_close::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn invalid_utf8_fails_1007() {
        let (mut client, _task) = spawn_ws(ServerConfig::default());

        send_masked(
            &mut client,
            &WsFrame::new(true, OpCode::Text, vec![0xff, 0xfe, 0xfd]),
        )
        .await;

        let close = read_reply(&mut client).await;
        assert_eq!(close.opcode, OpCode::Close);
        let code = u16::from_be_bytes([close.payload[0], close.payload[1]]);
        assert_eq!(code, ws_close::INVALID_PAYLOAD);
    }

    #[tokio::test]
    async fn oversized_message_fails_1009() {
        let mut config = ServerConfig::default();
        config.ws.max_message_size = 64;
        let (mut client, _task) = spawn_ws(config);

        send_masked(
            &mut client,
            &WsFrame::new(true, OpCode::Binary, vec![0; 65]),
        )
        .await;

        let close = read_reply(&mut client).await;
        let code = u16::from_be_bytes([close.payload[0], close.payload[1]]);
        assert_eq!(code, ws_close::MESSAGE_TOO_BIG);
    }

    #[tokio::test]
    async fn close_echoes_peer_code() {
        let (mut client, _task) = spawn_ws(ServerConfig::default());

        send_masked(&mut client, &WsFrame::close(1000, b"bye")).await;

        let close = read_reply(&mut client).await;
        assert_eq!(close.opcode, OpCode::Close);
        let code = u16::from_be_bytes([close.payload[0], close.payload[1]]);
        assert_eq!(code, 1000);
    }
}
