//! Accept loop and protocol dispatch: one task per connection, ALPN fan-out
//! under TLS, a live-connection ceiling, and graceful drain on shutdown.

use crate::{
    config::ServerConfig,
    errors::ConfigError,
    h2,
    metrics::Metrics,
    server::{
        context::ServerContext,
        handler::{EchoWs, Handler, WsHandler},
        http1, tls,
    },
};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// The server: owns the shared infrastructure and the accept loop.
///
/// # Examples
///
/// ```no_run
/// use trident_web::Server;
/// use trident_web::config::ServerConfig;
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .config(ServerConfig::from_env().expect("invalid environment"))
///         .build()
///         .expect("invalid configuration")
///         .launch()
///         .await;
/// }
/// ```
pub struct Server<H = (), W = EchoWs> {
    ctx: Arc<ServerContext>,
    handler: Arc<H>,
    ws_handler: Arc<W>,
    tls: Option<TlsAcceptor>,
    listener: Option<TcpListener>,

    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

impl Server {
    /// Creates a builder. Without a handler the server serves the static
    /// file tree only; without WebSocket handler upgrades echo.
    pub fn builder() -> ServerBuilder<(), EchoWs> {
        ServerBuilder {
            config: None,
            listener: None,
            handler: (),
            ws_handler: EchoWs,
        }
    }
}

impl<H: Handler, W: WsHandler> Server<H, W> {
    /// Runs the accept loop until the shutdown handle fires, then drains.
    pub async fn launch(self) {
        let signal = std::future::pending();
        self.launch_until(signal).await;
    }

    /// Runs the accept loop until `signal` resolves (or the shutdown handle
    /// fires), then stops accepting, tells every connection to wind down,
    /// and waits out the drain period before returning.
    pub async fn launch_until(mut self, signal: impl std::future::Future<Output = ()>) {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let addr = SocketAddr::new(self.ctx.config.address, self.ctx.config.port);
                match bind_listener(addr) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(%addr, error = %e, "cannot bind listener");
                        return;
                    }
                }
            }
        };
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, tls = self.tls.is_some(), "listening");
        }

        let mut external = self.shutdown_rx.clone();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;

                _ = &mut signal => break,
                _ = external.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            // Transient accept failures never stop the loop.
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.dispatch(stream, peer);
                }
            }
        }

        drop(listener);
        info!("shutting down, draining connections");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.ctx.config.drain_timeout;
        while self.live.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.live.load(Ordering::Acquire),
                    "drain period elapsed, force-closing"
                );
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Handle that makes `launch` return and drain from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Live metrics counters, for exporters.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    /// Spawns the per-connection task, or drops the socket outright when
    /// the connection ceiling is reached. Rate limiting remains the primary
    /// admission defense; the ceiling is the crude backstop.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        if self.live.load(Ordering::Acquire) >= self.ctx.config.max_connections {
            debug!(%peer, "connection ceiling reached, dropping");
            drop(stream);
            return;
        }

        let ctx = self.ctx.clone();
        let handler = self.handler.clone();
        let ws_handler = self.ws_handler.clone();
        let tls = self.tls.clone();
        let shutdown = self.shutdown_rx.clone();
        let live = self.live.clone();
        live.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let _guard = LiveGuard(live);
            let _ = stream.set_nodelay(true);
            debug!(%peer, "connection open");

            match tls {
                Some(acceptor) => {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!(%peer, error = %e, "tls handshake failed");
                            return;
                        }
                    };

                    let is_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(tls::ALPN_H2);
                    if is_h2 {
                        h2::connection::serve(
                            tls_stream,
                            BytesMut::new(),
                            false,
                            ctx,
                            handler,
                            Some(peer.ip()),
                            shutdown,
                        )
                        .await;
                    } else {
                        http1::serve(tls_stream, ctx, handler, ws_handler, Some(peer.ip()), shutdown)
                            .await;
                    }
                }
                None => {
                    http1::serve(stream, ctx, handler, ws_handler, Some(peer.ip()), shutdown).await;
                }
            }
            debug!(%peer, "connection closed");
        });
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fires the shutdown signal watched by the accept loop and every
/// connection task.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Builder for [`Server`] instances.
///
/// # Examples
///
/// ```no_run
/// use trident_web::{Server, Handler, Handled, Request, Response, StatusCode};
/// use trident_web::config::ServerConfig;
///
/// struct Api;
///
/// impl Handler for Api {
///     async fn handle(&self, _req: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("ok")
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let server = Server::builder()
///     .config(ServerConfig::default())
///     .handler(Api)
///     .build()
///     .unwrap();
/// # }
/// ```
pub struct ServerBuilder<H, W> {
    config: Option<ServerConfig>,
    listener: Option<TcpListener>,
    handler: H,
    ws_handler: W,
}

impl<H: Handler, W: WsHandler> ServerBuilder<H, W> {
    /// Sets the configuration container. Defaults to
    /// [`ServerConfig::default`].
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses an already-bound listener instead of binding
    /// `config.address:config.port`.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler.
    pub fn handler<NewH: Handler>(self, handler: NewH) -> ServerBuilder<NewH, W> {
        ServerBuilder {
            config: self.config,
            listener: self.listener,
            handler,
            ws_handler: self.ws_handler,
        }
    }

    /// Sets the WebSocket message handler (default: echo).
    pub fn ws_handler<NewW: WsHandler>(self, ws_handler: NewW) -> ServerBuilder<H, NewW> {
        ServerBuilder {
            config: self.config,
            listener: self.listener,
            handler: self.handler,
            ws_handler,
        }
    }

    /// Validates the configuration, loads TLS material, and builds the
    /// server. All failures happen here, before any socket is bound.
    pub fn build(self) -> Result<Server<H, W>, ConfigError> {
        let config = self.config.unwrap_or_default();
        let tls = match &config.tls {
            Some(limits) => Some(tls::build_acceptor(limits)?),
            None => None,
        };
        let ctx = Arc::new(ServerContext::new(config)?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Server {
            ctx,
            handler: Arc::new(self.handler),
            ws_handler: Arc::new(self.ws_handler),
            tls,
            listener: self.listener,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[cfg(test)]
mod acceptor_tests {
    use super::*;
    use crate::server::handler::Handled;
    use crate::{Request, Response, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Api;

    impl Handler for Api {
        async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
            match req.url().path() {
                b"/ok" => resp.status(StatusCode::Ok).body("served"),
                _ => Handled::Unhandled,
            }
        }
    }

    async fn spawn(config: ServerConfig) -> (SocketAddr, ShutdownHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::builder()
            .config(config)
            .listener(listener)
            .handler(Api)
            .build()
            .unwrap();
        let handle = server.shutdown_handle();
        tokio::spawn(server.launch());
        (addr, handle)
    }

    async fn get(addr: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {target} HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn serves_over_real_sockets() {
        let (addr, handle) = spawn(ServerConfig::default()).await;

        let response = get(addr, "/ok").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("served"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn ceiling_drops_excess_connections() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        config.drain_timeout = Duration::from_millis(50);
        let (addr, handle) = spawn(config).await;

        // Occupy the only slot with an idle connection.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"GET /ok HTTP").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second connection is accepted and closed with no response.
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"GET /ok HTTP/1.1\r\n\r\n").await.ok();
        let mut probe = [0u8; 16];
        let n = second.read(&mut probe).await.unwrap();
        assert_eq!(n, 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (addr, handle) = spawn(ServerConfig {
            drain_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        })
        .await;

        let response = get(addr, "/ok").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The listener is gone. Depending on timing the connect either
        // fails outright or the kernel-accepted socket reads EOF.
        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut s) => {
                s.write_all(b"GET /ok HTTP/1.1\r\n\r\n").await.ok();
                let mut probe = [0u8; 1];
                assert!(matches!(s.read(&mut probe).await, Ok(0) | Err(_)));
            }
        }
    }
}
