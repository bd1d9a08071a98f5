use crate::{
    http::{request::Request, response::Response, types::StatusCode},
    server::context::ServerContext,
};
use std::future::Future;
use std::time::Instant;

/// Marker returned by handlers: either the response was finalized, or the
/// request should fall through to the static file tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Done,
    Unhandled,
}

/// Application request handler, shared by HTTP/1.1 and HTTP/2.
///
/// `&self` holds shared state (database pools, routing tables); requests on
/// any connection and any protocol arrive here.
///
/// # Examples
///
/// ```
/// use trident_web::{Handler, Handled, Request, Response, StatusCode};
///
/// struct ApiHandler;
///
/// impl Handler for ApiHandler {
///     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
///         match req.url().path() {
///             b"/ping" => resp.status(StatusCode::Ok).body("pong"),
///             _ => Handled::Unhandled,
///         }
///     }
/// }
/// ```
pub trait Handler: Sync + Send + 'static {
    /// Processes a request. Return [`Handled::Unhandled`] to delegate to the
    /// static file tree (and ultimately a 404).
    fn handle(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;
}

/// The unit handler delegates everything: a pure static file server.
impl Handler for () {
    async fn handle(&self, _: &Request, _: &mut Response) -> Handled {
        Handled::Unhandled
    }
}

/// One WebSocket message, text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Application layer of a WebSocket connection.
pub trait WsHandler: Sync + Send + 'static {
    /// Called per complete inbound message; the returned message, if any, is
    /// sent back to the peer.
    fn on_message(&self, message: WsMessage) -> impl Future<Output = Option<WsMessage>> + Send;
}

/// Echoes every message back unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoWs;

impl WsHandler for EchoWs {
    async fn on_message(&self, message: WsMessage) -> Option<WsMessage> {
        Some(message)
    }
}

/// Runs one request to completion: handler, then static files, then 404.
/// Also owns the per-request metrics.
pub(crate) async fn run_request<H: Handler>(
    ctx: &ServerContext,
    handler: &H,
    request: &Request,
    response: &mut Response,
) {
    let started = Instant::now();

    let mut handled = handler.handle(request, response).await;

    if handled == Handled::Unhandled {
        if let Some(files) = &ctx.static_files {
            handled = files.serve(ctx, request, response).await;
        }
    }

    if handled == Handled::Unhandled || !response.is_complete() {
        response.reset();
        response.status(StatusCode::NotFound).body("not found");
    }

    ctx.metrics.record_request(started.elapsed());
}
