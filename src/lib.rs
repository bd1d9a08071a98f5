//! trident_web - multi-protocol HTTP server core for high-concurrency services
//!
//! A single-host server that accepts plaintext or TLS connections, negotiates
//! an application protocol and serves requests over HTTP/1.1, HTTP/2 or
//! WebSocket. Built for tens of thousands of simultaneous connections: one
//! lightweight tokio task per connection, with shared infrastructure that cuts
//! allocation and I/O cost on the hot path.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked request bodies, upgrade
//!   dispatch to HTTP/2 (`h2c` preface) and WebSocket
//! - **HTTP/2**: full framing, stream multiplexing, flow control and HPACK
//!   header compression (RFC 7540 / RFC 7541)
//! - **WebSocket**: RFC 6455 framing, fragmentation, close protocol
//! - **TLS**: rustls termination with ALPN fan-out (`h2`, `http/1.1`)
//!
//! # Shared infrastructure
//!
//! - Bounded buffer pool for hot-path reads and copies
//! - Token-bucket rate limiter with an LRU-bounded key store
//! - ETag and compression caches keyed by file identity / payload fingerprint
//! - Zero-copy file transfer (`sendfile`) with transparent buffered fallback
//!
//! All of these are explicit collaborators owned by the [`Server`] and handed
//! to each connection task; there is no hidden global state.
//!
//! # Quick Start
//!
//! ```no_run
//! use trident_web::{Server, Handler, Handled, Request, Response, StatusCode};
//! use trident_web::config::ServerConfig;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
//!         if req.url().path() == b"/hello" {
//!             resp.status(StatusCode::Ok).body("Hello World!")
//!         } else {
//!             Handled::Unhandled
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .config(ServerConfig::default())
//!         .handler(MyHandler)
//!         .build()
//!         .expect("invalid configuration")
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! Requests not claimed by the handler fall through to the static file tree
//! configured via [`config::ServerConfig::webroot`].

pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod h2 {
    pub(crate) mod connection;
    pub(crate) mod frame;
    pub(crate) mod hpack;
    pub(crate) mod huffman;
    pub(crate) mod stream;
}
pub(crate) mod ws {
    pub(crate) mod connection;
    pub(crate) mod frame;
    pub(crate) mod handshake;
}
pub(crate) mod shared {
    pub(crate) mod buffer_pool;
    pub(crate) mod compress;
    pub(crate) mod etag;
    pub(crate) mod lru;
    pub(crate) mod rate_limit;
    pub(crate) mod zero_copy;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod context;
    pub(crate) mod handler;
    pub(crate) mod http1;
    pub(crate) mod static_files;
    pub(crate) mod tls;
}
pub mod config;
pub(crate) mod errors;
pub mod metrics;

pub use crate::{
    http::{
        query,
        request::Request,
        response::{Body, Response},
        types::{Method, StatusCode, Url, Version},
    },
    server::{
        acceptor::{Server, ServerBuilder, ShutdownHandle},
        handler::{EchoWs, Handled, Handler, WsHandler, WsMessage},
    },
    shared::rate_limit::Decision,
};

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }
}
