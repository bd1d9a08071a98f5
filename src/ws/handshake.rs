//! WebSocket opening handshake (RFC 6455 §4).

use crate::errors::ErrorKind;
use crate::http::request::ParsedHead;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Whether a parsed HTTP/1.1 head asks for a WebSocket upgrade.
pub(crate) fn is_upgrade(head: &ParsedHead) -> bool {
    head.headers.contains_token(b"connection", b"upgrade")
        && head
            .headers
            .get(b"upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case(b"websocket"))
}

/// Validates the upgrade request and returns the `Sec-WebSocket-Accept`
/// value. Any violation maps to a 400 and the connection closes.
pub(crate) fn validate(head: &ParsedHead) -> Result<String, ErrorKind> {
    if head
        .headers
        .get(b"sec-websocket-version")
        .map_or(true, |v| v != b"13")
    {
        return Err(ErrorKind::BadUpgrade);
    }

    let key = head
        .headers
        .get(b"sec-websocket-key")
        .ok_or(ErrorKind::BadUpgrade)?;
    // The nonce is 16 bytes base64-coded: always 24 bytes on the wire.
    if key.len() != 24 {
        return Err(ErrorKind::BadUpgrade);
    }

    Ok(accept_value(key))
}

/// `base64(SHA1(key ++ GUID))` per RFC 6455 §4.2.2.
fn accept_value(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(ACCEPT_GUID);
    BASE64.encode(hasher.finalize())
}

/// The 101 response completing the handshake.
pub(crate) fn response_bytes(accept: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"upgrade: websocket\r\n");
    out.extend_from_slice(b"connection: Upgrade\r\n");
    out.extend_from_slice(b"sec-websocket-accept: ");
    out.extend_from_slice(accept.as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out
}
