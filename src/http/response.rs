use crate::{
    http::types::{StatusCode, Version},
    server::handler::Handled,
};
use bytes::Bytes;
use std::path::PathBuf;

/// Response payload.
///
/// Handlers produce in-memory bodies; the static file layer produces file
/// bodies so the writer can pick the zero-copy path for large content.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    File {
        path: PathBuf,
        len: u64,
    },
}

impl Body {
    /// Declared `content-length` of the body.
    #[inline]
    pub(crate) fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::File { len, .. } => *len,
        }
    }
}

/// Protocol-neutral response builder.
///
/// Built by chaining [`status`](Response::status), any number of
/// [`header`](Response::header) calls and one body method. The HTTP/1.1
/// writer serializes it as a head plus body; the HTTP/2 layer encodes the
/// same data as HEADERS plus DATA frames.
///
/// # Examples
/// ```
/// use trident_web::{Response, StatusCode};
///
/// let mut resp = Response::new();
/// resp.status(StatusCode::Ok)
///     .header("content-type", "text/plain")
///     .body("Hello!");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub(crate) status: StatusCode,
    headers: Vec<(Box<[u8]>, Box<[u8]>)>,
    pub(crate) body: Body,
    pub(crate) keep_alive: bool,
    /// HEAD answer: the head advertises the real content-length but no body
    /// bytes follow.
    pub(crate) head_only: bool,
    complete: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::with_capacity(8),
            body: Body::Empty,
            keep_alive: true,
            head_only: false,
            complete: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.body = Body::Empty;
        self.keep_alive = true;
        self.head_only = false;
        self.complete = false;
    }

    /// Sets the status code. Call first.
    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(!self.complete, "response already finalized");
        self.status = status;
        self
    }

    /// Adds a header. Names are stored lower-cased so the HTTP/2 encoder can
    /// emit them unchanged.
    ///
    /// `content-length` and `connection` are managed by the server; do not
    /// set them here.
    #[inline]
    pub fn header(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        debug_assert!(!self.complete, "response already finalized");

        let mut name: Box<[u8]> = name.as_ref().into();
        crate::http::types::to_lower_case(&mut name);
        self.headers.push((name, value.as_ref().into()));
        self
    }

    /// Forces the connection to close after this response (HTTP/1.x only).
    #[inline]
    pub fn close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    /// Sets the body and finalizes the response.
    #[inline]
    pub fn body(&mut self, data: impl Into<Bytes>) -> Handled {
        debug_assert!(!self.complete, "response already finalized");
        self.body = Body::Bytes(data.into());
        self.complete = true;
        Handled::Done
    }

    /// Finalizes with no body (204, 304, HEAD answers).
    #[inline]
    pub fn empty(&mut self) -> Handled {
        debug_assert!(!self.complete, "response already finalized");
        self.body = Body::Empty;
        self.complete = true;
        Handled::Done
    }

    /// Finalizes with a file body served from disk.
    pub(crate) fn file(&mut self, path: PathBuf, len: u64) -> Handled {
        debug_assert!(!self.complete, "response already finalized");
        self.body = Body::File { path, len };
        self.complete = true;
        Handled::Done
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// Header pairs in insertion order, names lower-cased.
    #[inline]
    pub(crate) fn header_pairs(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    /// Serializes the HTTP/1.1 head: status line, user headers, framing
    /// headers, terminating blank line.
    pub(crate) fn encode_h1_head(&self, version: Version, out: &mut Vec<u8>) {
        out.extend_from_slice(version.first_line_prefix());
        out.extend_from_slice(self.status.status_line());

        for (name, value) in self.header_pairs() {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        match (version, self.keep_alive) {
            (Version::Http11, false) => out.extend_from_slice(b"connection: close\r\n"),
            (Version::Http10, true) => out.extend_from_slice(b"connection: keep-alive\r\n"),
            _ => {}
        }

        out.extend_from_slice(b"content-length: ");
        out.extend_from_slice(self.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn h1_head_serialization() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body("hello");

        let mut out = Vec::new();
        resp.encode_h1_head(Version::Http11, &mut out);
        assert_eq!(
            str_op(&out),
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\n"
        );
    }

    #[test]
    fn connection_header_matrix() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  ""),
            (Version::Http11, false, "connection: close\r\n"),
            (Version::Http10, true,  "connection: keep-alive\r\n"),
            (Version::Http10, false, ""),
        ];

        for (version, keep_alive, header) in cases {
            let mut resp = Response::new();
            resp.keep_alive = keep_alive;
            resp.status(StatusCode::Ok).empty();

            let mut out = Vec::new();
            resp.encode_h1_head(version, &mut out);
            let rendered = str_op(&out).to_owned();
            assert!(
                rendered.contains(&format!("{header}content-length: 0\r\n\r\n")),
                "{version:?}/{keep_alive}: {rendered}"
            );
        }
    }

    #[test]
    fn body_lengths() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok).body(vec![1u8, 2, 3]);
        assert_eq!(resp.body.len(), 3);

        let mut resp = Response::new();
        resp.status(StatusCode::NoContent).empty();
        assert_eq!(resp.body.len(), 0);

        let mut resp = Response::new();
        resp.file(PathBuf::from("/tmp/x"), 4096);
        assert_eq!(resp.body.len(), 4096);
    }

    #[test]
    fn reset_clears_everything() {
        let mut resp = Response::new();
        resp.status(StatusCode::NotFound)
            .header("x", "y")
            .close()
            .body("gone");

        resp.reset();
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.header_pairs().count(), 0);
        assert_eq!(resp.body, Body::Empty);
        assert!(resp.keep_alive);
        assert!(!resp.is_complete());
    }

    #[test]
    fn header_names_lowercased() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok).header("X-REQUEST-ID", "1");

        let (name, _) = resp.header_pairs().next().unwrap();
        assert_eq!(name, b"x-request-id");
    }
}
