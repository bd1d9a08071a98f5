use crate::{
    config::Http1Limits,
    errors::ErrorKind,
    http::types::{trim_ascii, HeaderMap, Method, Url, Version},
};
use memchr::memchr;
use std::net::IpAddr;

/// A fully received request, protocol-independent.
///
/// HTTP/1.1 requests are produced by the parser below; HTTP/2 requests are
/// assembled from decoded HPACK pseudo-headers plus DATA frames. Handlers
/// see the same type either way.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
    pub(crate) peer: Option<IpAddr>,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        url: Url,
        version: Version,
        headers: HeaderMap,
        body: Vec<u8>,
        peer: Option<IpAddr>,
    ) -> Self {
        Self {
            method,
            url,
            version,
            headers,
            body,
            peer,
        }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// First header value with case-insensitive name matching.
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Peer address, when known.
    #[inline]
    pub fn peer(&self) -> Option<IpAddr> {
        self.peer
    }
}

// HTTP/1.1 head parsing

/// Result of parsing a request head (everything up to the blank line).
#[derive(Debug, PartialEq)]
pub(crate) struct ParsedHead {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) headers: HeaderMap,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
}

/// Parses a complete request head. `head` spans from the first byte of the
/// request line up to and including the blank line.
pub(crate) fn parse_head(head: &[u8], limits: &Http1Limits) -> Result<ParsedHead, ErrorKind> {
    let mut lines = Lines { rest: head };

    let request_line = lines.next().ok_or(ErrorKind::InvalidMethod)?;
    let (method, url, version, mut keep_alive) = parse_request_line(request_line)?;

    let mut headers = HeaderMap::with_capacity(16);
    let mut content_length = None;
    let mut chunked = false;

    loop {
        let line = lines.next().ok_or(ErrorKind::InvalidHeader)?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= limits.max_headers {
            return Err(ErrorKind::TooManyHeaders);
        }

        let split = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let name = &line[..split];
        let value = trim_ascii(&line[split + 1..]);

        if name.is_empty() || name.iter().any(|&b| b <= b' ' || b == 0x7f) {
            return Err(ErrorKind::InvalidHeader);
        }

        match () {
            _ if name.eq_ignore_ascii_case(b"content-length") => {
                let len =
                    crate::http::types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
                if let Some(previous) = content_length {
                    if previous != len {
                        return Err(ErrorKind::InvalidContentLength);
                    }
                }
                if len > limits.max_body_bytes {
                    return Err(ErrorKind::BodyTooLarge);
                }
                content_length = Some(len);
            }
            _ if name.eq_ignore_ascii_case(b"transfer-encoding") => {
                if !value.eq_ignore_ascii_case(b"chunked") {
                    return Err(ErrorKind::InvalidChunk);
                }
                chunked = true;
            }
            _ => {}
        }

        headers.append(name, value);
    }

    // connection: close / keep-alive overrides the version default.
    if headers.contains_token(b"connection", b"close") {
        keep_alive = false;
    } else if headers.contains_token(b"connection", b"keep-alive") {
        keep_alive = true;
    }

    if chunked && content_length.is_some() {
        return Err(ErrorKind::InvalidContentLength);
    }

    Ok(ParsedHead {
        method,
        url,
        version,
        keep_alive,
        headers,
        content_length,
        chunked,
    })
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Url, Version, bool), ErrorKind> {
    let first_space = memchr(b' ', line).ok_or(ErrorKind::InvalidMethod)?;
    let method = Method::from_token(&line[..first_space])?;

    let rest = &line[first_space + 1..];
    let second_space = memchr(b' ', rest).ok_or(ErrorKind::InvalidUrl)?;
    let url = Url::parse(&rest[..second_space])?;

    let (version, keep_alive) = Version::from_token(&rest[second_space + 1..])?;
    Ok((method, url, version, keep_alive))
}

/// Splits on `\n`, stripping one optional trailing `\r` per line. The final
/// blank line of the head shows up as an empty slice.
struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }

        let (mut line, rest) = match memchr(b'\n', self.rest) {
            Some(pos) => (&self.rest[..pos], &self.rest[pos + 1..]),
            None => (self.rest, &b""[..]),
        };
        self.rest = rest;

        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Some(line)
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use crate::tools::*;

    fn parse(head: &str) -> Result<ParsedHead, ErrorKind> {
        parse_head(head.as_bytes(), &Http1Limits::default())
    }

    #[test]
    fn minimal_get() {
        let head = parse("GET / HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(head.method, Method::Get);
        assert_eq!(str_op(head.url.path()), "/");
        assert_eq!(head.version, Version::Http11);
        assert!(head.keep_alive);
        assert!(head.headers.is_empty());
        assert_eq!(head.content_length, None);
        assert!(!head.chunked);
    }

    #[test]
    fn headers_and_target() {
        let head = parse(
            "POST /api/items?page=2 HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: application/json\r\n\
             Content-Length: 17\r\n\r\n",
        )
        .unwrap();

        assert_eq!(head.method, Method::Post);
        assert_eq!(str_op(head.url.path()), "/api/items");
        assert_eq!(str(head.url.query(b"page")), Some("2"));
        assert_eq!(str(head.headers.get(b"host")), Some("localhost"));
        assert_eq!(head.content_length, Some(17));
    }

    #[test]
    fn bare_lf_accepted() {
        let head = parse("GET /x HTTP/1.1\nHost: a\n\n").unwrap();
        assert_eq!(str(head.headers.get(b"host")), Some("a"));
    }

    #[test]
    fn keep_alive_negotiation() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                            true),
            ("GET / HTTP/1.0\r\n\r\n",                            false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",       false),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",  true),
            ("GET / HTTP/1.1\r\nConnection: Close\r\n\r\n",       false),
            ("GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n", true),
        ];

        for (raw, keep_alive) in cases {
            assert_eq!(parse(raw).unwrap().keep_alive, keep_alive, "{raw:?}");
        }
    }

    #[test]
    fn chunked_detection() {
        let head = parse(
            "POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn invalid_requests() {
        #[rustfmt::skip]
        let cases = [
            ("",                                       ErrorKind::InvalidMethod),
            ("BREW / HTTP/1.1\r\n\r\n",                ErrorKind::InvalidMethod),
            ("GET\r\n\r\n",                            ErrorKind::InvalidMethod),
            ("GET /\r\n\r\n",                          ErrorKind::InvalidUrl),
            ("GET nopath HTTP/1.1\r\n\r\n",            ErrorKind::InvalidUrl),
            ("GET / HTTP/9.9\r\n\r\n",                 ErrorKind::InvalidVersion),
            ("GET / HTTP/2.0\r\n\r\n",                 ErrorKind::UnsupportedVersion),
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n",      ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: novalue\r\n\r\n",    ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nA B: v\r\n\r\n",       ErrorKind::InvalidHeader),
            (
                "GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
            (
                "GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
            (
                "GET / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
                ErrorKind::InvalidChunk,
            ),
            (
                "GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse(raw).unwrap_err(), expected, "{raw:?}");
        }
    }

    #[test]
    fn body_size_bound() {
        let limits = Http1Limits::default();
        let ok = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            limits.max_body_bytes
        );
        let over = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            limits.max_body_bytes + 1
        );

        assert!(parse_head(ok.as_bytes(), &limits).is_ok());
        assert_eq!(
            parse_head(over.as_bytes(), &limits).unwrap_err(),
            ErrorKind::BodyTooLarge
        );
    }

    #[test]
    fn header_count_bound() {
        let limits = Http1Limits::default();
        let head = format!(
            "GET / HTTP/1.1\r\n{}\r\n",
            "X-H: v\r\n".repeat(limits.max_headers + 1)
        );
        assert_eq!(
            parse_head(head.as_bytes(), &limits).unwrap_err(),
            ErrorKind::TooManyHeaders
        );
    }

    #[test]
    fn request_accessors() {
        let head = parse("GET /a?b=c HTTP/1.1\r\nX-Id: 7\r\n\r\n").unwrap();
        let request = Request::new(
            head.method,
            head.url,
            head.version,
            head.headers,
            b"body".to_vec(),
            Some("127.0.0.1".parse().unwrap()),
        );

        assert_eq!(request.method(), Method::Get);
        assert_eq!(str(request.header(b"x-id")), Some("7"));
        assert_eq!(request.body(), b"body");
        assert_eq!(request.version(), Version::Http11);
        assert!(request.peer().is_some());
    }
}
