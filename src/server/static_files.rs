use crate::{
    errors::ConfigError,
    http::{request::Request, response::Response, types::Method, types::StatusCode},
    server::{context::ServerContext, handler::Handled},
    shared::compress::Algorithm,
};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Smallest body worth running through the compressor.
const MIN_COMPRESS_BYTES: u64 = 256;

/// Static file tree rooted at the configured webroot.
///
/// Every response path is canonicalized and verified to stay inside the
/// root, so no URL — encoded or otherwise — can read outside it.
#[derive(Debug)]
pub(crate) struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub(crate) fn new(root: &Path) -> Result<Self, ConfigError> {
        // Fail fast on a missing webroot; canonicalizing here also gives the
        // fixed prefix every resolved path is checked against.
        let root = root
            .canonicalize()
            .map_err(|_| ConfigError::Invalid("webroot does not exist"))?;
        Ok(Self { root })
    }

    /// Serves `request` from the tree. Returns [`Handled::Unhandled`] when
    /// the path has no corresponding file, letting the caller produce 404.
    pub(crate) async fn serve(
        &self,
        ctx: &ServerContext,
        request: &Request,
        response: &mut Response,
    ) -> Handled {
        match request.method() {
            Method::Get | Method::Head => {}
            _ => {
                return response
                    .status(StatusCode::MethodNotAllowed)
                    .header("allow", "GET, HEAD")
                    .empty();
            }
        }

        let Some(path) = self.resolve(request).await else {
            return Handled::Unhandled;
        };

        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return Handled::Unhandled;
        };
        if !meta.is_file() {
            return Handled::Unhandled;
        }

        let len = meta.len();
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        // Conditional GET against the content-addressed ETag.
        let etag = match ctx.etags.generate(&path, len, mtime_ns).await {
            Ok(tag) => tag,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "etag generation failed");
                response.status(StatusCode::InternalServerError);
                return response.empty();
            }
        };
        let quoted = format!("\"{etag}\"");

        if let Some(candidate) = request.header(b"if-none-match") {
            if candidate
                .split(|&b| b == b',')
                .map(crate::http::types::trim_ascii)
                .any(|tag| tag == quoted.as_bytes() || tag == b"*")
            {
                response.status(StatusCode::NotModified).header("etag", &quoted);
                return response.empty();
            }
        }

        response.status(StatusCode::Ok).header("etag", &quoted);
        if request.method() == Method::Head {
            response.head_only = true;
        }

        // Bodies below the zero-copy threshold may be compressed; larger
        // files go to the kernel fast path untouched.
        if !ctx.zero_copy.qualifies(len) {
            if let Some(algorithm) = negotiate_encoding(request, len) {
                match tokio::fs::read(&path).await {
                    Ok(raw) => match ctx.compressor.compress(&raw, algorithm).await {
                        Ok(compressed) => {
                            debug!(
                                path = %path.display(),
                                algorithm = algorithm.token(),
                                from = raw.len(),
                                to = compressed.len(),
                                "serving compressed body"
                            );
                            response.header("content-encoding", algorithm.token());
                            response.header("vary", "accept-encoding");
                            return response.body(compressed);
                        }
                        Err(e) => {
                            warn!(error = %e, "compression failed, serving identity");
                        }
                    },
                    Err(_) => return Handled::Unhandled,
                }
            }
        }

        response.file(path, len)
    }

    /// Maps the request path onto the tree, refusing anything whose
    /// canonical form escapes the root.
    async fn resolve(&self, request: &Request) -> Option<PathBuf> {
        let decoded = request.url().decoded_path().ok()?;
        let decoded = String::from_utf8(decoded).ok()?;

        // Reject dot-dot segments outright; canonicalization below is the
        // backstop for symlinks and anything this misses.
        let relative = Path::new(decoded.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }

        let mut joined = self.root.join(relative);
        if decoded.ends_with('/') || decoded == "/" {
            joined.push("index.html");
        }

        let canonical = tokio::fs::canonicalize(&joined).await.ok()?;
        if !canonical.starts_with(&self.root) {
            warn!(requested = %joined.display(), "path escapes webroot");
            return None;
        }
        Some(canonical)
    }
}

/// Picks a compression algorithm from `accept-encoding`, preferring brotli.
fn negotiate_encoding(request: &Request, len: u64) -> Option<Algorithm> {
    if len < MIN_COMPRESS_BYTES {
        return None;
    }
    let accept = request.header(b"accept-encoding")?;

    let mut gzip = false;
    for token in accept.split(|&b| b == b',') {
        // Strip quality parameters; q=0 opt-outs are rare enough to ignore.
        let token = crate::http::types::trim_ascii(
            token.split(|&b| b == b';').next().unwrap_or(b""),
        );
        if token.eq_ignore_ascii_case(b"br") {
            return Some(Algorithm::Brotli);
        }
        if token.eq_ignore_ascii_case(b"gzip") {
            gzip = true;
        }
    }
    gzip.then_some(Algorithm::Gzip)
}

#[cfg(test)]
mod static_tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::request::{parse_head, ParsedHead};

    fn webroot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![7u8; 2048]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), b"nested").unwrap();
        dir
    }

    fn ctx(root: &Path) -> ServerContext {
        let config = ServerConfig {
            webroot: Some(root.to_path_buf()),
            ..ServerConfig::default()
        };
        ServerContext::new(config).unwrap()
    }

    fn request(raw: &str) -> Request {
        let ParsedHead {
            method,
            url,
            version,
            headers,
            ..
        } = parse_head(raw.as_bytes(), &Default::default()).unwrap();
        Request::new(method, url, version, headers, Vec::new(), None)
    }

    async fn serve(ctx: &ServerContext, raw: &str) -> (Response, Handled) {
        let req = request(raw);
        let mut resp = Response::new();
        let handled = ctx
            .static_files
            .as_ref()
            .unwrap()
            .serve(ctx, &req, &mut resp)
            .await;
        (resp, handled)
    }

    #[tokio::test]
    async fn serves_existing_file() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (resp, handled) = serve(&ctx, "GET /sub/file.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(handled, Handled::Done);
        assert_eq!(resp.status, StatusCode::Ok);
        match &resp.body {
            crate::http::response::Body::File { len, .. } => assert_eq!(*len, 6),
            other => panic!("expected file body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_serves_index() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (resp, handled) = serve(&ctx, "GET / HTTP/1.1\r\n\r\n").await;
        assert_eq!(handled, Handled::Done);
        assert_eq!(resp.status, StatusCode::Ok);
    }

    #[tokio::test]
    async fn missing_file_unhandled() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (_, handled) = serve(&ctx, "GET /nope.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(handled, Handled::Unhandled);
    }

    #[tokio::test]
    async fn traversal_refused() {
        let root = webroot();
        let ctx = ctx(root.path());

        for target in [
            "GET /../secret HTTP/1.1\r\n\r\n",
            "GET /%2e%2e/secret HTTP/1.1\r\n\r\n",
            "GET /sub/../../secret HTTP/1.1\r\n\r\n",
            "GET /%2e%2e%2f%2e%2e%2fetc%2fpasswd HTTP/1.1\r\n\r\n",
        ] {
            let (resp, handled) = serve(&ctx, target).await;
            assert_eq!(handled, Handled::Unhandled, "{target:?}");
            assert!(!resp.is_complete(), "no body was produced for {target:?}");
        }
    }

    #[tokio::test]
    async fn etag_revalidation() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (resp, _) = serve(&ctx, "GET /sub/file.txt HTTP/1.1\r\n\r\n").await;
        let etag = resp
            .header_pairs()
            .find(|(n, _)| *n == b"etag")
            .map(|(_, v)| String::from_utf8(v.to_vec()).unwrap())
            .unwrap();

        let conditional = format!(
            "GET /sub/file.txt HTTP/1.1\r\nIf-None-Match: {etag}\r\n\r\n"
        );
        let (resp, handled) = serve(&ctx, &conditional).await;
        assert_eq!(handled, Handled::Done);
        assert_eq!(resp.status, StatusCode::NotModified);
        assert_eq!(resp.body, crate::http::response::Body::Empty);
    }

    #[tokio::test]
    async fn compression_negotiated() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (resp, _) = serve(
            &ctx,
            "GET /data.bin HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\n\r\n",
        )
        .await;
        let encoding = resp
            .header_pairs()
            .find(|(n, _)| *n == b"content-encoding")
            .map(|(_, v)| v.to_vec());
        assert_eq!(encoding.as_deref(), Some(&b"gzip"[..]));

        // Brotli wins when both are acceptable.
        let (resp, _) = serve(
            &ctx,
            "GET /data.bin HTTP/1.1\r\nAccept-Encoding: gzip, br\r\n\r\n",
        )
        .await;
        let encoding = resp
            .header_pairs()
            .find(|(n, _)| *n == b"content-encoding")
            .map(|(_, v)| v.to_vec());
        assert_eq!(encoding.as_deref(), Some(&b"br"[..]));
    }

    #[tokio::test]
    async fn head_requests_omit_body() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (resp, handled) = serve(&ctx, "HEAD /sub/file.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(handled, Handled::Done);
        assert!(resp.head_only);
        assert_eq!(resp.body.len(), 6);
    }

    #[tokio::test]
    async fn non_get_rejected() {
        let root = webroot();
        let ctx = ctx(root.path());

        let (resp, handled) = serve(&ctx, "DELETE /sub/file.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(handled, Handled::Done);
        assert_eq!(resp.status, StatusCode::MethodNotAllowed);
    }
}
