use crate::{metrics::Metrics, shared::buffer_pool::BufferPool};
use std::io;
use std::sync::Arc;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

/// File-to-socket transfer with a kernel fast path.
///
/// Files at or above the configured threshold go through `sendfile(2)` when
/// the sink exposes a raw descriptor (plaintext TCP). TLS streams and
/// non-Linux hosts fall back to a buffered copy through a pooled buffer; the
/// fallback is counted so operators can spot unexpected ones.
#[derive(Debug)]
pub(crate) struct ZeroCopy {
    threshold: u64,
    pool: Arc<BufferPool>,
    metrics: Arc<Metrics>,
}

impl ZeroCopy {
    pub(crate) fn new(threshold: u64, pool: Arc<BufferPool>, metrics: Arc<Metrics>) -> Self {
        Self {
            threshold,
            pool,
            metrics,
        }
    }

    /// Whether a body of `len` bytes qualifies for the fast path.
    #[inline]
    pub(crate) fn qualifies(&self, len: u64) -> bool {
        len >= self.threshold
    }

    /// Sends exactly `len` bytes of `file` to `stream`.
    ///
    /// Returns the bytes written; moving fewer than `len` bytes is an error,
    /// never a silent truncation.
    pub(crate) async fn transfer(
        &self,
        file: &mut File,
        len: u64,
        stream: &mut TcpStream,
    ) -> io::Result<u64> {
        match self.sendfile(file, len, stream).await {
            Ok(written) => {
                Metrics::incr(&self.metrics.zero_copy_transfers);
                self.metrics
                    .zero_copy_bytes
                    .fetch_add(written, std::sync::atomic::Ordering::Relaxed);
                Ok(written)
            }
            Err(SendfileError::Unsupported) => {
                Metrics::incr(&self.metrics.zero_copy_fallbacks);
                debug!("sendfile unavailable, using buffered copy");
                self.copy_buffered(file, len, stream).await
            }
            Err(SendfileError::Io(e)) => {
                Metrics::incr(&self.metrics.zero_copy_errors);
                Err(e)
            }
        }
    }

    /// Buffered copy through a pooled buffer; the path every non-descriptor
    /// sink takes.
    pub(crate) async fn copy_buffered<W>(
        &self,
        file: &mut File,
        len: u64,
        sink: &mut W,
    ) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = self.pool.acquire();
        let mut written: u64 = 0;

        while written < len {
            let want = ((len - written) as usize).min(buf.len());
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shorter than advertised length",
                ));
            }
            sink.write_all(&buf[..n]).await?;
            written += n as u64;
        }

        Ok(written)
    }

    #[cfg(target_os = "linux")]
    async fn sendfile(
        &self,
        file: &mut File,
        len: u64,
        stream: &mut TcpStream,
    ) -> Result<u64, SendfileError> {
        use std::os::fd::AsRawFd;
        use tokio::io::Interest;

        let file_fd = file.as_raw_fd();
        let socket_fd = stream.as_raw_fd();
        let mut offset: libc::off_t = 0;
        let mut written: u64 = 0;

        while written < len {
            stream
                .writable()
                .await
                .map_err(SendfileError::Io)?;

            let result = stream.try_io(Interest::WRITABLE, || {
                let remaining = (len - written) as usize;
                let n = unsafe { libc::sendfile(socket_fd, file_fd, &mut offset, remaining) };
                if n >= 0 {
                    return Ok(n as usize);
                }

                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
                    _ => Err(err),
                }
            });

            match result {
                Ok(0) => {
                    return Err(SendfileError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "sendfile reached EOF before advertised length",
                    )));
                }
                Ok(n) => written += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                // EINVAL / ENOSYS mean the platform refused the fast path,
                // distinguishable from a transport failure mid-stream.
                Err(e) if written == 0 => match e.raw_os_error() {
                    Some(libc::EINVAL) | Some(libc::ENOSYS) => {
                        return Err(SendfileError::Unsupported)
                    }
                    _ => return Err(SendfileError::Io(e)),
                },
                Err(e) => return Err(SendfileError::Io(e)),
            }
        }

        Ok(written)
    }

    #[cfg(not(target_os = "linux"))]
    async fn sendfile(
        &self,
        _file: &mut File,
        _len: u64,
        _stream: &mut TcpStream,
    ) -> Result<u64, SendfileError> {
        Err(SendfileError::Unsupported)
    }
}

#[derive(Debug)]
enum SendfileError {
    /// The platform or descriptor cannot service sendfile; fall back.
    Unsupported,
    /// Real transport or file error; propagate.
    Io(io::Error),
}
