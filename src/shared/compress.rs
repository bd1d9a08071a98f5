use crate::{metrics::Metrics, shared::lru::LruMap};
use ahash::RandomState;
use bytes::Bytes;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

const CACHE_ENTRIES: usize = 512;
const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

/// Compression algorithm negotiated via `Accept-Encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Algorithm {
    Gzip,
    Brotli,
}

impl Algorithm {
    /// The `content-encoding` token.
    #[inline]
    pub(crate) const fn token(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Brotli => "br",
        }
    }
}

/// Cache key: payload fingerprint plus algorithm. Length disambiguates the
/// rare 64-bit hash collision between different payloads.
type Key = (u64, u64, Algorithm);

#[derive(Debug, Clone)]
enum Slot {
    Ready(Bytes),
    Computing(Arc<Notify>),
}

/// Cache of compressed response bodies.
///
/// Compression runs on the blocking pool; concurrent requests for the same
/// `(payload, algorithm)` collapse onto a single compression pass.
#[derive(Debug)]
pub(crate) struct CompressionCache {
    entries: Mutex<LruMap<Key, Slot>>,
    fingerprinter: RandomState,
    metrics: Arc<Metrics>,
}

enum Lookup {
    Ready(Bytes),
    Owner(Arc<Notify>),
    Pending(Arc<Notify>),
}

impl CompressionCache {
    pub(crate) fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            entries: Mutex::new(LruMap::new(CACHE_ENTRIES)),
            // Fixed seeds: the fingerprint must be stable across calls.
            fingerprinter: RandomState::with_seeds(7, 31, 127, 8191),
            metrics,
        }
    }

    fn lookup(&self, key: &Key) -> Lookup {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(Slot::Ready(bytes)) => Lookup::Ready(bytes.clone()),
            Some(Slot::Computing(notify)) => Lookup::Pending(notify.clone()),
            None => {
                let notify = Arc::new(Notify::new());
                entries.insert(*key, Slot::Computing(notify.clone()));
                Lookup::Owner(notify)
            }
        }
    }

    /// Re-checks the slot under the same lock acquisition used to register
    /// `notified`. Returns the bytes directly if they landed since the
    /// caller's initial lookup; otherwise enables `notified` while still
    /// holding the lock, so the result cannot land unobserved between the
    /// two.
    fn enable_or_ready(&self, key: &Key, mut notified: Pin<&mut Notified<'_>>) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(Slot::Ready(bytes)) => Some(bytes.clone()),
            _ => {
                notified.as_mut().enable();
                None
            }
        }
    }

    /// Returns `input` compressed with `algorithm`, from cache when possible.
    pub(crate) async fn compress(&self, input: &[u8], algorithm: Algorithm) -> io::Result<Bytes> {
        let key: Key = (
            input.len() as u64,
            self.fingerprinter.hash_one(input),
            algorithm,
        );

        let own = loop {
            let waiter = match self.lookup(&key) {
                Lookup::Ready(bytes) => {
                    Metrics::incr(&self.metrics.compress_hits);
                    return Ok(bytes);
                }
                Lookup::Owner(notify) => break notify,
                Lookup::Pending(notify) => notify,
            };

            // Register interest before the lock is released: the owner's
            // `notify_waiters` wakes only already-registered waiters, so a
            // completion landing between unlock and first poll would
            // otherwise be lost for good. Re-checking under the same lock
            // used for `enable()` closes the window between the lookup
            // above and this registration.
            let notified = waiter.notified();
            tokio::pin!(notified);
            if let Some(bytes) = self.enable_or_ready(&key, notified.as_mut()) {
                Metrics::incr(&self.metrics.compress_hits);
                return Ok(bytes);
            }
            notified.await;
        };

        Metrics::incr(&self.metrics.compress_misses);

        let owned = input.to_vec();
        let result = match tokio::task::spawn_blocking(move || run_compressor(&owned, algorithm))
            .await
        {
            Ok(compressed) => compressed,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        };

        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match &result {
                Ok(bytes) => {
                    entries.insert(key, Slot::Ready(bytes.clone()));
                }
                Err(_) => {
                    entries.remove(&key);
                }
            }
        }

        own.notify_waiters();
        result
    }
}

fn run_compressor(input: &[u8], algorithm: Algorithm) -> io::Result<Bytes> {
    let out = match algorithm {
        Algorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input)?;
            encoder.finish()?
        }
        Algorithm::Brotli => {
            let mut encoder = brotli::CompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER,
                BROTLI_QUALITY,
                BROTLI_WINDOW,
            );
            encoder.write_all(input)?;
            encoder.flush()?;
            encoder.into_inner()
        }
    };
    Ok(Bytes::from(out))
}
