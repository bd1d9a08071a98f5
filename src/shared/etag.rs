use crate::{
    metrics::Metrics,
    shared::{buffer_pool::BufferPool, lru::LruMap},
};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::futures::Notified;
use tokio::{fs::File, io::AsyncReadExt, sync::Notify};

const CACHE_ENTRIES: usize = 4096;

/// Cache key: file identity. Any metadata change produces a fresh key, so
/// stale entries age out of the LRU without explicit invalidation.
type Key = (PathBuf, u64, u128);

#[derive(Debug, Clone)]
enum Slot {
    Ready(Arc<str>),
    Computing(Arc<Notify>),
}

/// Content-addressed ETag cache.
///
/// Values are the first 16 hex characters of the SHA-256 over the file's
/// full contents, hashed in pooled-buffer-sized chunks. Concurrent requests
/// for the same key collapse onto a single hashing pass.
#[derive(Debug)]
pub(crate) struct EtagCache {
    entries: Mutex<LruMap<Key, Slot>>,
    pool: Arc<BufferPool>,
    metrics: Arc<Metrics>,
}

enum Lookup {
    Ready(Arc<str>),
    Owner(Arc<Notify>),
    Pending(Arc<Notify>),
}

impl EtagCache {
    pub(crate) fn new(pool: Arc<BufferPool>, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: Mutex::new(LruMap::new(CACHE_ENTRIES)),
            pool,
            metrics,
        }
    }

    fn lookup(&self, key: &Key) -> Lookup {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(Slot::Ready(tag)) => Lookup::Ready(tag.clone()),
            Some(Slot::Computing(notify)) => Lookup::Pending(notify.clone()),
            None => {
                let notify = Arc::new(Notify::new());
                entries.insert(key.clone(), Slot::Computing(notify.clone()));
                Lookup::Owner(notify)
            }
        }
    }

    /// Re-checks the slot under the same lock acquisition used to register
    /// `notified`. Returns the tag directly if it landed since the caller's
    /// initial lookup; otherwise enables `notified` while still holding the
    /// lock, so the result cannot land unobserved between the two.
    fn enable_or_ready(&self, key: &Key, mut notified: Pin<&mut Notified<'_>>) -> Option<Arc<str>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(Slot::Ready(tag)) => Some(tag.clone()),
            _ => {
                notified.as_mut().enable();
                None
            }
        }
    }

    /// Returns the ETag for the file at `path` with the given metadata,
    /// computing and caching it on miss.
    pub(crate) async fn generate(
        &self,
        path: &Path,
        size: u64,
        mtime_ns: u128,
    ) -> io::Result<Arc<str>> {
        let key: Key = (path.to_path_buf(), size, mtime_ns);

        let own = loop {
            let waiter = match self.lookup(&key) {
                Lookup::Ready(tag) => {
                    Metrics::incr(&self.metrics.etag_hits);
                    return Ok(tag);
                }
                Lookup::Owner(notify) => break notify,
                Lookup::Pending(notify) => notify,
            };

            // Another task owns the computation. Register interest before
            // the lock is released: `notify_waiters` wakes only already
            // registered waiters, so a completion landing between unlock
            // and first poll would otherwise be lost for good. Re-checking
            // under the same lock used for `enable()` closes the window
            // between the lookup above and this registration: if the
            // result landed in that window, we observe it directly instead
            // of registering for a notification that already fired.
            let notified = waiter.notified();
            tokio::pin!(notified);
            if let Some(tag) = self.enable_or_ready(&key, notified.as_mut()) {
                Metrics::incr(&self.metrics.etag_hits);
                return Ok(tag);
            }
            notified.await;
        };

        Metrics::incr(&self.metrics.etag_misses);
        let result = self.hash_file(path).await;

        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match &result {
                Ok(tag) => {
                    entries.insert(key, Slot::Ready(tag.clone()));
                }
                Err(_) => {
                    // Leave no poisoned slot behind; the next caller retries.
                    entries.remove(&key);
                }
            }
        }

        own.notify_waiters();
        result
    }

    async fn hash_file(&self, path: &Path) -> io::Result<Arc<str>> {
        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = self.pool.acquire();

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let digest = hasher.finalize();
        let mut tag = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            tag.push_str(&format!("{:02x}", byte));
        }
        Ok(tag.into())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod etag_tests {
    use super::*;
    use crate::config::BufferPoolLimits;
    use std::io::Write;

    fn cache() -> EtagCache {
        EtagCache::new(
            BufferPool::new(&BufferPoolLimits::default()),
            Arc::new(Metrics::default()),
        )
    }

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn deterministic_for_fixed_identity() {
        let cache = cache();
        let file = temp_file(b"hello world");

        let a = cache.generate(file.path(), 11, 42).await.unwrap();
        let b = cache.generate(file.path(), 11, 42).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let cache = cache();
        let file = temp_file(b"cache me");

        cache.generate(file.path(), 8, 7).await.unwrap();
        cache.generate(file.path(), 8, 7).await.unwrap();

        let snap = cache.metrics.snapshot();
        assert_eq!(snap.etag_misses, 1);
        assert_eq!(snap.etag_hits, 1);
    }

    #[tokio::test]
    async fn metadata_change_forces_recomputation() {
        let cache = cache();
        let file = temp_file(b"versioned");

        cache.generate(file.path(), 9, 1).await.unwrap();
        cache.generate(file.path(), 9, 2).await.unwrap();

        assert_eq!(cache.metrics.snapshot().etag_misses, 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_collapse() {
        let cache = Arc::new(cache());
        let file = temp_file(&vec![7u8; 256 * 1024]);
        let path = file.path().to_path_buf();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let path = path.clone();
                tokio::spawn(async move { cache.generate(&path, 262_144, 5).await.unwrap() })
            })
            .collect();

        let mut tags = Vec::new();
        for task in tasks {
            tags.push(task.await.unwrap());
        }
        assert!(tags.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.metrics.snapshot().etag_misses, 1);
    }
}
