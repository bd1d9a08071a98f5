//! Observable surface of the server core.
//!
//! Counters are plain atomics mutated from any connection task; exporters
//! (Prometheus and friends) are external collaborators that periodically
//! call [`Metrics::snapshot`].

use crate::errors::H2ErrorCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bucket bounds for the request latency histogram, in microseconds.
/// The last bucket is unbounded.
#[rustfmt::skip]
const LATENCY_BOUNDS_US: [u64; 10] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 250_000, 1_000_000,
];

/// Process-wide counters. One instance per [`Server`](crate::Server), shared
/// by every connection task through the server context.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BOUNDS_US.len() + 1],

    pub(crate) etag_hits: AtomicU64,
    pub(crate) etag_misses: AtomicU64,
    pub(crate) compress_hits: AtomicU64,
    pub(crate) compress_misses: AtomicU64,

    pub(crate) rate_limit_denials: AtomicU64,

    pub(crate) h2_connections: AtomicU64,
    pub(crate) h2_streams: AtomicU64,
    pub(crate) ws_connections: AtomicU64,

    // Indexed by the RFC 7540 error code value (0x0..=0xd).
    h2_protocol_errors: [AtomicU64; 14],
    pub(crate) h1_protocol_errors: AtomicU64,
    pub(crate) ws_protocol_errors: AtomicU64,

    pub(crate) zero_copy_transfers: AtomicU64,
    pub(crate) zero_copy_bytes: AtomicU64,
    pub(crate) zero_copy_fallbacks: AtomicU64,
    pub(crate) zero_copy_errors: AtomicU64,
}

impl Metrics {
    #[inline]
    pub(crate) fn record_request(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let us = latency.as_micros().min(u64::MAX as u128) as u64;
        let bucket = LATENCY_BOUNDS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(LATENCY_BOUNDS_US.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_h2_error(&self, code: H2ErrorCode) {
        self.h2_protocol_errors[code as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Consistent-enough view of every counter. Reads are relaxed; exporters
    /// tolerate the skew.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests: load(&self.requests),
            latency_buckets: {
                let mut out = [0u64; LATENCY_BOUNDS_US.len() + 1];
                for (slot, bucket) in out.iter_mut().zip(self.latency_buckets.iter()) {
                    *slot = load(bucket);
                }
                out
            },
            etag_hits: load(&self.etag_hits),
            etag_misses: load(&self.etag_misses),
            compress_hits: load(&self.compress_hits),
            compress_misses: load(&self.compress_misses),
            rate_limit_denials: load(&self.rate_limit_denials),
            h2_connections: load(&self.h2_connections),
            h2_streams: load(&self.h2_streams),
            ws_connections: load(&self.ws_connections),
            h2_protocol_errors: {
                let mut out = [0u64; 14];
                for (slot, counter) in out.iter_mut().zip(self.h2_protocol_errors.iter()) {
                    *slot = load(counter);
                }
                out
            },
            h1_protocol_errors: load(&self.h1_protocol_errors),
            ws_protocol_errors: load(&self.ws_protocol_errors),
            zero_copy_transfers: load(&self.zero_copy_transfers),
            zero_copy_bytes: load(&self.zero_copy_bytes),
            zero_copy_fallbacks: load(&self.zero_copy_fallbacks),
            zero_copy_errors: load(&self.zero_copy_errors),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    /// Request latency histogram; bounds are 100µs..1s in roughly
    /// logarithmic steps, final bucket unbounded.
    pub latency_buckets: [u64; LATENCY_BOUNDS_US.len() + 1],

    pub etag_hits: u64,
    pub etag_misses: u64,
    pub compress_hits: u64,
    pub compress_misses: u64,

    pub rate_limit_denials: u64,

    pub h2_connections: u64,
    pub h2_streams: u64,
    pub ws_connections: u64,

    /// Indexed by RFC 7540 error code value.
    pub h2_protocol_errors: [u64; 14],
    pub h1_protocol_errors: u64,
    pub ws_protocol_errors: u64,

    pub zero_copy_transfers: u64,
    pub zero_copy_bytes: u64,
    pub zero_copy_fallbacks: u64,
    pub zero_copy_errors: u64,
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn latency_bucketing() {
        let metrics = Metrics::default();

        metrics.record_request(Duration::from_micros(50));
        metrics.record_request(Duration::from_micros(100));
        metrics.record_request(Duration::from_micros(101));
        metrics.record_request(Duration::from_secs(5));

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 4);
        assert_eq!(snap.latency_buckets[0], 2);
        assert_eq!(snap.latency_buckets[1], 1);
        assert_eq!(snap.latency_buckets[LATENCY_BOUNDS_US.len()], 1);
    }

    #[test]
    fn error_codes_indexed() {
        let metrics = Metrics::default();
        metrics.record_h2_error(H2ErrorCode::Compression);
        metrics.record_h2_error(H2ErrorCode::Compression);
        metrics.record_h2_error(H2ErrorCode::Protocol);

        let snap = metrics.snapshot();
        assert_eq!(snap.h2_protocol_errors[H2ErrorCode::Compression as usize], 2);
        assert_eq!(snap.h2_protocol_errors[H2ErrorCode::Protocol as usize], 1);
        assert_eq!(snap.h2_protocol_errors[H2ErrorCode::NoError as usize], 0);
    }
}
