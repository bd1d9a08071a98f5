use crate::{
    config::ServerConfig,
    errors::ConfigError,
    metrics::Metrics,
    server::static_files::StaticFiles,
    shared::{
        buffer_pool::BufferPool, compress::CompressionCache, etag::EtagCache,
        rate_limit::RateLimiter, zero_copy::ZeroCopy,
    },
};
use std::sync::Arc;

/// The shared collaborators every connection task works against.
///
/// Built once at server construction and handed to connection handlers as an
/// `Arc`; all cross-task sharing in the server goes through this struct, so
/// there are no hidden process-wide singletons.
#[derive(Debug)]
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) limiter: RateLimiter,
    pub(crate) etags: EtagCache,
    pub(crate) compressor: CompressionCache,
    pub(crate) zero_copy: ZeroCopy,
    pub(crate) static_files: Option<StaticFiles>,
}

impl ServerContext {
    pub(crate) fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(Metrics::default());
        let pool = BufferPool::new(&config.buffer_pool);
        let static_files = match &config.webroot {
            Some(root) => Some(StaticFiles::new(root)?),
            None => None,
        };

        Ok(Self {
            limiter: RateLimiter::new(&config.rate_limit, metrics.clone()),
            etags: EtagCache::new(pool.clone(), metrics.clone()),
            compressor: CompressionCache::new(metrics.clone()),
            zero_copy: ZeroCopy::new(config.zero_copy_threshold, pool.clone(), metrics.clone()),
            static_files,
            pool,
            metrics,
            config,
        })
    }
}
