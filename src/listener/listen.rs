use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::limiter::TokenBucketLimiter;
use crate::listener::ThrottledListener;
use crate::transport::{Listener, TcpAcceptor};

/// Builds throttled listeners that share one cancellation scope and rate.
///
/// Every listener gets its own bucket; the scope is shared by all of them.
#[derive(Debug, Clone)]
pub struct RateLimitedListen {
    cancel: CancellationToken,
    refill_interval: Duration,
    bucket_size: u32,
}

impl RateLimitedListen {
    pub fn new(cancel: CancellationToken, refill_interval: Duration, bucket_size: u32) -> Result<Self> {
        TokenBucketLimiter::validate(refill_interval, bucket_size)?;
        Ok(Self {
            cancel,
            refill_interval,
            bucket_size,
        })
    }

    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        Self::new(cancel, config.refill_interval(), config.bucket_size)
    }

    /// Binds `addr` over TCP and wraps it. Bind failures come back as is and
    /// no listener is created.
    pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<ThrottledListener<TcpAcceptor>> {
        let delegate = TcpAcceptor::bind(addr).await?;
        let listener = self.wrap(delegate)?;
        info!(
            "Rate limited listener on {} (1 permit / {:?}, burst {})",
            listener.local_addr()?,
            self.refill_interval,
            self.bucket_size
        );
        Ok(listener)
    }

    /// Wraps an already bound listener.
    pub fn wrap<L: Listener>(&self, delegate: L) -> Result<ThrottledListener<L>> {
        ThrottledListener::with_rate(
            delegate,
            self.cancel.clone(),
            self.refill_interval,
            self.bucket_size,
        )
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
