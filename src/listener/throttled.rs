use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analytics::AcceptStats;
use crate::error::{AppError, Result};
use crate::limiter::TokenBucketLimiter;
use crate::transport::Listener;

/// Failure of [`ThrottledListener::accept`].
#[derive(Error)]
pub enum AcceptError<C> {
    /// The underlying listener failed. No permit was consumed.
    #[error("accept failed: {0}")]
    Listener(#[source] io::Error),

    /// The shared scope was canceled while the connection waited for a permit.
    /// The connection is already open and belongs to the caller; dropping it
    /// closes it.
    #[error("permit wait canceled for connection from {peer}")]
    Canceled { conn: C, peer: SocketAddr },
}

impl<C> AcceptError<C> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, AcceptError::Canceled { .. })
    }

    /// Takes back the connection that was open when the permit wait was canceled.
    pub fn into_connection(self) -> Option<(C, SocketAddr)> {
        match self {
            AcceptError::Canceled { conn, peer } => Some((conn, peer)),
            AcceptError::Listener(_) => None,
        }
    }
}

// Connection handles are not required to be Debug.
impl<C> fmt::Debug for AcceptError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::Listener(err) => f.debug_tuple("Listener").field(err).finish(),
            AcceptError::Canceled { peer, .. } => f
                .debug_struct("Canceled")
                .field("peer", peer)
                .finish_non_exhaustive(),
        }
    }
}

impl<C> From<AcceptError<C>> for AppError {
    fn from(err: AcceptError<C>) -> Self {
        match err {
            AcceptError::Listener(err) => AppError::Io(err),
            AcceptError::Canceled { .. } => AppError::Canceled,
        }
    }
}

/// Listener whose accepted connections are released at the limiter's rate.
///
/// Each accept first takes a raw connection from the delegate, then waits for
/// a permit. `close` and `local_addr` go straight to the delegate.
pub struct ThrottledListener<L> {
    delegate: L,
    limiter: TokenBucketLimiter,
    cancel: CancellationToken,
    stats: Arc<AcceptStats>,
}

impl<L: Listener> ThrottledListener<L> {
    /// `cancel` is observed, never triggered, by the listener.
    pub fn new(delegate: L, limiter: TokenBucketLimiter, cancel: CancellationToken) -> Self {
        Self {
            delegate,
            limiter,
            cancel,
            stats: Arc::new(AcceptStats::new()),
        }
    }

    pub fn with_rate(
        delegate: L,
        cancel: CancellationToken,
        refill_interval: Duration,
        bucket_size: u32,
    ) -> Result<Self> {
        let limiter = TokenBucketLimiter::new(refill_interval, bucket_size)?;
        Ok(Self::new(delegate, limiter, cancel))
    }

    pub async fn accept(&self) -> std::result::Result<(L::Conn, SocketAddr), AcceptError<L::Conn>> {
        let (conn, peer) = match self.delegate.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.stats.record_listener_error();
                return Err(AcceptError::Listener(e));
            }
        };
        debug!("ThrottledListener: new connection incoming from {}", peer);

        let started = Instant::now();
        match self.limiter.acquire(&self.cancel).await {
            Ok(()) => {
                self.stats.record_accepted(started.elapsed());
                Ok((conn, peer))
            }
            Err(e) => {
                self.stats.record_canceled(started.elapsed());
                info!("ThrottledListener: error from rate limiter for {}: {}", peer, e);
                Err(AcceptError::Canceled { conn, peer })
            }
        }
    }

    /// Closes the delegate. Accepts blocked on the delegate are woken; accepts
    /// already waiting for a permit are not.
    pub async fn close(&self) -> io::Result<()> {
        self.delegate.close().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.delegate.local_addr()
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    pub fn stats(&self) -> Arc<AcceptStats> {
        self.stats.clone()
    }
}
