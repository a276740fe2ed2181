//! Token bucket that gates accepted connections.
//!
//! The bucket starts full, so `capacity` callers pass straight through. After
//! that one permit accrues per `refill_interval`. Waiters queue on a fair
//! async mutex: only the head of the queue looks at the bucket and sleeps until
//! the next permit, so a refilled permit is handed to exactly one caller, in
//! arrival order.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as WaitQueue;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    available: u32,
    refill_interval: Duration,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: u32, refill_interval: Duration, now: Instant) -> Self {
        Self {
            capacity,
            available: capacity,
            refill_interval,
            last_refill: now,
        }
    }

    /// Adds one permit per whole interval elapsed since the last refill.
    /// The leftover fraction of an interval stays on the clock.
    fn refill(&mut self, now: Instant) {
        if self.available >= self.capacity {
            // A full bucket does not bank time.
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if earned == 0 {
            return;
        }

        let missing = u128::from(self.capacity - self.available);
        if earned >= missing {
            self.available = self.capacity;
            self.last_refill = now;
        } else {
            // earned < missing <= u32::MAX
            let earned = earned as u32;
            self.available += earned;
            self.last_refill += self.refill_interval * earned;
        }
    }

    /// Takes one permit, or reports how long until the next one accrues.
    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.available > 0 {
            self.available -= 1;
            Ok(())
        } else {
            // An interval too long to land on the clock never refills; sleep
            // until canceled.
            let wait = self
                .last_refill
                .checked_add(self.refill_interval)
                .map_or(Duration::MAX, |next| next.saturating_duration_since(now));
            Err(wait)
        }
    }
}

/// Rate limiter handing out one permit per admitted operation.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    bucket: Mutex<Bucket>,
    queue: WaitQueue<()>,
}

impl TokenBucketLimiter {
    /// `refill_interval` is the time it takes for one permit to accrue and
    /// `capacity` the largest burst the bucket will hold.
    pub fn new(refill_interval: Duration, capacity: u32) -> Result<Self> {
        Self::validate(refill_interval, capacity)?;

        Ok(Self {
            bucket: Mutex::new(Bucket::full(capacity, refill_interval, Instant::now())),
            queue: WaitQueue::new(()),
        })
    }

    pub fn validate(refill_interval: Duration, capacity: u32) -> Result<()> {
        if refill_interval.is_zero() {
            return Err(AppError::InvalidConfig(
                "refill interval must be greater than zero".into(),
            ));
        }
        if capacity == 0 {
            return Err(AppError::InvalidConfig(
                "bucket capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Waits for a permit and takes it.
    ///
    /// Returns [`AppError::Canceled`] as soon as `cancel` fires, without
    /// consuming a permit. An already-canceled token fails immediately.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AppError::Canceled);
        }

        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Canceled),
            turn = self.queue.lock() => turn,
        };

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                match bucket.try_take(Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Canceled),
                _ = sleep(wait) => {}
            }
        }
    }

    /// Takes a permit only if one is available right now and nobody is
    /// already queued for it.
    pub fn try_acquire(&self) -> bool {
        let Ok(_turn) = self.queue.try_lock() else {
            return false;
        };
        self.bucket.lock().try_take(Instant::now()).is_ok()
    }

    /// Permits currently in the bucket, after accounting for elapsed time.
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.available
    }

    pub fn capacity(&self) -> u32 {
        self.bucket.lock().capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.bucket.lock().refill_interval
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::Arc;
    use tokio::time::advance;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(matches!(
            TokenBucketLimiter::new(Duration::ZERO, 1),
            Err(AppError::InvalidConfig(_))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(INTERVAL, 0),
            Err(AppError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_bound() {
        let limiter = TokenBucketLimiter::new(INTERVAL, 3).unwrap();
        assert_eq!(limiter.available(), 3);

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_timing() {
        let limiter = TokenBucketLimiter::new(INTERVAL, 1).unwrap();
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire(&cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= INTERVAL);
        assert!(waited < INTERVAL + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_interval_is_carried() {
        let limiter = TokenBucketLimiter::new(INTERVAL, 5).unwrap();
        while limiter.try_acquire() {}

        advance(Duration::from_millis(250)).await;
        assert_eq!(limiter.available(), 2);

        // 50ms left over from the previous read plus 50ms more.
        advance(Duration::from_millis(50)).await;
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let limiter = TokenBucketLimiter::new(INTERVAL, 4).unwrap();
        while limiter.try_acquire() {}

        advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.available(), 4);

        // A full bucket banks nothing, so the fifth permit still needs a full interval.
        for _ in 0..4 {
            assert!(limiter.try_acquire());
        }
        advance(INTERVAL - Duration::from_millis(1)).await;
        assert!(!limiter.try_acquire());
        advance(Duration::from_millis(1)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_before_wait() {
        let limiter = TokenBucketLimiter::new(INTERVAL, 1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_wait_keeps_permit() {
        let limiter = Arc::new(TokenBucketLimiter::new(INTERVAL, 1).unwrap());
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        advance(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(result.unwrap_err().is_canceled());

        advance(INTERVAL).await;
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_every_queued_waiter() {
        let limiter = Arc::new(TokenBucketLimiter::new(INTERVAL, 1).unwrap());
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { limiter.acquire(&cancel).await })
            })
            .collect();

        advance(Duration::from_millis(10)).await;
        cancel.cancel();

        for result in join_all(waiters).await {
            assert!(result.unwrap().unwrap_err().is_canceled());
        }

        advance(INTERVAL).await;
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_interval_waits_until_canceled() {
        let limiter = Arc::new(TokenBucketLimiter::new(Duration::MAX, 1).unwrap());
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        advance(Duration::from_secs(3600)).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_canceled());
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_double_grant_under_contention() {
        let limiter = Arc::new(TokenBucketLimiter::new(INTERVAL, 2).unwrap());
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&cancel).await.unwrap();
                start.elapsed()
            }));
        }

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        finished.sort();

        let immediate = finished.iter().filter(|d| d.is_zero()).count();
        assert_eq!(immediate, 2);
        assert_eq!(finished[2], INTERVAL);
        assert_eq!(finished[3], INTERVAL * 2);
        assert_eq!(finished[4], INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let limiter = Arc::new(TokenBucketLimiter::new(INTERVAL, 1).unwrap());
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for id in 0..3 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                limiter.acquire(&cancel).await.unwrap();
                tx.send(id).unwrap();
            });
            // Let each waiter reach the queue before the next one arrives.
            tokio::task::yield_now().await;
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(id) = rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }
}
