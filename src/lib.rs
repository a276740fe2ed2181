pub mod config;
pub mod error;
pub mod analytics;
pub mod limiter;
pub mod transport;
pub mod listener;
pub mod proxy;

pub use error::{AppError, Result};
pub use limiter::TokenBucketLimiter;
pub use listener::{AcceptError, RateLimitedListen, ThrottledListener};
pub use transport::{Listener, TcpAcceptor};
