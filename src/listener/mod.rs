pub mod listen;
pub mod throttled;

pub use listen::RateLimitedListen;
pub use throttled::{AcceptError, ThrottledListener};
