//! Rate limiting logic and state management.

mod backend;
mod fixed_window;
mod key;
mod store;
mod token_bucket;
mod window;

pub use backend::{Rate, RateLimitInfo, RateLimiter};
pub use fixed_window::{FailMode, FixedWindowLimiter};
pub use key::{KeyKind, RateLimitKey};
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore};
pub use token_bucket::TokenBucketLimiter;
pub use window::{CounterKey, FixedWindow, RECORD_TTL_SLACK};
