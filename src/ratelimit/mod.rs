//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod diagnostics;
mod distributed;
mod key;
mod limiter;
mod rules;
mod store;

pub use bucket::{BucketState, Consumption};
pub use clock::{Clock, ManualClock, SystemClock};
pub use diagnostics::{CountingDiagnostics, Diagnostics, DiagnosticsSnapshot};
pub use distributed::{DistributedBucketProxy, DistributedSettings};
pub use key::BucketKey;
pub use limiter::{Backend, Decision, RateLimiter, RateLimiterBuilder};
pub use rules::{EndpointPolicy, PolicyTable, RateLimitConfig, RouteRule, Strategy};
pub use store::{LocalBucketStore, LocalOutcome};
