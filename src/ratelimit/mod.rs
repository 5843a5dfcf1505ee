//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod distributed;
mod estimator;
mod group;
mod key;
mod limiter;
mod shared_bucket;

pub use backend::CapacityGroup;
pub use bucket::{now_secs, Bucket, BucketRate};
pub use distributed::{DistributedBucketGroup, LockPolicy};
pub use estimator::{
    CallKind, CallShape, ChatMessage, CostEstimator, FixedCost, Prompt, TokenEstimator,
};
pub use group::BucketGroup;
pub use key::BucketKey;
pub use limiter::{
    Admission, DistributedRateLimiter, LimitSettings, LocalRateLimiter, RateLimiter,
    REQUESTS_RESOURCE, TOKENS_RESOURCE,
};
pub use shared_bucket::DistributedBucket;
