//! Quotaguard - Dual Quota Enforcement for Rate-Limited APIs
//!
//! This crate keeps callers of a rate-limited API (such as an LLM endpoint
//! with a requests-per-minute and a tokens-per-minute quota) under both
//! limits at once. Each call is priced by a cost estimator and admitted only
//! when a request bucket and a token bucket can both cover it. The buckets
//! live either in process memory or in a shared Redis store, so several
//! processes can draw from one quota.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
