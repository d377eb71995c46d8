//! service-core: shared infrastructure for the collections workspace.
//!
//! Environment helpers, tracing setup, retry with backoff, webhook
//! signature verification and a cache for third-party access tokens.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod utils;
