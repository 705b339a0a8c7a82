//! Ratewindow - Bucketed Sliding-Window Rate Limiting
//!
//! This crate counts requests per subject over a trailing time window using
//! coarse time buckets. Windows are kept either in process memory or in a
//! shared store (Redis) guarded by a store-hosted lease lock, so several
//! service instances can enforce one limit together.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
