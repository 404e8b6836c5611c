//! Zonelimit - Sliding-Window Zone Rate Limiting
//!
//! This crate implements the rate limiting action of a request inspection
//! engine. Each rule carries a directive naming one or more zone selectors and a
//! per-zone event budget over a trailing window. Instances sharing a group key
//! can reconcile their counters through a shared store.

pub mod config;
pub mod error;
pub mod ratelimit;
