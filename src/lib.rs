//! Tollgate - Token Bucket Admission Control
//!
//! This crate puts a token-bucket rate limiter in front of an HTTP service.
//! Every request is keyed by client identity and endpoint class; buckets live
//! either in process or in a Redis store shared by all replicas, and the
//! limiter fails open when that store misbehaves.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
