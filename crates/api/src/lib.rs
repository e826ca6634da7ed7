//! HTTP API: task submission, status and cancellation behind tiered rate limits.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
