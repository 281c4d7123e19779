//! Infergate - an authenticating, load-balancing gateway for inference backends
//!
//! This library provides a streaming reverse proxy that:
//! - Rejects requests without a known bearer token before any backend work
//! - Picks a backend by least connections (or round-robin / random)
//! - Marks backends up and down from periodic health probes with hysteresis
//! - Relays request and response bodies frame by frame, never buffering them
//! - Reuses keep-alive connections to backends through a connection pool
//! - Swaps credentials and backends atomically on configuration reload

pub mod accesslog;
pub mod admin;
pub mod auth;
pub mod body;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod loadbalancer;
pub mod pool;
pub mod proxy;
pub mod state;
