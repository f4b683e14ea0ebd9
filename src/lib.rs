//! Conversion Delivery Library
//!
//! Reports funnel conversions (lead, qualified lead, scheduled visit) to ad
//! platform conversion APIs exactly once per entity and level.
//!
//! # Modules
//!
//! - `audit`: Append-only delivery audit log with bounded write retries.
//! - `circuit_breaker`: Per-provider breaker.
//! - `claim_store`: Atomic claim/commit/rollback of `(entity, level)` slots.
//! - `config`: Configuration management.
//! - `credentials`: Per-direction provider credential lookup.
//! - `db`: Database connection and schema bootstrap.
//! - `engine`: The delivery pipeline tying everything together.
//! - `errors`: Delivery outcome taxonomy and HTTP error types.
//! - `event_id`: Deterministic event id derivation.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `pii`: PII normalization and SHA-256 hashing.
//! - `providers`: Meta and TikTok payload adapters.
//! - `transport`: Retrying HTTP transport.

pub mod audit;
pub mod circuit_breaker;
pub mod claim_store;
pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod errors;
pub mod event_id;
pub mod handlers;
pub mod models;
pub mod pii;
pub mod providers;
pub mod transport;
