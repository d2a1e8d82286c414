//! Lead Enrichment Library
//!
//! Turns raw business candidates into scored, quality-gated sales leads by
//! calling paid data providers under a budget, with caching and per-provider
//! circuit breakers.
//!
//! # Modules
//!
//! - `budget`: Session budget ledger with per-lead caps.
//! - `cache`: TTL response cache keyed by provider and query.
//! - `cache_validator`: Checksummed cache entries.
//! - `circuit_breaker`: Per-provider circuit breaker.
//! - `config`: Configuration management.
//! - `enrichment`: Candidate validation and normalization.
//! - `errors`: Error handling types.
//! - `models`: Core data models.
//! - `orchestrator`: Batch pipeline driver.
//! - `providers`: Provider adapters and the call gateway.
//! - `quality`: Acceptance rules.
//! - `scoring`: Confidence scoring.
//! - `summary`: Run statistics.

pub mod budget;
pub mod cache;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod enrichment;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod quality;
pub mod scoring;
pub mod summary;

pub use orchestrator::DiscoveryOrchestrator;
pub use summary::RunSummary;
