//! metering-service: usage metering and quota enforcement engine.
//!
//! Two-tier architecture: an atomic hot counter store makes admission
//! decisions at request latency, and a periodic scheduler reconciles hot
//! deltas into a durable, queryable usage ledger via watermarked additive
//! merges. Reporting and alerting read the ledger; enforcement never does.

pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;
