//! # Pipes
//!
//! Per-workspace sync engine between a central time-tracking service and
//! third-party project-management services: a leased job queue with a worker
//! pool, OAuth credential refresh, foreign/local ID reconciliation and a
//! dependency-ordered sync pipeline.

pub mod central;
pub mod config;
pub mod db;
pub mod error;
pub mod integrations;
pub mod models;
pub mod oauth;
pub mod queue;
pub mod repositories;
pub mod scheduler;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod types;
pub use migration;
