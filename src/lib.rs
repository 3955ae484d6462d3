//! # branch_sync
//!
//! Multi-source synchronization engine: replicates ERP tables from many
//! independently operated branch databases into one warehouse, with
//! per-entity fetch policies, dependency filtering, idempotent writes and a
//! durable progress ledger for resuming partial runs.

pub mod cli;
pub mod config;
pub mod db;
pub mod dependency;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod prune;
pub mod retry;
pub mod sources;
pub mod telemetry;
pub mod transform;
pub mod watermark;
pub mod writer;
pub use migration;
