//! activity-sync - Quota-aware replication of a rate-limited activity API
//!
//! This crate mirrors an athlete's activities into a local SQLite database
//! and enriches them with heart rate and power zone data, while staying
//! inside the upstream's 15-minute and daily request allowances.

pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod otel;
pub mod sync;
pub mod workers;
