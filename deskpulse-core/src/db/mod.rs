//! Database layer for deskpulse
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Idempotent capture and bucket upserts
//! - A recovery log of flushed batches that have not been committed yet

pub mod repo;
pub mod schema;

pub use repo::{BatchEvent, Database, PruneStats, StoreStatus};
