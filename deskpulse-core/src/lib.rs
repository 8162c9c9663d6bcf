//! # deskpulse-core
//!
//! Core library for deskpulse - a screen-activity focus tracker.
//!
//! This library provides:
//! - Screen capture sources and image normalization
//! - Batching with a dual size/time flush trigger
//! - Vision analysis with bounded concurrency and retry
//! - Time-bucket aggregation of focus, active time and context switches
//! - Database storage layer with SQLite, including a crash-recovery log
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through the pipeline in one direction:
//! capture → normalize → batch → analyze → aggregate → persist.
//! The [`service::ServiceRunner`] drives it and is the only scheduler besides
//! the per-batch flush timer and the analysis retry timer.
//!
//! ## Example
//!
//! ```rust,no_run
//! use deskpulse_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let today = chrono::Utc::now().date_naive();
//! let metrics = db.daily_metrics(today).expect("failed to load metrics");
//! println!("focus score: {}", metrics.summary.focus_score);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use service::{RunSummary, ServiceRunner, ServiceState};
pub use types::*;

// Public modules
pub mod analysis;
pub mod analytics;
pub mod batch;
pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod service;
pub mod types;
