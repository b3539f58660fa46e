//! # Gridstat - utility usage importer for long-term energy statistics
//!
//! Pulls billing, usage-cost, verified hourly and near-real-time interval
//! readings from a utility account API on an hourly schedule and reconciles
//! them into an append-only statistics store.
//!
//! ## Architecture
//!
//! - `units`: unit conversion and the rolling two-day cutoff windows
//! - `planner`: decides which data sets a cycle requests
//! - `fetcher`: concurrent, retrying calls against the [`api::UtilityApi`]
//! - `merger`: readings to per-meter, per-direction candidate series
//! - `reconciler`: continuation / rebuild / replace writes into the store
//! - `orchestrator`: the refresh state machine
//! - `scheduler`: hourly trigger loop and manual commands
//! - `store`: the [`store::StatisticsStore`] capability and its adapters
//! - `web`: HTTP status and manual refresh (feature `web`)
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! The hourly and interval series of a meter never share a timestamp: hourly
//! points always lie before the cutoff, interval points in `[cutoff, now)`.

pub mod api;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod merger;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod units;
#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used types
pub use api::{ApiError, UtilityApi};
pub use config::Config;
pub use error::{FailureKind, GridstatError, Result};
pub use orchestrator::{CycleContext, CycleState, RefreshOrchestrator, TriggerOutcome};
pub use store::{JsonFileStore, MemoryStore, StatisticsStore};
