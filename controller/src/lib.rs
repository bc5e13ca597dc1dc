mod controller;
mod metrics;

pub mod classifier;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod planner;
pub mod reconciler;
pub mod selector;
pub mod telemetry;

pub use crate::controller::{backoff_delay, Context, ShimController};
pub use crate::metrics::ShimControllerMetrics;
