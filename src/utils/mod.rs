//! # Utility Modules
//!
//! Supporting utilities shared by the wire, region and pull layers.
//!
//! ## Components
//! - **Intervals**: disjoint byte-range bookkeeping for out-of-order reassembly
//! - **Logging**: subscriber setup with per-subsystem levels
//! - **Metrics**: Thread-safe observability counters

pub mod intervals;
pub mod logging;
pub mod metrics;

pub use intervals::IntervalSet;
pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
