//! Incremental extraction of monthly facility indicators from a DHIS2
//! analytics API into a wide, per-facility dataset.

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hierarchy;
pub mod period;
pub mod pipeline;
pub mod pivot;
pub mod store;

pub use crate::client::{AnalyticsSource, Dhis2Client, RetryPolicy};
pub use crate::config::{Credentials, IndicatorCatalog, RunOptions};
pub use crate::error::{ClientError, PipelineError};
pub use crate::period::{Period, RunWindow};
pub use crate::pipeline::{run_extraction, RunSummary};

use tracing_subscriber::{fmt, EnvFilter};

/// Log to stderr, `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}
