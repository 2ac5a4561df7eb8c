//! Run an arbitrary executable as a supervised background service.
//!
//! The [`Supervisor`] starts the configured process, captures its output through
//! the configured rotation policy and reports every lifecycle transition to the
//! platform's service manager.

mod catch;
mod factory;
mod runner;

pub use catch::Recover;
pub use factory::{PlatformProcessManagerFactory, create_process_manager, default_status_sink};
pub use runner::*;
pub use svcwrap_core::*;

/// Install the global tracing subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
