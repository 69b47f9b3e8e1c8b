#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod args;
mod core;
mod engine;
mod error;
pub mod loader;
mod registry;
mod unit;

pub use crate::args::{Argument, Arguments};
pub use crate::core::{Dynamic, Exports, Options, State, UnitId};
pub use crate::engine::{Completion, Diagnostics, Require, Resolver, UnitReport};
pub use crate::error::*;
pub use crate::loader::{Fetcher, ManualFetcher, PoolFetcher};
pub use crate::unit::Definition;

/// Installs a `tracing` subscriber writing to stderr.
///
/// The filter is read from `RUST_LOG` and defaults to `tsunagi=info`. Calling
/// this more than once is harmless, only the first call installs anything.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tsunagi=info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}
