//! Tracing setup
//!
//! The subscriber is installed before configuration is loaded so config
//! diagnostics reach the log. The configured `[logging] level` is applied
//! afterwards through a reload handle, unless `RUST_LOG` is set.

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Level used until the configuration has been read
pub const DEFAULT_LEVEL: &str = "info";

/// Handle for swapping the active filter after startup
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

impl LogLevelHandle {
    /// Switch to `level`; a no-op when `RUST_LOG` chose the filter
    pub fn apply(&self, level: &str) {
        if self.env_override {
            tracing::debug!(level, "RUST_LOG set, ignoring configured log level");
            return;
        }
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if let Err(e) = self.handle.reload(filter) {
                    tracing::warn!("Failed to apply log level '{}': {}", level, e);
                }
            }
            Err(e) => tracing::warn!("Invalid log level '{}': {}", level, e),
        }
    }
}

/// Subscriber writing to `make_writer` behind a reloadable filter
pub fn layered<W>(
    make_writer: W,
    filter: EnvFilter,
    env_override: bool,
) -> (impl Subscriber + Send + Sync + 'static, LogLevelHandle)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let (filter, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(make_writer));
    (subscriber, LogLevelHandle { handle, env_override })
}

/// Install the global subscriber, filtered by `RUST_LOG` or [`DEFAULT_LEVEL`]
pub fn init_tracing() -> LogLevelHandle {
    let (filter, env_override) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LEVEL), false),
    };
    let (subscriber, handle) = layered(std::io::stdout, filter, env_override);
    subscriber.init();
    handle
}
