//! Support for tracing execution of a program.

use tracing_subscriber::{fmt::Subscriber, prelude::*, EnvFilter};

/// The filter we use when `RUST_LOG` is unset. Tunnels that die in the
/// background report themselves at `error`, and teardown failures at `warn`,
/// so those must stay visible by default.
const DEFAULT_FILTER: &str = "warn";

/// Set up the `tracing` library with reasonable options.
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter)
        .finish()
        .init();
}
