use tracing_subscriber::EnvFilter;

use crate::config::Environment;

/// Initialize tracing for the process. `RUST_LOG` overrides the default `info`.
///
/// Development gets human-readable lines, everything else JSON.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(environment: Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if environment.is_development() {
        builder.try_init()
    } else {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
    };
}
