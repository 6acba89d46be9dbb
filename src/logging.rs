use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber once for the process.
///
/// The bridge's `debug` flag picks the default filter level; `RUST_LOG`
/// still wins when set so embedders can raise verbosity per target.
pub fn init(debug: bool) {
    INIT.call_once(|| {
        let default_directive = if debug { "tunlink=debug" } else { "tunlink=warn" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        // try_init: the embedder may already have a subscriber installed.
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}
