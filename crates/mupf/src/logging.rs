//! Log output for binaries built on mupf.
//!
//! The library only emits `tracing` events. [`init`] installs a formatting
//! subscriber filtered by `RUST_LOG`, defaulting to `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global subscriber. Later calls, and calls after another
/// subscriber was installed, do nothing.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
    });
}
