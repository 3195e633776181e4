use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Global flag to control per-buffer tracing on the recording writer thread
pub static BUFFER_TRACING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set per-buffer tracing on/off
pub fn set_buffer_tracing(enabled: bool) {
    BUFFER_TRACING_ENABLED.store(enabled, Ordering::Relaxed);
    info!("Buffer tracing {}", if enabled { "enabled" } else { "disabled" });
}

/// Check if per-buffer tracing is enabled
pub fn buffer_tracing_enabled() -> bool {
    BUFFER_TRACING_ENABLED.load(Ordering::Relaxed)
}

/// Buffer trace macro - only emits if buffer tracing is enabled
#[macro_export]
macro_rules! buffer_trace {
    ($($arg:tt)*) => {
        if $crate::log::BUFFER_TRACING_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::trace!($($arg)*);
        }
    };
}

/// Install a compact fmt subscriber. `RUST_LOG` takes precedence over
/// `default_filter`. Returns false if a global subscriber was already set.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
