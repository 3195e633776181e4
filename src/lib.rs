pub mod audio;
pub mod config;
pub mod log;
pub mod permissions;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

// Re-export capture types for hosts and tests
pub use audio::{
    CaptureError, CaptureEvent, CaptureHandle, CaptureOrchestrator, ProcessGroup, ProcessIdentity,
    ProcessKind, RecordingStats, SessionStatus, StreamRecorder,
};
pub use config::CaptureConfig;
pub use permissions::{PermissionGate, PermissionProvider, PermissionStatus};

/// Build an orchestrator over the platform's audio hardware, permission
/// provider and workspace, then run it on the current tokio runtime.
pub fn run(config: CaptureConfig) -> audio::tap::Result<(CaptureHandle, JoinHandle<()>)> {
    config.validate()?;
    log::init_tracing(&config.log_filter);

    let hardware = audio::tap::default_hardware()?;
    let workspace = Arc::new(audio::tap::SystemWorkspace::with_bundle_search_depth(
        config.bundle_search_depth,
    ));
    let orchestrator = CaptureOrchestrator::new(
        hardware,
        permissions::default_permission_provider(),
        workspace,
        config,
    );

    if tokio::runtime::Handle::try_current().is_err() {
        return Err(CaptureError::InvalidState("capture requires a tokio runtime"));
    }

    info!("Starting process audio capture");
    Ok(orchestrator.spawn())
}
