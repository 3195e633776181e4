// System audio capture permission (TCC) checking and requests
//
// `PermissionGate` holds the authorization status the capture pipeline acts on.
// How the status is looked up is behind `PermissionProvider`: the TCC provider
// on macOS, a static provider for tests and other platforms.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Authorization status for system audio capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Unknown,
    Authorized,
    Denied,
}

impl PermissionStatus {
    pub fn from_grant(granted: bool) -> Self {
        if granted {
            PermissionStatus::Authorized
        } else {
            PermissionStatus::Denied
        }
    }
}

/// Completion for a permission request. Called once, from any thread.
pub type PermissionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[cfg_attr(test, mockall::automock)]
pub trait PermissionProvider: Send + Sync {
    fn status(&self) -> PermissionStatus;

    fn request(&self, on_result: PermissionCallback);

    /// Send the user to the system privacy settings
    fn open_settings(&self) -> anyhow::Result<()>;
}

/// Current permission status plus the provider that resolves it.
///
/// Provider callbacks never touch the gate; the owner hands results back
/// through `apply` on its own context.
pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    status: PermissionStatus,
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        let status = provider.status();
        debug!("Initial audio capture permission: {:?}", status);
        Self { provider, status }
    }

    pub fn status(&self) -> PermissionStatus {
        self.status
    }

    /// Re-read the status from the provider
    pub fn refresh(&mut self) -> PermissionStatus {
        self.status = self.provider.status();
        self.status
    }

    pub fn request(&self, on_result: PermissionCallback) {
        info!("Requesting system audio capture permission");
        self.provider.request(on_result);
    }

    /// Record the outcome of a request
    pub fn apply(&mut self, granted: bool) -> PermissionStatus {
        self.status = PermissionStatus::from_grant(granted);
        info!("Audio capture permission {:?}", self.status);
        self.status
    }

    pub fn open_settings(&self) -> anyhow::Result<()> {
        self.provider.open_settings()
    }
}

/// Fixed status and request outcome, delivered from a separate thread
pub struct StaticPermissionProvider {
    status: Mutex<PermissionStatus>,
    grant: bool,
    requests: AtomicUsize,
    settings_opened: AtomicUsize,
}

impl StaticPermissionProvider {
    pub fn new(status: PermissionStatus, grant: bool) -> Self {
        Self {
            status: Mutex::new(status),
            grant,
            requests: AtomicUsize::new(0),
            settings_opened: AtomicUsize::new(0),
        }
    }

    pub fn authorized() -> Self {
        Self::new(PermissionStatus::Authorized, true)
    }

    pub fn set_status(&self, status: PermissionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn settings_open_count(&self) -> usize {
        self.settings_opened.load(Ordering::SeqCst)
    }
}

impl PermissionProvider for StaticPermissionProvider {
    fn status(&self) -> PermissionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, on_result: PermissionCallback) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let granted = self.grant;
        std::thread::spawn(move || on_result(granted));
    }

    fn open_settings(&self) -> anyhow::Result<()> {
        self.settings_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider for the current platform
pub fn default_permission_provider() -> Arc<dyn PermissionProvider> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(tcc::TccPermissionProvider::new())
    }

    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(StaticPermissionProvider::authorized())
    }
}

#[cfg(target_os = "macos")]
pub use tcc::TccPermissionProvider;

#[cfg(target_os = "macos")]
mod tcc {
    use std::ffi::{c_void, CString};
    use std::process::Command;
    use std::ptr;
    use std::sync::{Mutex, OnceLock, PoisonError};

    use block2::{Block, RcBlock};
    use core_foundation::base::TCFType;
    use core_foundation::string::{CFString, CFStringRef};
    use objc2::runtime::Bool;
    use tracing::{error, info};

    use super::{PermissionCallback, PermissionProvider, PermissionStatus};

    const TCC_PATH: &str = "/System/Library/PrivateFrameworks/TCC.framework/Versions/A/TCC";
    const AUDIO_CAPTURE_SERVICE: &str = "kTCCServiceAudioCapture";
    const PRIVACY_SETTINGS_URL: &str =
        "x-apple.systempreferences:com.apple.preference.security?Privacy_AudioCapture";

    type PreflightFn = unsafe extern "C" fn(CFStringRef, *const c_void) -> i32;
    type RequestFn = unsafe extern "C" fn(CFStringRef, *const c_void, *const Block<dyn Fn(Bool)>);

    struct TccApi {
        preflight: Option<PreflightFn>,
        request: Option<RequestFn>,
    }

    fn api() -> &'static TccApi {
        static API: OnceLock<TccApi> = OnceLock::new();
        API.get_or_init(|| unsafe { load_api() })
    }

    unsafe fn load_api() -> TccApi {
        let Ok(path) = CString::new(TCC_PATH) else {
            return TccApi { preflight: None, request: None };
        };
        let handle = libc::dlopen(path.as_ptr(), libc::RTLD_NOW);
        if handle.is_null() {
            error!("dlopen failed for {}", TCC_PATH);
            return TccApi { preflight: None, request: None };
        }

        let symbol = |name: &str| -> *mut c_void {
            match CString::new(name) {
                Ok(name) => libc::dlsym(handle, name.as_ptr()),
                Err(_) => ptr::null_mut(),
            }
        };

        let preflight = symbol("TCCAccessPreflight");
        let request = symbol("TCCAccessRequest");

        TccApi {
            preflight: (!preflight.is_null()).then(|| std::mem::transmute::<*mut c_void, PreflightFn>(preflight)),
            request: (!request.is_null()).then(|| std::mem::transmute::<*mut c_void, RequestFn>(request)),
        }
    }

    /// Status and requests through the private TCC framework
    #[derive(Default)]
    pub struct TccPermissionProvider;

    impl TccPermissionProvider {
        pub fn new() -> Self {
            Self
        }
    }

    impl PermissionProvider for TccPermissionProvider {
        fn status(&self) -> PermissionStatus {
            let Some(preflight) = api().preflight else {
                error!("TCCAccessPreflight missing");
                return PermissionStatus::Unknown;
            };

            let service = CFString::from_static_string(AUDIO_CAPTURE_SERVICE);
            match unsafe { preflight(service.as_concrete_TypeRef(), ptr::null()) } {
                0 => PermissionStatus::Authorized,
                1 => PermissionStatus::Denied,
                _ => PermissionStatus::Unknown,
            }
        }

        fn request(&self, on_result: PermissionCallback) {
            let Some(request) = api().request else {
                error!("TCCAccessRequest missing");
                return;
            };

            let pending = Mutex::new(Some(on_result));
            let block = RcBlock::new(move |granted: Bool| {
                info!("Permission request finished with result: {}", granted.as_bool());
                let callback = pending.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(callback) = callback {
                    callback(granted.as_bool());
                }
            });

            let service = CFString::from_static_string(AUDIO_CAPTURE_SERVICE);
            unsafe { request(service.as_concrete_TypeRef(), ptr::null(), &*block) };
        }

        fn open_settings(&self) -> anyhow::Result<()> {
            info!("Opening macOS Privacy settings for audio capture");
            Command::new("open").arg(PRIVACY_SETTINGS_URL).spawn()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_gate_reads_initial_status() {
        let mut provider = MockPermissionProvider::new();
        provider.expect_status().times(1).return_const(PermissionStatus::Denied);

        let gate = PermissionGate::new(Arc::new(provider));
        assert_eq!(gate.status(), PermissionStatus::Denied);
    }

    #[test]
    fn test_apply_is_the_only_mutation() {
        let provider = Arc::new(StaticPermissionProvider::new(PermissionStatus::Unknown, true));
        let mut gate = PermissionGate::new(provider.clone());

        let (tx, rx) = mpsc::channel();
        gate.request(Box::new(move |granted| tx.send(granted).unwrap()));
        let granted = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // Delivery alone leaves the gate untouched
        assert_eq!(gate.status(), PermissionStatus::Unknown);
        assert_eq!(gate.apply(granted), PermissionStatus::Authorized);
        assert_eq!(provider.request_count(), 1);
    }

    #[test]
    fn test_refresh_rereads_provider() {
        let provider = Arc::new(StaticPermissionProvider::new(PermissionStatus::Unknown, false));
        let mut gate = PermissionGate::new(provider.clone());

        provider.set_status(PermissionStatus::Denied);
        assert_eq!(gate.refresh(), PermissionStatus::Denied);
    }
}
