// Running application discovery and change notifications
//
// `Workspace` is the OS application registry as seen by the process registry:
// the list of running applications plus a pid -> (name, executable path)
// lookup. `ApplicationWatcher` turns polling of a workspace into an initial
// snapshot followed by change notifications.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bundle::{is_app, last_reverse_dns_component, parent_bundle, DEFAULT_BUNDLE_SEARCH_DEPTH};
use super::types::{CaptureError, ProcessId, Result};

/// An application record from the OS workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningApplication {
    pub pid: ProcessId,
    pub localized_name: Option<String>,
    pub bundle_id: Option<String>,
    pub bundle_path: Option<PathBuf>,
}

impl RunningApplication {
    /// Localized name, else bundle file name, else bundle id suffix
    pub fn display_name(&self) -> String {
        if let Some(name) = self.localized_name.as_deref().filter(|name| !name.is_empty()) {
            return name.to_string();
        }
        if let Some(stem) = self
            .bundle_path
            .as_deref()
            .and_then(Path::file_stem)
            .and_then(|stem| stem.to_str())
        {
            return stem.to_string();
        }
        if let Some(component) = self.bundle_id.as_deref().and_then(last_reverse_dns_component) {
            return component.to_string();
        }
        format!("Unknown {}", self.pid)
    }
}

/// Short name and executable path of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixProcessInfo {
    pub name: String,
    pub path: PathBuf,
}

#[cfg_attr(test, mockall::automock)]
pub trait Workspace: Send + Sync {
    fn running_applications(&self) -> Vec<RunningApplication>;

    fn process_info(&self, pid: ProcessId) -> Option<PosixProcessInfo>;
}

/// Workspace backed by the system process table
pub struct SystemWorkspace {
    system: Mutex<System>,
    bundle_search_depth: usize,
}

impl SystemWorkspace {
    pub fn new() -> Self {
        Self::with_bundle_search_depth(DEFAULT_BUNDLE_SEARCH_DEPTH)
    }

    pub fn with_bundle_search_depth(bundle_search_depth: usize) -> Self {
        Self {
            system: Mutex::new(System::new()),
            bundle_search_depth,
        }
    }
}

impl Default for SystemWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace for SystemWorkspace {
    fn running_applications(&self) -> Vec<RunningApplication> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();

        let mut apps: Vec<RunningApplication> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let exe = process.exe()?;
                let bundle = parent_bundle(exe, self.bundle_search_depth).filter(|path| is_app(path))?;
                let (bundle_id, localized_name) = bundle_metadata(&bundle);
                Some(RunningApplication {
                    pid: pid.as_u32() as ProcessId,
                    localized_name,
                    bundle_id,
                    bundle_path: Some(bundle),
                })
            })
            .collect();

        apps.sort_by_key(|app| app.pid);
        debug!("Found {} running applications", apps.len());
        apps
    }

    fn process_info(&self, pid: ProcessId) -> Option<PosixProcessInfo> {
        #[cfg(target_os = "macos")]
        {
            if let Some(info) = macos::proc_info(pid) {
                return Some(info);
            }
        }

        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let sys_pid = Pid::from_u32(pid as u32);
        system.refresh_process(sys_pid);
        let process = system.process(sys_pid)?;
        Some(PosixProcessInfo {
            name: process.name().to_string(),
            path: process.exe()?.to_path_buf(),
        })
    }
}

#[cfg(target_os = "macos")]
fn bundle_metadata(bundle: &Path) -> (Option<String>, Option<String>) {
    macos::bundle_metadata(bundle)
}

#[cfg(not(target_os = "macos"))]
fn bundle_metadata(_bundle: &Path) -> (Option<String>, Option<String>) {
    (None, None)
}

#[cfg(target_os = "macos")]
mod macos {
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_void};
    use std::path::{Path, PathBuf};

    use core_foundation::bundle::CFBundle;
    use core_foundation::string::CFString;
    use core_foundation::url::CFURL;

    use super::PosixProcessInfo;
    use crate::audio::tap::types::ProcessId;

    const PATH_BUFFER_LEN: usize = 4096;

    /// `(CFBundleIdentifier, CFBundleName)` from the bundle's Info.plist
    pub fn bundle_metadata(bundle: &Path) -> (Option<String>, Option<String>) {
        let Some(url) = CFURL::from_path(bundle, true) else {
            return (None, None);
        };
        let Some(bundle) = CFBundle::new(url) else {
            return (None, None);
        };
        let info = bundle.info_dictionary();

        let read = |key: &'static str| {
            info.find(&CFString::from_static_string(key))
                .and_then(|value| value.downcast::<CFString>())
                .map(|value| value.to_string())
                .filter(|value| !value.is_empty())
        };

        let name = read("CFBundleDisplayName").or_else(|| read("CFBundleName"));
        (read("CFBundleIdentifier"), name)
    }

    pub fn proc_info(pid: ProcessId) -> Option<PosixProcessInfo> {
        let mut name = [0 as c_char; PATH_BUFFER_LEN];
        let mut path = [0 as c_char; PATH_BUFFER_LEN];

        let (name_len, path_len) = unsafe {
            (
                libc::proc_name(pid, name.as_mut_ptr() as *mut c_void, PATH_BUFFER_LEN as u32),
                libc::proc_pidpath(pid, path.as_mut_ptr() as *mut c_void, PATH_BUFFER_LEN as u32),
            )
        };
        if name_len <= 0 || path_len <= 0 {
            return None;
        }

        let name = unsafe { CStr::from_ptr(name.as_ptr()) }.to_string_lossy().into_owned();
        let path = unsafe { CStr::from_ptr(path.as_ptr()) }.to_string_lossy().into_owned();
        Some(PosixProcessInfo {
            name,
            path: PathBuf::from(path),
        })
    }
}

/// Polls a workspace and reports the running applications whenever they change
pub struct ApplicationWatcher {
    task: JoinHandle<()>,
}

impl ApplicationWatcher {
    /// Start watching on the current tokio runtime. `on_change` receives the
    /// initial snapshot and then every snapshot that differs from the last,
    /// always without `exclude_pid`.
    pub fn spawn<F>(
        workspace: Arc<dyn Workspace>,
        interval: Duration,
        exclude_pid: ProcessId,
        on_change: F,
    ) -> Result<Self>
    where
        F: Fn(Vec<RunningApplication>) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CaptureError::InvalidState("application watcher requires a tokio runtime"))?;

        info!("Watching running applications every {:?}", interval);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Vec<RunningApplication>> = None;

            loop {
                ticker.tick().await;

                let source = workspace.clone();
                let apps = match tokio::task::spawn_blocking(move || source.running_applications()).await {
                    Ok(apps) => apps,
                    Err(e) => {
                        warn!("Application list refresh failed: {}", e);
                        continue;
                    }
                };

                let apps: Vec<RunningApplication> =
                    apps.into_iter().filter(|app| app.pid != exclude_pid).collect();

                if last.as_ref() == Some(&apps) {
                    continue;
                }

                debug!("Running applications changed ({} apps)", apps.len());
                last = Some(apps.clone());
                on_change(apps);
            }
        });

        Ok(Self { task })
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ApplicationWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn app(pid: ProcessId, name: &str) -> RunningApplication {
        RunningApplication {
            pid,
            localized_name: Some(name.to_string()),
            bundle_id: None,
            bundle_path: None,
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut record = RunningApplication {
            pid: 77,
            localized_name: None,
            bundle_id: Some("com.example.Player".to_string()),
            bundle_path: Some(PathBuf::from("/Applications/Player Pro.app")),
        };
        assert_eq!(record.display_name(), "Player Pro");

        record.bundle_path = None;
        assert_eq!(record.display_name(), "Player");

        record.bundle_id = None;
        assert_eq!(record.display_name(), "Unknown 77");

        record.localized_name = Some("Music".to_string());
        assert_eq!(record.display_name(), "Music");
    }

    #[tokio::test]
    async fn test_watcher_reports_changes_only() {
        let snapshots = Arc::new(Mutex::new(vec![
            vec![app(1, "Host"), app(2, "Music")],
            vec![app(1, "Host"), app(2, "Music")],
            vec![app(1, "Host"), app(2, "Music"), app(3, "Safari")],
        ]));

        let mut workspace = MockWorkspace::new();
        let source = snapshots.clone();
        workspace.expect_running_applications().returning(move || {
            let mut pending = source.lock().unwrap();
            if pending.len() > 1 {
                pending.remove(0)
            } else {
                pending[0].clone()
            }
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (counter, sink) = (calls.clone(), received.clone());

        let watcher = ApplicationWatcher::spawn(Arc::new(workspace), Duration::from_millis(5), 1, move |apps| {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().unwrap().push(apps);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.stop();

        let received = received.lock().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(received[0], vec![app(2, "Music")]);
        assert_eq!(received[1], vec![app(2, "Music"), app(3, "Safari")]);
    }

    #[test]
    fn test_watcher_requires_runtime() {
        let workspace = MockWorkspace::new();
        let result = ApplicationWatcher::spawn(Arc::new(workspace), Duration::from_millis(5), 1, |_| {});
        assert!(matches!(result, Err(CaptureError::InvalidState(_))));
    }
}
