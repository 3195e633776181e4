// Process registry - the ordered snapshot of OS audio processes
//
// `refresh` rebuilds the canonical snapshot from the HAL process list and the
// workspace's running applications. Groups are derived state: whoever owns the
// registry calls `recompute_groups` after a refresh reports a change.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::bundle::{is_app, last_reverse_dns_component, parent_bundle, DEFAULT_BUNDLE_SEARCH_DEPTH};
use super::hardware::{AudioHardware, HardwareResult};
use super::process::{order_snapshot, ProcessGroup, ProcessIdentity, ProcessKind};
use super::process_discovery::{ApplicationWatcher, RunningApplication, Workspace};
use super::types::{AudioObjectId, ProcessId, Result};

pub struct ProcessRegistry {
    hardware: Arc<dyn AudioHardware>,
    workspace: Arc<dyn Workspace>,
    bundle_search_depth: usize,
    processes: Vec<ProcessIdentity>,
    groups: Vec<ProcessGroup>,
    watcher: Option<ApplicationWatcher>,
}

impl ProcessRegistry {
    pub fn new(hardware: Arc<dyn AudioHardware>, workspace: Arc<dyn Workspace>) -> Self {
        Self {
            hardware,
            workspace,
            bundle_search_depth: DEFAULT_BUNDLE_SEARCH_DEPTH,
            processes: Vec::new(),
            groups: Vec::new(),
            watcher: None,
        }
    }

    pub fn with_bundle_search_depth(mut self, depth: usize) -> Self {
        self.bundle_search_depth = depth;
        self
    }

    /// Current ordered snapshot
    pub fn processes(&self) -> &[ProcessIdentity] {
        &self.processes
    }

    pub fn groups(&self) -> &[ProcessGroup] {
        &self.groups
    }

    pub fn process(&self, pid: ProcessId) -> Option<&ProcessIdentity> {
        self.processes.iter().find(|process| process.id == pid)
    }

    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }

    /// Subscribe to running application changes. `on_change` receives the
    /// initial list and each later change, without the host process.
    /// No-op when already active.
    pub fn activate<F>(&mut self, poll_interval: Duration, on_change: F) -> Result<()>
    where
        F: Fn(Vec<RunningApplication>) + Send + 'static,
    {
        debug!("ProcessRegistry::activate");

        if self.watcher.is_some() {
            return Ok(());
        }

        let host_pid = std::process::id() as ProcessId;
        let watcher = ApplicationWatcher::spawn(self.workspace.clone(), poll_interval, host_pid, on_change)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn deactivate(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }

    /// Rebuild the snapshot from the HAL process list.
    ///
    /// Returns whether the snapshot changed. Processes whose audio object can
    /// no longer be read are skipped.
    pub fn refresh(&mut self, apps: &[RunningApplication]) -> Result<bool> {
        debug!("ProcessRegistry::refresh");

        let objects = self.hardware.process_objects()?;

        let mut processes: Vec<ProcessIdentity> = objects
            .into_iter()
            .filter_map(|object| match self.resolve(object, apps) {
                Ok(process) => Some(process),
                Err(e) => {
                    warn!("Failed to read process with object ID #{}: {}", object, e);
                    None
                }
            })
            .collect();

        order_snapshot(&mut processes);
        Ok(self.set_snapshot(processes))
    }

    /// Replace the snapshot if it differs from the current one
    pub fn set_snapshot(&mut self, processes: Vec<ProcessIdentity>) -> bool {
        if processes == self.processes {
            return false;
        }
        self.processes = processes;
        true
    }

    pub fn recompute_groups(&mut self) {
        self.groups = ProcessGroup::groups(&self.processes);
    }

    fn resolve(&self, object: AudioObjectId, apps: &[RunningApplication]) -> HardwareResult<ProcessIdentity> {
        let pid = self.hardware.process_pid(object)?;
        let audio_active = self.hardware.process_is_running(object).unwrap_or_else(|e| {
            debug!("Could not read running state of #{}: {}", object, e);
            false
        });

        if let Some(app) = apps.iter().find(|app| app.pid == pid) {
            return Ok(ProcessIdentity {
                id: pid,
                kind: ProcessKind::App,
                name: app.display_name(),
                audio_active,
                bundle_id: app.bundle_id.clone().filter(|id| !id.is_empty()),
                bundle_path: app.bundle_path.clone(),
                object_id: object,
            });
        }

        let bundle_id = self.hardware.process_bundle_id(object).ok().flatten();

        let (name, bundle_path) = if let Some(info) = self.workspace.process_info(pid) {
            (info.name, parent_bundle(&info.path, self.bundle_search_depth))
        } else if let Some(component) = bundle_id.as_deref().and_then(last_reverse_dns_component) {
            (component.to_string(), None)
        } else {
            (format!("Unknown ({})", pid), None)
        };

        let kind = match bundle_path.as_deref() {
            Some(path) if is_app(path) => ProcessKind::App,
            _ => ProcessKind::Process,
        };

        Ok(ProcessIdentity {
            id: pid,
            kind,
            name,
            audio_active,
            bundle_id,
            bundle_path,
            object_id: object,
        })
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.deactivate();
    }
}
