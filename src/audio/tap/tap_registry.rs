// Keyed ownership of live process taps
//
// Recorders never hold a `ProcessTap` directly. They hold a `TapHandle`, and
// every access goes through the registry, which answers `Unavailable` once the
// tap has been removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::process_tap::ProcessTap;
use super::types::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TapKey(u64);

impl std::fmt::Display for TapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tap#{}", self.0)
    }
}

#[derive(Default)]
pub struct TapRegistry {
    taps: Mutex<HashMap<TapKey, ProcessTap>>,
    next_key: AtomicU64,
}

impl TapRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn taps(&self) -> MutexGuard<'_, HashMap<TapKey, ProcessTap>> {
        self.taps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `tap` and return a handle to it
    pub fn insert(self: &Arc<Self>, tap: ProcessTap) -> TapHandle {
        let key = TapKey(self.next_key.fetch_add(1, Ordering::Relaxed) + 1);
        self.taps().insert(key, tap);
        TapHandle {
            key,
            registry: Arc::clone(self),
        }
    }

    /// Run `f` on the tap behind `key`
    pub fn with_tap<R>(&self, key: TapKey, f: impl FnOnce(&mut ProcessTap) -> R) -> Result<R> {
        let mut taps = self.taps();
        let tap = taps.get_mut(&key).ok_or(CaptureError::Unavailable)?;
        Ok(f(tap))
    }

    /// Release the tap behind `key`. The caller decides when it is dropped.
    pub fn remove(&self, key: TapKey) -> Option<ProcessTap> {
        self.taps().remove(&key)
    }

    pub fn contains(&self, key: TapKey) -> bool {
        self.taps().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.taps().len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps().is_empty()
    }
}

/// Non-owning reference to a tap held by a `TapRegistry`
#[derive(Clone)]
pub struct TapHandle {
    key: TapKey,
    registry: Arc<TapRegistry>,
}

impl TapHandle {
    pub fn key(&self) -> TapKey {
        self.key
    }

    pub fn is_alive(&self) -> bool {
        self.registry.contains(self.key)
    }

    pub fn with_tap<R>(&self, f: impl FnOnce(&mut ProcessTap) -> R) -> Result<R> {
        self.registry.with_tap(self.key, f)
    }
}

impl std::fmt::Debug for TapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapHandle").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tap::fake_hardware::FakeAudioHardware;

    #[test]
    fn test_removed_tap_is_unavailable() {
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let handle = registry.insert(ProcessTap::new(hardware, Vec::new(), false));

        assert!(handle.is_alive());
        assert!(handle.with_tap(|tap| tap.is_activated()).is_ok());

        let tap = registry.remove(handle.key());
        assert!(tap.is_some());
        assert!(!handle.is_alive());
        assert!(matches!(handle.with_tap(|_| ()), Err(CaptureError::Unavailable)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_keys_are_not_reused() {
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();

        let first = registry.insert(ProcessTap::new(hardware.clone(), Vec::new(), false));
        registry.remove(first.key());
        let second = registry.insert(ProcessTap::new(hardware, Vec::new(), false));

        assert_ne!(first.key(), second.key());
        assert!(!first.is_alive());
    }
}
