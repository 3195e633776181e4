// On-disk bundle detection for process executables

use std::path::{Path, PathBuf};

const BUNDLE_EXTENSIONS: &[&str] = &["app", "appex", "bundle", "framework", "plugin", "xpc", "kext"];

pub const DEFAULT_BUNDLE_SEARCH_DEPTH: usize = 8;

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// A directory with a bundle extension or a `Contents/Info.plist`
pub fn is_bundle(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    match extension(path) {
        Some(ext) if BUNDLE_EXTENSIONS.contains(&ext.as_str()) => true,
        _ => path.join("Contents").join("Info.plist").is_file(),
    }
}

pub fn is_app(path: &Path) -> bool {
    is_bundle(path) && extension(path).as_deref() == Some("app")
}

/// Nearest bundle enclosing `path`, searching at most `max_depth` ancestors
/// above its parent directory
pub fn parent_bundle(path: &Path, max_depth: usize) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .take(max_depth + 1)
        .find(|candidate| !candidate.as_os_str().is_empty() && is_bundle(candidate))
        .map(Path::to_path_buf)
}

/// `com.example.Player` -> `Player`
pub fn last_reverse_dns_component(bundle_id: &str) -> Option<&str> {
    bundle_id.rsplit('.').next().filter(|component| !component.is_empty())
}
