// Process identities, grouping and ordering
//
// A `ProcessIdentity` is one OS audio-capable process resolved to a friendly
// name and kind. Groups and ordering are always derived from a full snapshot.

use std::cmp::Ordering;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::{AudioObjectId, ProcessId};

/// Whether a process belongs to an application bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Process,
    App,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Process => "process",
            ProcessKind::App => "app",
        }
    }

    pub fn group_title(self) -> &'static str {
        match self {
            ProcessKind::Process => "Processes",
            ProcessKind::App => "Apps",
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A process known to the OS audio layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub name: String,
    pub audio_active: bool,
    pub bundle_id: Option<String>,
    pub bundle_path: Option<PathBuf>,
    pub object_id: AudioObjectId,
}

/// Processes of one kind, derived from a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub id: ProcessKind,
    pub title: String,
    pub members: Vec<ProcessIdentity>,
}

impl ProcessGroup {
    fn empty(kind: ProcessKind) -> Self {
        Self {
            id: kind,
            title: kind.group_title().to_string(),
            members: Vec::new(),
        }
    }

    /// Group `processes` by kind, preserving their order within each group.
    /// Only kinds that occur are returned, sorted by title.
    pub fn groups(processes: &[ProcessIdentity]) -> Vec<ProcessGroup> {
        let mut groups: Vec<ProcessGroup> = Vec::with_capacity(2);

        for process in processes {
            let index = match groups.iter().position(|group| group.id == process.kind) {
                Some(index) => index,
                None => {
                    groups.push(ProcessGroup::empty(process.kind));
                    groups.len() - 1
                }
            };
            groups[index].members.push(process.clone());
        }

        groups.sort_by(|a, b| localized_standard_cmp(&a.title, &b.title));
        groups
    }
}

/// Sort a snapshot so audio-active processes come first, each partition by name
pub fn order_snapshot(processes: &mut [ProcessIdentity]) {
    processes.sort_by(|a, b| {
        b.audio_active
            .cmp(&a.audio_active)
            .then_with(|| localized_standard_cmp(&a.name, &b.name))
    });
}

/// Finder-style name comparison: case-insensitive, digit runs compared by value
pub fn localized_standard_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => break,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_run = take_digits(&mut left);
                let r_run = take_digits(&mut right);
                let ordering = compare_digit_runs(&l_run, &r_run);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                left.next();
                right.next();
                let ordering = l.to_lowercase().cmp(r.to_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }

    // Equal ignoring case; fall back to a stable total order
    a.cmp(b)
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
}
