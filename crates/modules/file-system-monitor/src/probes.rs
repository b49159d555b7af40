//! Catalogue of the instrumented kernel functions.

use probe_core::event::EventKind;
use strum::IntoEnumIterator;

/// A kprobe/kretprobe pair and the event kind it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeKind {
    kind: EventKind,
    function: &'static str,
}

impl ProbeKind {
    pub fn of(kind: EventKind) -> Self {
        let function = match kind {
            EventKind::Open => "may_open",
            EventKind::Mkdir => "vfs_mkdir",
            EventKind::Link => "vfs_link",
            EventKind::Rename => "vfs_rename",
            EventKind::Unlink => "vfs_unlink",
            EventKind::Rmdir => "vfs_rmdir",
            EventKind::SetAttr => "security_inode_setattr",
        };
        Self { kind, function }
    }

    pub fn all() -> impl Iterator<Item = ProbeKind> {
        EventKind::iter().map(Self::of)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Kernel function the pair is attached to.
    pub fn function(&self) -> &'static str {
        self.function
    }

    /// Link and rename touch two paths.
    pub fn needs_target(&self) -> bool {
        matches!(self.kind, EventKind::Link | EventKind::Rename)
    }
}
