//! # Dentry path resolution
//!
//! Kernel-side probe code can't chase pointers without bound or concatenate
//! strings, so it can't produce the absolute path of the file touched by a
//! syscall. Instead it materializes the chain of directory entries, from the
//! touched dentry up to the root, as a linked list inside a shared
//! `HashMap<u32, PathFragment>` (the fragment store):
//!
//! ```text
//!  key K3 -> { parent: K2, name: "c" }
//!  key K2 -> { parent: K1, name: "b" }
//!  key K1 -> { parent: 0,  name: "/" }
//! ```
//!
//! The record sent to userspace only carries the starting key (`K3`).
//! Userspace walks the list, assembles `/b/c` and deletes every node it reads.
//!
//! - [`writer`] is the kernel half, bounded to [`MAX_PATH_DEPTH`] hops.
//! - [`reader`] is the userspace half.
//!
//! Every key must be consumed exactly once: a second resolution of the same
//! key finds nothing. A missing key is an expected outcome under load (the
//! store is an LRU map and may have evicted the chain) and produces a marked
//! partial path rather than an error.

use std::fmt;

use bpf_common::aya::Pod;

pub mod reader;
pub mod tree;
pub mod writer;

pub use reader::{DentryResolver, ERROR_PATH_PREFIX, ResolveError, TRUNCATED_PATH_PREFIX};
pub use tree::{DentryTree, MemoryDentryTree};
pub use writer::{ChainEnd, KeySource, RandomKeys, write_dentry_path};

/// Maximum length of a path component.
pub const NAME_MAX: usize = 255;

/// Maximum number of fragments written for a single path.
pub const MAX_PATH_DEPTH: usize = 74;

/// Default capacity of the fragment store.
pub const FRAGMENT_STORE_CAPACITY: usize = 32 * 1024;

/// Name of the fragment store map inside the eBPF object.
pub const FRAGMENT_STORE_MAP: &str = "dentry_fragments";

/// Value of the fragment store: one path component and the key of its parent.
/// `parent == 0` terminates the chain.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PathFragment {
    pub parent: u32,
    /// NUL padded component name
    pub name: [u8; NAME_MAX + 1],
}

unsafe impl Pod for PathFragment {}

impl PathFragment {
    /// Build a fragment, truncating `name` to [`NAME_MAX`] bytes.
    pub fn new(parent: u32, name: &[u8]) -> Self {
        let mut fragment = Self {
            parent,
            name: [0; NAME_MAX + 1],
        };
        let len = name.len().min(NAME_MAX);
        fragment.name[..len].copy_from_slice(&name[..len]);
        fragment
    }

    /// Explicit end of a chain which was cut at [`MAX_PATH_DEPTH`].
    pub fn sentinel() -> Self {
        Self::new(0, b"")
    }

    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    pub fn is_terminal(&self) -> bool {
        self.parent == 0
    }
}

impl Default for PathFragment {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl fmt::Debug for PathFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathFragment")
            .field("parent", &self.parent)
            .field("name", &String::from_utf8_lossy(self.name()))
            .finish()
    }
}

/// Mount boundaries and the filesystem root are named starting with `/` and
/// contribute no component to the path.
pub(crate) fn is_mount_boundary(name: &[u8]) -> bool {
    name.first() == Some(&b'/')
}
