//! Kernel half of the fragment store protocol.
//!
//! This is the exact behaviour of the `resolve_dentry` helper compiled into
//! the probe object, expressed against [`SharedMap`] so it can be exercised
//! from userspace tests.

use bpf_common::{MapError, SharedMap};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{DentryTree, MAX_PATH_DEPTH, PathFragment, is_mount_boundary};

/// Source of fresh fragment keys. Keys are never 0, which is reserved as the
/// end-of-chain marker. Uniqueness is not checked: a collision with a chain
/// still in the store overwrites it.
pub trait KeySource {
    fn next_key(&mut self) -> u32;
}

/// Keys drawn uniformly from `1..=u32::MAX`, like `bpf_get_prandom_u32`.
pub struct RandomKeys(StdRng);

impl RandomKeys {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl Default for RandomKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySource for RandomKeys {
    fn next_key(&mut self) -> u32 {
        self.0.gen_range(1..=u32::MAX)
    }
}

impl<F: FnMut() -> u32> KeySource for F {
    fn next_key(&mut self) -> u32 {
        self()
    }
}

/// How a written chain ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEnd {
    /// The root or a mount boundary was reached.
    Complete,
    /// The walk stopped after [`MAX_PATH_DEPTH`] fragments and a sentinel
    /// fragment was written.
    Truncated,
}

/// Write the chain of `dentry` and its ancestors into `store`, starting at
/// `key` (which must not be 0).
///
/// Each fragment holds the name of the current dentry and the key of the next
/// one. The chain ends at the first dentry which is its own parent, has an
/// empty name or is a mount boundary.
///
/// A failed write leaves a hole in the chain, which the reader reports as a
/// missing key.
pub fn write_dentry_path<T, M, K>(
    tree: &T,
    dentry: T::Dentry,
    key: u32,
    store: &mut M,
    keys: &mut K,
) -> Result<ChainEnd, MapError>
where
    T: DentryTree,
    M: SharedMap<u32, PathFragment>,
    K: KeySource,
{
    let mut dentry = dentry;
    let mut next_key = key;
    for _ in 0..MAX_PATH_DEPTH {
        let current_key = next_key;
        let name = tree.name(dentry);
        let parent = tree.parent(dentry);
        next_key = if parent == dentry || name.is_empty() || is_mount_boundary(name) {
            0
        } else {
            keys.next_key()
        };
        store.put(current_key, PathFragment::new(next_key, name))?;
        if next_key == 0 {
            return Ok(ChainEnd::Complete);
        }
        dentry = parent;
    }
    store.put(next_key, PathFragment::sentinel())?;
    Ok(ChainEnd::Truncated)
}

#[cfg(test)]
mod tests {
    use bpf_common::maps::MemoryMap;

    use super::*;
    use crate::MemoryDentryTree;

    fn sequential(start: u32) -> impl FnMut() -> u32 {
        let mut next = start;
        move || {
            next += 1;
            next
        }
    }

    #[test]
    fn chain_links_leaf_to_root() {
        let mut tree = MemoryDentryTree::new(1);
        let leaf = tree.add_path("/b/c");
        let mut store = MemoryMap::with_capacity(64);

        let end = write_dentry_path(&tree, leaf, 3, &mut store, &mut sequential(10)).unwrap();

        assert_eq!(end, ChainEnd::Complete);
        assert_eq!(store.get(&3).unwrap(), PathFragment::new(11, b"c"));
        assert_eq!(store.get(&11).unwrap(), PathFragment::new(12, b"b"));
        assert_eq!(store.get(&12).unwrap(), PathFragment::new(0, b"/"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn mount_boundary_ends_chain() {
        let mut tree = MemoryDentryTree::new(1);
        let mnt = tree.add_path("/mnt");
        let mount_root = tree.add_mount(mnt, 2);
        let file = tree.add(mount_root, b"data");
        let mut store = MemoryMap::with_capacity(64);

        let end = write_dentry_path(&tree, file, 1, &mut store, &mut sequential(1)).unwrap();

        assert_eq!(end, ChainEnd::Complete);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&2).unwrap(), PathFragment::new(0, b"/"));
    }

    #[test]
    fn deep_chain_is_cut_with_sentinel() {
        let mut tree = MemoryDentryTree::new(1);
        let path: String = (1..=100).map(|i| format!("/d{i}")).collect();
        let leaf = tree.add_path(&path);
        let mut store = MemoryMap::with_capacity(1024);

        let end = write_dentry_path(&tree, leaf, 1, &mut store, &mut sequential(1)).unwrap();

        assert_eq!(end, ChainEnd::Truncated);
        assert_eq!(store.len(), MAX_PATH_DEPTH + 1);
        let last = (MAX_PATH_DEPTH + 1) as u32;
        assert_eq!(store.get(&last).unwrap(), PathFragment::sentinel());
    }

    #[test]
    fn random_keys_are_never_zero() {
        let mut keys = RandomKeys::new();
        assert!((0..10_000).all(|_| keys.next_key() != 0));
    }
}
