//! Userspace half of the fragment store protocol.

use bpf_common::SharedMap;
use thiserror::Error;

use crate::{MAX_PATH_DEPTH, PathFragment, is_mount_boundary};

/// Prefixed to paths whose chain was missing a key.
pub const ERROR_PATH_PREFIX: &str = "*ERROR*";
/// Prefixed to paths whose chain was cut by the kernel writer.
pub const TRUNCATED_PATH_PREFIX: &str = "*TRUNCATED*";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid path key 0")]
    InvalidKey,
}

/// Rebuilds paths out of the fragment store, consuming the fragments it reads.
pub struct DentryResolver<M> {
    store: M,
}

impl<M> DentryResolver<M>
where
    M: SharedMap<u32, PathFragment>,
{
    pub fn new(store: M) -> Self {
        Self { store }
    }

    /// Resolve the chain starting at `key` into an absolute path.
    ///
    /// Missing fragments don't fail the resolution: the components read so
    /// far are returned behind [`ERROR_PATH_PREFIX`]. A chain ended by the
    /// writer's sentinel is returned behind [`TRUNCATED_PATH_PREFIX`].
    pub fn resolve(&mut self, key: u32) -> Result<String, ResolveError> {
        if key == 0 {
            return Err(ResolveError::InvalidKey);
        }

        let mut components: Vec<String> = Vec::new();
        let mut prefix = "";
        let mut current = key;
        // one extra hop for the sentinel
        for hop in 0..=MAX_PATH_DEPTH {
            let fragment = match self.store.get(&current) {
                Ok(fragment) => fragment,
                Err(err) => {
                    log::debug!("path fragment {current} unavailable: {err}");
                    prefix = ERROR_PATH_PREFIX;
                    break;
                }
            };
            if let Err(err) = self.store.delete(&current) {
                log::debug!("deleting path fragment {current}: {err}");
            }

            let name = fragment.name();
            if name.is_empty() {
                if fragment.is_terminal() {
                    prefix = TRUNCATED_PATH_PREFIX;
                    break;
                }
            } else if !is_mount_boundary(name) {
                components.push(String::from_utf8_lossy(name).into_owned());
            }

            if fragment.is_terminal() {
                break;
            }
            if hop == MAX_PATH_DEPTH {
                prefix = TRUNCATED_PATH_PREFIX;
            }
            current = fragment.parent;
        }

        let path: String = components
            .iter()
            .rev()
            .flat_map(|component| ["/", component.as_str()])
            .collect();

        Ok(match (prefix, path.is_empty()) {
            ("", true) => "/".to_string(),
            (prefix, _) => format!("{prefix}{path}"),
        })
    }
}
