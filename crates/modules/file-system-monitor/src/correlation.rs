//! Correlation of syscall entry and exit, as performed by the probe pairs.
//!
//! The entry probe runs the filter and, if the call is interesting, caches
//! the process context and the call arguments under the `pid_tgid` of the
//! calling thread. The exit probe looks the entry up, resolves the touched
//! paths into the fragment store, emits a [`Record`] with the return value and
//! deletes the entry. An exit with no cached entry is ignored.
//!
//! [`ProbeModel`] is this logic written against the shared-table traits: the
//! probe object implements the same contract on real maps.

use bpf_common::{SharedMap, time::Timestamp};
use bpf_filtering::{CallContext, CallFilter};
use bytes::Bytes;
use dentry_resolver::{DentryTree, KeySource, PathFragment, write_dentry_path};
use probe_core::event::EventKind;

use crate::record::{
    DentryBody, ProcessContext, Record, RecordBody, SetAttrBody, TTY_NAME_LEN,
};

/// Capacity of the correlation cache.
pub const CALL_CACHE_CAPACITY: usize = 1024;

/// Key of the correlation cache, as returned by `bpf_get_current_pid_tgid`.
pub fn pid_tgid(tgid: u32, tid: u32) -> u64 {
    ((tgid as u64) << 32) | tid as u64
}

/// The calling task, as seen from probe code.
#[derive(Debug, Clone)]
pub struct Task {
    /// Thread group id
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    pub pid_ns: u64,
    /// Empty without a controlling terminal
    pub tty_name: String,
}

impl Task {
    fn context(&self, timestamp: u64) -> ProcessContext {
        let mut tty_name = [0; TTY_NAME_LEN];
        let name = self.tty_name.as_bytes();
        let len = name.len().min(TTY_NAME_LEN - 1);
        tty_name[..len].copy_from_slice(&name[..len]);
        ProcessContext {
            pid: self.pid,
            tid: self.tid,
            uid: self.uid,
            gid: self.gid,
            pid_ns: self.pid_ns,
            timestamp,
            tty_name,
        }
    }
}

/// Arguments of an instrumented call, referencing dentries of type `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArgs<D> {
    Open { file: D, flags: u32, mode: u32 },
    Mkdir { dir: D, mode: u32 },
    Link { source: D, target: D },
    Rename { source: D, target: D },
    Unlink { file: D },
    Rmdir { dir: D },
    SetAttr {
        file: D,
        valid: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        atime: u64,
        mtime: u64,
    },
}

impl<D> CallArgs<D> {
    pub fn kind(&self) -> EventKind {
        match self {
            CallArgs::Open { .. } => EventKind::Open,
            CallArgs::Mkdir { .. } => EventKind::Mkdir,
            CallArgs::Link { .. } => EventKind::Link,
            CallArgs::Rename { .. } => EventKind::Rename,
            CallArgs::Unlink { .. } => EventKind::Unlink,
            CallArgs::Rmdir { .. } => EventKind::Rmdir,
            CallArgs::SetAttr { .. } => EventKind::SetAttr,
        }
    }
}

/// Value of the correlation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCall<D> {
    pub process: ProcessContext,
    pub args: CallArgs<D>,
}

/// Entry and exit handlers of the probe pairs.
pub struct ProbeModel<T, F, C, S, K> {
    tree: T,
    filter: F,
    calls: C,
    fragments: S,
    keys: K,
}

impl<T, F, C, S, K> ProbeModel<T, F, C, S, K>
where
    T: DentryTree,
    F: CallFilter,
    C: SharedMap<u64, PendingCall<T::Dentry>>,
    S: SharedMap<u32, PathFragment>,
    K: KeySource,
{
    pub fn new(tree: T, filter: F, calls: C, fragments: S, keys: K) -> Self {
        Self {
            tree,
            filter,
            calls,
            fragments,
            keys,
        }
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut T {
        &mut self.tree
    }

    /// Syscall entry. Returns whether the call was cached.
    pub fn on_entry(&mut self, task: &Task, args: CallArgs<T::Dentry>) -> bool {
        let call = CallContext {
            pid: task.pid,
            pid_ns: task.pid_ns,
            has_tty: !task.tty_name.is_empty(),
        };
        if !self.filter.should_capture(&call) {
            return false;
        }
        let timestamp = Timestamp::now().unwrap_or_default().as_nanos();
        let pending = PendingCall {
            process: task.context(timestamp),
            args,
        };
        self.calls
            .put(pid_tgid(task.pid, task.tid), pending)
            .is_ok()
    }

    /// Syscall exit. Returns the record to output, if the call was cached.
    pub fn on_exit(&mut self, task: &Task, kind: EventKind, retval: i64) -> Option<Bytes> {
        let key = pid_tgid(task.pid, task.tid);
        let pending = self.calls.get(&key).ok()?;
        if pending.args.kind() != kind {
            return None;
        }
        let _ = self.calls.delete(&key);

        let body = match pending.args {
            CallArgs::Open { file, flags, mode } => RecordBody::Dentry(DentryBody {
                flags,
                mode,
                ..self.source(file)
            }),
            CallArgs::Mkdir { dir, mode } => RecordBody::Dentry(DentryBody {
                mode,
                ..self.source(dir)
            }),
            CallArgs::Link { source, target } | CallArgs::Rename { source, target } => {
                let (target_key, target_inode, target_mount_id) = self.path(target);
                RecordBody::Dentry(DentryBody {
                    target_key,
                    target_inode,
                    target_mount_id,
                    ..self.source(source)
                })
            }
            CallArgs::Unlink { file: dentry } | CallArgs::Rmdir { dir: dentry } => {
                RecordBody::Dentry(self.source(dentry))
            }
            CallArgs::SetAttr {
                file,
                valid,
                mode,
                uid,
                gid,
                atime,
                mtime,
            } => {
                let (path_key, inode, mount_id) = self.path(file);
                RecordBody::SetAttr(SetAttrBody {
                    path_key,
                    valid,
                    inode,
                    mount_id,
                    mode,
                    uid,
                    gid,
                    atime,
                    mtime,
                })
            }
        };

        let record = Record {
            kind,
            retval,
            process: pending.process,
            body,
        };
        Some(record.encode())
    }

    fn source(&mut self, dentry: T::Dentry) -> DentryBody {
        let (src_key, src_inode, src_mount_id) = self.path(dentry);
        DentryBody {
            src_key,
            src_inode,
            src_mount_id,
            ..Default::default()
        }
    }

    /// Write the path of `dentry` into the fragment store under a fresh key.
    fn path(&mut self, dentry: T::Dentry) -> (u32, u64, u32) {
        let key = self.keys.next_key();
        // a failed write shows up as a missing fragment in userspace
        let _ = write_dentry_path(&self.tree, dentry, key, &mut self.fragments, &mut self.keys);
        (key, self.tree.inode(dentry), self.tree.mount_id(dentry))
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::maps::MemoryMap;
    use bpf_filtering::{FilterConfig, MemoryFilterTables, install_filters};
    use dentry_resolver::{MemoryDentryTree, RandomKeys};

    use super::*;

    type Model = ProbeModel<
        MemoryDentryTree,
        MemoryFilterTables,
        MemoryMap<u64, PendingCall<usize>>,
        MemoryMap<u32, PathFragment>,
        RandomKeys,
    >;

    fn setup(config: FilterConfig) -> (Model, MemoryMap<u64, PendingCall<usize>>) {
        let mut filters = MemoryFilterTables::in_memory();
        install_filters(&mut filters, &config).unwrap();
        let calls = MemoryMap::with_capacity(CALL_CACHE_CAPACITY);
        let model = ProbeModel::new(
            MemoryDentryTree::new(1),
            filters,
            calls.clone(),
            MemoryMap::with_capacity(4096),
            RandomKeys::new(),
        );
        (model, calls)
    }

    fn task(pid: u32, pid_ns: u64, tty_name: &str) -> Task {
        Task {
            pid,
            tid: pid,
            uid: 1000,
            gid: 1000,
            pid_ns,
            tty_name: tty_name.to_string(),
        }
    }

    #[test]
    fn key_packs_tgid_and_tid() {
        assert_eq!(pid_tgid(1, 2), 0x0000_0001_0000_0002);
    }

    #[test]
    fn exit_without_entry_is_ignored() {
        let (mut model, calls) = setup(FilterConfig::default());
        assert!(model.on_exit(&task(10, 1, ""), EventKind::Unlink, 0).is_none());
        assert!(calls.is_empty());
    }

    #[test]
    fn cached_call_produces_one_record() {
        let (mut model, calls) = setup(FilterConfig::default());
        let file = model.tree_mut().add_path("/tmp/a");
        let task = task(10, 1, "pts0");

        assert!(model.on_entry(&task, CallArgs::Unlink { file }));
        assert!(calls.contains_key(&pid_tgid(10, 10)));

        let bytes = model.on_exit(&task, EventKind::Unlink, 0).unwrap();
        let record = Record::decode(&bytes).unwrap();
        assert_eq!(record.kind, EventKind::Unlink);
        assert_eq!(record.process.pid, 10);
        assert_eq!(record.process.tty_name(), "pts0");
        assert!(calls.is_empty());

        assert!(model.on_exit(&task, EventKind::Unlink, 0).is_none());
    }

    #[test]
    fn exit_of_another_kind_keeps_entry() {
        let (mut model, calls) = setup(FilterConfig::default());
        let dir = model.tree_mut().add_path("/tmp/d");
        let task = task(10, 1, "");

        assert!(model.on_entry(&task, CallArgs::Rmdir { dir }));
        assert!(model.on_exit(&task, EventKind::Unlink, 0).is_none());
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn filtered_calls_are_never_cached() {
        let cases = [
            (
                FilterConfig {
                    pid_allowlist: vec![1],
                    ..Default::default()
                },
                task(10, 1, "pts0"),
            ),
            (
                FilterConfig {
                    pid_denylist: vec![10],
                    ..Default::default()
                },
                task(10, 1, "pts0"),
            ),
            (
                FilterConfig {
                    ns_allowlist: vec![2],
                    ..Default::default()
                },
                task(10, 1, "pts0"),
            ),
            (
                FilterConfig {
                    ns_denylist: vec![1],
                    ..Default::default()
                },
                task(10, 1, "pts0"),
            ),
            (
                FilterConfig {
                    tty_only: true,
                    ..Default::default()
                },
                task(10, 1, ""),
            ),
        ];
        for (config, task) in cases {
            let (mut model, calls) = setup(config.clone());
            let file = model.tree_mut().add_path("/etc/shadow");
            let cached = model.on_entry(
                &task,
                CallArgs::Open {
                    file,
                    flags: 0,
                    mode: 0,
                },
            );
            assert!(!cached, "{config:?}");
            assert!(calls.is_empty());
            assert!(model.on_exit(&task, EventKind::Open, 3).is_none());
        }
    }

    #[test]
    fn rename_carries_both_paths() {
        let (mut model, _) = setup(FilterConfig::default());
        let source = model.tree_mut().add_path("/tmp/old");
        let target = model.tree_mut().add_path("/var/new");
        let task = task(10, 1, "");

        model.on_entry(&task, CallArgs::Rename { source, target });
        let bytes = model.on_exit(&task, EventKind::Rename, 0).unwrap();
        let RecordBody::Dentry(body) = Record::decode(&bytes).unwrap().body else {
            panic!("rename must carry a dentry body");
        };
        assert_ne!(body.src_key, 0);
        assert_ne!(body.target_key, 0);
        assert_eq!(body.src_inode, model.tree().inode(source));
        assert_eq!(body.target_inode, model.tree().inode(target));
    }
}
