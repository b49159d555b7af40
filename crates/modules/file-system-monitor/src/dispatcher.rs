use bpf_common::{SharedMap, time::BootTime, time::Timestamp};
use dentry_resolver::{DentryResolver, ERROR_PATH_PREFIX, PathFragment};
use probe_core::{
    bus::EventHandler,
    event::{AttrChange, Event, EventKind, FileFlags, FileInfo, Header, Payload},
};

use crate::record::{DecodeError, DentryBody, Record, RecordBody};

/// Turns raw records into [`Event`]s and hands them to the downstream handler.
///
/// Paths are resolved out of the fragment store; the source path is always
/// resolved, the target path only for calls which have one.
pub struct EventDispatcher<M, H> {
    source: String,
    resolver: DentryResolver<M>,
    boot_time: BootTime,
    handler: H,
}

impl<M, H> EventDispatcher<M, H>
where
    M: SharedMap<u32, PathFragment>,
    H: EventHandler,
{
    pub fn new(source: &str, resolver: DentryResolver<M>, boot_time: BootTime, handler: H) -> Self {
        Self {
            source: source.to_string(),
            resolver,
            boot_time,
            handler,
        }
    }

    pub fn dispatch(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        let record = Record::decode(data)?;
        let event = self.build_event(&record)?;
        self.handler.handle(event);
        Ok(())
    }

    fn build_event(&mut self, record: &Record) -> Result<Event, DecodeError> {
        let process = &record.process;
        let header = Header {
            kind: record.kind,
            source: self.source.clone(),
            timestamp: self
                .boot_time
                .to_system_time(Timestamp::from(process.timestamp)),
            pid: process.pid as i32,
            tid: process.tid as i32,
            uid: process.uid,
            gid: process.gid,
            pid_ns: process.pid_ns,
            tty_name: process.tty_name(),
            retval: record.retval,
        };

        let payload = match (record.kind, &record.body) {
            (EventKind::SetAttr, RecordBody::SetAttr(body)) => Payload::AttrChanged {
                file: self.file_info(body.path_key, body.inode, body.mount_id),
                change: AttrChange {
                    valid: body.valid,
                    mode: body.mode,
                    uid: body.uid,
                    gid: body.gid,
                    atime: body.atime,
                    mtime: body.mtime,
                },
            },
            (EventKind::Open, RecordBody::Dentry(body)) => Payload::FileOpened {
                file: self.source_info(body),
                flags: FileFlags::from_raw_unchecked(body.flags),
                mode: body.mode,
            },
            (EventKind::Mkdir, RecordBody::Dentry(body)) => Payload::DirCreated {
                dir: self.source_info(body),
                mode: body.mode,
            },
            (EventKind::Link, RecordBody::Dentry(body)) => Payload::FileLink {
                source: self.source_info(body),
                target: self.target_info(body),
            },
            (EventKind::Rename, RecordBody::Dentry(body)) => Payload::FileRename {
                source: self.source_info(body),
                target: self.target_info(body),
            },
            (EventKind::Unlink, RecordBody::Dentry(body)) => Payload::FileDeleted {
                file: self.source_info(body),
            },
            (EventKind::Rmdir, RecordBody::Dentry(body)) => Payload::DirDeleted {
                dir: self.source_info(body),
            },
            (kind, _) => return Err(DecodeError::MismatchedBody(kind)),
        };
        Ok(Event::new(header, payload))
    }

    fn source_info(&mut self, body: &DentryBody) -> FileInfo {
        self.file_info(body.src_key, body.src_inode, body.src_mount_id)
    }

    fn target_info(&mut self, body: &DentryBody) -> FileInfo {
        self.file_info(body.target_key, body.target_inode, body.target_mount_id)
    }

    fn file_info(&mut self, key: u32, inode: u64, mount_id: u32) -> FileInfo {
        let path = self.resolver.resolve(key).unwrap_or_else(|err| {
            log::debug!("{}: {err}", self.source);
            ERROR_PATH_PREFIX.to_string()
        });
        FileInfo {
            path,
            inode,
            mount_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::{Duration, UNIX_EPOCH},
    };

    use bpf_common::maps::MemoryMap;
    use bpf_filtering::{FilterConfig, MemoryFilterTables, install_filters};
    use dentry_resolver::{DentryTree, MemoryDentryTree, RandomKeys, TRUNCATED_PATH_PREFIX};

    use super::*;
    use crate::correlation::{CALL_CACHE_CAPACITY, CallArgs, ProbeModel, Task};

    #[derive(Clone, Default)]
    struct Collector(Arc<Mutex<Vec<Event>>>);

    impl EventHandler for Collector {
        fn handle(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Collector {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Harness {
        probes: ProbeModel<
            MemoryDentryTree,
            MemoryFilterTables,
            MemoryMap<u64, crate::correlation::PendingCall<usize>>,
            MemoryMap<u32, PathFragment>,
            RandomKeys,
        >,
        fragments: MemoryMap<u32, PathFragment>,
        dispatcher: EventDispatcher<MemoryMap<u32, PathFragment>, Collector>,
        events: Collector,
    }

    fn harness() -> Harness {
        let mut filters = MemoryFilterTables::in_memory();
        install_filters(&mut filters, &FilterConfig::default()).unwrap();
        let fragments = MemoryMap::with_capacity(4096);
        let events = Collector::default();
        Harness {
            probes: ProbeModel::new(
                MemoryDentryTree::new(1),
                filters,
                MemoryMap::with_capacity(CALL_CACHE_CAPACITY),
                fragments.clone(),
                RandomKeys::new(),
            ),
            fragments: fragments.clone(),
            dispatcher: EventDispatcher::new(
                "file-system-monitor",
                DentryResolver::new(fragments),
                BootTime::from_system_time(UNIX_EPOCH + Duration::from_secs(1_000)),
                events.clone(),
            ),
            events,
        }
    }

    fn task() -> Task {
        Task {
            pid: 42,
            tid: 43,
            uid: 1000,
            gid: 100,
            pid_ns: 4026531836,
            tty_name: "pts2".to_string(),
        }
    }

    impl Harness {
        fn syscall(&mut self, args: CallArgs<usize>, retval: i64) -> Event {
            let task = task();
            let kind = args.kind();
            assert!(self.probes.on_entry(&task, args));
            let bytes = self.probes.on_exit(&task, kind, retval).unwrap();
            self.dispatcher.dispatch(&bytes).unwrap();
            let mut events = self.events.take();
            assert_eq!(events.len(), 1);
            events.remove(0)
        }
    }

    #[test]
    fn open_event() {
        let mut h = harness();
        let file = h.probes.tree_mut().add_path("/etc/passwd");
        let inode = h.probes.tree().inode(file);

        let event = h.syscall(
            CallArgs::Open {
                file,
                flags: 0o101,
                mode: 0o644,
            },
            3,
        );

        let header = event.header();
        assert_eq!(header.kind, EventKind::Open);
        assert_eq!(header.source, "file-system-monitor");
        assert_eq!((header.pid, header.tid), (42, 43));
        assert_eq!(header.tty_name, "pts2");
        assert_eq!(header.retval, 3);
        let Payload::FileOpened { file, mode, .. } = event.payload() else {
            panic!("unexpected payload {:?}", event.payload());
        };
        assert_eq!(file.path, "/etc/passwd");
        assert_eq!(file.inode, inode);
        assert_eq!(file.mount_id, 1);
        assert_eq!(*mode, 0o644);
        assert!(h.fragments.is_empty());
    }

    #[test]
    fn link_and_rename_resolve_target() {
        let mut h = harness();
        let source = h.probes.tree_mut().add_path("/home/user/a");
        let target = h.probes.tree_mut().add_path("/home/user/b");

        let event = h.syscall(CallArgs::Link { source, target }, 0);
        let Payload::FileLink { source: s, target: t } = event.payload() else {
            panic!("unexpected payload {:?}", event.payload());
        };
        assert_eq!(s.path, "/home/user/a");
        assert_eq!(t.path, "/home/user/b");

        let event = h.syscall(CallArgs::Rename { source, target }, -17);
        let Payload::FileRename { source: s, target: t } = event.payload() else {
            panic!("unexpected payload {:?}", event.payload());
        };
        assert_eq!(s.path, "/home/user/a");
        assert_eq!(t.path, "/home/user/b");
        assert_eq!(event.header().retval, -17);
        assert!(h.fragments.is_empty());
    }

    #[test]
    fn setattr_event() {
        let mut h = harness();
        let file = h.probes.tree_mut().add_path("/tmp/x");
        let event = h.syscall(
            CallArgs::SetAttr {
                file,
                valid: AttrChange::MODE,
                mode: 0o600,
                uid: 0,
                gid: 0,
                atime: 0,
                mtime: 0,
            },
            0,
        );
        let Payload::AttrChanged { file, change } = event.payload() else {
            panic!("unexpected payload {:?}", event.payload());
        };
        assert_eq!(file.path, "/tmp/x");
        assert_eq!(change.valid, AttrChange::MODE);
        assert_eq!(change.mode, 0o600);
    }

    #[test]
    fn evicted_fragments_give_partial_path() {
        let mut h = harness();
        let dir = h.probes.tree_mut().add_path("/srv/data/old");
        let task = task();
        h.probes.on_entry(&task, CallArgs::Rmdir { dir });
        let bytes = h.probes.on_exit(&task, EventKind::Rmdir, 0).unwrap();

        // drop the fragment of "/data", as an LRU eviction would
        let mut fragments = h.fragments.clone();
        let Record {
            body: RecordBody::Dentry(body),
            ..
        } = Record::decode(&bytes).unwrap()
        else {
            panic!("rmdir must carry a dentry body");
        };
        let leaf = fragments.get(&body.src_key).unwrap();
        fragments.delete(&leaf.parent).unwrap();

        h.dispatcher.dispatch(&bytes).unwrap();
        let events = h.events.take();
        let Payload::DirDeleted { dir } = events[0].payload() else {
            panic!("unexpected payload {:?}", events[0].payload());
        };
        assert_eq!(dir.path, format!("{ERROR_PATH_PREFIX}/old"));
    }

    #[test]
    fn deep_paths_are_truncated() {
        let mut h = harness();
        let path: String = (0..80).map(|i| format!("/d{i}")).collect();
        let file = h.probes.tree_mut().add_path(&path);
        let event = h.syscall(CallArgs::Unlink { file }, 0);
        let Payload::FileDeleted { file } = event.payload() else {
            panic!("unexpected payload {:?}", event.payload());
        };
        assert!(file.path.starts_with(TRUNCATED_PATH_PREFIX));
        assert!(file.path.ends_with("/d79"));
    }

    #[test]
    fn body_of_another_kind_is_rejected() {
        let mut h = harness();
        let record = Record {
            kind: EventKind::SetAttr,
            retval: 0,
            process: crate::record::ProcessContext {
                pid: 1,
                tid: 1,
                uid: 0,
                gid: 0,
                pid_ns: 0,
                timestamp: 0,
                tty_name: [0; crate::record::TTY_NAME_LEN],
            },
            body: RecordBody::Dentry(DentryBody::default()),
        };
        assert_eq!(
            h.dispatcher.build_event(&record).unwrap_err(),
            DecodeError::MismatchedBody(EventKind::SetAttr)
        );
        assert!(h.events.take().is_empty());
    }

    #[test]
    fn malformed_record_is_not_dispatched() {
        let mut h = harness();
        assert!(h.dispatcher.dispatch(&[1, 0, 0]).is_err());
        assert!(h.events.take().is_empty());
    }
}
