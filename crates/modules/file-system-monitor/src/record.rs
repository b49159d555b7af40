//! Binary records emitted by the exit probes on the perf event array.
//!
//! Layout, host byte order, no implicit padding:
//!
//! ```text
//! header   : kind u32, _pad u32, retval i64
//! process  : pid u32, tid u32, uid u32, gid u32, pidns u64, timestamp u64, tty_name [u8; 64]
//! dentry   : src_key u32, target_key u32, src_inode u64, target_inode u64,
//!            src_mount_id u32, target_mount_id u32, mode u32, flags u32
//! setattr  : path_key u32, valid u32, inode u64, mount_id u32, mode u32,
//!            uid u32, gid u32, atime u64, mtime u64
//! ```
//!
//! `setattr` records carry the setattr body, every other kind the dentry body.
//! Bytes after a complete record are perf buffer padding and are ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use probe_core::event::EventKind;
use thiserror::Error;

pub const TTY_NAME_LEN: usize = 64;

pub const HEADER_SIZE: usize = 16;
pub const PROCESS_SIZE: usize = 32 + TTY_NAME_LEN;
pub const DENTRY_BODY_SIZE: usize = 40;
pub const SETATTR_BODY_SIZE: usize = 48;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown event kind {0}")]
    UnknownKind(u32),
    #[error("truncated record: {actual} bytes, {expected} expected")]
    Truncated { expected: usize, actual: usize },
    #[error("{0} record with the body of another kind")]
    MismatchedBody(EventKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    pub pid_ns: u64,
    /// Monotonic nanoseconds since boot
    pub timestamp: u64,
    pub tty_name: [u8; TTY_NAME_LEN],
}

impl ProcessContext {
    /// Terminal name up to the first NUL. Empty without a controlling terminal.
    pub fn tty_name(&self) -> String {
        let len = self
            .tty_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(TTY_NAME_LEN);
        String::from_utf8_lossy(&self.tty_name[..len]).into_owned()
    }

    pub fn has_tty(&self) -> bool {
        self.tty_name[0] != 0
    }
}

/// Body of every call touching one or two dentries.
/// `target_*` fields are zero unless the call has a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DentryBody {
    pub src_key: u32,
    pub target_key: u32,
    pub src_inode: u64,
    pub target_inode: u64,
    pub src_mount_id: u32,
    pub target_mount_id: u32,
    pub mode: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrBody {
    pub path_key: u32,
    pub valid: u32,
    pub inode: u64,
    pub mount_id: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordBody {
    Dentry(DentryBody),
    SetAttr(SetAttrBody),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub kind: EventKind,
    pub retval: i64,
    pub process: ProcessContext,
    pub body: RecordBody,
}

fn record_size(kind: EventKind) -> usize {
    let body = match kind {
        EventKind::SetAttr => SETATTR_BODY_SIZE,
        _ => DENTRY_BODY_SIZE,
    };
    HEADER_SIZE + PROCESS_SIZE + body
}

impl Record {
    pub fn decode(data: &[u8]) -> Result<Record, DecodeError> {
        let truncated = |expected| DecodeError::Truncated {
            expected,
            actual: data.len(),
        };
        if data.len() < HEADER_SIZE {
            return Err(truncated(HEADER_SIZE));
        }
        let mut buf = data;
        let raw_kind = buf.get_u32_ne();
        let kind = EventKind::from_raw(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;
        let expected = record_size(kind);
        if data.len() < expected {
            return Err(truncated(expected));
        }
        let _pad = buf.get_u32_ne();
        let retval = buf.get_i64_ne();

        let mut process = ProcessContext {
            pid: buf.get_u32_ne(),
            tid: buf.get_u32_ne(),
            uid: buf.get_u32_ne(),
            gid: buf.get_u32_ne(),
            pid_ns: buf.get_u64_ne(),
            timestamp: buf.get_u64_ne(),
            tty_name: [0; TTY_NAME_LEN],
        };
        buf.copy_to_slice(&mut process.tty_name);

        let body = match kind {
            EventKind::SetAttr => RecordBody::SetAttr(SetAttrBody {
                path_key: buf.get_u32_ne(),
                valid: buf.get_u32_ne(),
                inode: buf.get_u64_ne(),
                mount_id: buf.get_u32_ne(),
                mode: buf.get_u32_ne(),
                uid: buf.get_u32_ne(),
                gid: buf.get_u32_ne(),
                atime: buf.get_u64_ne(),
                mtime: buf.get_u64_ne(),
            }),
            _ => RecordBody::Dentry(DentryBody {
                src_key: buf.get_u32_ne(),
                target_key: buf.get_u32_ne(),
                src_inode: buf.get_u64_ne(),
                target_inode: buf.get_u64_ne(),
                src_mount_id: buf.get_u32_ne(),
                target_mount_id: buf.get_u32_ne(),
                mode: buf.get_u32_ne(),
                flags: buf.get_u32_ne(),
            }),
        };

        Ok(Record {
            kind,
            retval,
            process,
            body,
        })
    }

    /// Serialize the record as the probes do before `bpf_perf_event_output`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(record_size(self.kind));
        buf.put_u32_ne(self.kind.as_raw());
        buf.put_u32_ne(0);
        buf.put_i64_ne(self.retval);

        let process = &self.process;
        buf.put_u32_ne(process.pid);
        buf.put_u32_ne(process.tid);
        buf.put_u32_ne(process.uid);
        buf.put_u32_ne(process.gid);
        buf.put_u64_ne(process.pid_ns);
        buf.put_u64_ne(process.timestamp);
        buf.put_slice(&process.tty_name);

        match &self.body {
            RecordBody::Dentry(body) => {
                buf.put_u32_ne(body.src_key);
                buf.put_u32_ne(body.target_key);
                buf.put_u64_ne(body.src_inode);
                buf.put_u64_ne(body.target_inode);
                buf.put_u32_ne(body.src_mount_id);
                buf.put_u32_ne(body.target_mount_id);
                buf.put_u32_ne(body.mode);
                buf.put_u32_ne(body.flags);
            }
            RecordBody::SetAttr(body) => {
                buf.put_u32_ne(body.path_key);
                buf.put_u32_ne(body.valid);
                buf.put_u64_ne(body.inode);
                buf.put_u32_ne(body.mount_id);
                buf.put_u32_ne(body.mode);
                buf.put_u32_ne(body.uid);
                buf.put_u32_ne(body.gid);
                buf.put_u64_ne(body.atime);
                buf.put_u64_ne(body.mtime);
            }
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> ProcessContext {
        let mut tty_name = [0; TTY_NAME_LEN];
        tty_name[..4].copy_from_slice(b"pts1");
        ProcessContext {
            pid: 1000,
            tid: 1001,
            uid: 1,
            gid: 2,
            pid_ns: 4026531836,
            timestamp: 123_456_789,
            tty_name,
        }
    }

    #[test]
    fn rename_record_layout() {
        let record = Record {
            kind: EventKind::Rename,
            retval: -2,
            process: process(),
            body: RecordBody::Dentry(DentryBody {
                src_key: 7,
                target_key: 8,
                src_inode: 100,
                target_inode: 101,
                src_mount_id: 1,
                target_mount_id: 1,
                mode: 0,
                flags: 0,
            }),
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + PROCESS_SIZE + DENTRY_BODY_SIZE);
        assert_eq!(&bytes[..4], &4u32.to_ne_bytes());
        assert_eq!(&bytes[8..16], &(-2i64).to_ne_bytes());
        let body = HEADER_SIZE + PROCESS_SIZE;
        assert_eq!(&bytes[body + 4..body + 8], &8u32.to_ne_bytes());

        let decoded = Record::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.process.tty_name(), "pts1");
    }

    #[test]
    fn setattr_record_uses_its_own_body() {
        let record = Record {
            kind: EventKind::SetAttr,
            retval: 0,
            process: process(),
            body: RecordBody::SetAttr(SetAttrBody {
                path_key: 3,
                valid: 1,
                inode: 55,
                mount_id: 2,
                mode: 0o644,
                ..Default::default()
            }),
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + PROCESS_SIZE + SETATTR_BODY_SIZE);
        assert_eq!(Record::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let record = Record {
            kind: EventKind::Unlink,
            retval: 0,
            process: process(),
            body: RecordBody::Dentry(DentryBody::default()),
        };
        let mut padded = record.encode().to_vec();
        padded.extend_from_slice(&[0; 4]);
        assert_eq!(Record::decode(&padded).unwrap(), record);
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert_eq!(
            Record::decode(&[0; 4]),
            Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                actual: 4
            })
        );

        let mut unknown = vec![0; HEADER_SIZE + PROCESS_SIZE + DENTRY_BODY_SIZE];
        unknown[..4].copy_from_slice(&99u32.to_ne_bytes());
        assert_eq!(Record::decode(&unknown), Err(DecodeError::UnknownKind(99)));

        let record = Record {
            kind: EventKind::SetAttr,
            retval: 0,
            process: process(),
            body: RecordBody::SetAttr(SetAttrBody::default()),
        };
        let bytes = record.encode();
        let short = &bytes[..HEADER_SIZE + PROCESS_SIZE + DENTRY_BODY_SIZE];
        assert_eq!(
            Record::decode(short),
            Err(DecodeError::Truncated {
                expected: HEADER_SIZE + PROCESS_SIZE + SETATTR_BODY_SIZE,
                actual: short.len()
            })
        );
    }
}
