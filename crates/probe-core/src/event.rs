use std::{fmt, time::SystemTime};

use chrono::{DateTime, Utc};
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Number of slots of every table indexed by event type. Slot 0 is unused.
pub const EVENT_TYPE_MAX: u32 = 8;

/// Kind of an instrumented call. The discriminant is the value used on the
/// wire and as index of the statistics tables.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    EnumString,
    IntoStaticStr,
    FromRepr,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventKind {
    Open = 1,
    Mkdir = 2,
    Link = 3,
    Rename = 4,
    Unlink = 5,
    Rmdir = 6,
    #[strum(serialize = "setattr")]
    #[serde(rename = "setattr")]
    SetAttr = 7,
}

impl EventKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::from_repr(raw)
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Name used in telemetry tags for an event type index, so that type 5 is
/// tagged `event_type:unlink` rather than `event_type:5`.
/// Indexes with no matching kind are rendered as numbers.
pub fn event_type_name(event_type: u32) -> String {
    match EventKind::from_raw(event_type) {
        Some(kind) => kind.name().to_string(),
        None => event_type.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub(crate) header: Header,
    pub(crate) payload: Payload,
}

impl Event {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> EventKind {
        self.header.kind
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        let time = DateTime::<Utc>::from(header.timestamp).format("%Y-%m-%dT%TZ");
        let source = &header.source;
        let pid = header.pid;
        let retval = header.retval;
        let payload = self.payload();
        if f.alternate() {
            writeln!(
                f,
                "[{time} \x1b[1;30;46mEVENT\x1b[0m {pid} uid={} tty={}] [{source}] {payload} = {retval}",
                header.uid, header.tty_name
            )
        } else {
            writeln!(
                f,
                "[{time} EVENT {pid} uid={} tty={}] [{source}] {payload} = {retval}",
                header.uid, header.tty_name
            )
        }
    }
}

/// Context common to every event: who did it, when, and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub kind: EventKind,
    /// Name of the monitor which produced the event
    pub source: String,
    /// Wall-clock time, converted from the kernel monotonic timestamp
    pub timestamp: SystemTime,
    pub pid: i32,
    pub tid: i32,
    pub uid: u32,
    pub gid: u32,
    pub pid_ns: u64,
    /// Controlling terminal, empty if the process has none
    pub tty_name: String,
    /// Return value of the instrumented call
    pub retval: i64,
}

/// A resolved file: its absolute path and the identifiers of its inode.
///
/// The path may carry an error or truncation prefix when the kernel chain
/// could not be fully resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub inode: u64,
    pub mount_id: u32,
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (inode: {}, mount_id: {})",
            self.path, self.inode, self.mount_id
        )
    }
}

/// Attributes carried by a setattr call. Only fields whose bit is set in
/// `valid` were requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrChange {
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
}

impl AttrChange {
    pub const MODE: u32 = 1 << 0;
    pub const UID: u32 = 1 << 1;
    pub const GID: u32 = 1 << 2;
    pub const SIZE: u32 = 1 << 3;
    pub const ATIME: u32 = 1 << 4;
    pub const MTIME: u32 = 1 << 5;
}

impl fmt::Display for AttrChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        if self.valid & Self::MODE != 0 {
            fields.push(format!("mode: {:o}", self.mode));
        }
        if self.valid & Self::UID != 0 {
            fields.push(format!("uid: {}", self.uid));
        }
        if self.valid & Self::GID != 0 {
            fields.push(format!("gid: {}", self.gid));
        }
        if self.valid & Self::ATIME != 0 {
            fields.push(format!("atime: {}", self.atime));
        }
        if self.valid & Self::MTIME != 0 {
            fields.push(format!("mtime: {}", self.mtime));
        }
        write!(f, "{{ {} }}", fields.join(", "))
    }
}

/// One variant per instrumented call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Payload {
    FileOpened {
        file: FileInfo,
        flags: FileFlags,
        mode: u32,
    },
    DirCreated {
        dir: FileInfo,
        mode: u32,
    },
    FileLink {
        source: FileInfo,
        target: FileInfo,
    },
    FileRename {
        source: FileInfo,
        target: FileInfo,
    },
    FileDeleted {
        file: FileInfo,
    },
    DirDeleted {
        dir: FileInfo,
    },
    AttrChanged {
        file: FileInfo,
        change: AttrChange,
    },
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::FileOpened { file, flags, mode } => write!(f, "File Opened {{ file: {file}, flags: {flags}, mode: {mode:o} }}"),
            Payload::DirCreated { dir, mode } => write!(f, "Dir Created {{ dir: {dir}, mode: {mode:o} }}"),
            Payload::FileLink { source, target } => write!(f, "File Link {{ source: {source}, target: {target} }}"),
            Payload::FileRename { source, target } => write!(f, "File Rename {{ source: {source}, target: {target} }}"),
            Payload::FileDeleted { file } => write!(f, "File Deleted {{ file: {file} }}"),
            Payload::DirDeleted { dir } => write!(f, "Dir Deleted {{ dir: {dir} }}"),
            Payload::AttrChanged { file, change } => write!(f, "Attr Changed {{ file: {file}, change: {change} }}"),
        }
    }
}

// High level abstraction for file flags bitmask
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags(u32);

impl FileFlags {
    const ACC_MODE: u32 = 3;

    const ACC_MODE_FLAGS: [(&'static str, OFlag); 3] = [
        ("O_RDONLY", OFlag::O_RDONLY),
        ("O_WRONLY", OFlag::O_WRONLY),
        ("O_RDWR", OFlag::O_RDWR),
    ];

    const OTHER_FLAGS: [(&'static str, OFlag); 7] = [
        ("O_CREAT", OFlag::O_CREAT),
        ("O_EXCL", OFlag::O_EXCL),
        ("O_NOCTTY", OFlag::O_NOCTTY),
        ("O_TRUNC", OFlag::O_TRUNC),
        ("O_APPEND", OFlag::O_APPEND),
        ("O_NONBLOCK", OFlag::O_NONBLOCK),
        ("O_DIRECTORY", OFlag::O_DIRECTORY),
    ];

    pub fn from_raw_unchecked(flags: u32) -> Self {
        Self(flags)
    }
}

impl fmt::Debug for FileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self)
    }
}

impl fmt::Display for FileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flag_names = Vec::new();

        let mode = self.0 & Self::ACC_MODE;
        for (name, flag) in FileFlags::ACC_MODE_FLAGS {
            if mode == flag.bits() as u32 {
                flag_names.push(name);
                break; // Only one is possible
            }
        }

        for (name, flag) in FileFlags::OTHER_FLAGS {
            if (self.0 & flag.bits() as u32) > 0 {
                flag_names.push(name);
            }
        }

        write!(f, "({})", flag_names.join(","))
    }
}

impl From<FileFlags> for u32 {
    fn from(flags: FileFlags) -> Self {
        flags.0
    }
}
