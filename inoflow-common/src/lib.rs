#![no_std]
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const FILEPATH_LEN_MAX: usize = 96;
pub const FILEPATH_NODE_MAX: usize = 16;
pub const FILENAME_LEN_MAX: usize = 32;
pub const FILENAME_HALF_LEN: usize = FILENAME_LEN_MAX / 2;
pub const PREFIX_LEN_MAX: usize = 64;
pub const PREFIXES_MAX: usize = 64;
pub const STORE_RECORDS_MAX: usize = 65536;
pub const RING_RECORDS: usize = 8192;
pub const RECORD_TYPE_FILE: u32 = 1;

/* include/uapi/linux/stat.h */
pub const S_IFMT: u32 = 0o170000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;

pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}
pub fn is_lnk(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Store key: acting process in the high half, inode in the low half.
pub fn key_pid_ino(pid: u32, ino: u32) -> u64 {
    (pid as u64) << 32 | ino as u64
}

/// The closed set of filesystem event kinds, one per fsnotify mask bit the
/// hook layer can report.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum FsEventKind {
    Create,
    Open,
    OpenExec,
    Access,
    Attrib,
    Modify,
    CloseWrite,
    CloseNowrite,
    MovedFrom,
    MovedTo,
    Delete,
    DeleteSelf,
    MoveSelf,
    Unmount,
    QOverflow,
}

pub const FS_EVENT_MAX: usize = 15;

pub struct FsEventDesc {
    pub kind: FsEventKind,
    pub name: &'static str,
    pub short: &'static str,
    pub short2: &'static str,
}

/// Display names and short codes, indexed by `FsEventKind as usize`.
pub const FS_EVENT_TABLE: [FsEventDesc; FS_EVENT_MAX] = [
    FsEventDesc { kind: FsEventKind::Create, name: "CREATE", short: "CRE", short2: "CR" },
    FsEventDesc { kind: FsEventKind::Open, name: "OPEN", short: "OPN", short2: "OP" },
    FsEventDesc { kind: FsEventKind::OpenExec, name: "OPEN_EXEC", short: "OPX", short2: "OX" },
    FsEventDesc { kind: FsEventKind::Access, name: "ACCESS", short: "ACC", short2: "AC" },
    FsEventDesc { kind: FsEventKind::Attrib, name: "ATTRIB", short: "ATT", short2: "AT" },
    FsEventDesc { kind: FsEventKind::Modify, name: "MODIFY", short: "MOD", short2: "MO" },
    FsEventDesc { kind: FsEventKind::CloseWrite, name: "CLOSE_WRITE", short: "CLW", short2: "CW" },
    FsEventDesc { kind: FsEventKind::CloseNowrite, name: "CLOSE_NOWRITE", short: "CLN", short2: "CN" },
    FsEventDesc { kind: FsEventKind::MovedFrom, name: "MOVED_FROM", short: "MVF", short2: "MF" },
    FsEventDesc { kind: FsEventKind::MovedTo, name: "MOVED_TO", short: "MVT", short2: "MT" },
    FsEventDesc { kind: FsEventKind::Delete, name: "DELETE", short: "DEL", short2: "DE" },
    FsEventDesc { kind: FsEventKind::DeleteSelf, name: "DELETE_SELF", short: "DSF", short2: "DS" },
    FsEventDesc { kind: FsEventKind::MoveSelf, name: "MOVE_SELF", short: "MSF", short2: "MS" },
    FsEventDesc { kind: FsEventKind::Unmount, name: "UNMOUNT", short: "UNM", short2: "UM" },
    FsEventDesc { kind: FsEventKind::QOverflow, name: "Q_OVERFLOW", short: "QOF", short2: "QO" },
];

impl FsEventKind {
    pub fn name(self) -> &'static str {
        FS_EVENT_TABLE[self as usize].name
    }
}

impl core::fmt::Display for FsEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification of a finished record for output purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum FileModeClass {
    #[display("regular")]
    Regular,
    #[display("symlink")]
    Symlink,
    #[display("hardlink")]
    Hardlink,
}

/// Inode state sampled by the hook layer at event time.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct InodeMeta {
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime_nsec: u64,
    pub mtime_nsec: u64,
    pub ctime_nsec: u64,
}

/// File name carried by a record: one name, or the old/new pair once the
/// aggregate spans a rename.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub enum FileName {
    Single([u8; FILENAME_LEN_MAX]),
    Renamed {
        from: [u8; FILENAME_HALF_LEN],
        to: [u8; FILENAME_HALF_LEN],
    },
}

/// One aggregated (process, inode) activity record. Fixed layout, moved
/// whole across the emission channel.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RecordFs {
    pub rtype: u32,
    pub ts_ns: u64,
    pub events: u32,
    pub event_counts: [u32; FS_EVENT_MAX],
    pub ino: u32,
    pub imode: u32,
    pub inlink: u32,
    pub isize: u64,
    pub isize_first: u64,
    pub atime_nsec: u64,
    pub mtime_nsec: u64,
    pub ctime_nsec: u64,
    pub filepath: [u8; FILEPATH_LEN_MAX],
    pub name: FileName,
}

impl RecordFs {
    pub const fn zeroed() -> Self {
        Self {
            rtype: 0,
            ts_ns: 0,
            events: 0,
            event_counts: [0; FS_EVENT_MAX],
            ino: 0,
            imode: 0,
            inlink: 0,
            isize: 0,
            isize_first: 0,
            atime_nsec: 0,
            mtime_nsec: 0,
            ctime_nsec: 0,
            filepath: [0; FILEPATH_LEN_MAX],
            name: FileName::Single([0; FILENAME_LEN_MAX]),
        }
    }

    pub fn mode_class(&self) -> FileModeClass {
        if is_lnk(self.imode) {
            FileModeClass::Symlink
        } else if self.inlink > 1 {
            FileModeClass::Hardlink
        } else {
            FileModeClass::Regular
        }
    }
}

/// One allow-list entry: a literal path prefix plus its enable flag.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct AllowedPrefix {
    pub prefix: [u8; PREFIX_LEN_MAX],
    pub enabled: bool,
}

impl AllowedPrefix {
    pub const fn disabled() -> Self {
        Self { prefix: [0; PREFIX_LEN_MAX], enabled: false }
    }
}

/// Read-only export of the engine counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub opened: u64,
    pub closed: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub events: u64,
    pub channel_capacity: u64,
}

/// Slice of `buf` up to (excluding) the first NUL byte.
pub fn cstr(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Bounded NUL-terminated copy. Writes at most `dst.len() - 1` bytes of
/// `src` (stopping at a source NUL), terminates, returns the bytes copied.
pub fn put_cstr(dst: &mut [u8], src: &[u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let src = cstr(src);
    let n = core::cmp::min(src.len(), dst.len() - 1);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n] = 0;
    n
}
