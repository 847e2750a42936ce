//! Hook-layer boundary: the classified-event shape the engine consumes,
//! plus the production fanotify adapter that produces it.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use inoflow_common::{FsEventKind, InodeMeta};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::fanotify::{EventFFlags, Fanotify, FanotifyEvent, InitFlags, MarkFlags, MaskFlags};
use thiserror::Error;
use walkdir::WalkDir;

use crate::engine::Engine;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("failed to create fanotify notification group")]
    Init(#[source] Errno),
    #[error("failed to mark {path} for notification")]
    Mark {
        path: String,
        #[source]
        source: Errno,
    },
    #[error("no watchable directories under the configured roots")]
    NoWatchDirs,
}

/// One name-to-inode binding with a back-link to its parent. A missing
/// parent marks the filesystem root, as does a self-equal inode.
pub struct Dentry {
    name: Vec<u8>,
    meta: InodeMeta,
    parent: Option<Arc<Dentry>>,
}

impl Dentry {
    pub fn new(name: impl Into<Vec<u8>>, meta: InodeMeta, parent: Option<Arc<Dentry>>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), meta, parent })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn meta(&self) -> &InodeMeta {
        &self.meta
    }

    pub fn parent(&self) -> Option<&Arc<Dentry>> {
        self.parent.as_ref()
    }
}

/// One classified filesystem event. Lives for a single state-machine
/// invocation and is never stored.
pub struct FsEventInfo {
    pub kind: FsEventKind,
    pub pid: u32,
    pub dentry: Arc<Dentry>,
    /// Second binding for hard-link and rename pairs; its inode is the
    /// event target when present.
    pub dentry_old: Option<Arc<Dentry>>,
    pub hook: &'static str,
}

/// Build a dentry chain for an absolute path, attaching `leaf_meta` to the
/// leaf and sampling ancestor inodes as the chain is built.
pub fn dentry_for_path(path: &Path, leaf_meta: InodeMeta) -> Arc<Dentry> {
    let mut node = Dentry::new("/", meta_for_dir(Path::new("/")), None);
    let mut walked = PathBuf::from("/");
    let components: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_owned()),
            _ => None,
        })
        .collect();
    for (idx, name) in components.iter().enumerate() {
        walked.push(name);
        let meta = if idx == components.len() - 1 {
            leaf_meta
        } else {
            meta_for_dir(&walked)
        };
        node = Dentry::new(name.as_encoded_bytes(), meta, Some(node));
    }
    node
}

fn meta_for_dir(path: &Path) -> InodeMeta {
    match fs::symlink_metadata(path) {
        Ok(md) => {
            use std::os::unix::fs::MetadataExt;
            InodeMeta { ino: md.ino() as u32, mode: md.mode(), ..Default::default() }
        }
        Err(_) => InodeMeta::default(),
    }
}

const READ_RETRY: Duration = Duration::from_millis(50);

const EVENT_MASK: MaskFlags = MaskFlags::FAN_OPEN
    .union(MaskFlags::FAN_OPEN_EXEC)
    .union(MaskFlags::FAN_ACCESS)
    .union(MaskFlags::FAN_MODIFY)
    .union(MaskFlags::FAN_CLOSE_WRITE)
    .union(MaskFlags::FAN_CLOSE_NOWRITE);

/// Translates kernel fanotify notifications into classified events.
///
/// The fd-reporting notification class covers the open/access/modify/close
/// lifecycle and reports the acting pid; create, delete, rename and link
/// events enter the engine through the same `FsEventInfo` interface from
/// other producers.
// TODO: move to an FID-reporting group (FAN_REPORT_DFID_NAME) so create,
// delete and rename notifications arrive from the kernel as well.
pub struct FanotifySource {
    group: Fanotify,
    marked: usize,
}

impl FanotifySource {
    /// Create the notification group and mark the watch surface: with no
    /// roots the whole mount namespace is marked once, otherwise every
    /// directory beneath each root. Fails when the group cannot be
    /// established or nothing could be marked.
    pub fn new(roots: &[PathBuf]) -> Result<Self, HookError> {
        let group = Fanotify::init(
            InitFlags::FAN_CLASS_NOTIF | InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK,
            EventFFlags::O_RDONLY | EventFFlags::O_CLOEXEC,
        )
        .map_err(HookError::Init)?;

        let mut marked = 0usize;
        if roots.is_empty() {
            group
                .mark(
                    MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_FILESYSTEM,
                    EVENT_MASK,
                    None,
                    Some(Path::new("/")),
                )
                .map_err(|source| HookError::Mark { path: "/".into(), source })?;
            marked = 1;
        }
        for root in roots {
            for entry in WalkDir::new(root)
                .follow_root_links(true)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_dir())
            {
                let mark = group.mark(
                    MarkFlags::FAN_MARK_ADD,
                    EVENT_MASK | MaskFlags::FAN_EVENT_ON_CHILD,
                    None,
                    Some(entry.path()),
                );
                match mark {
                    Ok(()) => marked += 1,
                    Err(source) => {
                        return Err(HookError::Mark {
                            path: entry.path().display().to_string(),
                            source,
                        })
                    }
                }
            }
        }
        if marked == 0 {
            return Err(HookError::NoWatchDirs);
        }
        debug!("installed {marked} notification marks");
        Ok(Self { group, marked })
    }

    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Drain notifications until the shutdown flag is set, feeding each
    /// classified event to the engine.
    pub fn run(&self, engine: &Engine, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            match self.group.read_events() {
                Ok(events) => {
                    for event in events {
                        self.dispatch(&event, engine);
                    }
                }
                Err(Errno::EAGAIN) => std::thread::sleep(READ_RETRY),
                Err(err) => {
                    error!("failed to read notifications: {err}");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, event: &FanotifyEvent, engine: &Engine) {
        let mask = event.mask();
        if mask.contains(MaskFlags::FAN_Q_OVERFLOW) {
            warn!("notification queue overflowed, events were lost");
            return;
        }
        // Without an fd there is nothing to bind the event to.
        let Some(fd) = event.fd() else { return };
        let raw = fd.as_raw_fd();
        let Ok(path) = fs::read_link(format!("/proc/self/fd/{raw}")) else {
            return;
        };
        let Ok(st) = nix::sys::stat::fstat(raw) else {
            return;
        };
        let meta = InodeMeta {
            ino: st.st_ino as u32,
            mode: st.st_mode,
            nlink: st.st_nlink as u32,
            size: st.st_size.max(0) as u64,
            atime_nsec: time_ns(st.st_atime, st.st_atime_nsec),
            mtime_nsec: time_ns(st.st_mtime, st.st_mtime_nsec),
            ctime_nsec: time_ns(st.st_ctime, st.st_ctime_nsec),
        };
        let dentry = dentry_for_path(&path, meta);
        for kind in kinds_from_mask(mask) {
            engine.handle_event(&FsEventInfo {
                kind,
                pid: event.pid() as u32,
                dentry: dentry.clone(),
                dentry_old: None,
                hook: "fanotify",
            });
        }
    }
}

fn time_ns(sec: i64, nsec: i64) -> u64 {
    sec.max(0) as u64 * 1_000_000_000 + nsec.max(0) as u64
}

/// A single notification can carry several mask bits; each becomes its own
/// classified event, mirroring hook sites that fan one call into several
/// kinds.
fn kinds_from_mask(mask: MaskFlags) -> Vec<FsEventKind> {
    const TABLE: [(MaskFlags, FsEventKind); 6] = [
        (MaskFlags::FAN_CLOSE_WRITE, FsEventKind::CloseWrite),
        (MaskFlags::FAN_CLOSE_NOWRITE, FsEventKind::CloseNowrite),
        (MaskFlags::FAN_MODIFY, FsEventKind::Modify),
        (MaskFlags::FAN_ACCESS, FsEventKind::Access),
        (MaskFlags::FAN_OPEN_EXEC, FsEventKind::OpenExec),
        (MaskFlags::FAN_OPEN, FsEventKind::Open),
    ];
    TABLE
        .iter()
        .filter(|(bit, _)| mask.contains(*bit))
        .map(|&(_, kind)| kind)
        .collect()
}
