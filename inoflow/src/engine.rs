use std::cell::RefCell;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use inoflow_common::{
    is_lnk, is_reg, key_pid_ino, put_cstr, FileName, FsEventKind, RecordFs, FILENAME_HALF_LEN,
    FILENAME_LEN_MAX, RECORD_TYPE_FILE,
};
use log::trace;

use crate::channel::{EmissionChannel, Stats};
use crate::filter::PathFilter;
use crate::hook::FsEventInfo;
use crate::resolve::resolve_dir_path;
use crate::store::AggregateStore;

pub struct EngineConfig {
    /// Our own pid; events it causes are never tracked.
    pub self_pid: u32,
    /// Maximum events merged into one aggregate before forced closure.
    /// 0 disables the cap, 1 disables aggregation entirely.
    pub agg_events_max: u32,
}

/// The aggregation state machine. One invocation per classified event;
/// callable concurrently from any number of producer contexts.
pub struct Engine {
    cfg: EngineConfig,
    filter: PathFilter,
    store: AggregateStore,
    channel: EmissionChannel,
    stats: Arc<Stats>,
}

thread_local! {
    // Staging slot for the candidate aggregate, one per execution context,
    // so the hot path never allocates.
    static SCRATCH: RefCell<RecordFs> = const { RefCell::new(RecordFs::zeroed()) };
}

fn epoch_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn name_half(src: &[u8]) -> [u8; FILENAME_HALF_LEN] {
    let mut half = [0u8; FILENAME_HALF_LEN];
    put_cstr(&mut half, src);
    half
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        filter: PathFilter,
        store: AggregateStore,
        channel: EmissionChannel,
        stats: Arc<Stats>,
    ) -> Self {
        Self { cfg, filter, store, channel, stats }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    /// Consume one classified event: create or merge the aggregate for its
    /// (pid, inode) key, then close and emit it once the operation looks
    /// finished.
    pub fn handle_event(&self, event: &FsEventInfo) {
        // Access and attribute-only traffic is not tracked, and neither is
        // our own activity — that would feed back into itself.
        if matches!(event.kind, FsEventKind::Access | FsEventKind::Attrib) {
            return;
        }
        if event.pid == self.cfg.self_pid {
            return;
        }

        // Hard-link and rename pairs target the inode of the older binding.
        let target = event.dentry_old.as_ref().unwrap_or(&event.dentry);
        let meta = *target.meta();
        let name = event.dentry.name();
        if meta.ino == 0 || name.first().is_none_or(|&b| b == 0) {
            return;
        }
        if !(is_reg(meta.mode) || is_lnk(meta.mode)) {
            return;
        }

        let key = key_pid_ino(event.pid, meta.ino);
        let ts_event = epoch_ns();

        SCRATCH.with_borrow_mut(|r| {
            let is_new = match self.store.lookup(key) {
                Some(found) => {
                    *r = found;
                    if event.kind == FsEventKind::MovedTo {
                        let from = match r.name {
                            FileName::Single(ref n) => name_half(n),
                            FileName::Renamed { from, .. } => from,
                        };
                        r.name = FileName::Renamed { from, to: name_half(name) };
                    }
                    r.ts_ns = ts_event;
                    false
                }
                None => {
                    *r = RecordFs::zeroed();
                    r.ts_ns = ts_event;
                    r.ino = meta.ino;
                    let mut single = [0u8; FILENAME_LEN_MAX];
                    put_cstr(&mut single, name);
                    r.name = FileName::Single(single);
                    r.isize_first = meta.size;
                    resolve_dir_path(&event.dentry, &mut r.filepath);
                    true
                }
            };

            // Re-checked on every event, so an in-flight aggregate can
            // still be vetoed. A veto leaves statistics and the store
            // untouched.
            if !self.filter.permit(&r.filepath) {
                trace!("path rejected for {} via {}", event.kind, event.hook);
                return;
            }

            r.imode = meta.mode;
            r.isize = meta.size;
            r.inlink = meta.nlink;
            if event.kind == FsEventKind::Create && event.dentry_old.is_some() {
                // The link being created is not yet in the sampled count.
                r.inlink += 1;
            }
            r.atime_nsec = meta.atime_nsec;
            r.mtime_nsec = meta.mtime_nsec;
            r.ctime_nsec = meta.ctime_nsec;
            r.events += 1;
            r.event_counts[event.kind as usize] += 1;

            if self.store.upsert(key, *r) {
                self.stats.record_evicted();
            }
            if is_new {
                self.stats.record_opened();
            }
            self.stats.record_event();

            let finished = match event.kind {
                FsEventKind::CloseWrite
                | FsEventKind::CloseNowrite
                | FsEventKind::Delete
                | FsEventKind::MovedTo => true,
                FsEventKind::Create => is_lnk(meta.mode) || r.inlink > 1,
                _ => false,
            };
            let capped = self.cfg.agg_events_max != 0 && r.events >= self.cfg.agg_events_max;

            if finished || capped {
                r.rtype = RECORD_TYPE_FILE;
                self.channel.submit(*r, &self.stats);
                self.store.remove(key);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::emission_channel;
    use crate::hook::dentry_for_path;
    use crossbeam_channel::Receiver;
    use inoflow_common::{InodeMeta, StatsSnapshot, S_IFREG};
    use std::path::Path;

    const SELF_PID: u32 = 999_999;

    fn engine(agg_events_max: u32, filter: PathFilter) -> (Engine, Receiver<RecordFs>) {
        let (tx, rx) = emission_channel();
        let engine = Engine::new(
            EngineConfig { self_pid: SELF_PID, agg_events_max },
            filter,
            AggregateStore::with_capacity(1024),
            tx,
            Arc::new(Stats::new()),
        );
        (engine, rx)
    }

    fn file_meta(ino: u32, size: u64) -> InodeMeta {
        InodeMeta { ino, mode: S_IFREG | 0o644, nlink: 1, size, ..Default::default() }
    }

    fn event(kind: FsEventKind, pid: u32, path: &str, meta: InodeMeta) -> FsEventInfo {
        FsEventInfo {
            kind,
            pid,
            dentry: dentry_for_path(Path::new(path), meta),
            dentry_old: None,
            hook: "test",
        }
    }

    fn snapshot(engine: &Engine) -> StatsSnapshot {
        engine.stats().snapshot()
    }

    #[test]
    fn self_process_activity_is_invisible() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        engine.handle_event(&event(FsEventKind::Create, SELF_PID, "/data/x", file_meta(1, 0)));
        engine.handle_event(&event(FsEventKind::CloseWrite, SELF_PID, "/data/x", file_meta(1, 9)));
        assert!(rx.try_recv().is_err());
        assert_eq!(snapshot(&engine).events, 0);
        assert!(engine.store().is_empty());
    }

    #[test]
    fn access_and_attrib_are_not_tracked() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        engine.handle_event(&event(FsEventKind::Access, 10, "/data/x", file_meta(1, 0)));
        engine.handle_event(&event(FsEventKind::Attrib, 10, "/data/x", file_meta(1, 0)));
        assert!(rx.try_recv().is_err());
        assert!(engine.store().is_empty());
    }

    #[test]
    fn directories_and_odd_inodes_are_ignored() {
        let (engine, _rx) = engine(0, PathFilter::permit_all());
        let dir = InodeMeta { ino: 5, mode: 0o040755, nlink: 2, ..Default::default() };
        engine.handle_event(&event(FsEventKind::Create, 10, "/data/sub", dir));
        engine.handle_event(&event(FsEventKind::Modify, 10, "/data/x", file_meta(0, 0)));
        assert!(engine.store().is_empty());
        assert_eq!(snapshot(&engine).events, 0);
    }

    #[test]
    fn per_kind_counts_sum_to_total() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        for kind in [
            FsEventKind::Create,
            FsEventKind::Open,
            FsEventKind::Modify,
            FsEventKind::Modify,
            FsEventKind::CloseWrite,
        ] {
            engine.handle_event(&event(kind, 10, "/data/x", file_meta(1, 0)));
        }
        let record = rx.try_recv().unwrap();
        assert_eq!(record.events, 5);
        assert_eq!(record.event_counts.iter().sum::<u32>(), record.events);
        assert_eq!(record.event_counts[FsEventKind::Modify as usize], 2);
    }

    #[test]
    fn closure_empties_the_store_and_next_event_starts_fresh() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        engine.handle_event(&event(FsEventKind::Create, 10, "/data/x", file_meta(1, 0)));
        engine.handle_event(&event(FsEventKind::CloseWrite, 10, "/data/x", file_meta(1, 5)));
        assert!(engine.store().is_empty());
        let first = rx.try_recv().unwrap();
        assert_eq!(first.events, 2);

        engine.handle_event(&event(FsEventKind::Open, 10, "/data/x", file_meta(1, 5)));
        engine.handle_event(&event(FsEventKind::CloseNowrite, 10, "/data/x", file_meta(1, 5)));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.events, 2);
        assert_eq!(second.event_counts[FsEventKind::Create as usize], 0);
    }

    #[test]
    fn event_cap_of_one_disables_aggregation() {
        let (engine, rx) = engine(1, PathFilter::permit_all());
        for _ in 0..3 {
            engine.handle_event(&event(FsEventKind::Modify, 10, "/data/x", file_meta(1, 0)));
        }
        let records: Vec<RecordFs> = rx.try_iter().collect();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.events == 1));
    }

    #[test]
    fn filtered_paths_never_reach_the_channel() {
        let filter = PathFilter::from_prefixes(["/data"]).unwrap();
        let (engine, rx) = engine(0, filter);
        engine.handle_event(&event(FsEventKind::Create, 10, "/tmp/x", file_meta(1, 0)));
        engine.handle_event(&event(FsEventKind::CloseWrite, 10, "/tmp/x", file_meta(1, 5)));
        assert!(rx.try_recv().is_err());
        let snap = snapshot(&engine);
        assert_eq!((snap.events, snap.opened, snap.closed), (0, 0, 0));
        assert!(engine.store().is_empty());

        engine.handle_event(&event(FsEventKind::Create, 10, "/data/y", file_meta(2, 0)));
        engine.handle_event(&event(FsEventKind::CloseWrite, 10, "/data/y", file_meta(2, 5)));
        assert_eq!(rx.try_recv().unwrap().ino, 2);
    }

    #[test]
    fn same_inode_is_tracked_per_process() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        engine.handle_event(&event(FsEventKind::Open, 10, "/data/x", file_meta(1, 0)));
        engine.handle_event(&event(FsEventKind::Open, 11, "/data/x", file_meta(1, 0)));
        assert_eq!(engine.store().len(), 2);
        engine.handle_event(&event(FsEventKind::CloseNowrite, 10, "/data/x", file_meta(1, 0)));
        assert_eq!(engine.store().len(), 1);
        assert_eq!(rx.try_recv().unwrap().events, 2);
    }

    #[test]
    fn symlink_creation_closes_immediately() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        let meta = InodeMeta {
            ino: 3,
            mode: inoflow_common::S_IFLNK | 0o777,
            nlink: 1,
            ..Default::default()
        };
        engine.handle_event(&event(FsEventKind::Create, 10, "/data/link", meta));
        let record = rx.try_recv().unwrap();
        assert_eq!(record.mode_class(), inoflow_common::FileModeClass::Symlink);
        assert!(engine.store().is_empty());
    }

    #[test]
    fn hard_link_completion_closes_at_creation() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        let original = dentry_for_path(Path::new("/data/orig"), file_meta(4, 10));
        let link = dentry_for_path(Path::new("/data/link"), file_meta(0, 0));
        engine.handle_event(&FsEventInfo {
            kind: FsEventKind::Create,
            pid: 10,
            dentry: link,
            dentry_old: Some(original),
            hook: "test",
        });
        let record = rx.try_recv().unwrap();
        assert_eq!(record.ino, 4);
        assert_eq!(record.inlink, 2);
        assert_eq!(record.mode_class(), inoflow_common::FileModeClass::Hardlink);
        match record.name {
            FileName::Single(ref n) => assert_eq!(inoflow_common::cstr(n), b"link"),
            FileName::Renamed { .. } => panic!("expected a single name"),
        }
    }

    #[test]
    fn lone_hard_link_event_stays_open_until_terminal() {
        let (engine, rx) = engine(0, PathFilter::permit_all());
        // Plain create of a file whose link count is still one.
        engine.handle_event(&event(FsEventKind::Create, 10, "/data/x", file_meta(1, 0)));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.store().len(), 1);
    }
}
