use std::collections::HashMap;
use std::sync::Mutex;

use inoflow_common::RecordFs;

const SHARDS: usize = 16;

/// Capacity-bounded map from (pid, inode) keys to in-flight aggregates.
///
/// Sharded by key hash; each shard evicts its least-recently-touched entry
/// when full rather than failing. `lookup` copies the record out and
/// `upsert` writes a whole record back, so concurrent producers racing on
/// one key resolve last-write-wins — a rare interleaving can lose an
/// increment, which is accepted rather than serialized away.
pub struct AggregateStore {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
}

struct Shard {
    entries: HashMap<u64, Entry>,
    clock: u64,
}

struct Entry {
    record: RecordFs,
    touched: u64,
}

impl AggregateStore {
    pub fn with_capacity(total: usize) -> Self {
        let shard_capacity = (total / SHARDS).max(1);
        let shards = (0..SHARDS)
            .map(|_| {
                Mutex::new(Shard { entries: HashMap::with_capacity(shard_capacity), clock: 0 })
            })
            .collect();
        Self { shards, shard_capacity }
    }

    fn shard(&self, key: u64) -> &Mutex<Shard> {
        &self.shards[(key ^ (key >> 32)) as usize % SHARDS]
    }

    /// Copy out the aggregate for `key`, refreshing its recency.
    pub fn lookup(&self, key: u64) -> Option<RecordFs> {
        let mut shard = self.shard(key).lock().unwrap();
        shard.clock += 1;
        let clock = shard.clock;
        shard.entries.get_mut(&key).map(|entry| {
            entry.touched = clock;
            entry.record
        })
    }

    /// Insert or overwrite the aggregate for `key`. Returns true when an
    /// unrelated entry had to be evicted to make room.
    pub fn upsert(&self, key: u64, record: RecordFs) -> bool {
        let mut shard = self.shard(key).lock().unwrap();
        shard.clock += 1;
        let clock = shard.clock;
        let mut evicted = false;
        if !shard.entries.contains_key(&key) && shard.entries.len() >= self.shard_capacity {
            let oldest = shard
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                shard.entries.remove(&oldest);
                evicted = true;
            }
        }
        shard.entries.insert(key, Entry { record, touched: clock });
        evicted
    }

    pub fn remove(&self, key: u64) -> bool {
        self.shard(key).lock().unwrap().entries.remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
