//! Reference in-memory implementation of [`SharedIngestStore`]: a
//! skip-list mutation log with multi-version visibility, per-collection
//! prefix tombstones, and sync/flush draining into a [`CompactionSink`].
//!
//! This is the crate's default store and the vehicle for end-to-end tests;
//! a production engine may substitute its own implementation behind the
//! same trait.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{
    BufferCallback, CollectionDescriptor, CompactionSink, LookupFlags, LookupResult, Mutation,
    MutationBatch, MutationOp, SharedIngestStore, StoreIndex, ValueBuf,
};

/// Composite key ordering versions of one user key newest-first: ascending
/// by key bytes, then descending by seqno. Two mutations with equal key and
/// seqno collide, so the later insert replaces the earlier one, which is
/// exactly the last-writer-wins contract for equal sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionedKey {
    key: Vec<u8>,
    seqno: u64,
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seqno.cmp(&self.seqno))
    }
}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Collection {
    descriptor: CollectionDescriptor,
    callback: Arc<dyn BufferCallback>,
    /// Point mutations (puts and point tombstones), versioned per key.
    points: SkipMap<VersionedKey, MutationOp>,
    /// Range tombstones, keyed by prefix. Scanned in full at lookup time;
    /// this log is expected to stay small between syncs.
    prefixes: SkipMap<VersionedKey, ()>,
    bytes_used: AtomicUsize,
    /// High-water mark of drained mutations; 0 is the nothing-synced
    /// sentinel, so caller-assigned seqnos are expected to start at 1.
    synced_seqno: AtomicU64,
    /// Serializes sync/flush on this collection. Overlapping drains would
    /// both see a stale `synced_seqno`, deliver the same mutations to the
    /// sink twice, and double-free the byte accounting.
    drain_lock: Mutex<()>,
}

pub struct MemIngestStore {
    collections: DashMap<u32, Arc<Collection>>,
    next_index: AtomicU32,
    sink: Arc<dyn CompactionSink>,
    /// Byte budget across all collections; 0 means unlimited.
    bytes_budget: usize,
    bytes_used: AtomicUsize,
}

impl MemIngestStore {
    pub fn new(sink: Arc<dyn CompactionSink>) -> Self {
        Self::with_budget(sink, 0)
    }

    /// A store that reports `OutOfMemory` once `bytes_budget` bytes of keys
    /// and values are resident and not yet synced away.
    pub fn with_budget(sink: Arc<dyn CompactionSink>, bytes_budget: usize) -> Self {
        Self {
            collections: DashMap::new(),
            next_index: AtomicU32::new(0),
            sink,
            bytes_budget,
            bytes_used: AtomicUsize::new(0),
        }
    }

    fn collection(&self, index: StoreIndex) -> Result<Arc<Collection>> {
        self.collections
            .get(&index.0)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown store index {}", index)))
    }

    fn charge(&self, bytes: usize) -> Result<()> {
        let used = self.bytes_used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if self.bytes_budget != 0 && used > self.bytes_budget {
            self.bytes_used.fetch_sub(bytes, Ordering::AcqRel);
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    /// Newest point mutation to `key` visible at `seqno`, if any.
    fn visible_point(col: &Collection, key: &[u8], seqno: u64) -> Option<(u64, MutationOp)> {
        let from = VersionedKey {
            key: key.to_vec(),
            seqno,
        };
        let to = VersionedKey {
            key: key.to_vec(),
            seqno: 0,
        };
        col.points
            .range(from..=to)
            .next()
            .map(|entry| (entry.key().seqno, entry.value().clone()))
    }

    /// Newest range tombstone covering `key` visible at `seqno`, if any.
    fn visible_prefix(col: &Collection, key: &[u8], seqno: u64) -> Option<u64> {
        col.prefixes
            .iter()
            .filter(|entry| entry.key().seqno <= seqno && key.starts_with(&entry.key().key))
            .map(|entry| entry.key().seqno)
            .max()
    }

    /// Drains everything newer than the last synced seqno to the
    /// compaction sink as one batch, then notifies the buffer callback.
    /// Serialized per collection: a second drain entering behind this one
    /// waits, then finds nothing left and no-ops.
    fn drain(&self, index: StoreIndex) -> Result<()> {
        let col = self.collection(index)?;
        let _drain_guard = col.drain_lock.lock();
        let synced = col.synced_seqno.load(Ordering::Acquire);

        let mut mutations: Vec<Mutation> = col
            .points
            .iter()
            .filter(|entry| entry.key().seqno > synced)
            .map(|entry| Mutation {
                key: entry.key().key.clone(),
                op: entry.value().clone(),
                seqno: entry.key().seqno,
            })
            .chain(
                col.prefixes
                    .iter()
                    .filter(|entry| entry.key().seqno > synced)
                    .map(|entry| Mutation {
                        key: entry.key().key.clone(),
                        op: MutationOp::PrefixTombstone,
                        seqno: entry.key().seqno,
                    }),
            )
            .collect();

        mutations.sort_by_key(|m| m.seqno);
        // High-water mark of this batch, not of the collection: a put
        // racing this drain stays resident for the next one.
        let max_seqno = match mutations.last() {
            Some(m) => m.seqno,
            None => return Ok(()),
        };

        let freed: usize = mutations
            .iter()
            .map(|m| {
                m.key.len()
                    + match &m.op {
                        MutationOp::Put(v) => v.len(),
                        _ => 0,
                    }
            })
            .sum();
        let count = mutations.len();

        self.sink.ingest(
            &col.descriptor,
            MutationBatch {
                mutations,
                max_seqno,
            },
        )?;

        col.synced_seqno.store(max_seqno, Ordering::Release);
        col.bytes_used.fetch_sub(freed, Ordering::AcqRel);
        self.bytes_used.fetch_sub(freed, Ordering::AcqRel);
        col.callback.on_sync(max_seqno);
        debug!(
            "synced {} mutations of collection {} through seqno {}",
            count, col.descriptor.name, max_seqno
        );
        Ok(())
    }
}

impl SharedIngestStore for MemIngestStore {
    fn register(
        &self,
        descriptor: CollectionDescriptor,
        callback: Arc<dyn BufferCallback>,
    ) -> Result<StoreIndex> {
        descriptor.validate()?;
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        debug!("registering collection {} at index {}", descriptor.name, index);
        self.collections.insert(
            index,
            Arc::new(Collection {
                descriptor,
                callback,
                points: SkipMap::new(),
                prefixes: SkipMap::new(),
                bytes_used: AtomicUsize::new(0),
                synced_seqno: AtomicU64::new(0),
                drain_lock: Mutex::new(()),
            }),
        );
        Ok(StoreIndex(index))
    }

    fn deregister(&self, index: StoreIndex) -> Result<()> {
        let (_, col) = self
            .collections
            .remove(&index.0)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown store index {}", index)))?;
        self.bytes_used
            .fetch_sub(col.bytes_used.load(Ordering::Acquire), Ordering::AcqRel);
        debug!("deregistered collection {} at index {}", col.descriptor.name, index);
        Ok(())
    }

    fn put(&self, index: StoreIndex, key: &[u8], value: &[u8], seqno: u64) -> Result<()> {
        let col = self.collection(index)?;
        self.charge(key.len() + value.len())?;
        col.bytes_used
            .fetch_add(key.len() + value.len(), Ordering::AcqRel);
        col.points.insert(
            VersionedKey {
                key: key.to_vec(),
                seqno,
            },
            MutationOp::Put(Bytes::copy_from_slice(value)),
        );
        Ok(())
    }

    fn delete(&self, index: StoreIndex, key: &[u8], seqno: u64) -> Result<()> {
        let col = self.collection(index)?;
        self.charge(key.len())?;
        col.bytes_used.fetch_add(key.len(), Ordering::AcqRel);
        col.points.insert(
            VersionedKey {
                key: key.to_vec(),
                seqno,
            },
            MutationOp::Tombstone,
        );
        Ok(())
    }

    fn prefix_delete(&self, index: StoreIndex, prefix: &[u8], seqno: u64) -> Result<()> {
        let col = self.collection(index)?;
        self.charge(prefix.len())?;
        col.bytes_used.fetch_add(prefix.len(), Ordering::AcqRel);
        col.prefixes.insert(
            VersionedKey {
                key: prefix.to_vec(),
                seqno,
            },
            (),
        );
        Ok(())
    }

    fn get(
        &self,
        index: StoreIndex,
        key: &[u8],
        seqno: u64,
        flags: LookupFlags,
        vbuf: &mut ValueBuf<'_>,
    ) -> Result<LookupResult> {
        let col = self.collection(index)?;

        let point = Self::visible_point(&col, key, seqno);
        let prefix = Self::visible_prefix(&col, key, seqno);

        // A range tombstone at the same seqno as a point mutation was
        // forwarded after it within this store, so the tombstone wins ties.
        let shadowed = match (&point, prefix) {
            (Some((point_seq, _)), Some(prefix_seq)) => prefix_seq >= *point_seq,
            (None, Some(_)) => true,
            (_, None) => false,
        };

        let result = if shadowed {
            LookupResult::Tombstone
        } else {
            match point {
                Some((_, MutationOp::Put(value))) => {
                    vbuf.fill(&value);
                    LookupResult::Found
                }
                Some((_, _)) => LookupResult::Tombstone,
                None => LookupResult::NotFound,
            }
        };

        if flags.hide_tombstones && result == LookupResult::Tombstone {
            return Ok(LookupResult::NotFound);
        }
        Ok(result)
    }

    fn sync(&self, index: StoreIndex) -> Result<()> {
        self.drain(index)
    }

    fn flush(&self, index: StoreIndex) -> Result<()> {
        // The reference store drains synchronously, so flush and sync
        // coincide here; the distinction is the trait's.
        self.drain(index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    use super::*;

    struct NullCallback;
    impl BufferCallback for NullCallback {}

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<(String, MutationBatch)>>,
    }

    impl CompactionSink for CollectingSink {
        fn ingest(&self, descriptor: &CollectionDescriptor, batch: MutationBatch) -> Result<()> {
            self.batches
                .lock()
                .push((descriptor.name.clone(), batch));
            Ok(())
        }
    }

    fn open_store() -> (MemIngestStore, Arc<CollectingSink>, StoreIndex) {
        let sink = Arc::new(CollectingSink::default());
        let store = MemIngestStore::new(sink.clone());
        let index = store
            .register(CollectionDescriptor::new("kv0"), Arc::new(NullCallback))
            .unwrap();
        (store, sink, index)
    }

    fn lookup(store: &MemIngestStore, index: StoreIndex, key: &[u8], seqno: u64) -> LookupResult {
        let mut raw = [0u8; 64];
        let mut vbuf = ValueBuf::new(&mut raw);
        store
            .get(index, key, seqno, LookupFlags::default(), &mut vbuf)
            .unwrap()
    }

    #[test]
    fn test_versions_resolve_by_snapshot() {
        let (store, _, index) = open_store();

        store.put(index, b"k", b"v1", 5).unwrap();
        store.put(index, b"k", b"v2", 9).unwrap();

        let mut raw = [0u8; 8];
        let mut vbuf = ValueBuf::new(&mut raw);
        assert_eq!(
            store
                .get(index, b"k", 7, LookupFlags::default(), &mut vbuf)
                .unwrap(),
            LookupResult::Found
        );
        assert_eq!(vbuf.as_slice(), b"v1");

        let mut raw = [0u8; 8];
        let mut vbuf = ValueBuf::new(&mut raw);
        assert_eq!(
            store
                .get(index, b"k", 9, LookupFlags::default(), &mut vbuf)
                .unwrap(),
            LookupResult::Found
        );
        assert_eq!(vbuf.as_slice(), b"v2");

        // Older than any version.
        assert_eq!(lookup(&store, index, b"k", 4), LookupResult::NotFound);
    }

    #[test]
    fn test_equal_seqno_is_last_writer_wins() {
        let (store, _, index) = open_store();

        store.put(index, b"k", b"first", 3).unwrap();
        store.put(index, b"k", b"second", 3).unwrap();

        let mut raw = [0u8; 8];
        let mut vbuf = ValueBuf::new(&mut raw);
        store
            .get(index, b"k", 3, LookupFlags::default(), &mut vbuf)
            .unwrap();
        assert_eq!(vbuf.as_slice(), b"second");
    }

    #[test]
    fn test_hide_tombstones_flag() {
        let (store, _, index) = open_store();
        store.put(index, b"k", b"v", 1).unwrap();
        store.delete(index, b"k", 2).unwrap();

        assert_eq!(lookup(&store, index, b"k", 2), LookupResult::Tombstone);

        let mut raw = [0u8; 8];
        let mut vbuf = ValueBuf::new(&mut raw);
        let flags = LookupFlags {
            hide_tombstones: true,
        };
        assert_eq!(
            store.get(index, b"k", 2, flags, &mut vbuf).unwrap(),
            LookupResult::NotFound
        );
    }

    #[test]
    fn test_prefix_tombstone_ties_win() {
        let (store, _, index) = open_store();
        store.put(index, b"ab1", b"v", 4).unwrap();
        store.prefix_delete(index, b"ab", 4).unwrap();

        assert_eq!(lookup(&store, index, b"ab1", 4), LookupResult::Tombstone);
    }

    #[test]
    fn test_put_above_prefix_tombstone_is_visible() {
        let (store, _, index) = open_store();
        store.put(index, b"ab1", b"old", 2).unwrap();
        store.prefix_delete(index, b"ab", 3).unwrap();
        store.put(index, b"ab1", b"new", 4).unwrap();

        assert_eq!(lookup(&store, index, b"ab1", 3), LookupResult::Tombstone);
        assert_eq!(lookup(&store, index, b"ab1", 4), LookupResult::Found);
    }

    #[test]
    fn test_unknown_index_rejected() {
        let (store, _, _) = open_store();
        assert!(matches!(
            store.put(StoreIndex(99), b"k", b"v", 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sync_drains_once_and_orders_by_seqno() {
        let (store, sink, index) = open_store();
        store.put(index, b"b", b"2", 2).unwrap();
        store.put(index, b"a", b"1", 1).unwrap();
        store.delete(index, b"a", 3).unwrap();

        store.sync(index).unwrap();
        {
            let batches = sink.batches.lock();
            assert_eq!(batches.len(), 1);
            let (name, batch) = &batches[0];
            assert_eq!(name, "kv0");
            assert_eq!(batch.max_seqno, 3);
            let seqnos: Vec<u64> = batch.mutations.iter().map(|m| m.seqno).collect();
            assert_eq!(seqnos, vec![1, 2, 3]);
        }

        // Nothing new: idempotent no-op, no second batch.
        store.sync(index).unwrap();
        assert_eq!(sink.batches.lock().len(), 1);

        // New mutation after a sync is drained by the next one.
        store.put(index, b"c", b"3", 4).unwrap();
        store.sync(index).unwrap();
        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].1.mutations.len(), 1);
    }

    /// Sink that holds every `ingest` call until released, so two drains
    /// can be forced to overlap.
    struct GatedSink {
        entered: AtomicUsize,
        release: AtomicBool,
        batches: Mutex<Vec<MutationBatch>>,
    }

    impl CompactionSink for GatedSink {
        fn ingest(&self, _descriptor: &CollectionDescriptor, batch: MutationBatch) -> Result<()> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    #[test]
    fn test_overlapping_syncs_drain_once() {
        let sink = Arc::new(GatedSink {
            entered: AtomicUsize::new(0),
            release: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemIngestStore::with_budget(sink.clone(), 16));
        let index = store
            .register(CollectionDescriptor::new("kv0"), Arc::new(NullCallback))
            .unwrap();
        store.put(index, b"aaaa", b"bbbb", 1).unwrap();

        let mut handles = vec![];
        for _ in 0..2 {
            let store = store.clone();
            handles.push(thread::spawn(move || store.sync(index).unwrap()));
        }

        // Exactly one sync may reach the sink; the other waits behind the
        // per-collection drain and then finds nothing left.
        while sink.entered.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.entered.load(Ordering::SeqCst), 1);

        sink.release.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.join().unwrap();
        }

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].mutations.len(), 1);
        drop(batches);

        // The 8 drained bytes were released exactly once, so the budget
        // still admits a full-size ingest.
        store.put(index, b"cccccccc", b"dddddddd", 2).unwrap();
    }

    #[test]
    fn test_budget_exhaustion_reports_out_of_memory() {
        let sink = Arc::new(CollectingSink::default());
        let store = MemIngestStore::with_budget(sink, 16);
        let index = store
            .register(CollectionDescriptor::new("kv0"), Arc::new(NullCallback))
            .unwrap();

        store.put(index, b"aaaa", b"bbbb", 1).unwrap();
        assert_eq!(
            store.put(index, b"cccccccc", b"dddddddd", 2),
            Err(Error::OutOfMemory)
        );

        // Syncing frees budget for further ingest.
        store.sync(index).unwrap();
        store.put(index, b"cccccccc", b"dddddddd", 2).unwrap();
    }
}
