//! Boundary contract between per-collection write buffers and the shared,
//! multi-collection ingest store, plus the types that cross it.
//!
//! The store is concurrency-safe for many write buffers across many
//! collections; a `WriteBuffer` is a thin forwarder on top of it. Everything
//! downstream of `sync`/`flush` (durability, on-disk layout) belongs to the
//! compaction tier behind `CompactionSink`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Index assigned by the shared store when a collection registers. Valid
/// only against the store that issued it, from `register` to `deregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StoreIndex(pub u32);

impl fmt::Display for StoreIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    /// Shared key prefix length used by the surrounding engine's placement
    /// logic; not interpreted by this tier.
    pub prefix_len: usize,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix_len: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument(
                "collection name must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    Put(Bytes),
    /// Point tombstone: shadows the exact key at and above its seqno.
    Tombstone,
    /// Range tombstone: the mutation key is a prefix shadowing every key
    /// that starts with it, at and above its seqno.
    PrefixTombstone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: Vec<u8>,
    pub op: MutationOp,
    pub seqno: u64,
}

/// Ordered set of mutations handed to the compaction tier by one
/// sync/flush, sorted by seqno ascending.
#[derive(Debug, Clone, Default)]
pub struct MutationBatch {
    pub mutations: Vec<Mutation>,
    pub max_seqno: u64,
}

impl MutationBatch {
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Found,
    NotFound,
    Tombstone,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LookupFlags {
    /// Report tombstoned keys as `NotFound` instead of `Tombstone`.
    pub hide_tombstones: bool,
}

/// Caller-supplied destination for a looked-up value. The store writes at
/// most `capacity` bytes and always records the value's true length, so a
/// caller detects truncation by comparing `value_len()` to `capacity()`.
#[derive(Debug)]
pub struct ValueBuf<'a> {
    buf: &'a mut [u8],
    copied: usize,
    value_len: usize,
}

impl<'a> ValueBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            copied: 0,
            value_len: 0,
        }
    }

    /// Copies as much of `value` as fits and records its true length.
    pub fn fill(&mut self, value: &[u8]) {
        self.value_len = value.len();
        self.copied = value.len().min(self.buf.len());
        self.buf[..self.copied].copy_from_slice(&value[..self.copied]);
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes_written(&self) -> usize {
        self.copied
    }

    /// True length of the stored value, which may exceed `bytes_written`.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    pub fn is_truncated(&self) -> bool {
        self.value_len > self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.copied]
    }
}

/// Back-pointer a write buffer hands to the store at registration so the
/// store can notify it of lifecycle events.
pub trait BufferCallback: Send + Sync {
    /// Invoked after the store has drained this collection's mutations up
    /// to `max_seqno` toward the compaction tier.
    fn on_sync(&self, max_seqno: u64) {
        let _ = max_seqno;
    }
}

/// The persistent compaction tier, seen from this crate as a sink for
/// synced mutation batches.
pub trait CompactionSink: Send + Sync {
    fn ingest(&self, descriptor: &CollectionDescriptor, batch: MutationBatch) -> Result<()>;
}

/// Shared, multi-collection, concurrency-safe in-memory mutation index.
///
/// Errors returned by an implementation surface verbatim through the
/// `WriteBuffer` that forwarded the call.
pub trait SharedIngestStore: Send + Sync {
    /// Registers a collection and returns its assigned index. `callback`
    /// is held until `deregister` and invoked on sync completion.
    fn register(
        &self,
        descriptor: CollectionDescriptor,
        callback: Arc<dyn BufferCallback>,
    ) -> Result<StoreIndex>;

    fn deregister(&self, index: StoreIndex) -> Result<()>;

    fn put(&self, index: StoreIndex, key: &[u8], value: &[u8], seqno: u64) -> Result<()>;

    fn delete(&self, index: StoreIndex, key: &[u8], seqno: u64) -> Result<()>;

    /// Records a single logical range tombstone over `prefix`; never
    /// decomposed into per-key tombstones.
    fn prefix_delete(&self, index: StoreIndex, prefix: &[u8], seqno: u64) -> Result<()>;

    /// Looks up `key` as of snapshot `seqno`, writing the value (possibly
    /// truncated) into `vbuf`. Read-only.
    fn get(
        &self,
        index: StoreIndex,
        key: &[u8],
        seqno: u64,
        flags: LookupFlags,
        vbuf: &mut ValueBuf<'_>,
    ) -> Result<LookupResult>;

    /// Makes all mutations submitted for `index` so far durable candidates
    /// for the compaction tier. Idempotent: a repeat call with no
    /// intervening mutation is a successful no-op.
    fn sync(&self, index: StoreIndex) -> Result<()>;

    /// Non-blocking counterpart of `sync`: seals the collection's current
    /// mutation set and hands it onward without waiting for durability.
    fn flush(&self, index: StoreIndex) -> Result<()>;
}

/// The owning database handle, reduced to the one capability this tier
/// needs from it: resolving the current shared ingest store. Returning
/// `None` means the store is unavailable and `open` fails with
/// `InvalidState`.
pub trait IngestStoreProvider {
    fn ingest_store(&self) -> Option<Arc<dyn SharedIngestStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_buf_fill_and_truncation() {
        let mut raw = [0u8; 4];
        let mut vbuf = ValueBuf::new(&mut raw);
        vbuf.fill(b"abcdef");
        assert_eq!(vbuf.bytes_written(), 4);
        assert_eq!(vbuf.value_len(), 6);
        assert!(vbuf.is_truncated());
        assert_eq!(vbuf.as_slice(), b"abcd");

        let mut raw = [0u8; 8];
        let mut vbuf = ValueBuf::new(&mut raw);
        vbuf.fill(b"abc");
        assert_eq!(vbuf.bytes_written(), 3);
        assert_eq!(vbuf.value_len(), 3);
        assert!(!vbuf.is_truncated());
        assert_eq!(vbuf.as_slice(), b"abc");
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(CollectionDescriptor::new("kv0").validate().is_ok());
        assert!(CollectionDescriptor::new("").validate().is_err());
    }
}
