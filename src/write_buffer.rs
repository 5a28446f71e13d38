//! Per-collection write-buffer handle: registers with the shared ingest
//! store at `open`, forwards put/get/delete/prefix-delete/sync, and owns
//! the sync-then-deregister teardown ordering at `close`.
//!
//! The handle is a thin forwarder. It holds no lock and keeps no mutation
//! state of its own beyond an advisory pending-mutation counter; ordering
//! between a caller's own writes to one key is the caller's concern (or is
//! resolved by sequence numbers at read time).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::WriteBufferConfig;
use crate::error::{first_error, Error, Result};
use crate::store::{
    BufferCallback, CollectionDescriptor, IngestStoreProvider, LookupFlags, LookupResult,
    SharedIngestStore, StoreIndex, ValueBuf,
};
use crate::throttle::TokenBucket;

/// Counts mutations accepted since the last successful sync. Registered
/// with the store as the handle's callback so the store resets it when it
/// drains the collection. Advisory: a put racing a concurrent sync may be
/// counted against the wrong side.
#[derive(Default)]
struct PendingCounter {
    pending: AtomicU64,
    synced_seqno: AtomicU64,
}

impl BufferCallback for PendingCounter {
    fn on_sync(&self, max_seqno: u64) {
        self.pending.store(0, Ordering::Release);
        self.synced_seqno.fetch_max(max_seqno, Ordering::AcqRel);
    }
}

/// Registration slot held in the shared store, released exactly once: by
/// `close`, or best-effort on drop so an abandoned handle cannot leak the
/// slot.
struct Registration {
    store: Arc<dyn SharedIngestStore>,
    index: StoreIndex,
    armed: bool,
}

impl Registration {
    fn release(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        self.store.deregister(self.index)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.armed {
            warn!("write buffer at index {} dropped without close", self.index);
            if let Err(e) = self.release() {
                warn!("deregister of dropped write buffer failed: {}", e);
            }
        }
    }
}

pub struct WriteBuffer {
    registration: Registration,
    descriptor: CollectionDescriptor,
    pending: Arc<PendingCounter>,
    throttle: Option<TokenBucket>,
    key_len_max: usize,
    value_len_max: usize,
}

// Manual impl: the store behind `registration` is a trait object.
impl fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("collection", &self.descriptor.name)
            .field("index", &self.registration.index)
            .field("pending", &self.pending_mutations())
            .finish_non_exhaustive()
    }
}

impl WriteBuffer {
    /// Opens a write buffer for `descriptor`, resolving the shared ingest
    /// store from `owner` and registering with it.
    ///
    /// Fails atomically: on any error no handle is returned and no
    /// registration is left behind. Store unavailability is
    /// `InvalidState`; a registration failure surfaces the store's error
    /// verbatim.
    pub fn open(
        owner: &dyn IngestStoreProvider,
        config: &WriteBufferConfig,
        descriptor: CollectionDescriptor,
    ) -> Result<Self> {
        config.validate()?;
        descriptor.validate()?;

        let store = owner.ingest_store().ok_or_else(|| {
            Error::InvalidState("shared ingest store is not available".into())
        })?;

        let throttle = match &config.throttle {
            Some(t) => Some(TokenBucket::new(t.burst, t.rate)?),
            None => None,
        };

        let pending = Arc::new(PendingCounter::default());
        let index = store.register(descriptor.clone(), pending.clone())?;
        debug!(
            "opened write buffer for collection {} at index {}",
            descriptor.name, index
        );

        Ok(Self {
            registration: Registration {
                store,
                index,
                armed: true,
            },
            descriptor,
            pending,
            throttle,
            key_len_max: config.key_len_max,
            value_len_max: config.value_len_max,
        })
    }

    /// Closes the handle in fixed order: sync outstanding mutations, then
    /// deregister unconditionally, then release local state. The first
    /// error wins, but every step still runs; a sync failure is never
    /// masked by a later deregistration failure, and the registration slot
    /// is never leaked.
    pub fn close(mut self) -> Result<()> {
        let index = self.registration.index;
        let synced = self.registration.store.sync(index);
        if let Err(e) = &synced {
            warn!("sync during close of index {} failed: {}", index, e);
        }
        let deregistered = self.registration.release();
        debug!(
            "closed write buffer for collection {} at index {}",
            self.descriptor.name, index
        );
        first_error(synced, deregistered)
    }

    /// Forwards a put tagged with this collection's store index. No local
    /// buffering, no retries; a store failure surfaces verbatim.
    pub fn put(&self, key: &[u8], value: &[u8], seqno: u64) -> Result<()> {
        self.check_key(key)?;
        if value.len() > self.value_len_max {
            return Err(Error::InvalidArgument(format!(
                "value length {} exceeds maximum {}",
                value.len(),
                self.value_len_max
            )));
        }
        self.registration
            .store
            .put(self.registration.index, key, value, seqno)?;
        self.pending.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Inserts a point tombstone visible to lookups at or above `seqno`.
    pub fn delete(&self, key: &[u8], seqno: u64) -> Result<()> {
        self.check_key(key)?;
        self.registration
            .store
            .delete(self.registration.index, key, seqno)?;
        self.pending.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Inserts one logical range tombstone covering every key that starts
    /// with `prefix`; never decomposed into per-key tombstones here.
    pub fn prefix_delete(&self, prefix: &[u8], seqno: u64) -> Result<()> {
        self.check_key(prefix)?;
        self.registration
            .store
            .prefix_delete(self.registration.index, prefix, seqno)?;
        self.pending.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Looks up `key` at snapshot `seqno`, writing the value into `vbuf`
    /// per its truncation contract. Read-only.
    pub fn get(
        &self,
        key: &[u8],
        seqno: u64,
        flags: LookupFlags,
        vbuf: &mut ValueBuf<'_>,
    ) -> Result<LookupResult> {
        self.check_key(key)?;
        self.registration
            .store
            .get(self.registration.index, key, seqno, flags, vbuf)
    }

    /// Makes every mutation submitted through this handle so far a durable
    /// candidate for the compaction tier. Idempotent.
    pub fn sync(&self) -> Result<()> {
        self.registration.store.sync(self.registration.index)
    }

    /// Non-blocking counterpart of `sync`.
    pub fn flush(&self) -> Result<()> {
        self.registration.store.flush(self.registration.index)
    }

    pub fn index(&self) -> StoreIndex {
        self.registration.index
    }

    pub fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }

    /// Mutations accepted since the last successful sync. Advisory.
    pub fn pending_mutations(&self) -> u64 {
        self.pending.pending.load(Ordering::Acquire)
    }

    /// Highest seqno known drained to the compaction tier.
    pub fn synced_seqno(&self) -> u64 {
        self.pending.synced_seqno.load(Ordering::Acquire)
    }

    /// Ingestion throttle, present when the config asked for one. Callers
    /// consult it before admitting a batch; the write path itself never
    /// blocks on it.
    pub fn throttle(&self) -> Option<&TokenBucket> {
        self.throttle.as_ref()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must be non-empty".into()));
        }
        if key.len() > self.key_len_max {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                self.key_len_max
            )));
        }
        Ok(())
    }
}
