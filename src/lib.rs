//! emberkv: the in-memory write-buffering tier of a key-value storage
//! engine.
//!
//! Mutations (put, delete, prefix delete) enter through a per-collection
//! [`WriteBuffer`] handle, are indexed by a shared multi-collection
//! [`SharedIngestStore`], and leave as batches toward the compaction tier
//! when a handle syncs or closes. A [`TokenBucket`] rate limiter lets
//! ingestion callers pace themselves against downstream compaction
//! capacity.
//!
//! Durability, on-disk format, and the compaction tier itself are outside
//! this crate; they sit behind the [`CompactionSink`] and
//! [`SharedIngestStore`] traits.

pub mod config;
pub mod error;
pub mod memstore;
pub mod store;
pub mod throttle;
pub mod write_buffer;

pub use config::{ThrottleConfig, WriteBufferConfig};
pub use error::{Error, Result};
pub use memstore::MemIngestStore;
pub use store::{
    BufferCallback, CollectionDescriptor, CompactionSink, IngestStoreProvider, LookupFlags,
    LookupResult, Mutation, MutationBatch, MutationOp, SharedIngestStore, StoreIndex, ValueBuf,
};
pub use throttle::TokenBucket;
pub use write_buffer::WriteBuffer;
