use std::sync::Arc;

use parking_lot::Mutex;

use emberkv::{
    CollectionDescriptor, CompactionSink, IngestStoreProvider, MemIngestStore, MutationBatch,
    Result, SharedIngestStore,
};

/// Compaction tier stand-in that records every batch it is handed.
#[derive(Default)]
pub struct CollectingSink {
    pub batches: Mutex<Vec<(String, MutationBatch)>>,
}

impl CollectingSink {
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

impl CompactionSink for CollectingSink {
    fn ingest(&self, descriptor: &CollectionDescriptor, batch: MutationBatch) -> Result<()> {
        self.batches
            .lock()
            .push((descriptor.name.clone(), batch));
        Ok(())
    }
}

/// Owning database handle stand-in backed by the reference store.
pub struct TestDb {
    pub store: Arc<MemIngestStore>,
    pub sink: Arc<CollectingSink>,
}

impl TestDb {
    pub fn new() -> Self {
        let sink = Arc::new(CollectingSink::default());
        let store = Arc::new(MemIngestStore::new(sink.clone()));
        Self { store, sink }
    }
}

impl IngestStoreProvider for TestDb {
    fn ingest_store(&self) -> Option<Arc<dyn SharedIngestStore>> {
        Some(self.store.clone())
    }
}
