//! Data-source port: where the lookalike and custom pipelines read the full
//! customer population from.

use audience_core::types::CustomerRecord;
use audience_core::SegmentationResult;
use std::sync::Arc;

/// Supplies a snapshot of every customer record. Implementations are called
/// from blocking worker threads, never from the async executor.
pub trait CustomerDataSource: Send + Sync {
    fn fetch_all(&self) -> SegmentationResult<Vec<CustomerRecord>>;
}

/// Fixed in-memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataSource {
    records: Arc<Vec<CustomerRecord>>,
}

impl InMemoryDataSource {
    pub fn new(records: Vec<CustomerRecord>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CustomerDataSource for InMemoryDataSource {
    fn fetch_all(&self) -> SegmentationResult<Vec<CustomerRecord>> {
        Ok(self.records.as_ref().clone())
    }
}

impl<T: CustomerDataSource + ?Sized> CustomerDataSource for Arc<T> {
    fn fetch_all(&self) -> SegmentationResult<Vec<CustomerRecord>> {
        (**self).fetch_all()
    }
}
