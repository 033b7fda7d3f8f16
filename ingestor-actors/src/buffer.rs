use ingestor_db::Record;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Pending records between the ingest path and the flusher. The lock is held
/// only for the push or the swap.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    records: Mutex<Vec<Record>>,
    appended: Notify,
}

pub type SharedBuffer = Arc<RecordBuffer>;

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: Record) {
        self.records.lock().push(record);
        self.appended.notify_one();
    }

    /// Takes everything buffered so far and leaves the buffer empty.
    pub fn drain(&self) -> Vec<Record> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Puts a failed batch back in front of anything appended since it was
    /// drained, so the buffer stays oldest-first.
    pub fn requeue(&self, batch: Vec<Record>) {
        if batch.is_empty() {
            return;
        }
        let mut records = self.records.lock();
        let newer = std::mem::replace(&mut *records, batch);
        records.extend(newer);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Resolves after the next append, or immediately if one happened since
    /// the last wait.
    pub async fn appended(&self) {
        self.appended.notified().await
    }
}
