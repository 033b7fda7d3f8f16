pub mod blocks;
pub mod gap_tracking;
pub mod metadata;
pub mod record;
pub mod sink;

pub use blocks::{BlocksPartition, FjallSink};
pub use gap_tracking::{GapTrackingEntry, GapTrackingPartition};
pub use metadata::MetadataPartition;
pub use record::Record;
pub use sink::{
    BlockSink, DbError, GapRange, LatestRecord, SequenceBounds, SharedSink, consecutive_gaps,
};

use fjall::{Config, PersistMode, TxKeyspace};
use std::path::Path;
use tracing::info;

/// Every partition of the ingestor keyspace.
#[derive(Clone)]
pub struct Database {
    pub keyspace: TxKeyspace,
    pub blocks: BlocksPartition,
    pub gap_tracking: GapTrackingPartition,
    pub metadata: MetadataPartition,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let keyspace = Config::new(path).open_transactional()?;
        Self::from_keyspace(keyspace)
    }

    pub fn from_keyspace(keyspace: TxKeyspace) -> Result<Self, DbError> {
        let blocks = BlocksPartition::new(&keyspace)?;
        let gap_tracking = GapTrackingPartition::new(&keyspace)?;
        let metadata = MetadataPartition::new(&keyspace)?;
        metadata.ensure_db_version()?;
        if metadata.record_count()?.is_none() {
            let count = blocks.scan_len()? as u64;
            info!(count, "Initialising record counter");
            metadata.set_record_count(count)?;
        }
        Ok(Self {
            keyspace,
            blocks,
            gap_tracking,
            metadata,
        })
    }

    pub fn sink(&self) -> FjallSink {
        FjallSink::new(
            self.keyspace.clone(),
            self.blocks.clone(),
            self.metadata.clone(),
        )
    }

    pub fn persist(&self) -> Result<(), DbError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::tests::record;
    use crate::metadata::MetadataKey;
    use tempfile::TempDir;

    #[test]
    fn test_reopen_fills_missing_record_counter() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = Database::open(temp_dir.path()).unwrap();
            assert_eq!(db.metadata.record_count().unwrap(), Some(0));
            db.sink()
                .insert_batch(&[record(1), record(2), record(4)])
                .unwrap();
            // a keyspace written before the counter existed
            db.metadata
                .0
                .remove([MetadataKey::RecordCount as u8])
                .unwrap();
            db.persist().unwrap();
        }

        let db = Database::open(temp_dir.path()).unwrap();
        assert_eq!(db.metadata.record_count().unwrap(), Some(3));
        let bounds = db.sink().query_count_and_bounds().unwrap().unwrap();
        assert_eq!((bounds.count, bounds.min, bounds.max), (3, 1, 4));
    }
}
