use crate::metadata::MetadataPartition;
use crate::record::{Record, RecordValue};
use crate::sink::{BlockSink, DbError, GapRange, LatestRecord, SequenceBounds, consecutive_gaps};
use fjall::{PartitionCreateOptions, PersistMode, ReadTransaction, TxKeyspace, WriteTransaction};
use std::collections::BTreeSet;
use tracing::{debug, trace};
use zerocopy::{FromBytes, IntoBytes};

/// Blocks keyed by sequence number (u64 BE bytes), so iteration order is
/// sequence order.
/// Values: [`RecordValue`]
#[derive(Clone)]
pub struct BlocksPartition(pub fjall::TxPartition);

impl BlocksPartition {
    pub fn new(keyspace: &TxKeyspace) -> Result<Self, DbError> {
        Ok(Self(
            keyspace.open_partition(
                "blocks",
                PartitionCreateOptions::default()
                    .block_size(64 * 1024)
                    .compaction_strategy(fjall::compaction::Strategy::SizeTiered(
                        fjall::compaction::SizeTiered {
                            base_size: 8 * 1024 * 1024,
                            level_ratio: 6,
                        },
                    )),
            )?,
        ))
    }

    fn decode_key(key: &[u8]) -> Result<u64, DbError> {
        let key: [u8; 8] = key
            .try_into()
            .map_err(|_| DbError::Corrupted(format!("invalid block key length: {}", key.len())))?;
        Ok(u64::from_be_bytes(key))
    }

    fn decode_value(sequence_number: u64, value: &[u8]) -> Result<Record, DbError> {
        RecordValue::read_from_bytes(value)
            .map(|value| value.into_record(sequence_number))
            .map_err(|_| DbError::Corrupted(format!("invalid record value at {sequence_number}")))
    }

    /// Replaces any existing record with the same key.
    pub fn insert_wtx(&self, wtx: &mut WriteTransaction, record: &Record) {
        wtx.insert(
            &self.0,
            record.sequence_number.to_be_bytes(),
            RecordValue::from(record).as_bytes(),
        );
    }

    pub fn get(&self, sequence_number: u64) -> Result<Option<Record>, DbError> {
        self.0
            .get(sequence_number.to_be_bytes())?
            .map(|value| Self::decode_value(sequence_number, &value))
            .transpose()
    }

    pub fn last(&self) -> Result<Option<Record>, DbError> {
        self.0
            .inner()
            .last_key_value()?
            .map(|(key, value)| Self::decode_value(Self::decode_key(&key)?, &value))
            .transpose()
    }

    /// Ascending sequence numbers present in the partition.
    pub fn keys(&self) -> impl Iterator<Item = Result<u64, DbError>> + '_ {
        self.0.inner().keys().map(|key| Self::decode_key(&key?))
    }

    /// Full scan; the sink reads the counter kept in metadata instead.
    pub fn scan_len(&self) -> Result<usize, DbError> {
        Ok(self.0.inner().len()?)
    }

    pub fn contains_wtx(&self, wtx: &mut WriteTransaction, sequence_number: u64) -> Result<bool, DbError> {
        Ok(wtx.contains_key(&self.0, sequence_number.to_be_bytes())?)
    }

    /// Lowest and highest stored keys as seen by `rtx`.
    pub fn bounds_rtx(&self, rtx: &ReadTransaction) -> Result<Option<(u64, u64)>, DbError> {
        let (Some((first, _)), Some((last, _))) =
            (rtx.first_key_value(&self.0)?, rtx.last_key_value(&self.0)?)
        else {
            return Ok(None);
        };
        Ok(Some((Self::decode_key(&first)?, Self::decode_key(&last)?)))
    }
}

/// [`BlockSink`] over the embedded keyspace. Each batch is one transaction
/// followed by a journal sync. The transaction also moves the record counter,
/// so counting never scans the partition.
#[derive(Clone)]
pub struct FjallSink {
    keyspace: TxKeyspace,
    blocks: BlocksPartition,
    metadata: MetadataPartition,
}

impl FjallSink {
    pub fn new(keyspace: TxKeyspace, blocks: BlocksPartition, metadata: MetadataPartition) -> Self {
        Self {
            keyspace,
            blocks,
            metadata,
        }
    }

    #[cfg(test)]
    pub fn blocks(&self) -> &BlocksPartition {
        &self.blocks
    }
}

impl BlockSink for FjallSink {
    fn insert_batch(&self, records: &[Record]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut wtx = self.keyspace.write_tx()?;
        let mut added = 0;
        for sequence_number in records
            .iter()
            .map(|record| record.sequence_number)
            .collect::<BTreeSet<_>>()
        {
            if !self.blocks.contains_wtx(&mut wtx, sequence_number)? {
                added += 1;
            }
        }
        for record in records {
            self.blocks.insert_wtx(&mut wtx, record);
        }
        let count = self.metadata.record_count_wtx(&mut wtx)?.unwrap_or(0);
        self.metadata.set_record_count_wtx(&mut wtx, count + added);
        wtx.commit()?.map_err(|_| DbError::Conflict)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        trace!(records = records.len(), added, "Batch committed");
        Ok(())
    }

    fn fetch_by_key(&self, sequence_number: u64) -> Result<Option<Record>, DbError> {
        self.blocks.get(sequence_number)
    }

    fn query_gaps(&self) -> Result<Vec<GapRange>, DbError> {
        let gaps = itertools::process_results(self.blocks.keys(), |it| consecutive_gaps(it))?;
        debug!(gaps = gaps.len(), "Consecutive key scan finished");
        Ok(gaps)
    }

    fn query_latest(&self) -> Result<Option<LatestRecord>, DbError> {
        Ok(self.blocks.last()?.map(|record| LatestRecord {
            sequence_number: record.sequence_number,
            captured_at: record.captured_at,
        }))
    }

    fn query_count_and_bounds(&self) -> Result<Option<SequenceBounds>, DbError> {
        let rtx = self.keyspace.read_tx();
        let Some((min, max)) = self.blocks.bounds_rtx(&rtx)? else {
            return Ok(None);
        };
        Ok(Some(SequenceBounds {
            count: self.metadata.record_count_rtx(&rtx)?.unwrap_or(0),
            min,
            max,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fjall::Config;
    use tempfile::TempDir;

    pub(crate) fn create_test_sink() -> (TempDir, FjallSink) {
        let temp_dir = TempDir::new().unwrap();
        let keyspace = Config::new(temp_dir.path()).open_transactional().unwrap();
        let blocks = BlocksPartition::new(&keyspace).unwrap();
        let metadata = MetadataPartition::new(&keyspace).unwrap();
        (temp_dir, FjallSink::new(keyspace, blocks, metadata))
    }

    pub(crate) fn record(sequence_number: u64) -> Record {
        Record {
            sequence_number,
            captured_at: 1_700_000_000 + sequence_number * 12,
            gas_limit: 30_000_000,
            gas_used: 15_000_000,
            base_fee_per_gas: 10,
            transaction_count: 100,
            difficulty: 0,
            total_difficulty: None,
            size: 50_000,
            blob_gas_used: None,
            excess_blob_gas: None,
        }
    }

    #[test]
    fn test_empty_sink() {
        let (_temp_dir, sink) = create_test_sink();
        assert_eq!(sink.query_count_and_bounds().unwrap(), None);
        assert_eq!(sink.query_latest().unwrap(), None);
        assert!(sink.query_gaps().unwrap().is_empty());
    }

    #[test]
    fn test_insert_is_replace_by_key() {
        let (_temp_dir, sink) = create_test_sink();
        sink.insert_batch(&[record(7), record(8)]).unwrap();
        let mut replacement = record(7);
        replacement.gas_used = 1;
        sink.insert_batch(&[replacement, record(8)]).unwrap();

        assert_eq!(
            sink.query_count_and_bounds().unwrap(),
            Some(SequenceBounds {
                count: 2,
                min: 7,
                max: 8
            })
        );
        assert_eq!(sink.fetch_by_key(7).unwrap(), Some(replacement));
        assert_eq!(sink.fetch_by_key(9).unwrap(), None);
    }

    #[test]
    fn test_keys_sort_numerically() {
        let (_temp_dir, sink) = create_test_sink();
        // 256 and 1 would swap places under little-endian keys
        sink.insert_batch(&[record(256), record(1), record(2)]).unwrap();
        let keys = sink
            .blocks()
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(keys, vec![1, 2, 256]);
        assert_eq!(
            sink.query_latest().unwrap(),
            Some(LatestRecord {
                sequence_number: 256,
                captured_at: record(256).captured_at
            })
        );
    }

    #[test]
    fn test_query_gaps_over_stored_keys() {
        let (_temp_dir, sink) = create_test_sink();
        let records = (1..=1000)
            .filter(|k| !(501..=510).contains(k))
            .map(record)
            .collect::<Vec<_>>();
        sink.insert_batch(&records).unwrap();

        let gaps = sink.query_gaps().unwrap();
        assert_eq!(gaps, vec![GapRange::new(501, 510)]);
        assert_eq!(gaps[0].size, 10);
        assert_eq!(sink.query_gaps().unwrap(), gaps);
    }

    #[test]
    fn test_record_count_follows_inserts() {
        let (_temp_dir, sink) = create_test_sink();
        sink.insert_batch(&[record(1), record(2), record(2), record(5)])
            .unwrap();
        sink.insert_batch(&[record(5), record(6)]).unwrap();
        sink.insert_batch(&[]).unwrap();

        let bounds = sink.query_count_and_bounds().unwrap().unwrap();
        assert_eq!(
            bounds,
            SequenceBounds {
                count: 4,
                min: 1,
                max: 6
            }
        );
        assert!(!bounds.is_complete());
        assert_eq!(bounds.count, sink.blocks().scan_len().unwrap() as u64);
    }
}
