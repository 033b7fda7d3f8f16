use crate::sink::{DbError, GapRange};
use fjall::{PartitionCreateOptions, ReadTransaction, TxKeyspace, WriteTransaction};
use time::OffsetDateTime;
use zerocopy::big_endian;
use zerocopy::little_endian::{I64, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Lifecycle row of one open gap, owned by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapTrackingEntry {
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    pub notified: bool,
}

impl GapTrackingEntry {
    pub fn opened(range: GapRange, now: OffsetDateTime) -> Self {
        Self {
            start: range.start,
            end: range.end,
            size: range.size,
            first_seen: now,
            last_seen: now,
            notified: false,
        }
    }

    pub fn key(&self) -> (u64, u64) {
        (self.start, self.end)
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Immutable, IntoBytes, FromBytes, Unaligned, KnownLayout,
)]
pub struct GapTrackingKey {
    pub start: big_endian::U64,
    pub end: big_endian::U64,
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Immutable, IntoBytes, FromBytes, Unaligned, KnownLayout,
)]
pub struct GapTrackingValue {
    pub size: U64,
    /// unix seconds
    pub first_seen: I64,
    pub last_seen: I64,
    pub notified: u8,
}

/// Open gaps keyed by `(start, end)`.
/// Key: [`GapTrackingKey`]
/// Value: [`GapTrackingValue`]
#[derive(Clone)]
pub struct GapTrackingPartition(pub fjall::TxPartition);

impl GapTrackingPartition {
    pub fn new(keyspace: &TxKeyspace) -> Result<Self, DbError> {
        Ok(Self(keyspace.open_partition(
            "gap_tracking",
            PartitionCreateOptions::default().block_size(4 * 1024),
        )?))
    }

    fn key(start: u64, end: u64) -> GapTrackingKey {
        GapTrackingKey {
            start: start.into(),
            end: end.into(),
        }
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<GapTrackingEntry, DbError> {
        let key = GapTrackingKey::read_from_bytes(key)
            .map_err(|_| DbError::Corrupted("invalid gap tracking key".to_string()))?;
        let value = GapTrackingValue::read_from_bytes(value)
            .map_err(|_| DbError::Corrupted("invalid gap tracking value".to_string()))?;
        let timestamp = |seconds: I64| {
            OffsetDateTime::from_unix_timestamp(seconds.get())
                .map_err(|err| DbError::Corrupted(format!("invalid gap timestamp: {err}")))
        };
        Ok(GapTrackingEntry {
            start: key.start.get(),
            end: key.end.get(),
            size: value.size.get(),
            first_seen: timestamp(value.first_seen)?,
            last_seen: timestamp(value.last_seen)?,
            notified: value.notified != 0,
        })
    }

    fn value(entry: &GapTrackingEntry) -> GapTrackingValue {
        GapTrackingValue {
            size: entry.size.into(),
            first_seen: entry.first_seen.unix_timestamp().into(),
            last_seen: entry.last_seen.unix_timestamp().into(),
            notified: entry.notified as u8,
        }
    }

    pub fn upsert_wtx(&self, wtx: &mut WriteTransaction, entry: &GapTrackingEntry) {
        wtx.insert(
            &self.0,
            Self::key(entry.start, entry.end).as_bytes(),
            Self::value(entry).as_bytes(),
        );
    }

    pub fn remove_wtx(&self, wtx: &mut WriteTransaction, start: u64, end: u64) {
        wtx.remove(&self.0, Self::key(start, end).as_bytes());
    }

    /// Every open entry, ordered by `(start, end)`.
    pub fn get_all_rtx<'a>(
        &'a self,
        rtx: &'a ReadTransaction,
    ) -> impl DoubleEndedIterator<Item = Result<GapTrackingEntry, DbError>> + 'a {
        rtx.iter(&self.0).map(|item| {
            let (key, value) = item?;
            Self::decode(&key, &value)
        })
    }

    pub fn get_all(&self) -> Result<Vec<GapTrackingEntry>, DbError> {
        self.0
            .inner()
            .iter()
            .map(|item| {
                let (key, value) = item?;
                Self::decode(&key, &value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fjall::Config;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn create_partition() -> (TempDir, TxKeyspace, GapTrackingPartition) {
        let temp_dir = TempDir::new().unwrap();
        let keyspace = Config::new(temp_dir.path()).open_transactional().unwrap();
        let partition = GapTrackingPartition::new(&keyspace).unwrap();
        (temp_dir, keyspace, partition)
    }

    #[test]
    fn test_upsert_then_remove() {
        let (_temp_dir, keyspace, partition) = create_partition();
        let first_seen = datetime!(2024-03-01 12:00 UTC);
        let mut entry = GapTrackingEntry::opened(GapRange::new(501, 510), first_seen);
        let mut wtx = keyspace.write_tx().unwrap();
        partition.upsert_wtx(&mut wtx, &entry);
        wtx.commit().unwrap().unwrap();

        entry.last_seen = datetime!(2024-03-01 12:30 UTC);
        entry.notified = true;
        let mut wtx = keyspace.write_tx().unwrap();
        partition.upsert_wtx(&mut wtx, &entry);
        wtx.commit().unwrap().unwrap();
        assert_eq!(partition.get_all().unwrap(), vec![entry]);

        let mut wtx = keyspace.write_tx().unwrap();
        partition.remove_wtx(&mut wtx, 501, 511);
        wtx.commit().unwrap().unwrap();
        assert_eq!(partition.get_all().unwrap(), vec![entry]);

        let mut wtx = keyspace.write_tx().unwrap();
        partition.remove_wtx(&mut wtx, 501, 510);
        wtx.commit().unwrap().unwrap();
        assert!(partition.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_entries_ordered_by_start() {
        let (_temp_dir, keyspace, partition) = create_partition();
        let now = datetime!(2024-03-01 12:00 UTC);
        let mut wtx = keyspace.write_tx().unwrap();
        for range in [
            GapRange::new(70_000, 70_001),
            GapRange::new(3, 4),
            GapRange::new(300, 300),
        ] {
            partition.upsert_wtx(&mut wtx, &GapTrackingEntry::opened(range, now));
        }
        wtx.commit().unwrap().unwrap();

        let rtx = keyspace.read_tx();
        let starts = partition
            .get_all_rtx(&rtx)
            .map(|entry| entry.map(|entry| entry.start))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(starts, vec![3, 300, 70_000]);
    }
}
