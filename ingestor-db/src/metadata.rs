use crate::sink::DbError;
use fjall::{CompressionType, PartitionCreateOptions, ReadTransaction, TxKeyspace, WriteTransaction};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, IntoBytes};

pub const DB_VERSION: u32 = 1;

/// Small singleton values.
/// Key: [`MetadataKey`]
#[derive(Clone)]
pub struct MetadataPartition(pub fjall::TxPartition);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    DbVersion = 0,
    /// Bitmask of degraded reasons reported by the previous monitor cycle.
    HealthReasons = 1,
    /// Number of keys in the blocks partition, kept by every batch insert.
    RecordCount = 2,
}

impl MetadataPartition {
    pub fn new(keyspace: &TxKeyspace) -> Result<Self, DbError> {
        Ok(Self(
            keyspace.open_partition(
                "metadata",
                PartitionCreateOptions::default()
                    .block_size(1024)
                    .compression(CompressionType::None),
            )?,
        ))
    }

    pub fn db_version(&self) -> Result<u32, DbError> {
        let Some(bytes) = self.0.get([MetadataKey::DbVersion as u8])? else {
            return Ok(0);
        };
        let version = U32::read_from_bytes(&bytes)
            .map_err(|_| DbError::Corrupted("failed to read db version".to_string()))?;
        Ok(version.get())
    }

    pub fn set_db_version(&self, version: u32) -> Result<(), DbError> {
        self.0
            .insert([MetadataKey::DbVersion as u8], U32::new(version).as_bytes())?;
        Ok(())
    }

    /// Stamps a fresh keyspace with [`DB_VERSION`] and refuses a keyspace
    /// written by a different layout.
    pub fn ensure_db_version(&self) -> Result<(), DbError> {
        match self.db_version()? {
            0 => self.set_db_version(DB_VERSION),
            DB_VERSION => Ok(()),
            other => Err(DbError::Corrupted(format!(
                "unsupported db version {other}, expected {DB_VERSION}"
            ))),
        }
    }

    pub fn health_reasons(&self) -> Result<u8, DbError> {
        match self.0.get([MetadataKey::HealthReasons as u8])? {
            None => Ok(0),
            Some(bytes) => match *bytes {
                [mask] => Ok(mask),
                _ => Err(DbError::Corrupted(
                    "failed to read health reasons".to_string(),
                )),
            },
        }
    }

    pub fn set_health_reasons(&self, mask: u8) -> Result<(), DbError> {
        self.0.insert([MetadataKey::HealthReasons as u8], [mask])?;
        Ok(())
    }

    fn decode_record_count(bytes: &[u8]) -> Result<u64, DbError> {
        U64::read_from_bytes(bytes)
            .map(|count| count.get())
            .map_err(|_| DbError::Corrupted("failed to read record count".to_string()))
    }

    /// `None` until the counter was first written.
    pub fn record_count(&self) -> Result<Option<u64>, DbError> {
        self.0
            .get([MetadataKey::RecordCount as u8])?
            .map(|bytes| Self::decode_record_count(&bytes))
            .transpose()
    }

    pub fn record_count_rtx(&self, rtx: &ReadTransaction) -> Result<Option<u64>, DbError> {
        rtx.get(&self.0, [MetadataKey::RecordCount as u8])?
            .map(|bytes| Self::decode_record_count(&bytes))
            .transpose()
    }

    pub fn record_count_wtx(&self, wtx: &mut WriteTransaction) -> Result<Option<u64>, DbError> {
        wtx.get(&self.0, [MetadataKey::RecordCount as u8])?
            .map(|bytes| Self::decode_record_count(&bytes))
            .transpose()
    }

    pub fn set_record_count(&self, count: u64) -> Result<(), DbError> {
        self.0
            .insert([MetadataKey::RecordCount as u8], U64::new(count).as_bytes())?;
        Ok(())
    }

    pub fn set_record_count_wtx(&self, wtx: &mut WriteTransaction, count: u64) {
        wtx.insert(
            &self.0,
            [MetadataKey::RecordCount as u8],
            U64::new(count).as_bytes(),
        );
    }
}
