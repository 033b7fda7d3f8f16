use zerocopy::little_endian::{U128, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// One block of the ingested sequence. `sequence_number` is the only key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub sequence_number: u64,
    /// Block timestamp, unix seconds.
    pub captured_at: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee_per_gas: u64,
    pub transaction_count: u64,
    pub difficulty: u128,
    pub total_difficulty: Option<u128>,
    pub size: u64,
    pub blob_gas_used: Option<u64>,
    pub excess_blob_gas: Option<u64>,
}

const TOTAL_DIFFICULTY: u8 = 1;
const BLOB_GAS_USED: u8 = 1 << 1;
const EXCESS_BLOB_GAS: u8 = 1 << 2;

/// Stored value of the blocks partition, key is the big-endian sequence number.
/// Nullable fields are zero on disk with their bit cleared in `present`.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Immutable, IntoBytes, FromBytes, Unaligned, KnownLayout,
)]
pub struct RecordValue {
    pub captured_at: U64,
    pub gas_limit: U64,
    pub gas_used: U64,
    pub base_fee_per_gas: U64,
    pub transaction_count: U64,
    pub difficulty: U128,
    pub total_difficulty: U128,
    pub size: U64,
    pub blob_gas_used: U64,
    pub excess_blob_gas: U64,
    pub present: u8,
}

impl From<&Record> for RecordValue {
    fn from(record: &Record) -> Self {
        let mut present = 0;
        if record.total_difficulty.is_some() {
            present |= TOTAL_DIFFICULTY;
        }
        if record.blob_gas_used.is_some() {
            present |= BLOB_GAS_USED;
        }
        if record.excess_blob_gas.is_some() {
            present |= EXCESS_BLOB_GAS;
        }
        Self {
            captured_at: record.captured_at.into(),
            gas_limit: record.gas_limit.into(),
            gas_used: record.gas_used.into(),
            base_fee_per_gas: record.base_fee_per_gas.into(),
            transaction_count: record.transaction_count.into(),
            difficulty: record.difficulty.into(),
            total_difficulty: record.total_difficulty.unwrap_or_default().into(),
            size: record.size.into(),
            blob_gas_used: record.blob_gas_used.unwrap_or_default().into(),
            excess_blob_gas: record.excess_blob_gas.unwrap_or_default().into(),
            present,
        }
    }
}

impl RecordValue {
    pub fn into_record(self, sequence_number: u64) -> Record {
        let flag = |bit: u8| self.present & bit != 0;
        Record {
            sequence_number,
            captured_at: self.captured_at.get(),
            gas_limit: self.gas_limit.get(),
            gas_used: self.gas_used.get(),
            base_fee_per_gas: self.base_fee_per_gas.get(),
            transaction_count: self.transaction_count.get(),
            difficulty: self.difficulty.get(),
            total_difficulty: flag(TOTAL_DIFFICULTY).then(|| self.total_difficulty.get()),
            size: self.size.get(),
            blob_gas_used: flag(BLOB_GAS_USED).then(|| self.blob_gas_used.get()),
            excess_blob_gas: flag(EXCESS_BLOB_GAS).then(|| self.excess_blob_gas.get()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nullable_fields_survive_layout() {
        let record = Record {
            sequence_number: 19_000_000,
            captured_at: 1_700_000_000,
            gas_limit: 30_000_000,
            gas_used: 12_000_000,
            base_fee_per_gas: 25,
            transaction_count: 150,
            difficulty: 0,
            total_difficulty: None,
            size: 60_000,
            blob_gas_used: Some(0),
            excess_blob_gas: None,
        };
        let value = RecordValue::from(&record);
        let bytes = value.as_bytes();
        let restored = RecordValue::read_from_bytes(bytes).unwrap();
        assert_eq!(restored.into_record(record.sequence_number), record);
    }

    #[test]
    fn test_value_size_is_fixed() {
        assert_eq!(size_of::<RecordValue>(), 8 * 8 + 16 * 2 + 1);
    }
}
