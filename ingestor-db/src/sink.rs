use crate::record::Record;
use itertools::Itertools;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),
    #[error("write transaction conflict")]
    Conflict,
    #[error("db corrupted: {0}")]
    Corrupted(String),
}

/// A contiguous run of keys missing between two present keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GapRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl GapRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            size: end - start + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceBounds {
    pub count: u64,
    pub min: u64,
    pub max: u64,
}

impl SequenceBounds {
    pub fn expected(&self) -> u64 {
        self.max - self.min + 1
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.expected()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestRecord {
    pub sequence_number: u64,
    pub captured_at: u64,
}

/// Analytical sink contract. Inserting an existing key replaces it.
pub trait BlockSink: Send + Sync + 'static {
    fn insert_batch(&self, records: &[Record]) -> Result<(), DbError>;

    fn fetch_by_key(&self, sequence_number: u64) -> Result<Option<Record>, DbError>;

    fn query_gaps(&self) -> Result<Vec<GapRange>, DbError>;

    fn query_latest(&self) -> Result<Option<LatestRecord>, DbError>;

    /// `None` when the sink is empty.
    fn query_count_and_bounds(&self) -> Result<Option<SequenceBounds>, DbError>;
}

pub type SharedSink = Arc<dyn BlockSink>;

/// Walks ascending keys and reports every `[prev + 1, cur - 1]` with
/// `cur - prev > 1`. Repeated keys are collapsed first.
pub fn consecutive_gaps(keys: impl IntoIterator<Item = u64>) -> Vec<GapRange> {
    keys.into_iter()
        .dedup()
        .tuple_windows()
        .filter(|(prev, cur)| cur - prev > 1)
        .map(|(prev, cur)| GapRange::new(prev + 1, cur - 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_gaps_in_contiguous_run() {
        assert!(consecutive_gaps(1..=1000).is_empty());
    }

    #[test]
    fn test_empty_and_single_key() {
        assert!(consecutive_gaps(std::iter::empty()).is_empty());
        assert!(consecutive_gaps([42]).is_empty());
    }

    #[test]
    fn test_reports_every_range() {
        let keys = [1, 2, 5, 6, 7, 20, 21];
        assert_eq!(
            consecutive_gaps(keys),
            vec![GapRange::new(3, 4), GapRange::new(8, 19)]
        );
        assert_eq!(GapRange::new(8, 19).size, 12);
    }

    #[test]
    fn test_duplicates_do_not_create_gaps() {
        let keys = [10, 10, 11, 11, 11, 13, 13];
        assert_eq!(consecutive_gaps(keys), vec![GapRange::new(12, 12)]);
    }

    #[test]
    fn test_bounds_precheck() {
        let complete = SequenceBounds {
            count: 10,
            min: 1,
            max: 10,
        };
        assert!(complete.is_complete());
        let holed = SequenceBounds {
            count: 990,
            min: 1,
            max: 1000,
        };
        assert!(!holed.is_complete());
    }
}
