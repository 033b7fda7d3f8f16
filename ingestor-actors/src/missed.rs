use std::collections::BTreeSet;

/// Keys the live path failed to resolve, retried lowest first.
#[derive(Debug, Default, Clone)]
pub struct MissedSequenceSet(BTreeSet<u64>);

impl MissedSequenceSet {
    pub fn insert(&mut self, sequence_number: u64) -> bool {
        self.0.insert(sequence_number)
    }

    pub fn insert_range(&mut self, start: u64, end: u64) {
        self.0.extend(start..=end);
    }

    pub fn remove(&mut self, sequence_number: u64) -> bool {
        self.0.remove(&sequence_number)
    }

    #[cfg(test)]
    pub fn contains(&self, sequence_number: u64) -> bool {
        self.0.contains(&sequence_number)
    }

    /// Up to `limit` keys in ascending order, without removing them.
    pub fn lowest(&self, limit: usize) -> Vec<u64> {
        self.0.iter().take(limit).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
