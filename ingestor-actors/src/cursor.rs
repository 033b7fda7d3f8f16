/// Outcome of feeding one resolved key to [`SequenceCursor::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDecision {
    /// The cursor was unset and is now seeded.
    First,
    InOrder,
    /// Keys `start..=end` were skipped by the feed.
    Gap { start: u64, end: u64 },
    /// Duplicate or out-of-order key, cursor unchanged.
    Behind,
}

/// Expected next key of the live stream. Lives in memory only, the gap
/// monitor covers whatever a restart loses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceCursor {
    next: Option<u64>,
}

impl SequenceCursor {
    #[cfg(test)]
    pub fn expected(&self) -> Option<u64> {
        self.next
    }

    pub fn observe(&mut self, sequence_number: u64) -> CursorDecision {
        let advanced = Some(sequence_number.saturating_add(1));
        match self.next {
            None => {
                self.next = advanced;
                CursorDecision::First
            }
            Some(next) if sequence_number == next => {
                self.next = advanced;
                CursorDecision::InOrder
            }
            Some(next) if sequence_number > next => {
                self.next = advanced;
                CursorDecision::Gap {
                    start: next,
                    end: sequence_number - 1,
                }
            }
            Some(_) => CursorDecision::Behind,
        }
    }
}
