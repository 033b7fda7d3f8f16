use ingestor_db::{DbError, GapRange, SequenceBounds, SharedSink};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanReport {
    /// `None` for an empty sink.
    pub bounds: Option<SequenceBounds>,
    /// Ordered by `start`.
    pub ranges: Vec<GapRange>,
}

impl ScanReport {
    pub fn missing(&self) -> u64 {
        self.ranges.iter().map(|r| r.size).sum()
    }
}

/// Stateless consistency check of the sink. Blocking; call from
/// `spawn_blocking` in async code.
#[derive(Clone)]
pub struct GapScanner {
    sink: SharedSink,
}

impl GapScanner {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    pub fn scan(&self) -> Result<ScanReport, DbError> {
        let Some(bounds) = self.sink.query_count_and_bounds()? else {
            debug!("Sink is empty, nothing to scan");
            return Ok(ScanReport::default());
        };
        if bounds.is_complete() {
            debug!(count = bounds.count, min = bounds.min, max = bounds.max, "No gaps");
            return Ok(ScanReport {
                bounds: Some(bounds),
                ranges: Vec::new(),
            });
        }
        let ranges = self.sink.query_gaps()?;
        debug!(
            count = bounds.count,
            expected = bounds.expected(),
            ranges = ranges.len(),
            "Gap scan finished"
        );
        Ok(ScanReport {
            bounds: Some(bounds),
            ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MemorySink, record};
    use ingestor_db::BlockSink;
    use std::sync::Arc;

    fn sink_with(keys: impl Iterator<Item = u64>) -> Arc<MemorySink> {
        let sink = Arc::new(MemorySink::default());
        sink.insert_batch(&keys.map(record).collect::<Vec<_>>())
            .unwrap();
        sink
    }

    #[test]
    fn test_empty_sink_has_no_ranges() {
        let report = GapScanner::new(Arc::new(MemorySink::default()))
            .scan()
            .unwrap();
        assert_eq!(report, ScanReport::default());
    }

    #[test]
    fn test_reports_missing_range() {
        let sink = sink_with((1..=1000).filter(|k| !(501..=510).contains(k)));
        let scanner = GapScanner::new(sink);
        let first = scanner.scan().unwrap();
        assert_eq!(first.ranges, vec![GapRange::new(501, 510)]);
        assert_eq!(first.ranges[0].size, 10);
        assert_eq!(first.missing(), 10);
        assert_eq!(
            first.bounds,
            Some(SequenceBounds {
                count: 990,
                min: 1,
                max: 1000
            })
        );
        assert_eq!(scanner.scan().unwrap(), first);
    }

    #[test]
    fn test_complete_sink_skips_gap_query() {
        let sink = sink_with(1..=100);
        let report = GapScanner::new(sink).scan().unwrap();
        assert!(report.ranges.is_empty());
        assert_eq!(report.bounds.map(|b| b.count), Some(100));
    }

    #[test]
    fn test_query_failure_is_an_error() {
        let sink = sink_with(1..=10);
        sink.set_fail_reads(true);
        assert!(GapScanner::new(sink).scan().is_err());
    }
}
