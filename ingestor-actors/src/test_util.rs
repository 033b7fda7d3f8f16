//! In-memory collaborators for unit tests.

use crate::alert::{Alert, AlertChannel, NotifyError};
use crate::liveness::LivenessPing;
use crate::source::{BlockSource, FetchError};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use ingestor_db::{
    BlockSink, DbError, GapRange, LatestRecord, Record, SequenceBounds, consecutive_gaps,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn record(sequence_number: u64) -> Record {
    Record {
        sequence_number,
        captured_at: 1_700_000_000 + sequence_number * 12,
        gas_limit: 30_000_000,
        gas_used: 15_000_000,
        base_fee_per_gas: 7,
        transaction_count: 120,
        difficulty: 0,
        total_difficulty: None,
        size: 40_000,
        blob_gas_used: Some(0),
        excess_blob_gas: Some(0),
    }
}

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<u64, Record>>,
    fail_writes: AtomicBool,
    panic_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
}

impl MemorySink {
    pub fn set_panic_writes(&self, panic: bool) {
        self.panic_writes.store(panic, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<u64> {
        self.records.lock().keys().copied().collect()
    }

    pub fn successful_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<(), DbError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DbError::Corrupted("injected read failure".to_string()));
        }
        Ok(())
    }
}

impl BlockSink for MemorySink {
    fn insert_batch(&self, records: &[Record]) -> Result<(), DbError> {
        if self.panic_writes.load(Ordering::SeqCst) {
            panic!("sink write panicked");
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Conflict);
        }
        let mut stored = self.records.lock();
        for record in records {
            stored.insert(record.sequence_number, *record);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch_by_key(&self, sequence_number: u64) -> Result<Option<Record>, DbError> {
        self.check_reads()?;
        Ok(self.records.lock().get(&sequence_number).copied())
    }

    fn query_gaps(&self) -> Result<Vec<GapRange>, DbError> {
        self.check_reads()?;
        Ok(consecutive_gaps(self.records.lock().keys().copied()))
    }

    fn query_latest(&self) -> Result<Option<LatestRecord>, DbError> {
        self.check_reads()?;
        Ok(self
            .records
            .lock()
            .last_key_value()
            .map(|(_, record)| LatestRecord {
                sequence_number: record.sequence_number,
                captured_at: record.captured_at,
            }))
    }

    fn query_count_and_bounds(&self) -> Result<Option<SequenceBounds>, DbError> {
        self.check_reads()?;
        let records = self.records.lock();
        let (Some(min), Some(max)) = (records.keys().next(), records.keys().next_back()) else {
            return Ok(None);
        };
        Ok(Some(SequenceBounds {
            count: records.len() as u64,
            min: *min,
            max: *max,
        }))
    }
}

/// Serves every key in `available`; keys in `failures` fail that many times
/// first.
#[derive(Default)]
pub struct FakeSource {
    available: Mutex<BTreeSet<u64>>,
    failures: Mutex<HashMap<u64, u32>>,
    calls: Mutex<HashMap<u64, u32>>,
}

impl FakeSource {
    pub fn with_range(range: impl IntoIterator<Item = u64>) -> Self {
        Self {
            available: Mutex::new(range.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, sequence_number: u64, times: u32) {
        self.failures.lock().insert(sequence_number, times);
    }

    pub fn make_available(&self, sequence_number: u64) {
        self.available.lock().insert(sequence_number);
    }

    pub fn calls(&self, sequence_number: u64) -> u32 {
        self.calls
            .lock()
            .get(&sequence_number)
            .copied()
            .unwrap_or_default()
    }

    fn resolve(&self, sequence_number: u64) -> Result<Record, FetchError> {
        *self.calls.lock().entry(sequence_number).or_default() += 1;
        if let Some(remaining) = self.failures.lock().get_mut(&sequence_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Rpc {
                    code: -32000,
                    message: "injected failure".to_string(),
                });
            }
        }
        if self.available.lock().contains(&sequence_number) {
            Ok(record(sequence_number))
        } else {
            Err(FetchError::NotFound(sequence_number))
        }
    }
}

impl BlockSource for FakeSource {
    fn fetch_block(
        &self,
        sequence_number: u64,
    ) -> impl Future<Output = Result<Record, FetchError>> + Send {
        futures_util::future::ready(self.resolve(sequence_number))
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    sent: Mutex<Vec<Alert>>,
    fail: AtomicBool,
}

impl RecordingAlerts {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|a| a.title.clone()).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl AlertChannel for RecordingAlerts {
    fn send(&self, alert: Alert) -> BoxFuture<'_, Result<(), NotifyError>> {
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(NotifyError::Rejected {
                status: 500,
                body: "injected".to_string(),
            })
        } else {
            self.sent.lock().push(alert);
            Ok(())
        };
        futures_util::future::ready(result).boxed()
    }
}

#[derive(Default)]
pub struct RecordingPing {
    pings: Mutex<Vec<(bool, String)>>,
}

impl RecordingPing {
    pub fn pings(&self) -> Vec<(bool, String)> {
        self.pings.lock().clone()
    }
}

impl LivenessPing for RecordingPing {
    fn ping(&self, success: bool, diagnostic: String) -> BoxFuture<'_, Result<(), NotifyError>> {
        self.pings.lock().push((success, diagnostic));
        futures_util::future::ready(Ok(())).boxed()
    }
}
