pub mod alert;
pub mod buffer;
pub mod cursor;
pub mod flusher;
pub mod gap_scanner;
pub mod gap_tracker;
pub mod health;
pub mod heartbeat;
pub mod ingestor;
pub mod liveness;
pub mod metrics;
pub mod missed;
pub mod monitor;
pub mod source;
pub mod subscriber;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;
