//! Data transfer statistics.
//!
//! Keeps running byte totals plus two rolling histories:
//! - slow buckets: 5 minute resolution, 24 hours deep
//! - fast buckets: 1 second resolution, 288 seconds deep
//!
//! Times are milliseconds since the collector was created. The `*_at`
//! methods take an explicit timestamp and are what the wall-clock methods
//! delegate to.

use crate::bundle::{Bundle, BundleError};
use std::collections::VecDeque;
use std::time::Instant;

/// Slow bucket width
pub const SLOW_BUCKET_PERIOD_MS: u64 = 5 * 60 * 1000;
/// Fast bucket width
pub const FAST_BUCKET_PERIOD_MS: u64 = 1000;
/// Buckets kept per series
pub const MAX_BUCKETS: usize = 24 * 60 / 5;

const KEY_CONNECTED_TIME: &str = "dataTransferStatsConnectedTime";
const KEY_TOTAL_SENT: &str = "dataTransferStatsTotalBytesSent";
const KEY_TOTAL_RECEIVED: &str = "dataTransferStatsTotalBytesReceived";
const KEY_SLOW_SENT: &str = "dataTransferStatsSlowBucketsSent";
const KEY_SLOW_RECEIVED: &str = "dataTransferStatsSlowBucketsReceived";
const KEY_SLOW_LAST_START: &str = "dataTransferStatsSlowBucketsLastStartTime";
const KEY_FAST_SENT: &str = "dataTransferStatsFastBucketsSent";
const KEY_FAST_RECEIVED: &str = "dataTransferStatsFastBucketsReceived";
const KEY_FAST_LAST_START: &str = "dataTransferStatsFastBucketsLastStartTime";

/// Bytes transferred during one bucket period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone)]
struct BucketSeries {
    period_ms: u64,
    buckets: VecDeque<Bucket>,
    last_start_ms: u64,
}

impl BucketSeries {
    fn new(period_ms: u64, now_ms: u64) -> Self {
        Self {
            period_ms,
            buckets: VecDeque::from(vec![Bucket::default(); MAX_BUCKETS]),
            last_start_ms: bucket_start(now_ms, period_ms),
        }
    }

    /// Rotate in empty buckets for every period that elapsed since the
    /// current bucket started.
    fn advance(&mut self, now_ms: u64) {
        let start = bucket_start(now_ms, self.period_ms);
        if start <= self.last_start_ms {
            return;
        }
        let elapsed = ((start - self.last_start_ms) / self.period_ms) as usize;
        for _ in 0..elapsed.min(MAX_BUCKETS) {
            self.buckets.pop_front();
            self.buckets.push_back(Bucket::default());
        }
        self.last_start_ms = start;
    }

    fn add(&mut self, sent: u64, received: u64) {
        if let Some(current) = self.buckets.back_mut() {
            current.bytes_sent += sent;
            current.bytes_received += received;
        }
    }
}

fn bucket_start(now_ms: u64, period_ms: u64) -> u64 {
    period_ms * (now_ms / period_ms)
}

/// Service-side statistics collector.
#[derive(Debug, Clone)]
pub struct DataTransferStats {
    origin: Instant,
    connected_at_ms: Option<u64>,
    total_bytes_sent: u64,
    total_bytes_received: u64,
    slow: BucketSeries,
    fast: BucketSeries,
}

impl DataTransferStats {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            connected_at_ms: None,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            slow: BucketSeries::new(SLOW_BUCKET_PERIOD_MS, 0),
            fast: BucketSeries::new(FAST_BUCKET_PERIOD_MS, 0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Begin a new tunnel run: totals and histories are cleared.
    pub fn start_session(&mut self) {
        let now = self.now_ms();
        self.start_session_at(now);
    }

    pub fn start_session_at(&mut self, now_ms: u64) {
        self.total_bytes_sent = 0;
        self.total_bytes_received = 0;
        self.connected_at_ms = None;
        self.reset_buckets(now_ms);
    }

    /// Tunnel reached the connected state.
    pub fn start_connected(&mut self) {
        let now = self.now_ms();
        self.start_connected_at(now);
    }

    pub fn start_connected_at(&mut self, now_ms: u64) {
        self.connected_at_ms = Some(now_ms);
    }

    /// Tunnel lost its connection or stopped. Totals are kept.
    pub fn stop(&mut self) {
        let now = self.now_ms();
        self.stop_at(now);
    }

    pub fn stop_at(&mut self, now_ms: u64) {
        self.connected_at_ms = None;
        self.reset_buckets(now_ms);
    }

    fn reset_buckets(&mut self, now_ms: u64) {
        self.slow = BucketSeries::new(SLOW_BUCKET_PERIOD_MS, now_ms);
        self.fast = BucketSeries::new(FAST_BUCKET_PERIOD_MS, now_ms);
    }

    /// Account for bytes reported by the engine.
    pub fn add_bytes(&mut self, sent: u64, received: u64) {
        let now = self.now_ms();
        self.add_bytes_at(sent, received, now);
    }

    pub fn add_bytes_at(&mut self, sent: u64, received: u64, now_ms: u64) {
        self.total_bytes_sent += sent;
        self.total_bytes_received += received;
        self.slow.advance(now_ms);
        self.fast.advance(now_ms);
        self.slow.add(sent, received);
        self.fast.add(sent, received);
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    pub fn is_connected(&self) -> bool {
        self.connected_at_ms.is_some()
    }

    /// Point-in-time copy for transmission.
    pub fn snapshot(&mut self) -> DataTransferSnapshot {
        let now = self.now_ms();
        self.snapshot_at(now)
    }

    pub fn snapshot_at(&mut self, now_ms: u64) -> DataTransferSnapshot {
        self.slow.advance(now_ms);
        self.fast.advance(now_ms);
        DataTransferSnapshot {
            connected_time_ms: self
                .connected_at_ms
                .map(|t| now_ms.saturating_sub(t))
                .unwrap_or(0),
            total_bytes_sent: self.total_bytes_sent,
            total_bytes_received: self.total_bytes_received,
            slow_buckets: self.slow.buckets.iter().copied().collect(),
            slow_buckets_last_start_ms: self.slow.last_start_ms,
            fast_buckets: self.fast.buckets.iter().copied().collect(),
            fast_buckets_last_start_ms: self.fast.last_start_ms,
        }
    }
}

impl Default for DataTransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics as carried by the `DATA_TRANSFER_STATS` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTransferSnapshot {
    /// Milliseconds since the tunnel connected, 0 when not connected
    pub connected_time_ms: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub slow_buckets: Vec<Bucket>,
    pub slow_buckets_last_start_ms: u64,
    pub fast_buckets: Vec<Bucket>,
    pub fast_buckets_last_start_ms: u64,
}

impl DataTransferSnapshot {
    pub fn to_bundle(&self) -> Bundle {
        let mut bundle = Bundle::new();
        bundle
            .put_long(KEY_CONNECTED_TIME, self.connected_time_ms as i64)
            .put_long(KEY_TOTAL_SENT, self.total_bytes_sent as i64)
            .put_long(KEY_TOTAL_RECEIVED, self.total_bytes_received as i64)
            .put_long_list(KEY_SLOW_SENT, sent_series(&self.slow_buckets))
            .put_long_list(KEY_SLOW_RECEIVED, received_series(&self.slow_buckets))
            .put_long(KEY_SLOW_LAST_START, self.slow_buckets_last_start_ms as i64)
            .put_long_list(KEY_FAST_SENT, sent_series(&self.fast_buckets))
            .put_long_list(KEY_FAST_RECEIVED, received_series(&self.fast_buckets))
            .put_long(KEY_FAST_LAST_START, self.fast_buckets_last_start_ms as i64);
        bundle
    }

    pub fn from_bundle(bundle: &Bundle) -> Result<Self, BundleError> {
        Ok(Self {
            connected_time_ms: unsigned(bundle, KEY_CONNECTED_TIME)?,
            total_bytes_sent: unsigned(bundle, KEY_TOTAL_SENT)?,
            total_bytes_received: unsigned(bundle, KEY_TOTAL_RECEIVED)?,
            slow_buckets: buckets(bundle, KEY_SLOW_SENT, KEY_SLOW_RECEIVED)?,
            slow_buckets_last_start_ms: unsigned(bundle, KEY_SLOW_LAST_START)?,
            fast_buckets: buckets(bundle, KEY_FAST_SENT, KEY_FAST_RECEIVED)?,
            fast_buckets_last_start_ms: unsigned(bundle, KEY_FAST_LAST_START)?,
        })
    }
}

fn sent_series(buckets: &[Bucket]) -> Vec<i64> {
    buckets.iter().map(|b| b.bytes_sent as i64).collect()
}

fn received_series(buckets: &[Bucket]) -> Vec<i64> {
    buckets.iter().map(|b| b.bytes_received as i64).collect()
}

fn unsigned(bundle: &Bundle, key: &str) -> Result<u64, BundleError> {
    let raw = bundle.get_long(key)?;
    u64::try_from(raw).map_err(|_| BundleError::InvalidValue {
        key: key.to_string(),
        reason: format!("negative value {}", raw),
    })
}

fn buckets(bundle: &Bundle, sent_key: &str, received_key: &str) -> Result<Vec<Bucket>, BundleError> {
    let sent = bundle.get_long_list(sent_key)?;
    let received = bundle.get_long_list(received_key)?;
    if sent.len() != received.len() {
        return Err(BundleError::InvalidValue {
            key: sent_key.to_string(),
            reason: "sent and received series differ in length".to_string(),
        });
    }
    Ok(sent
        .into_iter()
        .zip(received)
        .map(|(s, r)| Bucket {
            bytes_sent: s.max(0) as u64,
            bytes_received: r.max(0) as u64,
        })
        .collect())
}
