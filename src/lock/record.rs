//! On-blob lock record

use crate::host;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Name of the lock blob under a lockable address
pub const LOCK_FILE: &str = "lock.json";

/// Seconds since the Unix epoch as a float, the timestamp unit of lock records
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Contents of `lock.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Opaque token unique to the current holder
    pub writer_id: String,
    pub first_acquired_at: f64,
    /// Lease duration in seconds
    pub expire_s: f64,
    /// Heartbeat counter, 1 on acquisition
    pub write_count: u64,
    /// Set once the holder lets go
    pub released_at: Option<f64>,
    /// Time of the most recent acquisition or heartbeat
    #[serde(default)]
    pub last_written_at: f64,
    #[serde(default)]
    pub writer_host: String,
}

impl LockRecord {
    /// Fresh record for a new holder
    pub fn acquired(writer_id: impl Into<String>, expire_s: f64, now: f64) -> Self {
        Self {
            writer_id: writer_id.into(),
            first_acquired_at: now,
            expire_s,
            write_count: 1,
            released_at: None,
            last_written_at: now,
            writer_host: host::writer_identity(),
        }
    }

    /// Time the lease lapses if nobody heartbeats
    pub fn expires_at(&self) -> f64 {
        self.last_written_at.max(self.first_acquired_at) + self.expire_s
    }

    /// Whether another writer may take over at `now`
    ///
    /// A live lease only counts as expired once it is older than its
    /// duration plus `margin`, which absorbs clock skew between writers.
    pub fn is_available(&self, now: f64, margin: f64) -> bool {
        self.released_at.is_some() || now > self.expires_at() + margin
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    /// Record one heartbeat
    pub fn heartbeat(&mut self, now: f64) {
        self.write_count += 1;
        self.last_written_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_held() {
        let record = LockRecord::acquired("w1", 10.0, 1000.0);
        assert_eq!(record.write_count, 1);
        assert!(!record.is_available(1005.0, 1.0));
        assert!(!record.is_available(1010.5, 1.0));
        assert!(record.is_available(1011.5, 1.0));
    }

    #[test]
    fn heartbeat_extends_lease() {
        let mut record = LockRecord::acquired("w1", 10.0, 1000.0);
        record.heartbeat(1008.0);
        assert_eq!(record.write_count, 2);
        assert!(!record.is_available(1015.0, 0.0));
        assert!(record.is_available(1018.5, 0.0));
    }

    #[test]
    fn released_record_is_available() {
        let mut record = LockRecord::acquired("w1", 10.0, 1000.0);
        record.released_at = Some(1001.0);
        assert!(record.is_available(1001.0, 5.0));
    }

    #[test]
    fn wire_format() {
        let record = LockRecord::acquired("w1", 30.0, 1.5);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["writer_id"], "w1");
        assert_eq!(json["expire_s"], 30.0);
        assert_eq!(json["write_count"], 1);
        assert!(json["released_at"].is_null());

        // Records written without the optional fields still parse
        let minimal = r#"{"writer_id":"x","first_acquired_at":2.0,"expire_s":5.0,"write_count":3,"released_at":null}"#;
        let parsed: LockRecord = serde_json::from_str(minimal).unwrap();
        assert_eq!(parsed.expires_at(), 7.0);
    }
}
