use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// One outcome of pushing a `DynamicConfiguration` to a single data-plane
/// instance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeployRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub instance_name: String,
    pub instance_ip: String,
    pub success: bool,
    pub message: String,
}

/// A bounded, drop-oldest ring buffer of `DeployRecord`s, exposed read-only to
/// the admin endpoint. Append and snapshot are both lock-protected; there is
/// no way to observe a torn write.
pub struct DeployLog {
    capacity: usize,
    records: Mutex<VecDeque<DeployRecord>>,
}

impl DeployLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Appends a record, dropping the oldest entry if the log is at capacity.
    pub fn push(&self, record: DeployRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Returns a snapshot of the log, oldest first.
    pub fn snapshot(&self) -> Vec<DeployRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(n: i64, success: bool) -> DeployRecord {
        DeployRecord {
            timestamp: chrono::Utc.timestamp_opt(n, 0).unwrap(),
            instance_name: format!("instance-{n}"),
            instance_ip: "10.0.0.1".to_string(),
            success,
            message: String::new(),
        }
    }

    #[test]
    fn drops_oldest_once_at_capacity() {
        let log = DeployLog::new(2);
        log.push(record(1, true));
        log.push(record(2, true));
        log.push(record(3, false));

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].instance_name, "instance-2");
        assert_eq!(snapshot[1].instance_name, "instance-3");
    }

    #[test]
    fn capacity_of_zero_is_clamped_to_one() {
        let log = DeployLog::new(0);
        log.push(record(1, true));
        log.push(record(2, true));
        assert_eq!(log.len(), 1);
    }
}
