//! Progress reporting for in-flight transfers (spec §4.7 step 2 & 5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::transfer::Transfer;

/// Default throttle period for status feed updates (spec §4.7: `meshageStatusPeriod`).
pub const DEFAULT_STATUS_PERIOD: Duration = Duration::from_secs(3);

/// One snapshot of a transfer's progress, matching the shape in spec §4.7:
/// `{filename, dir, parts: seen set, numParts, queued: bool}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatus {
    pub filename: String,
    pub dir: String,
    pub parts: Vec<u64>,
    pub num_parts: u64,
    pub queued: bool,
}

impl From<&Transfer> for TransferStatus {
    fn from(t: &Transfer) -> Self {
        let mut parts: Vec<u64> = t.parts_seen.iter().copied().collect();
        parts.sort_unstable();
        Self {
            filename: t.rel_path.clone(),
            dir: t.parts_dir.display().to_string(),
            parts,
            num_parts: t.num_parts(),
            queued: t.queued,
        }
    }
}

/// Throttles a status feed per-subscriber so a caller is never updated more
/// than once per `period`, no matter how many parts land in between
/// (spec §4.7: "the helper throttles updates ... default 3 s").
pub struct StatusThrottle {
    period: Duration,
    last_sent: HashMap<String, Instant>,
}

impl StatusThrottle {
    pub fn new(period: Duration) -> Self {
        Self { period, last_sent: HashMap::new() }
    }

    /// Returns `true` if an update to `subscriber` should be sent now,
    /// recording the send time as a side effect.
    pub fn should_send(&mut self, subscriber: &str, now: Instant) -> bool {
        match self.last_sent.get(subscriber) {
            Some(last) if now.duration_since(*last) < self.period => false,
            _ => {
                self.last_sent.insert(subscriber.to_string(), now);
                true
            }
        }
    }
}

impl Default for StatusThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn status_reflects_transfer_fields() {
        let mut t = Transfer {
            rel_path: "x.img".into(),
            parts_dir: PathBuf::from("/tmp/parts"),
            descriptor: None,
            parts_seen: Default::default(),
            queued: true,
        };
        t.parts_seen.insert(2);
        t.parts_seen.insert(0);
        let status: TransferStatus = (&t).into();
        assert_eq!(status.filename, "x.img");
        assert_eq!(status.parts, vec![0, 2]);
        assert!(status.queued);
    }

    #[test]
    fn throttle_suppresses_rapid_updates() {
        let mut throttle = StatusThrottle::new(Duration::from_secs(3));
        let t0 = Instant::now();
        assert!(throttle.should_send("caller-a", t0));
        assert!(!throttle.should_send("caller-a", t0 + Duration::from_millis(500)));
        assert!(throttle.should_send("caller-a", t0 + Duration::from_secs(4)));
    }

    #[test]
    fn throttle_is_per_subscriber() {
        let mut throttle = StatusThrottle::new(Duration::from_secs(3));
        let t0 = Instant::now();
        assert!(throttle.should_send("a", t0));
        assert!(throttle.should_send("b", t0));
    }
}
