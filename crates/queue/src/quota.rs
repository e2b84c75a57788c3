use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use omniq_core::errors::{OmniqError, OmniqResult};

/// Client-side byte accounting for a quota-limited broker tier. Payload
/// bytes are reserved before a task is admitted and released when it turns
/// terminal, so the broker never sees a write that would blow the cap.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    max_payload_bytes: usize,
    max_total_bytes: usize,
    used: Arc<AtomicUsize>,
}

impl QuotaTracker {
    pub fn new(max_payload_bytes: usize, max_total_bytes: usize) -> Self {
        Self {
            max_payload_bytes,
            max_total_bytes,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn reserve(&self, bytes: usize) -> OmniqResult<()> {
        if bytes > self.max_payload_bytes {
            return Err(OmniqError::quota(format!(
                "payload of {bytes} bytes exceeds the per-task limit of {} bytes",
                self.max_payload_bytes
            )));
        }
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.max_total_bytes {
                return Err(OmniqError::quota(format!(
                    "queue storage is full: {current} of {} bytes in use",
                    self.max_total_bytes
                )));
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Serialized payload size used for quota accounting. Reserve and release
/// must measure the same bytes, so both go through this.
pub fn payload_bytes(payload: &serde_json::Value) -> usize {
    serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_payload_is_rejected_outright() {
        let quota = QuotaTracker::new(100, 1_000);
        assert!(quota.reserve(101).is_err());
        assert_eq!(quota.used_bytes(), 0);
    }

    #[test]
    fn total_cap_holds_across_reservations() {
        let quota = QuotaTracker::new(400, 1_000);
        quota.reserve(400).unwrap();
        quota.reserve(400).unwrap();
        let err = quota.reserve(400).unwrap_err();
        assert!(matches!(err, OmniqError::QuotaExceeded(_)));
        quota.release(400);
        quota.reserve(200).unwrap();
        assert_eq!(quota.used_bytes(), 1_000);
    }

    #[test]
    fn release_never_underflows() {
        let quota = QuotaTracker::new(100, 1_000);
        quota.release(50);
        assert_eq!(quota.used_bytes(), 0);
    }
}
