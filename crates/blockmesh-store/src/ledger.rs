use std::collections::HashMap;

use dashmap::DashMap;

/// Per-uid byte usage held in memory.
///
/// Rebuilt from the files on disk when a store opens and adjusted by every
/// write afterwards. Adjustments are optimistic: a store takes a [`Hold`]
/// before its write lands and lets it lapse if the write fails, so readers
/// can briefly observe bytes that never reach disk.
#[derive(Debug, Default)]
pub struct Ledger {
    usage: DashMap<String, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes attributed to `uid` (zero for unknown uids).
    pub fn usage(&self, uid: &str) -> u64 {
        self.usage.get(uid).map(|v| *v).unwrap_or(0)
    }

    /// Apply a signed adjustment and return the new balance.
    /// Balances saturate at zero.
    pub fn apply(&self, uid: &str, delta: i64) -> u64 {
        let mut entry = self.usage.entry(uid.to_string()).or_insert(0);
        let next = if delta >= 0 {
            entry.saturating_add(delta as u64)
        } else {
            entry.saturating_sub(delta.unsigned_abs())
        };
        *entry = next;
        next
    }

    pub fn charge(&self, uid: &str, bytes: u64) -> u64 {
        self.apply(uid, i64::try_from(bytes).unwrap_or(i64::MAX))
    }

    pub fn refund(&self, uid: &str, bytes: u64) -> u64 {
        self.apply(uid, -i64::try_from(bytes).unwrap_or(i64::MAX))
    }

    /// Copy of every balance, keyed by uid.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.usage
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Apply `delta` now and reverse it when the returned hold is dropped,
    /// unless it was committed or settled first.
    pub fn hold<'a>(&'a self, uid: &'a str, delta: i64) -> Hold<'a> {
        self.apply(uid, delta);
        Hold {
            ledger: self,
            uid,
            delta,
            armed: true,
        }
    }
}

/// A ledger adjustment held across an await point.
///
/// Dropping the hold, including dropping the future that owns it, takes the
/// adjustment back out.
#[derive(Debug)]
#[must_use = "dropping a hold reverses it immediately"]
pub struct Hold<'a> {
    ledger: &'a Ledger,
    uid: &'a str,
    delta: i64,
    armed: bool,
}

impl Hold<'_> {
    /// Keep the adjustment.
    pub fn commit(mut self) {
        self.armed = false;
    }

    /// Replace the held amount with `actual` and keep it.
    pub fn settle(mut self, actual: i64) {
        self.armed = false;
        self.ledger.apply(self.uid, actual - self.delta);
    }
}

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ledger.apply(self.uid, -self.delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_refund() {
        let ledger = Ledger::new();
        assert_eq!(ledger.usage("usera"), 0);
        assert_eq!(ledger.charge("usera", 60), 60);
        assert_eq!(ledger.apply("usera", -10), 50);
        assert_eq!(ledger.refund("usera", 50), 0);
    }

    #[test]
    fn test_saturates_at_zero() {
        let ledger = Ledger::new();
        ledger.charge("usera", 5);
        assert_eq!(ledger.refund("usera", 50), 0);
    }

    #[test]
    fn test_uids_are_independent() {
        let ledger = Ledger::new();
        ledger.charge("usera", 11);
        ledger.charge("userb", 21);
        ledger.charge("userc", 31);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot["usera"], 11);
        assert_eq!(snapshot["userb"], 21);
        assert_eq!(snapshot["userc"], 31);
    }

    #[test]
    fn test_dropped_hold_is_reversed() {
        let ledger = Ledger::new();
        ledger.charge("usera", 10);
        {
            let _hold = ledger.hold("usera", 90);
            assert_eq!(ledger.usage("usera"), 100);
        }
        assert_eq!(ledger.usage("usera"), 10);
    }

    #[test]
    fn test_commit_and_settle_keep_the_adjustment() {
        let ledger = Ledger::new();
        ledger.hold("usera", 40).commit();
        assert_eq!(ledger.usage("usera"), 40);

        // Held 30, the write only added 12
        ledger.hold("usera", 30).settle(12);
        assert_eq!(ledger.usage("usera"), 52);
    }

    #[tokio::test]
    async fn test_hold_reversed_when_future_is_dropped() {
        let ledger = Ledger::new();
        let pending = async {
            let hold = ledger.hold("usera", 64);
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            hold.commit();
        };
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(ledger.usage("usera"), 0);
    }
}
