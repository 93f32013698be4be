//! Per-node bandwidth accounting.
//!
//! Utilisation is never an incremented counter: it is always the sum over the
//! ledger of live reservations, so it returns to exactly zero once every
//! transfer has released its grant.

use crate::store::error::{StoreError, StoreResult};
use crate::store::types::ChunkKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Inbound => f.write_str("in"),
            TransferDirection::Outbound => f.write_str("out"),
        }
    }
}

/// One live transfer: the chunk being moved and the direction it moves in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub chunk: ChunkKey,
    pub direction: TransferDirection,
}

impl ReservationKey {
    pub fn new(chunk: ChunkKey, direction: TransferDirection) -> Self {
        Self { chunk, direction }
    }
}

/// Tracks bandwidth grants for concurrent transfers on one node.
pub struct BandwidthAccountant {
    capacity_bps: f64,
    active: Mutex<HashMap<ReservationKey, f64>>,
}

/// Fraction of the free link a single transfer may claim. The remaining 20%
/// keeps heartbeats flowing while the link is busy.
const HEADROOM_FACTOR: f64 = 0.8;

impl BandwidthAccountant {
    pub fn new(capacity_bps: u64) -> Self {
        Self {
            capacity_bps: capacity_bps as f64,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve bandwidth for a transfer, granting
    /// `min(requested, free × 0.8)`. Re-reserving a live key replaces its
    /// grant. Fails when the link has no free capacity at all.
    pub fn reserve(&self, key: ReservationKey, requested_bps: f64) -> StoreResult<f64> {
        let mut active = self.active.lock();

        let in_use: f64 = active
            .iter()
            .filter(|(k, _)| **k != key)
            .map(|(_, amount)| amount)
            .sum();
        let free = self.capacity_bps - in_use;

        if free <= 0.0 {
            return Err(StoreError::LinkSaturated { key: key.chunk });
        }

        let granted = requested_bps.min(free * HEADROOM_FACTOR);
        assert!(
            granted > 0.0,
            "bandwidth grant must be positive (requested {requested_bps}, free {free})"
        );

        active.insert(key, granted);
        self.check_ledger(&active);
        Ok(granted)
    }

    /// Release a transfer's grant. Releasing an unknown key is a no-op.
    pub fn release(&self, key: &ReservationKey) {
        let mut active = self.active.lock();
        active.remove(key);
        self.check_ledger(&active);
    }

    /// Current utilisation in bits/second: the sum over live reservations.
    pub fn utilisation(&self) -> f64 {
        self.active.lock().values().sum()
    }

    pub fn active_transfers(&self) -> usize {
        self.active.lock().len()
    }

    pub fn capacity_bps(&self) -> f64 {
        self.capacity_bps
    }

    /// The ledger exceeding link capacity means a grant was computed against
    /// stale state. That is a bug, not a runtime condition.
    fn check_ledger(&self, active: &HashMap<ReservationKey, f64>) {
        let total: f64 = active.values().sum();
        assert!(
            total <= self.capacity_bps * 1.000_001,
            "bandwidth ledger {total} exceeds link capacity {}",
            self.capacity_bps
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: u32) -> ReservationKey {
        ReservationKey::new(ChunkKey::new("f1", index), TransferDirection::Inbound)
    }

    #[test]
    fn idle_utilisation_is_zero() {
        let accountant = BandwidthAccountant::new(1_000_000);
        assert_eq!(accountant.utilisation(), 0.0);
    }

    #[test]
    fn grant_leaves_headroom() {
        let accountant = BandwidthAccountant::new(1_000_000);
        let granted = accountant.reserve(key(0), 2_000_000.0).unwrap();
        assert_eq!(granted, 800_000.0);
    }

    #[test]
    fn modest_request_granted_in_full() {
        let accountant = BandwidthAccountant::new(1_000_000);
        let granted = accountant.reserve(key(0), 100_000.0).unwrap();
        assert_eq!(granted, 100_000.0);
    }

    #[test]
    fn utilisation_equals_outstanding_sum() {
        let accountant = BandwidthAccountant::new(1_000_000);

        let first = accountant.reserve(key(0), 300_000.0).unwrap();
        let second = accountant.reserve(key(1), 300_000.0).unwrap();
        assert_eq!(accountant.utilisation(), first + second);

        accountant.release(&key(0));
        assert_eq!(accountant.utilisation(), second);

        accountant.release(&key(1));
        assert_eq!(accountant.utilisation(), 0.0);
    }

    #[test]
    fn release_is_idempotent() {
        let accountant = BandwidthAccountant::new(1_000_000);
        accountant.reserve(key(0), 100_000.0).unwrap();

        accountant.release(&key(0));
        accountant.release(&key(0));
        assert_eq!(accountant.utilisation(), 0.0);
    }

    #[test]
    fn many_transfers_settle_to_zero() {
        let accountant = BandwidthAccountant::new(10_000_000);

        let keys: Vec<_> = (0..10).map(key).collect();
        for k in &keys {
            accountant.reserve(k.clone(), 500_000.0).unwrap();
        }
        assert!(accountant.utilisation() > 0.0);
        assert_eq!(accountant.active_transfers(), 10);

        for k in &keys {
            accountant.release(k);
        }
        assert_eq!(accountant.utilisation(), 0.0);
        assert_eq!(accountant.active_transfers(), 0);
    }

    #[test]
    fn ledger_never_overcommits_the_link() {
        let accountant = BandwidthAccountant::new(1_000_000);

        // grants converge geometrically on capacity without crossing it
        for index in 0..200 {
            let _ = accountant.reserve(key(index), f64::MAX);
        }
        let free = accountant.capacity_bps() - accountant.utilisation();
        assert!(free >= 0.0);

        // re-reserving a live key replaces its grant instead of stacking
        assert!(accountant.reserve(key(0), 1_000.0).is_ok());
    }

    #[test]
    fn reserving_same_key_replaces_grant() {
        let accountant = BandwidthAccountant::new(1_000_000);

        accountant.reserve(key(0), 400_000.0).unwrap();
        accountant.reserve(key(0), 100_000.0).unwrap();

        assert_eq!(accountant.utilisation(), 100_000.0);
        assert_eq!(accountant.active_transfers(), 1);
    }
}
