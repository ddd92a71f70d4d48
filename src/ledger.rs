//! Per-user storage quota accounting.
//!
//! `reserve` is a single conditional atomic update, so concurrent uploads for the same user
//! can never overshoot the limit. A [`CapacityGuard`] ties one reservation to exactly one
//! `commit` or `release`; repeated calls on a settled guard are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Default)]
pub struct Account {
    used: AtomicU64,
    limit: AtomicU64,
    reserved_total: AtomicU64,
    committed_total: AtomicU64,
    released_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub used: u64,
    pub limit: u64,
    pub reserved_total: u64,
    pub committed_total: u64,
    pub released_total: u64,
}

#[derive(Default)]
pub struct CapacityLedger {
    accounts: RwLock<HashMap<u64, Arc<Account>>>,
}

impl CapacityLedger {
    pub fn new() -> Self { Self::default() }

    /// Register (or refresh the limit of) a user's account. Existing usage is kept.
    pub fn open(&self, uid: u64, limit: u64, used: u64) {
        let mut w = self.accounts.write();
        let acct = w.entry(uid).or_insert_with(|| Arc::new(Account { used: AtomicU64::new(used), ..Default::default() }));
        acct.limit.store(limit, Ordering::Release);
    }

    fn account(&self, uid: u64) -> AppResult<Arc<Account>> {
        self.accounts.read().get(&uid).cloned().ok_or_else(|| AppError::database("ledger_account_missing", format!("no capacity account for user {}", uid)))
    }

    pub fn used(&self, uid: u64) -> AppResult<u64> { Ok(self.account(uid)?.used.load(Ordering::Acquire)) }

    pub fn remaining(&self, uid: u64) -> AppResult<u64> {
        let a = self.account(uid)?;
        Ok(a.limit.load(Ordering::Acquire).saturating_sub(a.used.load(Ordering::Acquire)))
    }

    /// Atomically add `delta` to usage if it stays within the limit.
    pub fn reserve(&self, uid: u64, delta: u64) -> AppResult<()> {
        if delta == 0 { return Ok(()); }
        let a = self.account(uid)?;
        let limit = a.limit.load(Ordering::Acquire);
        a.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| cur.checked_add(delta).filter(|n| *n <= limit))
            .map_err(|cur| AppError::quota_exceeded("quota_exceeded", format!("insufficient capacity: {} of {} bytes used, {} requested", cur, limit, delta)))?;
        a.reserved_total.fetch_add(delta, Ordering::AcqRel);
        Ok(())
    }

    /// Give back previously reserved bytes.
    pub fn release(&self, uid: u64, delta: u64) -> AppResult<()> {
        let a = self.account(uid)?;
        saturating_sub(&a.used, delta);
        a.released_total.fetch_add(delta, Ordering::AcqRel);
        Ok(())
    }

    /// Reserved bytes become permanent usage; usage is already counted.
    pub fn commit(&self, uid: u64, delta: u64) -> AppResult<()> {
        self.account(uid)?.committed_total.fetch_add(delta, Ordering::AcqRel);
        Ok(())
    }

    /// Copies are charged without a limit check.
    pub fn increase_unchecked(&self, uid: u64, delta: u64) -> AppResult<()> {
        self.account(uid)?.used.fetch_add(delta, Ordering::AcqRel);
        Ok(())
    }

    /// Deleted objects give their bytes back. Usage never goes below zero.
    pub fn deduct(&self, uid: u64, delta: u64) -> AppResult<()> {
        saturating_sub(&self.account(uid)?.used, delta);
        Ok(())
    }

    pub fn stats(&self, uid: u64) -> AppResult<LedgerStats> {
        let a = self.account(uid)?;
        Ok(LedgerStats {
            used: a.used.load(Ordering::Acquire),
            limit: a.limit.load(Ordering::Acquire),
            reserved_total: a.reserved_total.load(Ordering::Acquire),
            committed_total: a.committed_total.load(Ordering::Acquire),
            released_total: a.released_total.load(Ordering::Acquire),
        })
    }
}

fn saturating_sub(cell: &AtomicU64, delta: u64) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(cur.saturating_sub(delta)));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Idle,
    Reserved { uid: u64, size: u64 },
    Committed,
    Released,
}

/// Single-use reservation token for one file write. Clones share state.
#[derive(Debug, Clone)]
pub struct CapacityGuard {
    state: Arc<Mutex<GuardState>>,
}

impl Default for CapacityGuard {
    fn default() -> Self { Self { state: Arc::new(Mutex::new(GuardState::Idle)) } }
}

impl CapacityGuard {
    pub fn new() -> Self { Self::default() }

    /// Reserve once. Returns `Ok(false)` when this guard was already used.
    pub fn reserve(&self, ledger: &CapacityLedger, uid: u64, size: u64) -> AppResult<bool> {
        let mut st = self.state.lock();
        if *st != GuardState::Idle { return Ok(false); }
        ledger.reserve(uid, size)?;
        *st = GuardState::Reserved { uid, size };
        Ok(true)
    }

    /// Release the reservation if one is outstanding. Returns whether bytes were given back.
    pub fn release(&self, ledger: &CapacityLedger) -> AppResult<bool> {
        let mut st = self.state.lock();
        if let GuardState::Reserved { uid, size } = *st {
            ledger.release(uid, size)?;
            *st = GuardState::Released;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn commit(&self, ledger: &CapacityLedger) -> AppResult<bool> {
        let mut st = self.state.lock();
        if let GuardState::Reserved { uid, size } = *st {
            ledger.commit(uid, size)?;
            *st = GuardState::Committed;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn reserved(&self) -> Option<u64> {
        match *self.state.lock() {
            GuardState::Reserved { size, .. } => Some(size),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool { matches!(*self.state.lock(), GuardState::Committed | GuardState::Released) }
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod ledger_tests;
