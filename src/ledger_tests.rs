use super::*;

#[test]
fn reserve_respects_limit() {
    let l = CapacityLedger::new();
    l.open(1, 100, 0);
    l.reserve(1, 60).unwrap();
    assert!(matches!(l.reserve(1, 41), Err(AppError::QuotaExceeded { .. })));
    l.reserve(1, 40).unwrap();
    assert_eq!(l.remaining(1).unwrap(), 0);
    assert!(l.reserve(1, 0).is_ok());
}

#[test]
fn unknown_account_surfaces_error() {
    let l = CapacityLedger::new();
    assert!(matches!(l.reserve(9, 1), Err(AppError::Database { .. })));
    assert!(l.release(9, 1).is_err());
}

#[test]
fn guard_reserves_once_and_settles_once() {
    let l = CapacityLedger::new();
    l.open(1, 1_000, 0);
    let g = CapacityGuard::new();
    assert!(g.reserve(&l, 1, 100).unwrap());
    assert!(!g.reserve(&l, 1, 100).unwrap());
    assert_eq!(l.used(1).unwrap(), 100);

    assert!(g.release(&l).unwrap());
    assert!(!g.release(&l).unwrap());
    assert!(!g.commit(&l).unwrap());
    assert_eq!(l.used(1).unwrap(), 0);
    let s = l.stats(1).unwrap();
    assert_eq!(s.reserved_total, 100);
    assert_eq!(s.released_total, 100);
    assert_eq!(s.committed_total, 0);
}

#[test]
fn clones_share_state() {
    let l = CapacityLedger::new();
    l.open(1, 1_000, 0);
    let g = CapacityGuard::new();
    let h = g.clone();
    g.reserve(&l, 1, 10).unwrap();
    assert_eq!(h.reserved(), Some(10));
    assert!(h.commit(&l).unwrap());
    assert!(g.is_settled());
    assert!(!g.release(&l).unwrap());
    assert_eq!(l.used(1).unwrap(), 10);
}

#[test]
fn concurrent_reservations_never_overshoot() {
    let l = Arc::new(CapacityLedger::new());
    l.open(1, 1_000, 0);
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let l = l.clone();
            std::thread::spawn(move || (0..50).filter(|_| l.reserve(1, 3).is_ok()).count())
        })
        .collect();
    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(granted, 333);
    assert_eq!(l.used(1).unwrap(), 999);
}

#[test]
fn deduct_saturates_at_zero_and_open_keeps_usage() {
    let l = CapacityLedger::new();
    l.open(1, 100, 30);
    l.deduct(1, 50).unwrap();
    assert_eq!(l.used(1).unwrap(), 0);
    l.increase_unchecked(1, 150).unwrap();
    l.open(1, 500, 0);
    assert_eq!(l.used(1).unwrap(), 150);
    assert_eq!(l.remaining(1).unwrap(), 350);
}
