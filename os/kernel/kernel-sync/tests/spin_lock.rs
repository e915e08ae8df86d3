use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u64);
    {
        let mut g = l.lock();
        *g = 4096;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 4096);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new([0u8; 4]);
    let held = l.try_lock();
    assert!(held.is_some());
    assert!(l.try_lock().is_none());
    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn debug_does_not_block_on_held_lock() {
    let l = SpinLock::new(7u32);
    assert_eq!(format!("{l:?}"), "SpinLock { inner: 7 }");
    let _g = l.lock();
    assert_eq!(format!("{l:?}"), "SpinLock { <locked> }");
}

#[test]
fn get_mut_and_into_inner_skip_locking() {
    let mut l = SpinLock::new(vec![1u64, 2]);
    l.get_mut().push(3);
    assert_eq!(l.into_inner(), vec![1, 2, 3]);
}

/// A miniature free-list shared by several CPUs: every pop must be matched by
/// exactly one push, and no element may be handed out twice.
#[test]
fn contended_free_list_conserves_entries() {
    const CPUS: usize = 8;
    const ROUNDS: usize = 2_000;

    let list = Arc::new(SpinLock::new((0..64usize).collect::<Vec<_>>()));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(CPUS));

    let handles: Vec<_> = (0..CPUS)
        .map(|_| {
            let list = Arc::clone(&list);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ROUNDS {
                    let taken = list.with_lock(|l| {
                        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                        let v = l.pop();
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                        v
                    });
                    thread::yield_now();
                    if let Some(v) = taken {
                        list.with_lock(|l| l.push(v));
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let mut left = list.with_lock(|l| l.clone());
    left.sort_unstable();
    assert_eq!(left, (0..64).collect::<Vec<_>>());
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinLock::new(0u8));
}
