//! Poison-tolerant access to `std::sync` locks.
//!
//! The in-process tables in this crate hold plain bookkeeping (queues, maps of
//! handles). A panic while one of them is held leaves data that is still
//! structurally valid, so the guard is recovered and the event is logged.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn report_poisoned(owner: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        owner,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned lock"
    );
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        report_poisoned(owner, op, "mutex");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        report_poisoned(owner, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        report_poisoned(owner, op, "rwlock.write");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn mutex_guard_survives_poisoning() {
        let lock = Mutex::new(vec![1_u32]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("mutex should lock");
            panic!("poison mutex");
        }));

        mutex_lock(&lock, "tests", "push").push(2);
        assert_eq!(*mutex_lock(&lock, "tests", "read"), vec![1, 2]);
    }

    #[test]
    fn rwlock_guards_survive_poisoning() {
        let lock = RwLock::new(0_u64);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("rwlock should lock");
            panic!("poison rwlock");
        }));

        *rw_write(&lock, "tests", "write") = 7;
        assert_eq!(*rw_read(&lock, "tests", "read"), 7);
    }
}
