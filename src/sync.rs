#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{
        Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering, fence},
    };
    use std::{sync::PoisonError, time::Duration};

    /// Loom has no notion of wall-clock time, so a timed wait is modelled as a
    /// plain wait that never reports a timeout.
    pub(crate) fn wait_timeout<'a, T>(
        condvar: &Condvar,
        guard: MutexGuard<'a, T>,
        _timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let guard = condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        (guard, false)
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use std::sync::{
        Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering, fence},
    };
    use std::{sync::PoisonError, time::Duration};

    pub(crate) fn wait_timeout<'a, T>(
        condvar: &Condvar,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = condvar
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }
}

pub(crate) use imp::*;
use std::sync::PoisonError;

/// Lock `mutex`, recovering the guard if a panicking holder poisoned it.
///
/// Node bodies run under `catch_unwind`, so a poisoned lock never guards
/// half-written state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
