use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if it was poisoned.
///
/// No handler code runs while these locks are held, so the data is intact.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
