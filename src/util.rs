use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, ignoring poisoning.
///
/// All critical sections in this crate are short, do not call out to user code, and leave the
///  protected state consistent at every point where they could panic. A poisoned lock is
///  therefore still safe to use, and failing every subsequent operation on a connection because
///  some other thread panicked would be worse.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
