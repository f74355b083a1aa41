//! Poison-tolerant mutex access for queue state.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(op, "recovered from poisoned queue lock");
            poisoned.into_inner()
        }
    }
}
