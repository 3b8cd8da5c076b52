// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A `Mutex` that does not poison on panic.
//!
//! A panic while holding one of the framework's locks (the watch map, the frontend
//! map, a handler's channel map) should not turn every future lock attempt into a
//! panic of its own; we'd rather keep serving the other guests. This wrapper
//! discards the poison flag instead of propagating it.

use std::sync::{self, MutexGuard};

pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Mutex {
            inner: sync::Mutex::new(val),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.inner
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use std::sync::Arc;

    #[test]
    fn lock_survives_a_poisoning_panic() {
        let mutex = Arc::new(Mutex::new(0));
        let poisoner = mutex.clone();
        let _ = panic::catch_unwind(move || {
            let mut guard = poisoner.lock();
            *guard = 1;
            panic!("simulated worker panic while holding the lock");
        });

        // A std::sync::Mutex would return Err(PoisonError) here; this wrapper
        // hands back the guard instead.
        assert_eq!(*mutex.lock(), 1);
    }
}
