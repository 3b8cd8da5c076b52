// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C2: configuration-store client with a background watch dispatcher.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base::WaitContext;
use sync::Mutex;

use crate::capability::StoreBackend;
use crate::error::Error;
use crate::ids::DomainId;
use crate::Result;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

type WatchCallback = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(Error) + Send + Sync>;

struct Shared {
    store: Arc<dyn StoreBackend>,
    watches: Mutex<HashMap<String, WatchCallback>>,
    initial_fires: Mutex<VecDeque<String>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    terminate: AtomicBool,
}

/// Wraps a [`StoreBackend`] with tree I/O plus a watch dispatcher (spec §4.2).
///
/// `set_watch`/`clear_watch` are serialized against each other through
/// `lifecycle` so that the dispatcher thread's start (on the first watch) and
/// stop (on the last watch's removal) are linear, independent of the mutex
/// guarding the watch map's contents.
pub struct StoreClient {
    shared: Arc<Shared>,
    lifecycle: Mutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        StoreClient {
            shared: Arc::new(Shared {
                store,
                watches: Mutex::new(HashMap::new()),
                initial_fires: Mutex::new(VecDeque::new()),
                error_callback: Mutex::new(None),
                terminate: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(()),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.shared.store.read_bytes(path)
    }

    pub fn read_int(&self, path: &str) -> Result<i64> {
        self.shared.store.read_int(path)
    }

    pub fn read_string(&self, path: &str) -> Result<String> {
        self.shared.store.read_string(path)
    }

    pub fn write_int(&self, path: &str, value: i64) -> Result<()> {
        self.shared.store.write_int(path, value)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.shared.store.remove(path)
    }

    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        self.shared.store.list(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.shared.store.exists(path)
    }

    pub fn get_domain_path(&self, domain: DomainId) -> String {
        self.shared.store.get_domain_path(domain)
    }

    /// Installs a sink invoked once, from the dispatcher thread, if the
    /// dispatcher fails terminally.
    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        *self.shared.error_callback.lock() = Some(Box::new(cb));
    }

    /// Registers `path`: subscribes with the underlying store, records
    /// `callback` under the watch map, and spawns the dispatcher thread if
    /// this is the first registered watch. If `fire_immediately`, schedules
    /// one synthetic `callback(path)` dispatch ahead of any real event (spec
    /// §4.2, property 6).
    pub fn set_watch<F>(&self, path: &str, callback: F, fire_immediately: bool) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let _lifecycle = self.lifecycle.lock();

        self.shared.store.watch(path)?;

        let was_empty = {
            let mut watches = self.shared.watches.lock();
            let was_empty = watches.is_empty();
            watches.insert(path.to_string(), Arc::new(callback));
            was_empty
        };

        if fire_immediately {
            self.shared.initial_fires.lock().push_back(path.to_string());
        }

        if was_empty {
            self.spawn_dispatcher();
        }

        Ok(())
    }

    /// Unsubscribes `path`. If the watch map becomes empty, joins and retires
    /// the dispatcher thread.
    pub fn clear_watch(&self, path: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        let now_empty = {
            let mut watches = self.shared.watches.lock();
            watches.remove(path);
            watches.is_empty()
        };

        let _ = self.shared.store.unwatch(path);

        if now_empty {
            self.shared.terminate.store(true, Ordering::SeqCst);
            if let Some(handle) = self.dispatcher.lock().take() {
                let _ = handle.join();
            }
            self.shared.terminate.store(false, Ordering::SeqCst);
        }

        Ok(())
    }

    fn spawn_dispatcher(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || dispatcher_loop(shared));
        *self.dispatcher.lock() = Some(handle);
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

fn dispatcher_loop(shared: Arc<Shared>) {
    let mut has_event_hint = false;

    loop {
        if shared.terminate.load(Ordering::SeqCst) {
            return;
        }
        if shared.watches.lock().is_empty() {
            return;
        }

        let path = if let Some(path) = shared.initial_fires.lock().pop_front() {
            Some(path)
        } else if has_event_hint {
            match shared.store.check_watch() {
                Ok(Some((path, _token))) => Some(path),
                Ok(None) => {
                    has_event_hint = false;
                    continue;
                }
                Err(e) => {
                    dispatch_error(&shared, e);
                    return;
                }
            }
        } else {
            match WaitContext::wait_readable(shared.store.fd(), POLL_TIMEOUT) {
                Ok(base::WaitResult::Ready) => {
                    has_event_hint = true;
                    continue;
                }
                Ok(base::WaitResult::Timeout) => None,
                Err(e) => {
                    dispatch_error(&shared, Error::ConfigStore(e.to_string()));
                    return;
                }
            }
        };

        if let Some(path) = path {
            // Clone the callback handle out from under the map lock, then invoke it
            // without holding the lock, per spec §4.2.
            let callback = shared.watches.lock().get(&path).cloned();
            if let Some(callback) = callback {
                callback(&path);
            }
        }
    }
}

fn dispatch_error(shared: &Arc<Shared>, error: Error) {
    if let Some(cb) = shared.error_callback.lock().as_ref() {
        cb(error);
    } else {
        log::error!("config store dispatcher failed: {error}");
    }
}
