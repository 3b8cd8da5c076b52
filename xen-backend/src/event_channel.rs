// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C3: an event-channel endpoint with its own poll thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base::WaitContext;
use sync::Mutex;

use crate::capability::{EventChannelBackend, EventChannelHandle};
use crate::error::Error;
use crate::ids::DomainId;
use crate::Result;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

type ErrorCallback = Box<dyn Fn(Error) + Send>;

/// A bound local port plus the thread that drains it (spec §4.3).
///
/// The endpoint is edge-triggered: whatever the user callback does on one
/// signal must drain all outstanding work that signal might represent. For
/// C5's ring engine, draining in a loop until the ring reports no pending
/// requests satisfies this.
pub struct EventChannel {
    handle: Arc<dyn EventChannelHandle>,
    terminate: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    /// Binds `(peer_domain, peer_port)` but does not start the poll thread;
    /// call [`EventChannel::start`] once a callback has been installed (C6
    /// wires this during data-channel construction).
    pub fn bind(backend: &dyn EventChannelBackend, peer_domain: DomainId, peer_port: u32) -> Result<Self> {
        let handle: Arc<dyn EventChannelHandle> = Arc::from(backend.bind(peer_domain, peer_port)?);
        Ok(EventChannel {
            handle,
            terminate: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u32 {
        self.handle.local_port()
    }

    /// A cloned handle to the bound port, for wiring a ring engine's notify
    /// callback without giving it the whole channel (C6).
    pub fn handle(&self) -> Arc<dyn EventChannelHandle> {
        Arc::clone(&self.handle)
    }

    /// Publishes one edge to the peer.
    pub fn notify(&self) -> Result<()> {
        self.handle.notify()
    }

    /// True once the poll thread has exited, whether from `stop()` or an
    /// internal error; C7 uses this to detect a dead data channel.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Starts the poll thread, invoking `on_signal` on every edge and routing
    /// any error — the handle's own failures, or one `on_signal` returns — to
    /// `on_error` before exiting. `on_signal` returning `Err` terminates the
    /// thread just as a failed read/unmask does (spec §4.3, "on any error,
    /// invoke the error callback and exit the thread"): a ring drain failure
    /// must not be swallowed and leave the thread polling forever.
    pub fn start<F, E>(&self, mut on_signal: F, on_error: E)
    where
        F: FnMut() -> Result<()> + Send + 'static,
        E: Fn(Error) + Send + 'static,
    {
        let handle = Arc::clone(&self.handle);
        let terminate = Arc::clone(&self.terminate);
        let terminated = Arc::clone(&self.terminated);
        let on_error: ErrorCallback = Box::new(on_error);

        let join = thread::spawn(move || {
            let result = poll_loop(&*handle, &terminate, &mut on_signal);
            if let Err(e) = result {
                on_error(e);
            }
            terminated.store(true, Ordering::SeqCst);
        });

        *self.thread.lock() = Some(join);
    }
}

fn poll_loop(
    handle: &dyn EventChannelHandle,
    terminate: &AtomicBool,
    on_signal: &mut (dyn FnMut() -> Result<()> + Send),
) -> Result<()> {
    while !terminate.load(Ordering::SeqCst) {
        match WaitContext::wait_readable(handle.fd(), POLL_TIMEOUT) {
            Ok(base::WaitResult::Timeout) => continue,
            Ok(base::WaitResult::Ready) => {}
            Err(e) => return Err(Error::EventChannel(e.to_string())),
        }

        let port = match handle.pending()? {
            Some(port) => port,
            None => continue,
        };
        handle.unmask(port)?;
        if port != handle.local_port() {
            return Err(Error::EventChannel(format!(
                "unexpected port {port}, expected {}",
                handle.local_port()
            )));
        }

        on_signal()?;
    }
    Ok(())
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::SeqCst);
        if let Some(join) = self.thread.lock().take() {
            let _ = join.join();
        }
        // `self.handle`'s own Drop (the concrete capability type) unbinds the port.
    }
}
