// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory stand-ins for the four C1 capabilities, driving unit and
//! integration tests without touching real Xen device nodes — the same role
//! the teacher's `FakeBackend` plays for `VhostUserBackend` in
//! `devices/src/virtio/vhost/user/device/handler.rs`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use base::Event;
use sync::Mutex;

use crate::capability::{
    Capabilities, DomainCtl, DomainFlags, EventChannelBackend, EventChannelHandle, GrantCtl,
    MappedRegion, Protection, StoreBackend,
};
use crate::error::Error;
use crate::ids::DomainId;
use crate::Result;

const FAKE_PAGE_SIZE: usize = 4096;

/// Bundles all four fakes and hands out a [`Capabilities`] built from them.
pub struct FakeCapabilities {
    pub store: Arc<FakeStore>,
    pub domains: Arc<FakeDomainCtl>,
    pub event_channels: Arc<FakeEventChannelBackend>,
    pub grants: Arc<FakeGrantCtl>,
}

impl FakeCapabilities {
    pub fn new() -> Result<Self> {
        Ok(FakeCapabilities {
            store: Arc::new(FakeStore::new()?),
            domains: Arc::new(FakeDomainCtl::new()),
            event_channels: Arc::new(FakeEventChannelBackend::new()),
            grants: Arc::new(FakeGrantCtl),
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            domains: self.domains.clone(),
            event_channels: self.event_channels.clone(),
            grants: self.grants.clone(),
            store: self.store.clone(),
        }
    }
}

// --- domain enumeration -----------------------------------------------------

pub struct FakeDomainCtl {
    domains: Mutex<Vec<(DomainId, DomainFlags)>>,
}

impl FakeDomainCtl {
    pub fn new() -> Self {
        FakeDomainCtl { domains: Mutex::new(Vec::new()) }
    }

    pub fn set_running(&self, domains: &[DomainId]) {
        *self.domains.lock() = domains.iter().map(|d| (*d, DomainFlags { running: true })).collect();
    }
}

impl DomainCtl for FakeDomainCtl {
    fn list_domains(&self) -> Result<Vec<(DomainId, DomainFlags)>> {
        Ok(self.domains.lock().clone())
    }
}

// --- event channels ----------------------------------------------------------

/// Each bound port gets one inbound eventfd the test drives with
/// [`FakeEventChannelBackend::kick`] to simulate a guest notify, and a call
/// counter `notify()` increments so tests can assert on outbound edges (seed
/// scenario S5).
pub struct FakeEventChannelBackend {
    ports: Mutex<HashMap<u32, Event>>,
    notify_counts: Mutex<HashMap<u32, Arc<AtomicUsize>>>,
    next_port: AtomicU32,
}

impl FakeEventChannelBackend {
    pub fn new() -> Self {
        FakeEventChannelBackend {
            ports: Mutex::new(HashMap::new()),
            notify_counts: Mutex::new(HashMap::new()),
            next_port: AtomicU32::new(1),
        }
    }

    /// Simulates the guest signalling `port`.
    pub fn kick(&self, port: u32) -> Result<()> {
        let ports = self.ports.lock();
        let event = ports
            .get(&port)
            .ok_or_else(|| Error::EventChannel(format!("no such port {port}")))?;
        event.write(1).map_err(|e| Error::EventChannel(e.to_string()))
    }

    pub fn notify_count(&self, port: u32) -> usize {
        self.notify_counts
            .lock()
            .get(&port)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl EventChannelBackend for FakeEventChannelBackend {
    fn bind(&self, _remote_domain: DomainId, _remote_port: u32) -> Result<Box<dyn EventChannelHandle>> {
        let local_port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let event = Event::new().map_err(|e| Error::EventChannel(e.to_string()))?;
        let notify_count = Arc::new(AtomicUsize::new(0));

        self.ports.lock().insert(local_port, event.try_clone().map_err(|e| Error::EventChannel(e.to_string()))?);
        self.notify_counts.lock().insert(local_port, notify_count.clone());

        Ok(Box::new(FakeEventChannelHandle { event, local_port, notify_count }))
    }
}

pub struct FakeEventChannelHandle {
    event: Event,
    local_port: u32,
    notify_count: Arc<AtomicUsize>,
}

impl EventChannelHandle for FakeEventChannelHandle {
    fn fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    fn local_port(&self) -> u32 {
        self.local_port
    }

    fn pending(&self) -> Result<Option<u32>> {
        match self.event.read() {
            Ok(v) if v > 0 => Ok(Some(self.local_port)),
            Ok(_) => Ok(None),
            Err(e) if e.errno() == libc::EAGAIN => Ok(None),
            Err(e) => Err(Error::EventChannel(e.to_string())),
        }
    }

    fn unmask(&self, _port: u32) -> Result<()> {
        Ok(())
    }

    fn notify(&self) -> Result<()> {
        self.notify_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- grant mapping -------------------------------------------------------

pub struct FakeGrantCtl;

impl GrantCtl for FakeGrantCtl {
    fn map(&self, _domain: DomainId, refs: &[u32], _prot: Protection) -> Result<Box<dyn MappedRegion>> {
        let len = refs.len() * FAKE_PAGE_SIZE;
        Ok(Box::new(FakeMappedRegion::new(len)))
    }
}

pub struct FakeMappedRegion {
    ptr: *mut u8,
    len: usize,
    _backing: Vec<u8>,
}

impl FakeMappedRegion {
    fn new(len: usize) -> Self {
        let mut backing = vec![0u8; len];
        let ptr = backing.as_mut_ptr();
        FakeMappedRegion { ptr, len, _backing: backing }
    }
}

// SAFETY: `_backing`'s heap allocation is never resized after construction, so
// `ptr` stays valid for the struct's lifetime; exclusively owned, never aliased.
unsafe impl Send for FakeMappedRegion {}

impl MappedRegion for FakeMappedRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

// --- configuration store ---------------------------------------------------

/// An in-memory XenStore: a flat path → bytes map plus exact-or-below watch
/// matching, with a pollable eventfd standing in for the store daemon's
/// socket (spec §4.1, §4.2).
pub struct FakeStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
    watched: Mutex<HashSet<String>>,
    pending: Mutex<VecDeque<String>>,
    event: Event,
}

impl FakeStore {
    pub fn new() -> Result<Self> {
        Ok(FakeStore {
            data: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashSet::new()),
            pending: Mutex::new(VecDeque::new()),
            event: Event::new().map_err(|e| Error::ConfigStore(e.to_string()))?,
        })
    }

    fn fire_watches(&self, changed_path: &str) {
        let watched = self.watched.lock();
        let mut fired = false;
        for w in watched.iter() {
            if changed_path == w || changed_path.starts_with(&format!("{w}/")) {
                self.pending.lock().push_back(w.clone());
                fired = true;
            }
        }
        drop(watched);
        if fired {
            let _ = self.event.write(1);
        }
    }
}

impl StoreBackend for FakeStore {
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.data
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ConfigStore(format!("no such path: {path}")))
    }

    fn read_int(&self, path: &str) -> Result<i64> {
        self.read_string(path)?
            .trim()
            .parse()
            .map_err(|_| Error::ConfigStore(format!("{path} is not an integer")))
    }

    fn read_string(&self, path: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_bytes(path)?).to_string())
    }

    fn write_int(&self, path: &str, value: i64) -> Result<()> {
        self.data.lock().insert(path.to_string(), value.to_string().into_bytes());
        self.fire_watches(path);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let prefix = format!("{path}/");
        self.data.lock().retain(|k, _| k != path && !k.starts_with(&prefix));
        self.fire_watches(path);
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{path}/");
        let mut children: Vec<String> = self
            .data
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap().to_string())
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    fn exists(&self, path: &str) -> bool {
        self.data.lock().contains_key(path)
    }

    fn watch(&self, path: &str) -> Result<()> {
        self.watched.lock().insert(path.to_string());
        Ok(())
    }

    fn unwatch(&self, path: &str) -> Result<()> {
        self.watched.lock().remove(path);
        Ok(())
    }

    fn get_domain_path(&self, domain: DomainId) -> String {
        format!("/local/domain/{}", domain.0)
    }

    fn fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    fn check_watch(&self) -> Result<Option<(String, u32)>> {
        if let Some(path) = self.pending.lock().pop_front() {
            return Ok(Some((path, 0)));
        }
        let _ = self.event.read();
        Ok(None)
    }
}
