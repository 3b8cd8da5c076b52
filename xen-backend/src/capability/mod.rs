// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C1: the hypervisor capability facade.
//!
//! Each of the four capabilities `spec.md` §4.1 names (domain enumeration,
//! event-channel endpoints, grant mapping, configuration-store primitives) is
//! its own trait so a concrete binding (real Xen device nodes, see
//! [`linux`]) and a test double (see [`crate::testing`]) can each implement
//! only what they need, the same way the teacher's `VhostUserBackend` trait
//! lets `handler.rs` swap in a `FakeBackend` under test.

pub mod linux;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::ids::DomainId;
use crate::Result;

/// `PROT_READ` / `PROT_WRITE` bits, as passed to [`GrantCtl::map`].
pub type Protection = i32;

/// Per-domain flags returned by [`DomainCtl::list_domains`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainFlags {
    pub running: bool,
}

/// Domain enumeration (spec §4.1).
pub trait DomainCtl: Send + Sync {
    /// Retrieves the full domain list. Implementations page internally (the
    /// original hypercall returns at most a fixed chunk per call); callers
    /// always see the concatenated result.
    fn list_domains(&self) -> Result<Vec<(DomainId, DomainFlags)>>;

    /// Domains currently running, derived from [`DomainCtl::list_domains`].
    fn running_domains(&self) -> Result<Vec<DomainId>> {
        Ok(self
            .list_domains()?
            .into_iter()
            .filter(|(_, flags)| flags.running)
            .map(|(domain, _)| domain)
            .collect())
    }
}

/// A bound local event-channel port (spec §4.1, §4.3).
pub trait EventChannelHandle: Send {
    fn fd(&self) -> RawFd;
    fn local_port(&self) -> u32;
    /// Returns the port the hypervisor last signalled, if any.
    fn pending(&self) -> Result<Option<u32>>;
    fn unmask(&self, port: u32) -> Result<()>;
    fn notify(&self) -> Result<()>;
}

/// Construction capability for event-channel endpoints.
pub trait EventChannelBackend: Send + Sync {
    fn bind(&self, remote_domain: DomainId, remote_port: u32) -> Result<Box<dyn EventChannelHandle>>;
}

/// A mapped range of one or more consecutive guest pages (spec §4.1, §4.4).
pub trait MappedRegion: Send {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Construction capability for grant mappings.
pub trait GrantCtl: Send + Sync {
    fn map(&self, domain: DomainId, refs: &[u32], prot: Protection) -> Result<Box<dyn MappedRegion>>;

    fn map_single(&self, domain: DomainId, reference: u32, prot: Protection) -> Result<Box<dyn MappedRegion>> {
        self.map(domain, &[reference], prot)
    }
}

/// Configuration-store primitives (spec §4.1).
pub trait StoreBackend: Send + Sync {
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;
    fn read_int(&self, path: &str) -> Result<i64>;
    fn read_string(&self, path: &str) -> Result<String>;
    fn write_int(&self, path: &str, value: i64) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
    fn list(&self, path: &str) -> Result<Vec<String>>;
    fn exists(&self, path: &str) -> bool;
    fn watch(&self, path: &str) -> Result<()>;
    fn unwatch(&self, path: &str) -> Result<()>;
    fn get_domain_path(&self, domain: DomainId) -> String;
    /// A descriptor pollable for watch events.
    fn fd(&self) -> RawFd;
    /// Drains one queued watch notification, if any, without blocking.
    fn check_watch(&self) -> Result<Option<(String, u32)>>;
}

/// The four capabilities bundled together, as C2/C3/C4/C8 receive them.
#[derive(Clone)]
pub struct Capabilities {
    pub domains: Arc<dyn DomainCtl>,
    pub event_channels: Arc<dyn EventChannelBackend>,
    pub grants: Arc<dyn GrantCtl>,
    pub store: Arc<dyn StoreBackend>,
}
