// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C4: a scoped mapping of one or more guest-granted pages.

use crate::capability::{GrantCtl, MappedRegion, Protection};
use crate::ids::DomainId;
use crate::Result;

/// Read-write by default; the only protection the ring engine needs, since it
/// both reads requests and writes responses on the same page.
pub const PROT_READ_WRITE: Protection = libc::PROT_READ | libc::PROT_WRITE;

/// Owns a mapping of `refs.len()` consecutive guest pages. The mapping is
/// released deterministically on drop via the inner [`MappedRegion`].
pub struct GrantBuffer {
    region: Box<dyn MappedRegion>,
    page_count: usize,
}

impl GrantBuffer {
    pub fn map(grants: &dyn GrantCtl, domain: DomainId, refs: &[u32], prot: Protection) -> Result<Self> {
        let region = grants.map(domain, refs, prot)?;
        Ok(GrantBuffer { region, page_count: refs.len() })
    }

    pub fn map_single(grants: &dyn GrantCtl, domain: DomainId, reference: u32, prot: Protection) -> Result<Self> {
        Self::map(grants, domain, &[reference], prot)
    }

    /// Raw pointer to the start of the mapping; indexing past `len()` is a
    /// caller bug, not a checked error (spec §4.4).
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }
}
