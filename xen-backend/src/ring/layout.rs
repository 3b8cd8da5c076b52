// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The shared ring header, bit-exact to the Xen ring convention
//! (`xen/include/public/io/ring.h`): producer/consumer indices for requests
//! and responses, padded to a cache-line-sized header, followed by a slot
//! array that request and response records share (a completed request slot
//! is overwritten in place with its response).

use std::sync::atomic::{fence, Ordering};

pub const HEADER_SIZE: usize = 64;

#[repr(C)]
pub struct SharedRingHeader {
    pub req_prod: u32,
    pub req_event: u32,
    pub rsp_prod: u32,
    pub rsp_event: u32,
    _pad: [u8; HEADER_SIZE - 4 * 4],
}

const _: () = assert!(std::mem::size_of::<SharedRingHeader>() == HEADER_SIZE);

/// Rounds `n` down to the nearest power of two (0 maps to 0).
fn floor_pow2(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1usize << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Computes the slot count: the largest power of two `n` such that `n *
/// slot_size` fits in the page past the header, matching `__RING_SIZE`'s
/// derivation in the original macro-based ring. Requests and responses share
/// one slot array (a consumed request slot is overwritten with its
/// response), so this is sized for one array, not two.
pub fn slot_count(page_size: usize, slot_size: usize) -> usize {
    let usable = page_size.saturating_sub(HEADER_SIZE);
    floor_pow2(usable / slot_size.max(1)).max(1)
}

/// How a ring derives its slot capacity from the mapped page size. The
/// default, [`StandardLayout`], is the `__RING_SIZE` derivation above; a
/// device class whose slot size isn't simply `max(size_of::<Req>(),
/// size_of::<Rsp>())` (the original's `CustomRingBuffer` case) can supply its
/// own.
pub trait RingLayout {
    fn slot_count(&self, page_size: usize) -> usize;
}

/// The layout every device class gets unless it asks for something else:
/// one slot per max-sized record, packed as densely as the page allows.
pub struct StandardLayout {
    pub slot_size: usize,
}

impl RingLayout for StandardLayout {
    fn slot_count(&self, page_size: usize) -> usize {
        slot_count(page_size, self.slot_size)
    }
}

/// A raw view over one mapped ring page: header plus an opaque slot array.
/// Reads/writes to the header fields go through `read_volatile`/
/// `write_volatile` since the guest mutates `req_prod` (and this process
/// mutates `rsp_prod`) without holding any lock the other side can see.
pub(super) struct RawRing {
    base: *mut u8,
    slot_size: usize,
    capacity: usize,
}

impl RawRing {
    /// # Safety
    /// `base` must point to a mapping at least `HEADER_SIZE + capacity *
    /// slot_size` bytes long, valid for the lifetime of this `RawRing`.
    pub unsafe fn new(base: *mut u8, slot_size: usize, capacity: usize) -> Self {
        RawRing { base, slot_size, capacity }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn header(&self) -> *mut SharedRingHeader {
        self.base as *mut SharedRingHeader
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        let slot = (index as usize) % self.capacity;
        // SAFETY: `slot < self.capacity` and the mapping is sized for it.
        unsafe { self.base.add(HEADER_SIZE + slot * self.slot_size) }
    }

    pub fn read_req_prod(&self) -> u32 {
        // SAFETY: `header()` points within the mapped page for the engine's lifetime.
        let v = unsafe { std::ptr::read_volatile(&(*self.header()).req_prod) };
        fence(Ordering::Acquire);
        v
    }

    pub fn read_rsp_event(&self) -> u32 {
        // SAFETY: see `read_req_prod`.
        unsafe { std::ptr::read_volatile(&(*self.header()).rsp_event) }
    }

    pub fn read_rsp_prod(&self) -> u32 {
        // SAFETY: see `read_req_prod`.
        unsafe { std::ptr::read_volatile(&(*self.header()).rsp_prod) }
    }

    pub fn write_req_cons_published(&self, req_event: u32) {
        fence(Ordering::Release);
        // SAFETY: see `read_req_prod`; this is the only writer of `req_event`.
        unsafe { std::ptr::write_volatile(&mut (*self.header()).req_event, req_event) };
        fence(Ordering::SeqCst);
    }

    pub fn write_rsp_prod(&self, rsp_prod: u32) {
        fence(Ordering::Release);
        // SAFETY: see `read_req_prod`; this is the only writer of `rsp_prod`.
        unsafe { std::ptr::write_volatile(&mut (*self.header()).rsp_prod, rsp_prod) };
        fence(Ordering::SeqCst);
    }

    /// Copies the request slot at `index` into a local record.
    ///
    /// # Safety
    /// `Req` must be the record type this ring was constructed for.
    pub unsafe fn read_request<Req: Copy>(&self, index: u32) -> Req {
        std::ptr::read_unaligned(self.slot_ptr(index) as *const Req)
    }

    /// Writes `rsp` into the slot at `index`, overwriting a consumed request.
    ///
    /// # Safety
    /// `Rsp` must be the record type this ring was constructed for and
    /// `index` must already have been consumed as a request.
    pub unsafe fn write_response<Rsp: Copy>(&self, index: u32, rsp: Rsp) {
        std::ptr::write_unaligned(self.slot_ptr(index) as *mut Rsp, rsp);
    }
}

// SAFETY: `RawRing` is only ever accessed from the single event-channel
// thread that owns the enclosing `RingBufferEngine` (spec §5).
unsafe impl Send for RawRing {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_count_is_a_power_of_two_fit_to_the_page() {
        assert_eq!(slot_count(4096, 8), 256);
        assert_eq!(slot_count(4096, 64), 32);
    }

    #[test]
    fn slot_count_saturates_when_the_header_fills_the_page() {
        assert_eq!(slot_count(HEADER_SIZE, 8), 1);
    }

    #[test]
    fn standard_layout_matches_the_free_function() {
        let layout = StandardLayout { slot_size: 64 };
        assert_eq!(layout.slot_count(4096), slot_count(4096, 64));
    }

    struct FixedLayout(usize);
    impl RingLayout for FixedLayout {
        fn slot_count(&self, _page_size: usize) -> usize {
            self.0
        }
    }

    #[test]
    fn a_custom_layout_overrides_the_standard_derivation() {
        let layout = FixedLayout(7);
        assert_eq!(layout.slot_count(4096), 7);
    }
}
