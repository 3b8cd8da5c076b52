// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::marker::PhantomData;

use crate::error::Error;
use crate::grant_buffer::GrantBuffer;
use crate::ring::layout::{RawRing, RingLayout, StandardLayout};
use crate::Result;

/// A ring-buffer engine over one grant-mapped page, generic over the request
/// and response record types (spec §4.5). Owns its [`GrantBuffer`]; accessed
/// from exactly one thread (the owning event-channel's poll thread), so no
/// internal locking is needed (spec §5).
pub struct RingBufferEngine<Req, Rsp> {
    buffer: GrantBuffer,
    raw: RawRing,
    req_cons: u32,
    rsp_prod_pvt: u32,
    notify_callback: Option<Box<dyn FnMut() + Send>>,
    _marker: PhantomData<(Req, Rsp)>,
}

impl<Req: Copy + 'static, Rsp: Copy + 'static> RingBufferEngine<Req, Rsp> {
    /// Builds the engine over an already-mapped single page, computing slot
    /// capacity from the page size and the larger of `Req`/`Rsp` via
    /// [`StandardLayout`]. Use [`RingBufferEngine::with_layout`] for a device
    /// class whose slot sizing doesn't fit that default.
    pub fn new(buffer: GrantBuffer) -> Result<Self> {
        let slot_size = std::mem::size_of::<Req>().max(std::mem::size_of::<Rsp>());
        Self::with_layout(buffer, &StandardLayout { slot_size })
    }

    /// Builds the engine using a caller-supplied [`RingLayout`] to derive slot
    /// capacity, for rings whose slot size isn't simply the larger of
    /// `Req`/`Rsp` (spec §4, "C5 generic ring parameters").
    pub fn with_layout(buffer: GrantBuffer, layout: &dyn RingLayout) -> Result<Self> {
        let slot_size = std::mem::size_of::<Req>().max(std::mem::size_of::<Rsp>());
        let capacity = layout.slot_count(buffer.len());
        if capacity == 0 {
            return Err(Error::RingProtocol("mapped page too small for one ring slot".into()));
        }

        // SAFETY: `buffer` maps exactly one grant-shared page, sized for the
        // header plus `capacity` slots of `slot_size`, and outlives `raw`
        // (it is stored alongside it in this struct).
        let raw = unsafe { RawRing::new(buffer.as_ptr(), slot_size, capacity) };

        Ok(RingBufferEngine {
            buffer,
            raw,
            req_cons: 0,
            rsp_prod_pvt: 0,
            notify_callback: None,
            _marker: PhantomData,
        })
    }

    pub fn set_notify_callback<F>(&mut self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.notify_callback = Some(Box::new(cb));
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity()
    }

    /// Drains all currently-available requests, invoking `process_request`
    /// for each in order and publishing its returned response (spec §4.5,
    /// drain algorithm; property 1). `process_request` takes `Req` by value
    /// rather than borrowing `self`, so it is free to inspect the request
    /// without the double-mutable-borrow a ring-internal callback would need.
    pub fn on_signal<F>(&mut self, mut process_request: F) -> Result<()>
    where
        F: FnMut(Req) -> Rsp,
    {
        let mut pending = true;

        while pending {
            let rp = self.raw.read_req_prod();

            if rp.wrapping_sub(self.req_cons) > self.capacity() {
                return Err(Error::RingOverflow("bogus producer".into()));
            }

            while self.req_cons != rp {
                if self.req_cons.wrapping_sub(self.rsp_prod_pvt) >= self.capacity() {
                    return Err(Error::RingOverflow("consumer overflow".into()));
                }

                // SAFETY: `self.req_cons` is within `[0, capacity)` modulo wraparound
                // and the slot was produced by the guest as a `Req` record.
                let req = unsafe { self.raw.read_request::<Req>(self.req_cons) };

                self.req_cons = self.req_cons.wrapping_add(1);

                let rsp = process_request(req);
                self.send_response(rsp)?;
            }

            pending = self.final_check_for_requests();
        }

        Ok(())
    }

    /// `RING_FINAL_CHECK_FOR_REQUESTS`: publish `req_cons` as the guest's next
    /// notification threshold, then re-check in case the guest produced more
    /// between our last read and this publish.
    fn final_check_for_requests(&self) -> bool {
        if self.has_unconsumed_requests() {
            return true;
        }
        self.raw.write_req_cons_published(self.req_cons.wrapping_add(1));
        self.has_unconsumed_requests()
    }

    fn has_unconsumed_requests(&self) -> bool {
        self.raw.read_req_prod() != self.req_cons
    }

    /// Copies `rsp` into the next response slot and runs the push-and-check-
    /// notify protocol; calls the notify callback at most once per batch,
    /// exactly when the protocol flags it (spec §4.5, property 2).
    pub fn send_response(&mut self, rsp: Rsp) -> Result<()> {
        // SAFETY: `self.rsp_prod_pvt` indexes a slot already consumed as a
        // request (`rsp_prod_pvt <= req_cons` is the ring invariant), and
        // `Rsp` is the record type this engine was constructed for.
        unsafe {
            self.raw.write_response::<Rsp>(self.rsp_prod_pvt, rsp);
        }
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);

        if self.push_responses_and_check_notify() {
            if let Some(cb) = self.notify_callback.as_mut() {
                cb();
            }
        }

        Ok(())
    }

    /// `RING_PUSH_RESPONSES_AND_CHECK_NOTIFY`.
    fn push_responses_and_check_notify(&self) -> bool {
        let old_prod = self.raw.read_rsp_prod();
        let new_prod = self.rsp_prod_pvt;

        self.raw.write_rsp_prod(new_prod);

        let rsp_event = self.raw.read_rsp_event();
        new_prod.wrapping_sub(rsp_event) < new_prod.wrapping_sub(old_prod)
    }
}
