// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C6: one event-channel endpoint bound to one ring-buffer engine.

use crate::capability::EventChannelBackend;
use crate::event_channel::EventChannel;
use crate::ids::DomainId;
use crate::ring::RingBufferEngine;
use crate::Result;

/// Binds an [`EventChannel`] to a [`RingBufferEngine`]: the ring's notify
/// callback rings the channel's doorbell, and the channel's signal callback
/// drains the ring (spec §4.6). Once built, the ring lives entirely inside
/// the channel's poll thread closure — it is never touched from any other
/// thread, matching the "ring engine has no locking, one owning thread"
/// invariant (spec §5).
pub struct DataChannel {
    name: String,
    channel: EventChannel,
}

impl DataChannel {
    /// Binds the event channel, wires the ring engine's notify callback to
    /// it, and starts the poll thread. `process_request` is the device
    /// class's per-request hook: given one guest request it returns the
    /// response to publish.
    pub fn new<Req, Rsp, F>(
        name: impl Into<String>,
        backend: &dyn EventChannelBackend,
        peer_domain: DomainId,
        peer_port: u32,
        mut ring: RingBufferEngine<Req, Rsp>,
        mut process_request: F,
    ) -> Result<Self>
    where
        Req: Copy + Send + 'static,
        Rsp: Copy + Send + 'static,
        F: FnMut(Req) -> Rsp + Send + 'static,
    {
        let name = name.into();
        let channel = EventChannel::bind(backend, peer_domain, peer_port)?;

        let notify_handle = channel.handle();
        let notify_name = name.clone();
        ring.set_notify_callback(move || {
            if let Err(e) = notify_handle.notify() {
                log::error!(target: "data_channel", "{notify_name}: notify failed: {e}");
            }
        });

        let error_name = name.clone();
        channel.start(
            move || ring.on_signal(&mut process_request),
            move |e| log::error!(target: "data_channel", "{error_name}: terminated: {e}"),
        );

        Ok(DataChannel { name, channel })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local event-channel port this channel's ring listens on.
    pub fn local_port(&self) -> u32 {
        self.channel.local_port()
    }

    /// True once this channel's poll thread has exited, whether from normal
    /// shutdown or a ring/event-channel failure (spec §4.7's reaping check).
    pub fn is_terminated(&self) -> bool {
        self.channel.is_terminated()
    }
}
