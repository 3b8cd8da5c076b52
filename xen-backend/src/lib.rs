// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reusable paravirtualized device backend framework.
//!
//! Multiplexes many unprivileged guest "frontends" of one device class onto
//! one privileged-domain backend process: guest discovery (C8), a per-guest
//! XenBus-style handshake (C7), and grant-shared request/response rings (C4,
//! C5) signalled over event channels (C3), all driven off a watch-capable
//! configuration store (C1, C2). Device-class semantics (what a request or
//! response record means) are supplied by the caller; this crate only
//! provides the plumbing.

pub mod backend;
pub mod capability;
pub mod data_channel;
pub mod error;
pub mod event_channel;
pub mod frontend;
pub mod grant_buffer;
pub mod ids;
pub mod ring;
pub mod state;
pub mod store_client;

pub mod testing;

pub use backend::{BackendEngine, NewFrontendHook};
pub use capability::Capabilities;
pub use data_channel::DataChannel;
pub use error::{Error, Result};
pub use event_channel::EventChannel;
pub use frontend::{FrontendHandler, OnBindHook};
pub use grant_buffer::GrantBuffer;
pub use ids::{DomainId, FrontendKey, InstanceId};
pub use ring::RingBufferEngine;
pub use state::State;
pub use store_client::StoreClient;
