// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// The framework's error taxonomy (spec §7). Each variant is raised by exactly
/// one component and carries a human-readable context message, mirroring the
/// `XenException` subclasses (`XenEvtchnException`, `XenGnttabException`, ...)
/// in the original C++ library.
#[derive(Error, Debug)]
pub enum Error {
    /// Raised by the domain-enumeration / event-channel / grant capability
    /// facade (C1) when the underlying hypervisor control interface fails.
    #[error("hypervisor: {0}")]
    Hypervisor(String),

    /// Raised by the configuration-store primitives or watch dispatcher (C2).
    #[error("config store: {0}")]
    ConfigStore(String),

    /// Raised by an event-channel endpoint (C3); terminates its poll thread.
    #[error("event channel: {0}")]
    EventChannel(String),

    /// Raised while mapping or releasing guest-granted pages (C4).
    #[error("grant: {0}")]
    Grant(String),

    /// The guest produced a ring index outside the admissible range (C5).
    #[error("ring overflow: {0}")]
    RingOverflow(String),

    /// The ring's shared header violated the expected protocol (C5).
    #[error("ring protocol: {0}")]
    RingProtocol(String),

    /// A frontend handler's handshake state machine hit an unrecoverable
    /// condition (C7); the handler is driven to `Closing`.
    #[error("handshake: {0}")]
    Handshake(String),
}

pub type Result<T> = std::result::Result<T, Error>;
