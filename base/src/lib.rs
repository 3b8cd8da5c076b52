// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small set of host-facing primitives shared by every component of the backend
//! framework: raw descriptor ownership, an eventfd wrapper, a timeout-based
//! multi-fd wait context, and process logging setup.

mod descriptor;
mod errno;
mod event;
mod syslog;
mod wait_context;

pub use descriptor::{AsRawDescriptor, FromRawDescriptor, IntoRawDescriptor, RawDescriptor, SafeDescriptor};
pub use errno::{errno_result, Error, Result};
pub use event::Event;
pub use log::{debug, error, info, trace, warn};
pub use syslog::init as syslog_init;
pub use wait_context::{WaitContext, WaitResult};
