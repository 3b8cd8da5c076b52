// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::errno::{errno_result, Result};

/// Outcome of a bounded wait on a single pollable descriptor.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WaitResult {
    Ready,
    Timeout,
}

/// A minimal poll(2)-based wait context.
///
/// Every long-lived thread in this crate (the watch dispatcher, an event-channel
/// endpoint, the backend supervisor) owns exactly one pollable descriptor and waits
/// on it with a short timeout so it can observe a terminate flag promptly; this
/// type captures that one pattern rather than a general multi-fd reactor.
pub struct WaitContext;

impl WaitContext {
    /// Waits up to `timeout` for `fd` to become readable.
    pub fn wait_readable(fd: RawFd, timeout: Duration) -> Result<WaitResult> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        // SAFETY: `pfd` is valid for the duration of the call and poll only
        // reads/writes through the pointer we pass.
        let ret = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };

        if ret < 0 {
            return errno_result();
        }

        if ret == 0 || pfd.revents == 0 {
            Ok(WaitResult::Timeout)
        } else {
            Ok(WaitResult::Ready)
        }
    }
}
