// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::{AsRawFd, RawFd};

use crate::descriptor::{AsRawDescriptor, FromRawDescriptor, RawDescriptor, SafeDescriptor};
use crate::errno::{errno_result, Result};

/// A thin eventfd(2) wrapper, used as the local-process counterpart to a bound
/// event-channel descriptor and, in tests, to stand in for one.
#[derive(Debug)]
pub struct Event {
    descriptor: SafeDescriptor,
}

impl Event {
    pub fn new() -> Result<Event> {
        // SAFETY: creates a new, independent eventfd.
        let ret = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY: `ret` is a freshly created, uniquely owned descriptor.
        Ok(Event {
            descriptor: unsafe { SafeDescriptor::from_raw_descriptor(ret) },
        })
    }

    /// Writes `v` to the eventfd counter, waking any waiter.
    pub fn write(&self, v: u64) -> Result<()> {
        // SAFETY: `buf` outlives the call and has the right size for a u64 write.
        let ret = unsafe {
            libc::write(
                self.descriptor.as_raw_descriptor(),
                &v as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Reads and clears the eventfd counter, returning its value.
    pub fn read(&self) -> Result<u64> {
        let mut v: u64 = 0;
        // SAFETY: `v` is valid for the duration of the call and sized for a u64 read.
        let ret = unsafe {
            libc::read(
                self.descriptor.as_raw_descriptor(),
                &mut v as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(v)
    }

    pub fn try_clone(&self) -> Result<Event> {
        Ok(Event {
            descriptor: self.descriptor.try_clone()?,
        })
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor.as_raw_descriptor()
    }
}

impl AsRawDescriptor for Event {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor.as_raw_descriptor()
    }
}

impl FromRawDescriptor for Event {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        Event {
            descriptor: SafeDescriptor::from_raw_descriptor(descriptor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_observes_the_count() {
        let event = Event::new().unwrap();
        event.write(3).unwrap();
        assert_eq!(event.read().unwrap(), 3);
    }

    #[test]
    fn read_with_nothing_pending_returns_eagain() {
        let event = Event::new().unwrap();
        let err = event.read().unwrap_err();
        assert_eq!(err.errno(), libc::EAGAIN);
    }

    #[test]
    fn try_clone_shares_the_same_counter() {
        let event = Event::new().unwrap();
        let clone = event.try_clone().unwrap();
        event.write(1).unwrap();
        assert_eq!(clone.read().unwrap(), 1);
    }
}
