// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::errno::{errno_result, Result};

pub type RawDescriptor = RawFd;

/// Trait for FD-like objects that can hand out their underlying descriptor without
/// transferring ownership.
pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

/// Trait for objects that can be constructed from a descriptor whose ownership is
/// transferred to the new object.
///
/// # Safety
/// `descriptor` must be a valid, open, uniquely-owned descriptor.
pub trait FromRawDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self;
}

/// Trait for objects that can give up ownership of their descriptor.
pub trait IntoRawDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor;
}

/// An owned descriptor, closed on drop. The building block every grant mapping,
/// event channel, and store handle in this crate is built from.
#[derive(Debug)]
pub struct SafeDescriptor {
    descriptor: RawDescriptor,
}

impl AsRawFd for SafeDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor
    }
}

impl AsRawDescriptor for SafeDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor
    }
}

impl FromRawDescriptor for SafeDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        SafeDescriptor { descriptor }
    }
}

impl FromRawFd for SafeDescriptor {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_raw_descriptor(fd)
    }
}

impl IntoRawDescriptor for SafeDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor {
        let descriptor = self.descriptor;
        std::mem::forget(self);
        descriptor
    }
}

impl IntoRawFd for SafeDescriptor {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw_descriptor()
    }
}

impl Drop for SafeDescriptor {
    fn drop(&mut self) {
        // SAFETY: `self.descriptor` is uniquely owned by this object.
        unsafe {
            libc::close(self.descriptor);
        }
    }
}

impl SafeDescriptor {
    /// Duplicates the underlying descriptor via `dup(2)`.
    pub fn try_clone(&self) -> Result<SafeDescriptor> {
        // SAFETY: `self.descriptor` is valid for the duration of this call.
        let ret = unsafe { libc::dup(self.descriptor) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY: `ret` is a freshly dup'd, uniquely owned descriptor.
        Ok(unsafe { SafeDescriptor::from_raw_descriptor(ret) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_clone_yields_independent_descriptor() {
        let file = tempfile::tempfile().unwrap();
        // SAFETY: `into_raw_fd` hands us unique ownership of the fd.
        let original = unsafe { SafeDescriptor::from_raw_descriptor(file.into_raw_fd()) };

        let cloned = original.try_clone().unwrap();
        assert_ne!(original.as_raw_descriptor(), cloned.as_raw_descriptor());

        drop(original);
        // The clone's descriptor is still valid after the original is dropped.
        let ret = unsafe { libc::fcntl(cloned.as_raw_descriptor(), libc::F_GETFD) };
        assert!(ret >= 0);
    }
}
