// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

/// A system call error, carrying the raw `errno` value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(i32);

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Constructs an `Error` from the last OS error (`errno`).
    pub fn last() -> Error {
        Error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn new(errno: i32) -> Error {
        Error(errno)
    }

    pub fn errno(self) -> i32 {
        self.0
    }
}

/// Shorthand for returning `Err(Error::last())` from a syscall wrapper.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error(errno = {})", self.0)
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::from_raw_os_error(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_strerror() {
        let err = Error::new(libc::ENOENT);
        assert!(err.to_string().to_lowercase().contains("no such file"));
    }

    #[test]
    fn errno_round_trips() {
        let err = Error::new(libc::EAGAIN);
        assert_eq!(err.errno(), libc::EAGAIN);
    }
}
