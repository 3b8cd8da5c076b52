// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

/// The XenBus handshake state enumeration (spec §6). Values are fixed by the
/// upstream XenBus wire convention; this is ABI, not an implementation choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum State {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
}

impl State {
    /// States after which a frontend handler is reaped (spec §3).
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Closing | State::Closed)
    }
}

impl TryFrom<i64> for State {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, i64> {
        Ok(match value {
            0 => State::Unknown,
            1 => State::Initialising,
            2 => State::InitWait,
            3 => State::Initialised,
            4 => State::Connected,
            5 => State::Closing,
            6 => State::Closed,
            other => return Err(other),
        })
    }
}

impl From<State> for i64 {
    fn from(s: State) -> i64 {
        s as i64
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Unknown => "Unknown",
            State::Initialising => "Initialising",
            State::InitWait => "InitWait",
            State::Initialised => "Initialised",
            State::Connected => "Connected",
            State::Closing => "Closing",
            State::Closed => "Closed",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_match_the_xenbus_wire_numbering() {
        assert_eq!(i64::from(State::Unknown), 0);
        assert_eq!(i64::from(State::Closed), 6);
        assert_eq!(State::try_from(4), Ok(State::Connected));
        assert_eq!(State::try_from(42), Err(42));
    }

    #[test]
    fn only_closing_and_closed_are_terminal() {
        assert!(!State::Connected.is_terminal());
        assert!(State::Closing.is_terminal());
        assert!(State::Closed.is_terminal());
    }
}
