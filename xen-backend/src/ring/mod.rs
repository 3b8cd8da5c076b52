// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C5: the generic producer/consumer ring-buffer engine.

mod engine;
mod layout;

pub use engine::RingBufferEngine;
pub use layout::{slot_count, RingLayout, StandardLayout, HEADER_SIZE};
