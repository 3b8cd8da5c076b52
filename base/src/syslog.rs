// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Initializes process-wide logging. Safe to call more than once; only the first
/// call takes effect. Surrounding process bootstrap (outside this crate's scope)
/// is expected to call this before constructing a backend engine.
pub fn init() {
    INIT.get_or_init(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_micros()
            .init();
    });
}
