// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C8: the process-level supervisor loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sync::Mutex;

use crate::capability::Capabilities;
use crate::frontend::FrontendHandler;
use crate::ids::{DomainId, FrontendKey, InstanceId};
use crate::state::State;
use crate::Result;

const SCAN_TICK: Duration = Duration::from_millis(100);

/// Called for every `(domain, instance)` pair newly observed under
/// `{domain_path}/device/{device_name}`. The hook constructs a concrete
/// frontend handler (often a thin wrapper around [`FrontendHandler`] that
/// supplies a device-class-specific `on_bind`) and registers it with
/// [`BackendEngine::add_frontend_handler`] (spec §4.8).
pub trait NewFrontendHook: Send + Sync {
    fn on_new_frontend(
        &self,
        engine: &BackendEngine,
        domain: DomainId,
        instance: InstanceId,
    ) -> Result<()>;
}

/// Process-level supervisor: scans for guest device instances, constructs a
/// frontend handler per instance via [`NewFrontendHook`], reaps terminated
/// handlers (spec §4.8).
pub struct BackendEngine {
    device_name: String,
    self_domain: DomainId,
    capabilities: Capabilities,
    handlers: Mutex<BTreeMap<FrontendKey, Arc<FrontendHandler>>>,
    hook: Box<dyn NewFrontendHook>,
    stop: Arc<AtomicBool>,
}

impl BackendEngine {
    pub fn new(
        device_name: impl Into<String>,
        self_domain: DomainId,
        capabilities: Capabilities,
        hook: Box<dyn NewFrontendHook>,
    ) -> Self {
        BackendEngine {
            device_name: device_name.into(),
            self_domain,
            capabilities,
            handlers: Mutex::new(BTreeMap::new()),
            hook,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn self_domain(&self) -> DomainId {
        self.self_domain
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Registers a handler constructed by the [`NewFrontendHook`]. Keyed by
    /// `(domain, instance)`; a duplicate key replaces the prior entry, which
    /// is dropped (and therefore torn down) in place.
    pub fn add_frontend_handler(&self, key: FrontendKey, handler: Arc<FrontendHandler>) {
        self.handlers.lock().insert(key, handler);
    }

    /// Runs the supervisor loop until [`BackendEngine::stop`] is called.
    /// Blocks the calling thread; typically the process's main thread after
    /// bootstrap (signal handling, logging) has been set up by the caller,
    /// per spec §1's "process bootstrap is out of scope".
    pub fn run(&self) -> Result<()> {
        while !self.stop.load(Ordering::SeqCst) {
            self.scan()?;
            self.reap();
            thread::sleep(SCAN_TICK);
        }
        self.handlers.lock().clear();
        Ok(())
    }

    /// Requests the loop exit at the next tick boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn scan(&self) -> Result<()> {
        let domains = self.capabilities.domains.running_domains()?;

        for domain in domains {
            if domain == self.self_domain {
                continue;
            }

            let device_dir = format!(
                "{}/device/{}",
                self.capabilities.store.get_domain_path(domain),
                self.device_name
            );
            let instances = match self.capabilities.store.list(&device_dir) {
                Ok(names) => names,
                Err(_) => continue,
            };

            for name in instances {
                let instance = match name.parse::<u32>() {
                    Ok(n) => InstanceId(n),
                    Err(_) => continue,
                };
                if !self.capabilities.store.exists(&format!("{device_dir}/{name}/state")) {
                    continue;
                }

                let key = FrontendKey::new(domain, instance);
                if self.handlers.lock().contains_key(&key) {
                    continue;
                }

                if let Err(e) = self.hook.on_new_frontend(self, domain, instance) {
                    log::error!(target: "backend", "on_new_frontend({domain}, {instance}) failed: {e}");
                }
            }
        }

        Ok(())
    }

    fn reap(&self) {
        let closing: Vec<FrontendKey> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, h)| h.backend_state() == State::Closing)
            .map(|(k, _)| *k)
            .collect();

        if !closing.is_empty() {
            let mut handlers = self.handlers.lock();
            for key in closing {
                handlers.remove(&key);
            }
        }
    }
}
