// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C7: one handler per connected guest device-instance, owning the
//! XenBus-style handshake state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use sync::Mutex;

use crate::capability::StoreBackend;
use crate::data_channel::DataChannel;
use crate::ids::{DomainId, InstanceId};
use crate::state::State;
use crate::store_client::StoreClient;
use crate::Result;

/// Called once, from within the watch callback, when the peer publishes
/// `Initialised`. Implementations call [`FrontendHandler::add_channel`] to
/// adopt the data channels their device class needs (spec §4.7, §9 "virtual
/// dispatch / open-class hooks": a stored function value, not a subclass).
pub type OnBindHook = Box<dyn Fn(&FrontendHandler) -> Result<()> + Send + Sync>;

/// One per `(peer_domain, instance)` (spec §3, §4.7).
///
/// Owns a private [`StoreClient`] (and therefore a private watch-dispatcher
/// thread) rather than sharing the backend engine's, per the resolution of
/// the "duplicate owners" open question in spec §9: one store client per
/// dispatcher thread avoids fd contention between handlers' watches.
pub struct FrontendHandler {
    device_name: String,
    peer_domain: DomainId,
    instance: InstanceId,
    frontend_path: String,
    backend_path: String,
    store: Arc<StoreClient>,
    backend_state: Mutex<State>,
    last_peer_state: Mutex<Option<State>>,
    waiting_for_initialising: AtomicBool,
    channels: Mutex<HashMap<String, DataChannel>>,
    on_bind: OnBindHook,
}

impl FrontendHandler {
    /// Computes the frontend/backend paths, publishes `Initialising`, and
    /// installs a `fire_immediately` watch on the peer's state node (spec
    /// §4.7 construction steps 1-4).
    pub fn new(
        store_backend: Arc<dyn StoreBackend>,
        device_name: &str,
        self_domain: DomainId,
        peer_domain: DomainId,
        instance: InstanceId,
        on_bind: OnBindHook,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(StoreClient::new(store_backend));

        let frontend_path = format!(
            "{}/device/{}/{}",
            store.get_domain_path(peer_domain),
            device_name,
            instance
        );
        let backend_path = format!(
            "{}/backend/{}/{}/{}",
            store.get_domain_path(self_domain),
            device_name,
            peer_domain,
            instance
        );

        let handler = Arc::new(FrontendHandler {
            device_name: device_name.to_string(),
            peer_domain,
            instance,
            frontend_path,
            backend_path,
            store,
            backend_state: Mutex::new(State::Unknown),
            last_peer_state: Mutex::new(None),
            waiting_for_initialising: AtomicBool::new(true),
            channels: Mutex::new(HashMap::new()),
            on_bind,
        });

        handler.publish_backend_state(State::Initialising);

        let weak: Weak<FrontendHandler> = Arc::downgrade(&handler);
        handler.store.set_error_callback(move |e| {
            if let Some(handler) = weak.upgrade() {
                log::error!(target: "frontend", "{}: store error: {e}", handler.key());
                handler.publish_backend_state(State::Closing);
            }
        });

        let state_path = format!("{}/state", handler.frontend_path);
        let weak: Weak<FrontendHandler> = Arc::downgrade(&handler);
        handler.store.set_watch(
            &state_path,
            move |_path| {
                if let Some(handler) = weak.upgrade() {
                    handler.on_peer_state_changed();
                }
            },
            true,
        )?;

        Ok(handler)
    }

    pub fn peer_domain(&self) -> DomainId {
        self.peer_domain
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Per-instance log tag, `dom<id>/<device>/<instance>`, matching the
    /// original's `Utils::logDomId` plus per-class `Log` instance naming.
    fn key(&self) -> String {
        format!("dom{}/{}/{}", self.peer_domain, self.device_name, self.instance)
    }

    /// Adopts `dc`, starting its event-channel thread. Must only be called
    /// from inside the `on_bind` hook (spec §4.7).
    pub fn add_channel(&self, dc: DataChannel) {
        self.channels.lock().insert(dc.name().to_string(), dc);
    }

    fn publish_backend_state(&self, state: State) {
        *self.backend_state.lock() = state;
        if let Err(e) = self.store.write_int(&format!("{}/state", self.backend_path), state.into()) {
            log::error!(target: "frontend", "{}: failed to publish state {state}: {e}", self.key());
        }
    }

    /// Samples the handler's progress; promotes to `Closing` if any adopted
    /// channel's thread has terminated (spec §4.7 "Termination").
    pub fn backend_state(&self) -> State {
        let any_terminated = self.channels.lock().values().any(|c| c.is_terminated());
        if any_terminated {
            let current = *self.backend_state.lock();
            if !current.is_terminal() {
                self.publish_backend_state(State::Closing);
            }
        }
        *self.backend_state.lock()
    }

    fn on_peer_state_changed(&self) {
        let raw = match self.store.read_int(&format!("{}/state", self.frontend_path)) {
            Ok(v) => v,
            Err(e) => {
                log::error!(target: "frontend", "{}: failed to read peer state: {e}", self.key());
                self.publish_backend_state(State::Closing);
                return;
            }
        };
        let peer_state = match State::try_from(raw) {
            Ok(s) => s,
            Err(v) => {
                log::warn!(target: "frontend", "{}: unknown peer state {v}", self.key());
                return;
            }
        };

        {
            let mut last = self.last_peer_state.lock();
            if *last == Some(peer_state) {
                return;
            }
            *last = Some(peer_state);
        }

        if self.waiting_for_initialising.load(Ordering::SeqCst) && peer_state != State::Initialising {
            // A stale state (often `Connected`, left over from a previous guest
            // generation) observed before the guest re-announces itself.
            return;
        }
        if peer_state == State::Initialising {
            self.waiting_for_initialising.store(false, Ordering::SeqCst);
        }

        match peer_state {
            State::Initialising => {
                let current = *self.backend_state.lock();
                if current != State::Initialising && current != State::InitWait {
                    self.publish_backend_state(State::Closing);
                } else {
                    self.publish_backend_state(State::InitWait);
                }
            }
            State::Initialised => {
                if let Err(e) = (self.on_bind)(self) {
                    log::error!(target: "frontend", "{}: on_bind failed: {e}", self.key());
                    self.publish_backend_state(State::Closing);
                    return;
                }
                self.publish_backend_state(State::Connected);
            }
            State::Closing | State::Closed => {
                self.publish_backend_state(State::Closing);
            }
            _ => {}
        }
    }
}

impl Drop for FrontendHandler {
    fn drop(&mut self) {
        // Channels first: each `DataChannel`'s `EventChannel` joins its poll
        // thread on drop, so this blocks until all per-channel work quiesces.
        self.channels.lock().clear();
        self.publish_backend_state(State::Closed);
        let state_path = format!("{}/state", self.frontend_path);
        let _ = self.store.clear_watch(&state_path);
    }
}
