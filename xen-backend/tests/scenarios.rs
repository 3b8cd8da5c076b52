// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end seed scenarios (S1-S6) driven against the fake capability set.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use xen_backend::backend::{BackendEngine, NewFrontendHook};
use xen_backend::capability::StoreBackend;
use xen_backend::data_channel::DataChannel;
use xen_backend::error::Error;
use xen_backend::frontend::FrontendHandler;
use xen_backend::grant_buffer::{GrantBuffer, PROT_READ_WRITE};
use xen_backend::ids::{DomainId, FrontendKey, InstanceId};
use xen_backend::ring::{RingBufferEngine, HEADER_SIZE};
use xen_backend::state::State;
use xen_backend::testing::FakeCapabilities;

const POLL_BUDGET: Duration = Duration::from_secs(2);

fn wait_until(mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < POLL_BUDGET, "condition not met within {POLL_BUDGET:?}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// S1: happy path through Initialising -> InitWait -> Initialised -> Connected.
#[test]
fn s1_happy_path() {
    let fake = FakeCapabilities::new().unwrap();
    let frontend_state = "/local/domain/5/device/audio/0/state";
    let backend_state = "/local/domain/0/backend/audio/5/0/state";

    fake.store.write_int(frontend_state, 1).unwrap(); // peer: Initialising

    let on_bind_called = Arc::new(AtomicBool::new(false));
    let flag = on_bind_called.clone();
    let handler = FrontendHandler::new(
        fake.store.clone(),
        "audio",
        DomainId(0),
        DomainId(5),
        InstanceId(0),
        Box::new(move |_h| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
    )
    .unwrap();

    wait_until(|| fake.store.read_int(backend_state).ok() == Some(2));

    fake.store.write_int(frontend_state, 3).unwrap(); // peer: Initialised

    wait_until(|| fake.store.read_int(backend_state).ok() == Some(4));
    assert!(on_bind_called.load(Ordering::SeqCst));
    assert_eq!(handler.backend_state(), State::Connected);
}

/// S2 + S7: peer vanishes mid-setup; the handler is reaped by the backend
/// engine within one supervisor tick.
#[test]
fn s2_peer_vanishes_is_reaped() {
    let fake = FakeCapabilities::new().unwrap();
    fake.domains.set_running(&[DomainId(5)]);

    let device_dir = "/local/domain/5/device/audio/0";
    let device_state = format!("{device_dir}/state");
    fake.store.write_int(&device_state, 1).unwrap();

    struct Hook;
    impl NewFrontendHook for Hook {
        fn on_new_frontend(
            &self,
            engine: &BackendEngine,
            domain: DomainId,
            instance: InstanceId,
        ) -> xen_backend::Result<()> {
            let handler = FrontendHandler::new(
                engine.capabilities().store.clone(),
                engine.device_name(),
                engine.self_domain(),
                domain,
                instance,
                Box::new(|_h| Ok(())),
            )?;
            engine.add_frontend_handler(FrontendKey::new(domain, instance), handler);
            Ok(())
        }
    }

    let engine = Arc::new(BackendEngine::new(
        "audio",
        DomainId(0),
        fake.capabilities(),
        Box::new(Hook),
    ));

    let run_engine = engine.clone();
    let join = std::thread::spawn(move || run_engine.run());

    let backend_state = "/local/domain/0/backend/audio/5/0/state";
    wait_until(|| fake.store.read_int(backend_state).ok() == Some(2));

    // Peer re-publishes Closing, simulating a guest that vanished mid-setup.
    fake.store.write_int(&device_state, 5).unwrap();

    wait_until(|| fake.store.read_int(backend_state).ok() == Some(5));

    engine.stop();
    join.join().unwrap().unwrap();
}

/// S3: a guest that advances `req_prod` past the ring's capacity is rejected
/// with `RingOverflow`, not read past `req_cons + capacity`.
#[test]
fn s3_bogus_ring_producer() {
    #[derive(Clone, Copy)]
    struct Req {
        id: u32,
    }
    #[derive(Clone, Copy)]
    struct Rsp {
        id: u32,
        result: u32,
    }

    #[repr(C)]
    struct GuestHeader {
        req_prod: u32,
        req_event: u32,
        rsp_prod: u32,
        rsp_event: u32,
    }

    let fake = FakeCapabilities::new().unwrap();
    let buffer = GrantBuffer::map(&*fake.grants, DomainId(5), &[1], PROT_READ_WRITE).unwrap();
    let header = buffer.as_ptr() as *mut GuestHeader;

    let mut ring: RingBufferEngine<Req, Rsp> = RingBufferEngine::new(buffer).unwrap();
    let capacity = ring.capacity();

    // SAFETY: test-only poke simulating a misbehaving guest driver directly
    // writing the shared ring header.
    unsafe {
        (*header).req_prod = capacity + 1;
        (*header).req_event = 0;
        (*header).rsp_prod = 0;
        (*header).rsp_event = 1;
    }

    let result = ring.on_signal(|req| Rsp { id: req.id, result: 0 });
    assert!(matches!(result, Err(Error::RingOverflow(_))));
}

/// S3 (data-channel path): unlike `s3_bogus_ring_producer`, which drives
/// `RingBufferEngine::on_signal` directly, this drives the same failure
/// through a `DataChannel`'s poll thread to confirm the error actually
/// terminates the channel instead of being logged and swallowed.
#[test]
fn s3b_ring_failure_terminates_data_channel() {
    #[derive(Clone, Copy)]
    struct Req {
        id: u32,
    }
    #[derive(Clone, Copy)]
    struct Rsp {
        id: u32,
    }

    #[repr(C)]
    struct GuestHeader {
        req_prod: u32,
        req_event: u32,
        rsp_prod: u32,
        rsp_event: u32,
    }

    let fake = FakeCapabilities::new().unwrap();
    let buffer = GrantBuffer::map(&*fake.grants, DomainId(5), &[1], PROT_READ_WRITE).unwrap();
    let header = buffer.as_ptr() as *mut GuestHeader;

    let ring: RingBufferEngine<Req, Rsp> = RingBufferEngine::new(buffer).unwrap();
    let capacity = ring.capacity();

    // SAFETY: test-only poke simulating a misbehaving guest driver directly
    // writing the shared ring header, same as `s3_bogus_ring_producer`.
    unsafe {
        (*header).req_prod = capacity + 1;
        (*header).req_event = 0;
        (*header).rsp_prod = 0;
        (*header).rsp_event = 1;
    }

    let channel = DataChannel::new(
        "test",
        &*fake.event_channels,
        DomainId(5),
        0,
        ring,
        |req: Req| Rsp { id: req.id },
    )
    .unwrap();

    fake.event_channels.kick(channel.local_port()).unwrap();

    wait_until(|| channel.is_terminated());
}

/// S5: draining 64 requests and publishing 64 responses in one batch produces
/// exactly one notify, matching the guest's default `rsp_event = 1`.
#[test]
fn s5_notify_fan_in() {
    #[derive(Clone, Copy)]
    struct Req {
        id: u32,
    }
    #[derive(Clone, Copy)]
    struct Rsp {
        id: u32,
    }

    #[repr(C)]
    struct GuestHeader {
        req_prod: u32,
        req_event: u32,
        rsp_prod: u32,
        rsp_event: u32,
    }

    let fake = FakeCapabilities::new().unwrap();
    let buffer = GrantBuffer::map(&*fake.grants, DomainId(5), &[1], PROT_READ_WRITE).unwrap();
    let header = buffer.as_ptr() as *mut GuestHeader;
    let slots = unsafe { buffer.as_ptr().add(HEADER_SIZE) as *mut Req };

    let mut ring: RingBufferEngine<Req, Rsp> = RingBufferEngine::new(buffer).unwrap();
    let capacity = ring.capacity();
    assert!(capacity >= 64, "fixture ring too small for this scenario");

    for i in 0..64u32 {
        // SAFETY: writing into this process's own grant-mapped test buffer,
        // within the bounds just asserted above.
        unsafe { std::ptr::write(slots.add(i as usize), Req { id: i }) };
    }
    unsafe {
        (*header).req_prod = 64;
        (*header).req_event = 0;
        (*header).rsp_prod = 0;
        (*header).rsp_event = 1;
    }

    let notify_count = Arc::new(AtomicUsize::new(0));
    let counter = notify_count.clone();
    ring.set_notify_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_writer = seen.clone();
    ring.on_signal(move |req| {
        seen_writer.lock().unwrap().push(req.id);
        Rsp { id: req.id }
    })
    .unwrap();

    assert_eq!(seen.lock().unwrap().len(), 64);
    assert_eq!(notify_count.load(Ordering::SeqCst), 1);
}

/// S6: `set_watch(path, cb, fire_immediately = true)` fires even though no
/// write happens after registration, because the peer had already published
/// its state before the handler was constructed.
#[test]
fn s6_watch_initial_fire() {
    let fake = FakeCapabilities::new().unwrap();
    let frontend_state = "/local/domain/5/device/audio/0/state";
    fake.store.write_int(frontend_state, 1).unwrap();

    let _handler = FrontendHandler::new(
        fake.store.clone(),
        "audio",
        DomainId(0),
        DomainId(5),
        InstanceId(0),
        Box::new(|_h| Ok(())),
    )
    .unwrap();

    // No further write to `frontend_state`; the fire-immediately dispatch
    // alone must carry the handler from Initialising to InitWait.
    wait_until(|| {
        fake.store
            .read_int("/local/domain/0/backend/audio/5/0/state")
            .ok()
            == Some(2)
    });
}

/// S4: from `Connected`, a peer re-publishing `Initialising` is treated as a
/// guest restart and drives the handler to `Closing`, not back through setup.
#[test]
fn s4_peer_restart_from_connected() {
    let fake = FakeCapabilities::new().unwrap();
    let frontend_state = "/local/domain/5/device/audio/0/state";
    let backend_state = "/local/domain/0/backend/audio/5/0/state";

    fake.store.write_int(frontend_state, 1).unwrap();
    let handler = FrontendHandler::new(
        fake.store.clone(),
        "audio",
        DomainId(0),
        DomainId(5),
        InstanceId(0),
        Box::new(|_h| Ok(())),
    )
    .unwrap();

    wait_until(|| fake.store.read_int(backend_state).ok() == Some(2)); // InitWait
    fake.store.write_int(frontend_state, 3).unwrap(); // Initialised
    wait_until(|| fake.store.read_int(backend_state).ok() == Some(4)); // Connected
    assert_eq!(handler.backend_state(), State::Connected);

    fake.store.write_int(frontend_state, 1).unwrap(); // peer restarts
    wait_until(|| handler.backend_state() == State::Closing);
}
