// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Handshake Integration Test
//!
//! Runs a real `WorkerController` on a thread against a host side driven by
//! hand from the test body:
//! 1. Worker announces readiness
//! 2. Host duplicates its reference and sends it
//! 3. Worker opens the resource, binds content and acknowledges
//! 4. Content is visible through the host's original handle
//!
//! The worker runs with `PeerPolicy::Detach` and expects its reference from
//! this process, because its "host" is the test process itself.

use std::os::fd::AsFd;
use std::thread;
use std::time::Duration;

use crossvis::bridge::{CompositionTarget, ResourceReference};
use crossvis::exchange::{
    ExchangeChannel, HandshakeHeader, SendOutcome, TAG_BOUND, TAG_READY, TAG_RESOURCE_REFERENCE,
};
use crossvis::lifecycle::discover;
use crossvis::{
    HeadlessWindow, MemfdBridge, PairConfig, PeerPolicy, Role, ShareError, SharedResourceBridge,
    Visual, WorkerController, WorkerState,
};
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(5);

fn pair_config(dir: &std::path::Path, pair_id: &str) -> PairConfig {
    PairConfig::new(pair_id)
        .with_runtime_dir(dir)
        .with_handshake_timeout(WAIT)
        .with_peer_policy(PeerPolicy::Detach)
        .with_host_pid(std::process::id())
}

fn spawn_worker(
    config: PairConfig,
    window: HeadlessWindow,
) -> thread::JoinHandle<(crossvis::Result<()>, WorkerState)> {
    thread::spawn(move || {
        let bridge = MemfdBridge::from_config(&config);
        let mut worker = WorkerController::new(config, bridge, window);
        let result = worker.run();
        (result, worker.state())
    })
}

#[test]
#[serial]
fn worker_content_is_visible_through_the_hosts_handle() {
    let dir = tempfile::tempdir().unwrap();
    let config = pair_config(dir.path(), "equivalence");
    let bridge = MemfdBridge::from_config(&config);
    let (local, mut reference) = bridge.create_shared_resource().unwrap();
    let host = ExchangeChannel::bind(config.identity(Role::Host)).unwrap();

    let mut target = CompositionTarget::new(800.0, 600.0);
    target.set_root(local.clone());
    assert!(target.compose(Duration::ZERO).unwrap().is_empty());

    let worker_window = HeadlessWindow::new(320, 240);
    let worker_close = worker_window.handle();
    let worker = spawn_worker(config.clone(), worker_window);

    let ready = host
        .recv_tagged_timeout(TAG_READY, WAIT)
        .unwrap()
        .expect("worker never announced readiness");
    assert_eq!(ready.sender_pid, std::process::id());

    let worker_record = discover(Role::Worker, ready.sender_pid).unwrap();
    let duplicate = bridge
        .duplicate_reference_for_process(&mut reference, &worker_record)
        .unwrap();
    assert!(duplicate.same_object_as(&reference).unwrap());

    let outcome = host
        .send(
            &config.identity(Role::Worker),
            HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, duplicate.resource_id()),
            Some(duplicate.as_fd()),
        )
        .unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);
    drop(duplicate);

    host.recv_tagged_timeout(TAG_BOUND, WAIT)
        .unwrap()
        .expect("worker never acknowledged the bind");

    // No bind on this side: the content arrived through the shared resource.
    assert_eq!(local.root().unwrap(), Some(Visual::demo_scene()));
    let frame = target.compose(Duration::ZERO).unwrap();
    assert_eq!(frame.len(), 2);

    // Single-bind policy holds across processes' handles.
    let second = bridge
        .open_shared_resource(ResourceReference::from_parts(
            reference.as_fd().try_clone_to_owned().unwrap(),
            reference.resource_id(),
            std::process::id(),
        ))
        .unwrap();
    for _ in 0..3 {
        assert!(matches!(
            bridge.set_root(&second, &Visual::container()),
            Err(ShareError::AlreadyBound(_))
        ));
    }
    assert_eq!(local.root().unwrap(), Some(Visual::demo_scene()));

    // Resizing the host side needs nothing from the worker.
    bridge.resize(&local, 1280.0, 720.0).unwrap();
    assert_eq!(second.extent(), (1280.0, 720.0));

    worker_close.close();
    let (result, state) = worker.join().unwrap();
    result.unwrap();
    assert_eq!(state, WorkerState::Terminated);
}

#[test]
#[serial]
fn worker_rejects_a_reference_for_another_resource() {
    let dir = tempfile::tempdir().unwrap();
    let config = pair_config(dir.path(), "mismatch");
    let bridge = MemfdBridge::from_config(&config);
    let (_local, reference) = bridge.create_shared_resource().unwrap();
    let host = ExchangeChannel::bind(config.identity(Role::Host)).unwrap();

    let worker = spawn_worker(config.clone(), HeadlessWindow::new(10, 10));

    host.recv_tagged_timeout(TAG_READY, WAIT)
        .unwrap()
        .expect("worker never announced readiness");
    host.send(
        &config.identity(Role::Worker),
        HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, reference.resource_id() ^ 0xff),
        Some(reference.as_fd()),
    )
    .unwrap();

    let (result, state) = worker.join().unwrap();
    assert!(matches!(result, Err(ShareError::InvalidResource(_))));
    assert_eq!(state, WorkerState::Terminated);
    assert!(
        host.recv_tagged_timeout(TAG_BOUND, Duration::from_millis(50))
            .unwrap()
            .is_none()
    );
}

#[test]
#[serial]
fn reference_without_an_fd_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = pair_config(dir.path(), "no-fd");
    let host = ExchangeChannel::bind(config.identity(Role::Host)).unwrap();

    let worker = spawn_worker(config.clone(), HeadlessWindow::new(10, 10));

    host.recv_tagged_timeout(TAG_READY, WAIT)
        .unwrap()
        .expect("worker never announced readiness");
    host.send(
        &config.identity(Role::Worker),
        HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, 42),
        None,
    )
    .unwrap();

    let (result, _) = worker.join().unwrap();
    assert!(matches!(result, Err(ShareError::Protocol(_))));
}

#[test]
#[serial]
fn reference_from_an_unexpected_process_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    // Expect the reference from our parent, then send it from here.
    let config = pair_config(dir.path(), "impostor")
        .with_host_pid(std::os::unix::process::parent_id())
        .with_handshake_timeout(Duration::from_millis(500));
    let bridge = MemfdBridge::from_config(&config);
    let (local, reference) = bridge.create_shared_resource().unwrap();
    let host = ExchangeChannel::bind(config.identity(Role::Host)).unwrap();

    let worker = spawn_worker(config.clone(), HeadlessWindow::new(10, 10));

    host.recv_tagged_timeout(TAG_READY, WAIT)
        .unwrap()
        .expect("worker never announced readiness");
    host.send(
        &config.identity(Role::Worker),
        HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, reference.resource_id()),
        Some(reference.as_fd()),
    )
    .unwrap();

    let (result, state) = worker.join().unwrap();
    assert!(matches!(
        result,
        Err(ShareError::HandshakeTimeout(_, "resource reference"))
    ));
    assert_eq!(state, WorkerState::Terminated);
    assert!(!local.is_bound());
}
