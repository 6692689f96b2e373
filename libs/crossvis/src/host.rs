// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host side of the pair.
//!
//! The host owns the shared resource. It exports it, spawns the worker,
//! hands the worker a reference once the worker has announced readiness,
//! and then displays whatever the worker binds. Closing the host's window
//! terminates the worker.

use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use crate::bridge::{
    Capability, CompositionTarget, LocalResource, ResourceReference, SharedResourceBridge,
};
use crate::config::{Backoff, PairConfig, Role};
use crate::error::{Result, ShareError};
use crate::exchange::{
    ExchangeChannel, HandshakeHeader, Inbound, SendOutcome, TAG_BOUND, TAG_READY,
    TAG_RESOURCE_REFERENCE,
};
use crate::lifecycle::{self, PeerSupervisor};
use crate::window::{Window, WindowEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    ResourceExported,
    WorkerSpawned,
    HandshakeSent,
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Everything the host process holds for the lifetime of the pair.
pub struct HostController<B: SharedResourceBridge, W: Window> {
    config: PairConfig,
    bridge: B,
    window: W,
    state: HostState,
    channel: Option<ExchangeChannel>,
    target: CompositionTarget,
    resource: Option<LocalResource>,
    reference: Option<ResourceReference>,
    supervisor: PeerSupervisor,
    started: Instant,
}

impl<B: SharedResourceBridge, W: Window> HostController<B, W> {
    pub fn new(config: PairConfig, bridge: B, window: W) -> Self {
        let (width, height) = window.client_size();
        let supervisor = PeerSupervisor::new(config.peer_policy, config.peer_shutdown_timeout);
        Self {
            config,
            bridge,
            window,
            state: HostState::Created,
            channel: None,
            target: CompositionTarget::new(width as f32, height as f32),
            resource: None,
            reference: None,
            supervisor,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn resource(&self) -> Option<&LocalResource> {
        self.resource.as_ref()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.supervisor.peer().map(|peer| peer.pid())
    }

    /// Run the handshake through to a bound worker.
    ///
    /// Returns `Ok(false)` if the window was closed before the pair was
    /// established; the controller is then `Terminating`.
    pub fn establish(&mut self) -> Result<bool> {
        if self.state != HostState::Created {
            return Err(ShareError::Protocol(format!(
                "handshake already started (state {:?})",
                self.state
            )));
        }

        if let Capability::Unsupported(reason) = self.bridge.negotiate() {
            return Err(ShareError::Unsupported(reason));
        }
        self.config.validate()?;

        self.export_resource()?;

        // Bound before the worker exists, so its READY always has a target.
        self.channel = Some(ExchangeChannel::bind(self.config.identity(Role::Host))?);

        let worker = lifecycle::spawn(Role::Worker, &self.config)?;
        self.supervisor.watch(worker)?;
        self.transition(HostState::WorkerSpawned);

        if self.await_from_worker(TAG_READY, "worker readiness")?.is_none() {
            self.transition(HostState::Terminating);
            return Ok(false);
        }

        self.send_reference()?;
        self.transition(HostState::HandshakeSent);

        if self.await_from_worker(TAG_BOUND, "worker to bind content")?.is_none() {
            self.transition(HostState::Terminating);
            return Ok(false);
        }

        self.transition(HostState::Running);
        tracing::info!(
            worker_pid = self.worker_pid(),
            pair_id = %self.config.pair_id,
            "Pair established"
        );
        Ok(true)
    }

    /// Establish if needed, then service the window until it closes or the
    /// worker goes away. The worker is terminated on every way out.
    pub fn run(&mut self) -> Result<()> {
        self.run_with(|_| {})
    }

    /// [`run`](Self::run), calling `on_established` once the worker has bound
    /// its content.
    pub fn run_with<F>(&mut self, on_established: F) -> Result<()>
    where
        F: FnOnce(&Self),
    {
        let span = tracing::info_span!(
            "host",
            pid = std::process::id(),
            pair_id = %self.config.pair_id
        );
        let _guard = span.enter();

        let result = self.run_loop(on_established);
        if let Err(e) = &result {
            tracing::error!(error = %e, state = ?self.state, "Host failed");
        }
        let shutdown = self.shutdown();
        result.and(shutdown)
    }

    fn run_loop<F>(&mut self, on_established: F) -> Result<()>
    where
        F: FnOnce(&Self),
    {
        if self.state == HostState::Created && !self.establish()? {
            return Ok(());
        }
        if self.state != HostState::Running {
            return Ok(());
        }
        on_established(self);

        loop {
            if self.supervisor.peer_exited()? {
                return Err(self.peer_exited_error());
            }
            if self.service_window(self.config.poll_interval)? == Flow::Close {
                tracing::info!("Host window closed");
                return Ok(());
            }
            self.present_frame()?;
        }
    }

    /// Terminate the worker and release every reference held here.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == HostState::Terminated {
            return Ok(());
        }
        if self.state != HostState::Terminating {
            self.transition(HostState::Terminating);
        }

        let released = self.supervisor.release();

        self.reference = None;
        self.resource = None;
        let (width, height) = self.target.extent();
        self.target = CompositionTarget::new(width, height);
        self.channel = None;

        self.transition(HostState::Terminated);
        released
    }

    fn export_resource(&mut self) -> Result<()> {
        let (local, reference) = self.bridge.create_shared_resource()?;
        let (width, height) = self.target.extent();
        self.bridge.resize(&local, width, height)?;
        self.target.set_root(local.clone());

        self.resource = Some(local);
        self.reference = Some(reference);
        self.transition(HostState::ResourceExported);
        Ok(())
    }

    fn send_reference(&mut self) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| {
            ShareError::Protocol("exchange channel is not bound".into())
        })?;
        let reference = self.reference.as_mut().ok_or_else(|| {
            ShareError::Protocol("no resource reference to send".into())
        })?;
        let worker = self.supervisor.peer().ok_or_else(|| {
            ShareError::Protocol("no worker to send the reference to".into())
        })?;

        let duplicate = self.bridge.duplicate_reference_for_process(reference, worker)?;
        let header = HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, duplicate.resource_id());
        let target = self.config.identity(Role::Worker);

        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut backoff = Backoff::new(
            self.config.ready_backoff_initial,
            self.config.ready_backoff_max,
        );
        loop {
            match channel.send(&target, header, Some(duplicate.as_fd()))? {
                SendOutcome::Delivered => break,
                SendOutcome::NoReceiver => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ShareError::HandshakeTimeout(
                            self.config.handshake_timeout,
                            "worker to accept the resource reference",
                        ));
                    }
                    std::thread::sleep(backoff.next_delay().min(remaining));
                }
            }
        }

        tracing::info!(
            resource_id = format_args!("{:#x}", duplicate.resource_id()),
            worker_pid = worker.pid(),
            "Resource reference sent"
        );
        Ok(())
    }

    /// Wait, bounded, for `tag` from the spawned worker while keeping the
    /// window serviced. `None` means the window was closed first.
    fn await_from_worker(&mut self, tag: u32, what: &'static str) -> Result<Option<Inbound>> {
        let Some(worker_pid) = self.worker_pid() else {
            return Err(ShareError::Protocol(format!("waiting for {} with no worker", what)));
        };
        let deadline = Instant::now() + self.config.handshake_timeout;

        loop {
            if self.supervisor.peer_exited()? {
                return Err(self.peer_exited_error());
            }
            if self.service_window(Duration::ZERO)? == Flow::Close {
                tracing::info!(waiting_for = what, "Host window closed during handshake");
                return Ok(None);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShareError::HandshakeTimeout(self.config.handshake_timeout, what));
            }

            let channel = self.channel.as_ref().ok_or_else(|| {
                ShareError::Protocol("exchange channel is not bound".into())
            })?;
            if let Some(inbound) =
                channel.recv_tagged_timeout(tag, remaining.min(self.config.poll_interval))?
            {
                if inbound.sender_pid == worker_pid {
                    return Ok(Some(inbound));
                }
                tracing::warn!(
                    sender_pid = inbound.sender_pid,
                    worker_pid,
                    tag = format_args!("{:#x}", tag),
                    "Ignoring message from a process that is not our worker"
                );
            }
        }
    }

    fn service_window(&mut self, timeout: Duration) -> Result<Flow> {
        match self.window.poll_event(timeout)? {
            Some(WindowEvent::CloseRequested) => Ok(Flow::Close),
            Some(WindowEvent::Resized { width, height }) => {
                self.apply_resize(width as f32, height as f32)?;
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Continue),
        }
    }

    fn apply_resize(&mut self, width: f32, height: f32) -> Result<()> {
        self.target.resize(width, height);
        if let Some(resource) = &self.resource {
            self.bridge.resize(resource, width, height)?;
        }
        tracing::debug!(width, height, "Host window resized");
        Ok(())
    }

    fn present_frame(&mut self) -> Result<()> {
        let frame = self.target.compose(self.started.elapsed())?;
        self.window.present(&frame);
        Ok(())
    }

    fn peer_exited_error(&self) -> ShareError {
        match self.supervisor.peer() {
            Some(peer) => ShareError::PeerExited(peer.pid(), peer.exit_description()),
            None => ShareError::Protocol("peer exit reported with no peer".into()),
        }
    }

    fn transition(&mut self, next: HostState) {
        tracing::info!(from = ?self.state, to = ?next, "Host state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{MemfdBridge, RemoteResource, Visual};
    use crate::config::PeerPolicy;
    use crate::lifecycle::ProcessRecord;
    use crate::window::HeadlessWindow;
    use serial_test::serial;

    struct NoSharing;

    impl SharedResourceBridge for NoSharing {
        fn negotiate(&self) -> Capability {
            Capability::Unsupported("no shared resources in this test".into())
        }
        fn create_shared_resource(&self) -> Result<(LocalResource, ResourceReference)> {
            Err(ShareError::Unsupported("create".into()))
        }
        fn duplicate_reference_for_process(
            &self,
            _reference: &mut ResourceReference,
            _target: &ProcessRecord,
        ) -> Result<ResourceReference> {
            Err(ShareError::Unsupported("duplicate".into()))
        }
        fn open_shared_resource(&self, _reference: ResourceReference) -> Result<RemoteResource> {
            Err(ShareError::Unsupported("open".into()))
        }
        fn set_root(&self, _resource: &RemoteResource, _content: &Visual) -> Result<()> {
            Err(ShareError::Unsupported("set_root".into()))
        }
        fn resize(&self, _resource: &LocalResource, _width: f32, _height: f32) -> Result<()> {
            Err(ShareError::Unsupported("resize".into()))
        }
    }

    /// A worker process that never speaks the protocol.
    fn silent_worker_config(dir: &std::path::Path, pair_id: &str) -> PairConfig {
        PairConfig::new(pair_id)
            .with_runtime_dir(dir)
            .with_handshake_timeout(Duration::from_millis(300))
            .with_worker_program("/bin/sh")
            .with_worker_args(["-c", "exec sleep 30"])
    }

    #[test]
    fn unsupported_platform_stops_before_anything_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = PairConfig::new("unsupported").with_runtime_dir(dir.path());
        let mut host = HostController::new(config, NoSharing, HeadlessWindow::new(10, 10));

        assert!(matches!(host.establish(), Err(ShareError::Unsupported(_))));
        assert_eq!(host.state(), HostState::Created);
        assert!(host.worker_pid().is_none());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    #[serial]
    fn silent_worker_times_out_and_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let config = silent_worker_config(dir.path(), "silent");
        let mut host = HostController::new(
            config,
            MemfdBridge::new(16 * 1024, 10.0, 10.0),
            HeadlessWindow::new(10, 10),
        );

        let started = Instant::now();
        let result = host.run();
        assert!(matches!(
            result,
            Err(ShareError::HandshakeTimeout(_, "worker readiness"))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(host.state(), HostState::Terminated);
        assert!(host.resource().is_none());
    }

    #[test]
    #[serial]
    fn worker_that_exits_early_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = silent_worker_config(dir.path(), "early-exit")
            .with_handshake_timeout(Duration::from_secs(10))
            .with_worker_args(["-c", "exit 3"]);
        let mut host = HostController::new(
            config,
            MemfdBridge::new(16 * 1024, 10.0, 10.0),
            HeadlessWindow::new(10, 10),
        );

        let started = Instant::now();
        assert!(matches!(host.run(), Err(ShareError::PeerExited(_, _))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn closing_during_the_handshake_is_a_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = silent_worker_config(dir.path(), "closed-early")
            .with_handshake_timeout(Duration::from_secs(10))
            .with_peer_policy(PeerPolicy::TerminatePeer);
        let window = HeadlessWindow::new(10, 10);
        window.handle().close();
        let mut host = HostController::new(config, MemfdBridge::new(16 * 1024, 10.0, 10.0), window);

        host.run().unwrap();
        assert_eq!(host.state(), HostState::Terminated);
    }

    #[test]
    fn establish_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PairConfig::new("twice").with_runtime_dir(dir.path());
        let mut host = HostController::new(
            config,
            MemfdBridge::new(16 * 1024, 10.0, 10.0),
            HeadlessWindow::new(10, 10),
        );
        host.shutdown().unwrap();
        assert!(matches!(host.establish(), Err(ShareError::Protocol(_))));
    }
}
