// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker side of the pair.
//!
//! The worker announces itself, waits (bounded) for the host's reference,
//! opens the resource and binds its own content as the root. From then on
//! the host displays that content without further messages. Closing the
//! worker's window terminates the host.

use std::time::{Duration, Instant};

use crate::bridge::{
    Capability, Rect, RemoteResource, ResourceReference, SharedResourceBridge, Visual,
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
pub enum WorkerState {
    WaitingForReference,
    ReferenceReceived,
    ResourceOpened,
    ContentBound,
    Resizable,
    Terminated,
}

pub struct WorkerController<B: SharedResourceBridge, W: Window> {
    config: PairConfig,
    bridge: B,
    window: W,
    state: WorkerState,
    channel: Option<ExchangeChannel>,
    resource: Option<RemoteResource>,
    content: Visual,
    supervisor: PeerSupervisor,
    started: Instant,
}

impl<B: SharedResourceBridge, W: Window> WorkerController<B, W> {
    pub fn new(config: PairConfig, bridge: B, window: W) -> Self {
        let supervisor = PeerSupervisor::new(config.peer_policy, config.peer_shutdown_timeout);
        Self {
            config,
            bridge,
            window,
            state: WorkerState::WaitingForReference,
            channel: None,
            resource: None,
            content: Visual::demo_scene(),
            supervisor,
            started: Instant::now(),
        }
    }

    /// Replace the content bound once the resource is open.
    pub fn with_content(mut self, content: Visual) -> Self {
        self.content = content;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn resource(&self) -> Option<&RemoteResource> {
        self.resource.as_ref()
    }

    /// Pid of the process that sent the reference.
    pub fn host_pid(&self) -> Option<u32> {
        self.supervisor.peer().map(|peer| peer.pid())
    }

    /// Announce readiness, receive the reference, open it and bind content.
    ///
    /// Returns `Ok(false)` if the window was closed first.
    pub fn establish(&mut self) -> Result<bool> {
        if self.state != WorkerState::WaitingForReference || self.channel.is_some() {
            return Err(ShareError::Protocol(format!(
                "handshake already started (state {:?})",
                self.state
            )));
        }

        if let Capability::Unsupported(reason) = self.bridge.negotiate() {
            return Err(ShareError::Unsupported(reason));
        }
        self.config.validate()?;

        self.channel = Some(ExchangeChannel::bind(self.config.identity(Role::Worker))?);

        if !self.announce_ready()? {
            return Ok(false);
        }
        let Some(inbound) = self.await_reference()? else {
            return Ok(false);
        };

        // Supervise the sender before anything else can fail.
        let host = lifecycle::discover(Role::Host, inbound.sender_pid)?;
        self.supervisor.watch(host)?;
        self.transition(WorkerState::ReferenceReceived);

        let (Some(fd), Some(resource_id)) = (inbound.fd, inbound.payload) else {
            return Err(ShareError::Protocol(
                "resource reference message without an fd or resource id".into(),
            ));
        };
        let reference = ResourceReference::from_parts(fd, resource_id, inbound.sender_pid);
        self.resource = Some(self.bridge.open_shared_resource(reference)?);
        self.transition(WorkerState::ResourceOpened);

        self.bind_content()?;
        self.acknowledge_bound()?;
        self.transition(WorkerState::Resizable);

        tracing::info!(
            host_pid = inbound.sender_pid,
            resource_id = format_args!("{:#x}", resource_id),
            "Worker content live in shared resource"
        );
        Ok(true)
    }

    /// Bind this worker's content as the shared resource's root.
    ///
    /// Fails with `ResourceNotOpened` until a reference has been opened.
    pub fn bind_content(&mut self) -> Result<()> {
        let resource = self.resource.as_ref().ok_or(ShareError::ResourceNotOpened)?;
        self.bridge.set_root(resource, &self.content)?;
        self.transition(WorkerState::ContentBound);
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let span = tracing::info_span!(
            "worker",
            pid = std::process::id(),
            pair_id = %self.config.pair_id
        );
        let _guard = span.enter();

        let result = self.run_loop();
        if let Err(e) = &result {
            tracing::error!(error = %e, state = ?self.state, "Worker failed");
        }
        let shutdown = self.shutdown();
        result.and(shutdown)
    }

    fn run_loop(&mut self) -> Result<()> {
        if self.state == WorkerState::WaitingForReference && !self.establish()? {
            return Ok(());
        }
        if self.state != WorkerState::Resizable {
            return Ok(());
        }

        loop {
            if self.supervisor.peer_exited()? {
                return Err(self.peer_exited_error());
            }
            match self.window.poll_event(self.config.poll_interval)? {
                Some(WindowEvent::CloseRequested) => {
                    tracing::info!("Worker window closed");
                    return Ok(());
                }
                Some(WindowEvent::Resized { width, height }) => {
                    tracing::debug!(width, height, "Worker window resized");
                }
                None => {}
            }
            self.present_frame();
        }
    }

    /// Terminate the host and release the opened resource.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == WorkerState::Terminated {
            return Ok(());
        }
        let released = self.supervisor.release();
        self.resource = None;
        self.channel = None;
        self.transition(WorkerState::Terminated);
        released
    }

    /// Send READY until the host's channel takes it.
    fn announce_ready(&mut self) -> Result<bool> {
        let target = self.config.identity(Role::Host);
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut backoff = Backoff::new(
            self.config.ready_backoff_initial,
            self.config.ready_backoff_max,
        );

        loop {
            if self.window_closed()? {
                return Ok(false);
            }

            let channel = self.channel.as_ref().ok_or_else(|| {
                ShareError::Protocol("exchange channel is not bound".into())
            })?;
            match channel.send(&target, HandshakeHeader::new(TAG_READY), None)? {
                SendOutcome::Delivered => {
                    tracing::debug!(host = %target, "Readiness announced");
                    return Ok(true);
                }
                SendOutcome::NoReceiver => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ShareError::HandshakeTimeout(
                            self.config.handshake_timeout,
                            "host to accept readiness",
                        ));
                    }
                    let delay = backoff.next_delay().min(remaining);
                    tracing::trace!(?delay, "Host not listening yet, retrying");
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Wait, bounded, for the reference from the expected host. A reference
    /// from any other process is dropped.
    fn await_reference(&mut self) -> Result<Option<Inbound>> {
        let host_pid = self.config.expected_host_pid();
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            if self.window_closed()? {
                return Ok(None);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShareError::HandshakeTimeout(
                    self.config.handshake_timeout,
                    "resource reference",
                ));
            }

            let channel = self.channel.as_ref().ok_or_else(|| {
                ShareError::Protocol("exchange channel is not bound".into())
            })?;
            if let Some(inbound) = channel.recv_tagged_timeout(
                TAG_RESOURCE_REFERENCE,
                remaining.min(self.config.poll_interval),
            )? {
                if inbound.sender_pid == host_pid {
                    return Ok(Some(inbound));
                }
                tracing::warn!(
                    sender_pid = inbound.sender_pid,
                    host_pid,
                    "Ignoring resource reference from a process that is not our host"
                );
            }
        }
    }

    fn acknowledge_bound(&self) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| {
            ShareError::Protocol("exchange channel is not bound".into())
        })?;
        let target = self.config.identity(Role::Host);
        if channel.send(&target, HandshakeHeader::new(TAG_BOUND), None)? == SendOutcome::NoReceiver {
            tracing::warn!(host = %target, "Host channel gone before bind acknowledgment");
        }
        Ok(())
    }

    /// Service one pending window event without blocking.
    fn window_closed(&mut self) -> Result<bool> {
        Ok(matches!(
            self.window.poll_event(Duration::ZERO)?,
            Some(WindowEvent::CloseRequested)
        ))
    }

    /// The worker lays its content out against its own window.
    fn present_frame(&mut self) {
        let (width, height) = self.window.client_size();
        let frame = self.content.layout(
            Rect::from_size(width as f32, height as f32),
            self.started.elapsed(),
        );
        self.window.present(&frame);
    }

    fn peer_exited_error(&self) -> ShareError {
        match self.supervisor.peer() {
            Some(peer) => ShareError::PeerExited(peer.pid(), peer.exit_description()),
            None => ShareError::Protocol("peer exit reported with no peer".into()),
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::info!(from = ?self.state, to = ?next, "Worker state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MemfdBridge;
    use crate::config::PeerPolicy;
    use crate::window::HeadlessWindow;

    fn worker(dir: &std::path::Path, pair_id: &str) -> WorkerController<MemfdBridge, HeadlessWindow> {
        let config = PairConfig::new(pair_id)
            .with_runtime_dir(dir)
            .with_handshake_timeout(Duration::from_millis(200))
            .with_peer_policy(PeerPolicy::Detach);
        WorkerController::new(
            config,
            MemfdBridge::new(16 * 1024, 10.0, 10.0),
            HeadlessWindow::new(10, 10),
        )
    }

    #[test]
    fn binding_before_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), "premature");
        assert!(matches!(worker.bind_content(), Err(ShareError::ResourceNotOpened)));
        assert_eq!(worker.state(), WorkerState::WaitingForReference);
    }

    #[test]
    fn worker_alone_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), "alone");
        let started = Instant::now();
        assert!(matches!(
            worker.run(),
            Err(ShareError::HandshakeTimeout(_, "host to accept readiness"))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert!(!dir.path().join("crossvis-alone-worker.sock").exists());
    }

    #[test]
    fn host_that_never_sends_a_reference_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = PairConfig::new("mute-host").with_runtime_dir(dir.path());
        let _host = ExchangeChannel::bind(config.identity(Role::Host)).unwrap();

        let mut worker = worker(dir.path(), "mute-host");
        assert!(matches!(
            worker.establish(),
            Err(ShareError::HandshakeTimeout(_, "resource reference"))
        ));
    }

    #[test]
    fn closing_before_the_reference_arrives_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), "closed");
        worker.window.handle().close();
        worker.run().unwrap();
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert!(worker.host_pid().is_none());
    }
}
