// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::io::ErrorKind;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::{Duration, Instant};

use crossvis_wire::{HandshakeHeader, SendOutcome};

use crate::config::ProcessIdentity;
use crate::error::{Result, ShareError};

/// A received message whose tag matched what the caller was waiting for.
#[derive(Debug)]
pub struct Inbound {
    pub tag: u32,
    /// Pid the sender stamped into the header.
    pub sender_pid: u32,
    pub payload: Option<u64>,
    pub fd: Option<OwnedFd>,
}

/// One process's end of the exchange: a datagram socket bound at its
/// discoverable identity.
///
/// Binding is what makes a process reachable, so a bound channel is the
/// readiness signal the counterpart waits for. The socket file is removed
/// when the channel drops, unless another channel has since taken the path.
pub struct ExchangeChannel {
    identity: ProcessIdentity,
    socket: UnixDatagram,
    /// (dev, ino) of the socket file this channel created.
    file_id: (u64, u64),
}

impl ExchangeChannel {
    /// Bind at `identity`, replacing a stale socket file left by a dead pair.
    ///
    /// An identity some live process is still bound at is refused with
    /// `Configuration`; two pairs sharing an id would misdeliver each
    /// other's messages.
    pub fn bind(identity: ProcessIdentity) -> Result<Self> {
        let path = identity.path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        remove_stale_socket(&identity)?;

        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        let file_id = file_id(path)?;

        tracing::debug!(identity = %identity, path = %path.display(), "Exchange channel bound");

        Ok(Self {
            identity,
            socket,
            file_id,
        })
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Fire-and-forget send. `NoReceiver` is an outcome, not an error: the
    /// caller owns the retry policy.
    pub fn send(
        &self,
        target: &ProcessIdentity,
        header: HandshakeHeader,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<SendOutcome> {
        let outcome = crossvis_wire::send_message(&self.socket, target.path(), &header, fd)?;
        tracing::trace!(
            from = %self.identity,
            to = %target,
            tag = format_args!("{:#x}", header.tag),
            with_fd = fd.is_some(),
            ?outcome,
            "Exchange send"
        );
        Ok(outcome)
    }

    /// Drain queued datagrams until one carries `tag`. Other tags and
    /// malformed datagrams are dropped.
    pub fn try_recv_tagged(&self, tag: u32) -> Result<Option<Inbound>> {
        loop {
            let message = match crossvis_wire::recv_message(&self.socket) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(None),
                Err(crossvis_wire::WireError::Io(e)) => return Err(ShareError::Io(e)),
                Err(e) => {
                    tracing::warn!(identity = %self.identity, error = %e, "Dropping malformed datagram");
                    continue;
                }
            };

            if message.header.tag != tag {
                tracing::debug!(
                    identity = %self.identity,
                    tag = format_args!("{:#x}", message.header.tag),
                    expected = format_args!("{:#x}", tag),
                    sender_pid = message.header.sender_pid,
                    "Ignoring message with unexpected tag"
                );
                continue;
            }

            return Ok(Some(Inbound {
                tag: message.header.tag,
                sender_pid: message.header.sender_pid,
                payload: message
                    .header
                    .has_payload()
                    .then_some(message.header.payload),
                fd: message.fd,
            }));
        }
    }

    /// Wait up to `timeout` for a message carrying `tag`.
    pub fn recv_tagged_timeout(&self, tag: u32, timeout: Duration) -> Result<Option<Inbound>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(inbound) = self.try_recv_tagged(tag)? {
                return Ok(Some(inbound));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            crossvis_wire::poll_readable(&self.socket, remaining)?;
        }
    }
}

fn file_id(path: &Path) -> std::io::Result<(u64, u64)> {
    let metadata = std::fs::symlink_metadata(path)?;
    Ok((metadata.dev(), metadata.ino()))
}

/// Unlink `identity`'s socket file if nobody is receiving on it.
fn remove_stale_socket(identity: &ProcessIdentity) -> Result<()> {
    let path = identity.path();
    let probe = UnixDatagram::unbound()?;
    match probe.connect(path) {
        Ok(()) => {
            return Err(ShareError::Configuration(format!(
                "identity {} is already in use at {}",
                identity,
                path.display()
            )));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {}
        Err(e) => return Err(e.into()),
    }

    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(identity = %identity, "Removed stale handshake socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

impl Drop for ExchangeChannel {
    fn drop(&mut self) {
        let path = self.identity.path();
        match file_id(path) {
            Ok(id) if id == self.file_id => {}
            Ok(_) => {
                tracing::debug!(identity = %self.identity, "Handshake socket path was replaced, leaving it");
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "Failed to inspect handshake socket");
                return;
            }
        }
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(identity = %self.identity, error = %e, "Failed to remove handshake socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crossvis_wire::{TAG_BOUND, TAG_READY, TAG_RESOURCE_REFERENCE};
    use std::os::fd::AsFd;

    fn pair(dir: &std::path::Path) -> (ExchangeChannel, ExchangeChannel) {
        let host = ExchangeChannel::bind(ProcessIdentity::new(Role::Host, "t", dir)).unwrap();
        let worker = ExchangeChannel::bind(ProcessIdentity::new(Role::Worker, "t", dir)).unwrap();
        (host, worker)
    }

    #[test]
    fn unmatched_tags_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (host, worker) = pair(dir.path());

        worker
            .send(host.identity(), HandshakeHeader::new(TAG_BOUND), None)
            .unwrap();
        worker
            .send(host.identity(), HandshakeHeader::new(TAG_READY), None)
            .unwrap();

        let inbound = host.try_recv_tagged(TAG_READY).unwrap().unwrap();
        assert_eq!(inbound.tag, TAG_READY);
        assert_eq!(inbound.sender_pid, std::process::id());
        assert!(inbound.payload.is_none());
        // The BOUND message was consumed and dropped while looking for READY.
        assert!(host.try_recv_tagged(TAG_BOUND).unwrap().is_none());
    }

    #[test]
    fn reference_message_carries_payload_and_fd() {
        let dir = tempfile::tempdir().unwrap();
        let (host, worker) = pair(dir.path());
        let file = tempfile::tempfile().unwrap();

        let outcome = host
            .send(
                worker.identity(),
                HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, 0x42),
                Some(file.as_fd()),
            )
            .unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);

        let inbound = worker
            .recv_tagged_timeout(TAG_RESOURCE_REFERENCE, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(inbound.payload, Some(0x42));
        assert!(inbound.fd.is_some());
    }

    #[test]
    fn send_before_receiver_binds_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let host = ExchangeChannel::bind(ProcessIdentity::new(Role::Host, "t", dir.path())).unwrap();
        let worker_identity = ProcessIdentity::new(Role::Worker, "t", dir.path());

        let outcome = host
            .send(&worker_identity, HandshakeHeader::new(TAG_READY), None)
            .unwrap();
        assert_eq!(outcome, SendOutcome::NoReceiver);
    }

    #[test]
    fn recv_times_out_when_nothing_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _worker) = pair(dir.path());

        let started = Instant::now();
        let inbound = host
            .recv_tagged_timeout(TAG_READY, Duration::from_millis(50))
            .unwrap();
        assert!(inbound.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dropping_the_channel_removes_its_socket() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ProcessIdentity::new(Role::Host, "t", dir.path());
        let channel = ExchangeChannel::bind(identity.clone()).unwrap();
        assert!(identity.path().exists());
        drop(channel);
        assert!(!identity.path().exists());
    }

    #[test]
    fn rebinding_replaces_a_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ProcessIdentity::new(Role::Host, "t", dir.path());
        // std does not unlink the path when the socket closes.
        drop(UnixDatagram::bind(identity.path()).unwrap());
        assert!(identity.path().exists());

        ExchangeChannel::bind(identity).unwrap();
    }

    #[test]
    fn live_identity_is_not_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let (host, worker) = pair(dir.path());

        let second = ExchangeChannel::bind(host.identity().clone());
        assert!(matches!(second, Err(ShareError::Configuration(_))));

        // The first binder still receives.
        let outcome = worker
            .send(host.identity(), HandshakeHeader::new(TAG_READY), None)
            .unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
        assert!(host.try_recv_tagged(TAG_READY).unwrap().is_some());
    }

    #[test]
    fn drop_leaves_a_path_rebound_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ProcessIdentity::new(Role::Host, "t", dir.path());
        let channel = ExchangeChannel::bind(identity.clone()).unwrap();

        std::fs::remove_file(identity.path()).unwrap();
        let _other = UnixDatagram::bind(identity.path()).unwrap();

        drop(channel);
        assert!(identity.path().exists());
    }
}
