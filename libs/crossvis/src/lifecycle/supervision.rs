// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use crate::config::PeerPolicy;
use crate::error::Result;

use super::ProcessRecord;

/// The "on my exit, terminate my peer" obligation.
///
/// A controller registers its counterpart here as soon as it has a record
/// for it. The obligation is discharged by [`release`](Self::release) on a
/// normal exit, and by `Drop` on every other path, so an error unwinding
/// out of a controller still takes the peer down.
pub struct PeerSupervisor {
    peer: Option<ProcessRecord>,
    policy: PeerPolicy,
    shutdown_timeout: Duration,
}

impl PeerSupervisor {
    pub fn new(policy: PeerPolicy, shutdown_timeout: Duration) -> Self {
        Self {
            peer: None,
            policy,
            shutdown_timeout,
        }
    }

    /// Register the counterpart. Replacing a watched peer releases the old one first.
    pub fn watch(&mut self, record: ProcessRecord) -> Result<()> {
        if self.peer.is_some() {
            self.release()?;
        }
        tracing::debug!(pid = record.pid(), role = %record.role(), policy = ?self.policy, "Supervising peer");
        self.peer = Some(record);
        Ok(())
    }

    pub fn peer(&self) -> Option<&ProcessRecord> {
        self.peer.as_ref()
    }

    /// Whether the watched peer has exited. `false` when nothing is watched.
    pub fn peer_exited(&mut self) -> Result<bool> {
        match self.peer.as_mut() {
            Some(peer) => peer.has_exited(),
            None => Ok(false),
        }
    }

    /// Discharge the obligation now.
    pub fn release(&mut self) -> Result<()> {
        let Some(mut peer) = self.peer.take() else {
            tracing::debug!("No peer registered, nothing to release");
            return Ok(());
        };

        match self.policy {
            PeerPolicy::TerminatePeer => peer.terminate(self.shutdown_timeout),
            PeerPolicy::Detach => {
                tracing::info!(pid = peer.pid(), role = %peer.role(), "Detaching from peer");
                Ok(())
            }
        }
    }
}

impl Drop for PeerSupervisor {
    fn drop(&mut self) {
        if self.peer.is_some() {
            if let Err(e) = self.release() {
                tracing::error!(error = %e, "Failed to terminate peer on exit");
            }
        }
    }
}
