// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("Platform does not support cross-process composition: {0}")]
    Unsupported(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Handshake timed out after {0:?} waiting for {1}")]
    HandshakeTimeout(std::time::Duration, &'static str),

    #[error("Peer process {0} exited: {1}")]
    PeerExited(u32, String),

    #[error("Peer process {0} not found")]
    PeerNotFound(u32),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Shared resource has not been opened in this process")]
    ResourceNotOpened,

    #[error("Shared resource {0:#x} already has a root bound")]
    AlreadyBound(u64),

    #[error("Resource reference {0:#x} was already duplicated for process {1}")]
    ReferenceAlreadyDuplicated(u64, u32),

    #[error("Invalid shared resource: {0}")]
    InvalidResource(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] crossvis_wire::WireError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ShareError>;
