// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Wire helpers for the crossvis handshake socket.
//!
//! The host and the worker each bind an `AF_UNIX` datagram socket at a
//! discoverable path. Every datagram carries one fixed-size [`HandshakeHeader`];
//! the resource-reference message additionally carries exactly one file
//! descriptor as `SCM_RIGHTS` ancillary data. The kernel installs that
//! descriptor in the receiver's fd table on delivery, which is what lets the
//! worker open the very same memfd the host created.
//!
//! This crate has no opinion about what the fd refers to or what the
//! controllers do with a message; it only frames and moves bytes and fds.

mod error;
mod header;
#[cfg(target_os = "linux")]
mod socket;

pub use error::WireError;
pub use header::{
    HEADER_LEN, HandshakeHeader, MAGIC, MAX_PAYLOAD_LEN, TAG_BOUND, TAG_READY,
    TAG_RESOURCE_REFERENCE, WIRE_VERSION,
};
#[cfg(target_os = "linux")]
pub use socket::{ReceivedMessage, SendOutcome, poll_readable, recv_message, send_message};
