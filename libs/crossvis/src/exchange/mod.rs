// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Capability exchange channel.
//!
//! Moves the one resource reference from host to worker, plus the two small
//! control messages that bracket it (`READY` before, `BOUND` after). The
//! channel bootstraps the first cross-process reference, so it needs nothing
//! shared up front beyond a directory both processes can see.

mod channel;

pub use channel::{ExchangeChannel, Inbound};
pub use crossvis_wire::{
    HandshakeHeader, SendOutcome, TAG_BOUND, TAG_READY, TAG_RESOURCE_REFERENCE,
};
