// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process lifecycle for the pair.
//!
//! - [`spawn`] launches the counterpart with its role marker.
//! - [`discover`] builds a record for an already-running counterpart from its pid.
//! - [`PeerSupervisor`] carries the "on my exit, terminate the peer" obligation.

mod launcher;
mod process_record;
mod supervision;

pub use launcher::{build_command, spawn};
pub use process_record::{ProcessRecord, discover};
pub use supervision::PeerSupervisor;
