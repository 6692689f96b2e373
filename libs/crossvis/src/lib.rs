// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cross-process sharing of one live composition resource.
//!
//! A host process creates the resource and spawns a worker; the worker
//! receives a reference to the same resource and binds its own content as
//! the root. The host displays that content because it already holds the
//! resource. Either process exiting takes the other down.
//!
//! ```no_run
//! use crossvis::{HeadlessWindow, HostController, MemfdBridge, PairConfig};
//!
//! let config = PairConfig::generate();
//! let bridge = MemfdBridge::from_config(&config);
//! let window = HeadlessWindow::new(800, 600).close_on_signals()?;
//! HostController::new(config, bridge, window).run()?;
//! # Ok::<(), crossvis::ShareError>(())
//! ```

#![allow(clippy::missing_safety_doc)] // Safety documented in implementation comments

#[cfg(not(target_os = "linux"))]
compile_error!("crossvis shares resources through memfd and SCM_RIGHTS and only builds on Linux");

pub mod bridge;
pub mod config;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod window;

mod host;
mod worker;

pub use bridge::{
    Capability, CompositionTarget, LocalResource, MemfdBridge, RemoteResource,
    ResourceReference, SharedResourceBridge, Visual,
};
pub use config::{PairConfig, PairSettings, PeerPolicy, ProcessIdentity, Role};
pub use error::{Result, ShareError};
pub use host::{HostController, HostState};
pub use window::{HeadlessWindow, Window, WindowEvent, WindowHandle};
pub use worker::{WorkerController, WorkerState};
