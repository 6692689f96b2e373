// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared resource bridge.
//!
//! The seam between the handshake core and the composition engine. The core
//! only needs five things from the engine: create a shareable resource,
//! duplicate its reference for another process, open a reference inside that
//! process, bind content as the resource's root, and resize it.
//!
//! [`MemfdBridge`] is the Linux engine: the resource is a sealed memfd, the
//! reference is an fd to it, and the root is a serialized [`Visual`] tree.

mod memfd;
mod region;
mod resource;
mod target;
mod visual;

pub use memfd::MemfdBridge;
pub use region::{HEADER_SIZE, MIN_RESOURCE_CAPACITY};
pub use resource::{LocalResource, RemoteResource, ResourceReference};
pub use target::CompositionTarget;
pub use visual::{
    Color, Keyframe, KeyframeAnimation, PlacedSprite, Rect, Visual, VisualKind, VisualSize,
};

use crate::error::Result;
use crate::lifecycle::ProcessRecord;

/// Outcome of the one-time capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Supported,
    Unsupported(String),
}

/// What the pair needs from the composition engine.
pub trait SharedResourceBridge {
    /// Probe once, at controller start, whether cross-process sharing works here.
    fn negotiate(&self) -> Capability;

    /// Allocate a resource; return a local handle and an exportable reference.
    fn create_shared_resource(&self) -> Result<(LocalResource, ResourceReference)>;

    /// Produce the copy of `reference` that `target` will receive. Allowed
    /// once per reference.
    fn duplicate_reference_for_process(
        &self,
        reference: &mut ResourceReference,
        target: &ProcessRecord,
    ) -> Result<ResourceReference>;

    /// Turn an inbound reference into a handle on the same resource.
    fn open_shared_resource(&self, reference: ResourceReference) -> Result<RemoteResource>;

    /// Bind `content` as what the resource displays. Rejected if a root is
    /// already bound.
    fn set_root(&self, resource: &RemoteResource, content: &Visual) -> Result<()>;

    /// Update the resource's extent.
    fn resize(&self, resource: &LocalResource, width: f32, height: f32) -> Result<()>;
}
