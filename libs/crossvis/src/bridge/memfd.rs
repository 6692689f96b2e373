// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::config::PairConfig;
use crate::error::{Result, ShareError};
use crate::lifecycle::ProcessRecord;

use super::region::{SharedRegion, probe_memfd};
use super::{
    Capability, LocalResource, RemoteResource, ResourceReference, SharedResourceBridge, Visual,
};

/// Shares resources as sealed memfds passed over `SCM_RIGHTS`.
#[derive(Debug, Clone)]
pub struct MemfdBridge {
    /// Total bytes per resource, header included.
    resource_size: usize,
    initial_extent: (f32, f32),
}

impl MemfdBridge {
    pub fn new(resource_size: usize, width: f32, height: f32) -> Self {
        Self {
            resource_size,
            initial_extent: (width, height),
        }
    }

    pub fn from_config(config: &PairConfig) -> Self {
        let (width, height) = config.window_size;
        Self::new(config.resource_capacity, width as f32, height as f32)
    }
}

impl SharedResourceBridge for MemfdBridge {
    fn negotiate(&self) -> Capability {
        match probe_memfd() {
            Ok(()) => Capability::Supported,
            Err(e) => Capability::Unsupported(format!("memfd_create unavailable: {}", e)),
        }
    }

    fn create_shared_resource(&self) -> Result<(LocalResource, ResourceReference)> {
        let resource_id = fastrand::u64(1..);
        let (width, height) = self.initial_extent;
        let region = SharedRegion::create(self.resource_size, resource_id, width, height)?;
        let reference =
            ResourceReference::from_parts(region.try_clone_fd()?, resource_id, std::process::id());

        tracing::debug!(
            resource_id = format_args!("{:#x}", resource_id),
            size = self.resource_size,
            "Created shared resource"
        );

        Ok((LocalResource::new(region), reference))
    }

    fn duplicate_reference_for_process(
        &self,
        reference: &mut ResourceReference,
        target: &ProcessRecord,
    ) -> Result<ResourceReference> {
        if let Some(previous) = reference.duplicated_for() {
            return Err(ShareError::ReferenceAlreadyDuplicated(
                reference.resource_id(),
                previous,
            ));
        }

        let fd = reference.try_clone_fd()?;
        reference.mark_duplicated(target.pid());

        tracing::debug!(
            resource_id = format_args!("{:#x}", reference.resource_id()),
            target_pid = target.pid(),
            "Duplicated resource reference"
        );

        Ok(ResourceReference::from_parts(
            fd,
            reference.resource_id(),
            reference.origin_pid(),
        ))
    }

    fn open_shared_resource(&self, reference: ResourceReference) -> Result<RemoteResource> {
        let expected = reference.resource_id();
        let origin_pid = reference.origin_pid();
        let region = SharedRegion::open(reference.into_fd())?;

        if region.resource_id() != expected {
            return Err(ShareError::InvalidResource(format!(
                "reference names resource {:#x} but the mapping holds {:#x}",
                expected,
                region.resource_id()
            )));
        }

        tracing::debug!(
            resource_id = format_args!("{:#x}", expected),
            origin_pid,
            "Opened shared resource"
        );

        Ok(RemoteResource::new(region, origin_pid))
    }

    fn set_root(&self, resource: &RemoteResource, content: &Visual) -> Result<()> {
        let bytes = serde_json::to_vec(content)?;
        resource.region().bind_root(&bytes)?;

        tracing::info!(
            resource_id = format_args!("{:#x}", resource.resource_id()),
            bytes = bytes.len(),
            "Bound content as shared root"
        );
        Ok(())
    }

    fn resize(&self, resource: &LocalResource, width: f32, height: f32) -> Result<()> {
        if !(width.is_finite() && height.is_finite()) || width < 0.0 || height < 0.0 {
            return Err(ShareError::InvalidResource(format!(
                "invalid extent {}x{}",
                width, height
            )));
        }
        resource.region().set_extent(width, height);
        tracing::trace!(width, height, "Resized shared resource");
        Ok(())
    }
}
