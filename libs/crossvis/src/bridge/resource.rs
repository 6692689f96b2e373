// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use crate::error::Result;

use super::Visual;
use super::region::SharedRegion;

/// A transferable token naming one shared resource.
///
/// Holds an fd to the resource's memfd. The fd is close-on-exec, so a
/// reference only reaches another process by explicit duplication over the
/// exchange channel.
#[derive(Debug)]
pub struct ResourceReference {
    fd: OwnedFd,
    resource_id: u64,
    origin_pid: u32,
    duplicated_for: Option<u32>,
}

impl ResourceReference {
    /// Wrap an fd received from `origin_pid` that claims to name `resource_id`.
    pub fn from_parts(fd: OwnedFd, resource_id: u64, origin_pid: u32) -> Self {
        Self {
            fd,
            resource_id,
            origin_pid,
            duplicated_for: None,
        }
    }

    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    /// Process the reference was produced in.
    pub fn origin_pid(&self) -> u32 {
        self.origin_pid
    }

    /// Pid this reference was already duplicated for, if any.
    pub fn duplicated_for(&self) -> Option<u32> {
        self.duplicated_for
    }

    pub(crate) fn mark_duplicated(&mut self, target: u32) {
        self.duplicated_for = Some(target);
    }

    pub(crate) fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }

    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Whether both references name the same underlying kernel object.
    pub fn same_object_as(&self, other: &ResourceReference) -> io::Result<bool> {
        Ok(file_identity(self.fd.as_fd())? == file_identity(other.fd.as_fd())?)
    }
}

impl AsFd for ResourceReference {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn file_identity(fd: BorrowedFd<'_>) -> io::Result<(u64, u64)> {
    // SAFETY: fstat fills the provided struct.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

/// The creating process's handle on a resource.
///
/// Cheap to clone; every clone shares one mapping.
#[derive(Clone)]
pub struct LocalResource {
    region: Arc<SharedRegion>,
}

impl LocalResource {
    pub(crate) fn new(region: SharedRegion) -> Self {
        Self {
            region: Arc::new(region),
        }
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn resource_id(&self) -> u64 {
        self.region.resource_id()
    }

    pub fn extent(&self) -> (f32, f32) {
        self.region.extent()
    }

    pub fn is_bound(&self) -> bool {
        self.region.is_bound()
    }

    /// Pid of the process that bound content, once bound.
    pub fn root_owner(&self) -> Option<u32> {
        self.region.root_owner()
    }

    /// The content currently bound as root.
    pub fn root(&self) -> Result<Option<Visual>> {
        match self.region.root_bytes() {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for LocalResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalResource")
            .field("resource_id", &format_args!("{:#x}", self.resource_id()))
            .field("extent", &self.extent())
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// A resource opened from a reference produced elsewhere.
pub struct RemoteResource {
    region: SharedRegion,
    origin_pid: u32,
}

impl RemoteResource {
    pub(crate) fn new(region: SharedRegion, origin_pid: u32) -> Self {
        Self { region, origin_pid }
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn resource_id(&self) -> u64 {
        self.region.resource_id()
    }

    pub fn origin_pid(&self) -> u32 {
        self.origin_pid
    }

    pub fn extent(&self) -> (f32, f32) {
        self.region.extent()
    }

    pub fn is_bound(&self) -> bool {
        self.region.is_bound()
    }
}

impl std::fmt::Debug for RemoteResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteResource")
            .field("resource_id", &format_args!("{:#x}", self.resource_id()))
            .field("origin_pid", &self.origin_pid)
            .field("bound", &self.is_bound())
            .finish()
    }
}
