// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Memory layout of a shared composition resource.
//!
//! ```text
//! +---------------------------+  0
//! | RegionHeader (64 bytes)   |  atomics, shared by every mapping
//! +---------------------------+  HEADER_SIZE
//! | root content              |  serialized visual tree, root_len bytes
//! +---------------------------+  HEADER_SIZE + capacity
//! ```
//!
//! The memfd is sealed against shrinking and growing before its reference
//! leaves the creating process, so no mapping can be truncated underneath.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, ShareError};

/// "XVRS", little-endian.
const REGION_MAGIC: u32 = u32::from_le_bytes(*b"XVRS");
const REGION_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 64;

/// Smallest total size accepted for a resource.
pub const MIN_RESOURCE_CAPACITY: usize = 4096;

const ROOT_UNBOUND: u32 = 0;
const ROOT_BINDING: u32 = 1;
const ROOT_BOUND: u32 = 2;

const MEMFD_NAME: &CStr = c"crossvis-resource";

#[repr(C)]
struct RegionHeader {
    magic: AtomicU32,
    version: AtomicU32,
    resource_id: AtomicU64,
    /// f32 bits.
    width: AtomicU32,
    /// f32 bits.
    height: AtomicU32,
    root_state: AtomicU32,
    root_len: AtomicU32,
    root_owner_pid: AtomicU32,
    capacity: AtomicU32,
    _reserved: [AtomicU32; 6],
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == HEADER_SIZE);

/// One mapping of a resource's memfd.
pub(crate) struct SharedRegion {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: every access to shared state goes through the header atomics, and
// the content area is written once under the BINDING claim before BOUND is
// published with release ordering.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create, size, seal and map a fresh memfd, then initialize the header.
    pub(crate) fn create(
        total_len: usize,
        resource_id: u64,
        width: f32,
        height: f32,
    ) -> Result<Self> {
        if total_len < MIN_RESOURCE_CAPACITY || total_len - HEADER_SIZE > u32::MAX as usize {
            return Err(ShareError::InvalidResource(format!(
                "resource size {} out of range",
                total_len
            )));
        }

        let fd = memfd_create(libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)?;

        // SAFETY: valid fd, non-negative length.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), total_len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;
        // SAFETY: valid fd; F_ADD_SEALS takes an int.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let region = Self::map_fd(fd, total_len)?;
        let header = region.header();
        header.resource_id.store(resource_id, Ordering::Relaxed);
        header.width.store(width.to_bits(), Ordering::Relaxed);
        header.height.store(height.to_bits(), Ordering::Relaxed);
        header.root_state.store(ROOT_UNBOUND, Ordering::Relaxed);
        header
            .capacity
            .store((total_len - HEADER_SIZE) as u32, Ordering::Relaxed);
        header.version.store(REGION_VERSION, Ordering::Relaxed);
        header.magic.store(REGION_MAGIC, Ordering::Release);

        Ok(region)
    }

    /// Map a memfd received from another process and validate it.
    pub(crate) fn open(fd: OwnedFd) -> Result<Self> {
        // SAFETY: fstat fills the provided struct.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        if stat.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Err(ShareError::InvalidResource(
                "reference is not a memory file".into(),
            ));
        }

        // SAFETY: valid fd.
        let seals = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GET_SEALS) };
        if seals < 0 || seals & libc::F_SEAL_SHRINK == 0 {
            return Err(ShareError::InvalidResource(
                "reference is not sealed against shrinking".into(),
            ));
        }

        let total_len = stat.st_size as usize;
        if total_len < HEADER_SIZE {
            return Err(ShareError::InvalidResource(format!(
                "resource is {} bytes, smaller than its header",
                total_len
            )));
        }

        let region = Self::map_fd(fd, total_len)?;
        let header = region.header();
        let magic = header.magic.load(Ordering::Acquire);
        if magic != REGION_MAGIC {
            return Err(ShareError::InvalidResource(format!(
                "bad magic {:#010x}",
                magic
            )));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != REGION_VERSION {
            return Err(ShareError::InvalidResource(format!(
                "unsupported layout version {}",
                version
            )));
        }
        if region.capacity() > total_len - HEADER_SIZE {
            return Err(ShareError::InvalidResource(
                "declared capacity exceeds the mapping".into(),
            ));
        }

        Ok(region)
    }

    fn map_fd(fd: OwnedFd, len: usize) -> Result<Self> {
        // SAFETY: mapping a regular file we hold open, shared, read-write.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| ShareError::InvalidResource("mmap returned null".into()))?;
        Ok(Self { fd, ptr, len })
    }

    fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long.
        unsafe { &*self.ptr.as_ptr().cast::<RegionHeader>() }
    }

    pub(crate) fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }

    pub(crate) fn resource_id(&self) -> u64 {
        self.header().resource_id.load(Ordering::Relaxed)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.header().capacity.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn extent(&self) -> (f32, f32) {
        let header = self.header();
        (
            f32::from_bits(header.width.load(Ordering::Acquire)),
            f32::from_bits(header.height.load(Ordering::Acquire)),
        )
    }

    pub(crate) fn set_extent(&self, width: f32, height: f32) {
        let header = self.header();
        header.width.store(width.to_bits(), Ordering::Release);
        header.height.store(height.to_bits(), Ordering::Release);
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.header().root_state.load(Ordering::Acquire) == ROOT_BOUND
    }

    /// Pid of the process that bound the root, once bound.
    pub(crate) fn root_owner(&self) -> Option<u32> {
        self.is_bound()
            .then(|| self.header().root_owner_pid.load(Ordering::Relaxed))
    }

    /// Write `bytes` as the root. Only the first caller across all mappings wins.
    pub(crate) fn bind_root(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity() {
            return Err(ShareError::InvalidResource(format!(
                "root content is {} bytes, resource holds {}",
                bytes.len(),
                self.capacity()
            )));
        }

        let header = self.header();
        if header
            .root_state
            .compare_exchange(
                ROOT_UNBOUND,
                ROOT_BINDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ShareError::AlreadyBound(self.resource_id()));
        }

        // SAFETY: the BINDING claim gives us exclusive write access to the
        // content area, and the length was checked against capacity.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(HEADER_SIZE),
                bytes.len(),
            );
        }
        header.root_len.store(bytes.len() as u32, Ordering::Relaxed);
        header
            .root_owner_pid
            .store(std::process::id(), Ordering::Relaxed);
        header.root_state.store(ROOT_BOUND, Ordering::Release);
        Ok(())
    }

    /// Copy of the bound root bytes, if any.
    pub(crate) fn root_bytes(&self) -> Option<Vec<u8>> {
        if !self.is_bound() {
            return None;
        }
        let len = (self.header().root_len.load(Ordering::Relaxed) as usize).min(self.capacity());
        let mut out = vec![0u8; len];
        // SAFETY: BOUND was observed with acquire ordering, so the content
        // write is visible and no longer changing.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(HEADER_SIZE),
                out.as_mut_ptr(),
                len,
            );
        }
        Some(out)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what map_fd mapped.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

fn memfd_create(flags: libc::c_uint) -> Result<OwnedFd> {
    // SAFETY: NUL-terminated name, plain flags.
    let fd = unsafe { libc::memfd_create(MEMFD_NAME.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: the kernel just handed us this fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Whether memfds can be created here at all.
pub(crate) fn probe_memfd() -> io::Result<()> {
    memfd_create(libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
        .map(drop)
        .map_err(|e| match e {
            ShareError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        })
}
