// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Datagram send/receive with optional `SCM_RIGHTS` fd passing.
//!
//! Both calls are non-blocking: the control thread polls them between window
//! events, so neither side of the pair can wedge the other.

use std::ffi::c_void;
use std::io;
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

use crate::{HEADER_LEN, HandshakeHeader, WireError};

/// Room for one `cmsghdr` plus a handful of fds, u64-aligned as `cmsghdr` requires.
const CONTROL_WORDS: usize = 8;

/// Whether a datagram reached a bound receiver.
///
/// `NoReceiver` covers a missing socket path, a path nobody is bound to, and a
/// receiver whose queue is full. The sender decides whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NoReceiver,
}

/// A received handshake datagram and the first fd that came with it.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub header: HandshakeHeader,
    pub fd: Option<OwnedFd>,
}

/// Send `header` to the socket bound at `target`, optionally passing `fd`.
pub fn send_message(
    socket: &UnixDatagram,
    target: &Path,
    header: &HandshakeHeader,
    fd: Option<BorrowedFd<'_>>,
) -> Result<SendOutcome, WireError> {
    let (mut addr, addr_len) = sockaddr_un(target)?;
    let bytes = header.encode();

    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut c_void,
        iov_len: bytes.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];

    // SAFETY: msghdr is plain old data; every pointer stored in it outlives the
    // sendmsg call below.
    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_un as *mut c_void;
    msg.msg_namelen = addr_len;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        let space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points at a zeroed, aligned buffer of at least `space` bytes.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }
    }

    loop {
        // SAFETY: msg is fully initialised above.
        let rc = unsafe {
            libc::sendmsg(
                socket.as_raw_fd(),
                &msg,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if rc >= 0 {
            return Ok(SendOutcome::Delivered);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ENOENT) | Some(libc::ECONNREFUSED) | Some(libc::EAGAIN) => {
                return Ok(SendOutcome::NoReceiver);
            }
            _ => return Err(WireError::Io(err)),
        }
    }
}

/// Receive one datagram without blocking. `Ok(None)` means nothing is queued.
///
/// Fds are taken into ownership before the header is validated, so a
/// malformed datagram never leaks a descriptor.
pub fn recv_message(socket: &UnixDatagram) -> Result<Option<ReceivedMessage>, WireError> {
    let mut bytes = [0u8; HEADER_LEN * 2];
    let mut iov = libc::iovec {
        iov_base: bytes.as_mut_ptr() as *mut c_void,
        iov_len: bytes.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];

    // SAFETY: as in send_message.
    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = size_of::<[u64; CONTROL_WORDS]>() as _;

    let received = loop {
        // SAFETY: msg points at live local buffers.
        let rc = unsafe {
            libc::recvmsg(
                socket.as_raw_fd(),
                &mut msg,
                libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
            )
        };
        if rc >= 0 {
            break rc as usize;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(WireError::Io(err)),
        }
    };

    let fds = take_fds(&msg);
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(WireError::ControlTruncated);
    }

    let header = HandshakeHeader::decode(&bytes[..received.min(bytes.len())])?;
    Ok(Some(ReceivedMessage {
        header,
        fd: fds.into_iter().next(),
    }))
}

/// Wait until `socket` has a datagram queued or `timeout` elapses.
pub fn poll_readable(socket: &UnixDatagram, timeout: Duration) -> Result<bool, WireError> {
    let mut pfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;

    loop {
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc >= 0 {
            return Ok(rc > 0 && pfd.revents & libc::POLLIN != 0);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(WireError::Io(err));
        }
    }
}

fn take_fds(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();

    // SAFETY: the kernel filled msg_control; the CMSG_* macros walk it within
    // msg_controllen. Each SCM_RIGHTS fd is freshly installed and owned by us.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..data_len / size_of::<RawFd>() {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }

    fds
}

fn sockaddr_un(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t), WireError> {
    // SAFETY: sockaddr_un is plain old data.
    let mut addr: libc::sockaddr_un = unsafe { zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(WireError::PathTooLong(bytes.len()));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}
