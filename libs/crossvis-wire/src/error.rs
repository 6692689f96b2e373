// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("datagram too short: {0} bytes, need {1}")]
    Truncated(usize, usize),

    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u16),

    #[error("payload length {0} exceeds the fixed payload slot")]
    PayloadTooLarge(u32),

    #[error("socket path too long: {0} bytes")]
    PathTooLong(usize),

    #[error("ancillary data truncated by the kernel")]
    ControlTruncated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
