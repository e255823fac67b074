//! io_uring-backed source reader.
//!
//! Linux only; the blocking reader in [`crate::reader`] implements the same
//! loan contract everywhere else (and on kernels where ring setup fails).

pub mod reader;

pub use reader::{RingReader, RingReaderBuilder};

use std::io;

/// Highest best-effort I/O priority (IOPRIO_CLASS_BE, level 0).
pub(crate) const IO_PRIO_BE_HIGHEST: u16 = 2 << 13;

/// Whether `err` means "this host cannot do io_uring" rather than a real
/// failure: missing syscall, seccomp/container denial, or a kernel too old
/// for the setup flags we need. These downgrade to the blocking reader.
pub fn ring_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSYS | libc::EPERM | libc::EACCES | libc::EINVAL | libc::EOPNOTSUPP)
    )
}
