//! Small `O_CLOEXEC` helpers shared by the opener, master and worker.
//!
//! Grounded on `proxmox-sys`' `fd_change_cloexec` (same `fcntl` dance), kept
//! in this crate rather than pulled in as a dependency since it is the only
//! piece of that crate this supervisor needs.

use std::os::unix::io::RawFd;

use anyhow::Result;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};

/// Set or clear `FD_CLOEXEC` on an already-open file descriptor.
pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> Result<()> {
    let mut flags = FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, on);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}
