//! The process-environment contract between a master and its workers.
//!
//! This is the entire cross-process data model for role dispatch and fd
//! inheritance (`SPEC_FULL.md` §3, §6): four variables, all set by the master
//! at fork time, read once by the worker at startup.

use std::str::FromStr;

use crate::error::Error;

/// Presence (`"1"`) marks the process as a worker.
pub const WORKER: &str = "GRACEFUL_WORKER";
/// Decimal count of fds inherited starting at fd 3.
pub const NUMFD: &str = "GRACEFUL_NUMFD";
/// Decimal pid of the master at fork time.
pub const PARENT_PID: &str = "GRACEFUL_PARENT_PID";
/// Decimal pid of the outgoing worker during a reload, or `0` on first boot.
pub const OLD_WORKER_PID: &str = "GRACEFUL_OLD_WORKER_PID";

/// Fd number of the first inherited listener.
pub const FIRST_FD: i32 = 3;

/// Whether this process was launched by a master as a worker.
///
/// A pure function of the environment, safe to call anywhere (including from
/// inside a handler).
pub fn is_worker() -> bool {
    std::env::var(WORKER).as_deref() == Ok("1")
}

/// Whether this process is the master (i.e. not a worker).
pub fn is_master() -> bool {
    !is_worker()
}

/// Reads and parses a `GRACEFUL_*` variable, mapping absence/parse failure to
/// the matching [`Error`] variant.
pub(crate) fn var_parsed<T: FromStr>(name: &'static str) -> Result<T, Error> {
    let raw = std::env::var(name).map_err(|_| Error::MissingEnv(name))?;
    raw.parse()
        .map_err(|_| Error::InvalidEnv { name, value: raw })
}
