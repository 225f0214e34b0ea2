//! Address resolution and the one-shot listener opener (`SPEC_FULL.md` §4.1).

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::fd;

/// A `(network, addr)` pair. Insertion order into [`crate::Server`] defines
/// the fd ordering every worker observes (invariant 2 in `SPEC_FULL.md` §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A TCP address, given as a `host:port` string (resolved by
    /// [`std::net::TcpListener::bind`], same as any other `ToSocketAddrs`).
    Tcp(String),
    /// A UNIX domain socket path.
    Unix(PathBuf),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp:{addr}"),
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl Address {
    pub(crate) fn tcp(addr: impl Into<String>) -> Self {
        Address::Tcp(addr.into())
    }

    pub(crate) fn unix(path: impl Into<PathBuf>) -> Self {
        Address::Unix(path.into())
    }

    /// Bind and listen, returning the owned raw fd with the high-level
    /// listener object dropped (but the fd kept open) so it can cross a
    /// `fork`+exec.
    fn open(&self) -> Result<OwnedFd, Error> {
        let raw: OwnedFd = match self {
            Address::Tcp(addr) => std::net::TcpListener::bind(addr)
                .map_err(|source| Error::Bind {
                    address: self.clone(),
                    source,
                })?
                .into(),
            Address::Unix(path) => {
                unlink_stale(path);
                std::os::unix::net::UnixListener::bind(path)
                    .map_err(|source| Error::Bind {
                        address: self.clone(),
                        source,
                    })?
                    .into()
            }
        };

        // Keep the fd closed-on-exec until the master is actually about to
        // fork a worker; see `master::fork_worker`, which clears the flag on
        // the target fd numbers right before `execve`.
        fd::set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&raw), true).map_err(|source| {
            Error::Bind {
                address: self.clone(),
                source: std::io::Error::other(source),
            }
        })?;

        Ok(raw)
    }
}

/// Remove a stale UNIX socket file left behind by a previous, uncleanly
/// terminated master. Absence is not an error; anything else is left for
/// `bind` to report.
fn unlink_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed stale socket file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove stale socket file {}: {e}", path.display()),
    }
}

/// Open every registered address in registration order. The returned vector
/// is the fd-ordering contract between master and worker (`3+i`).
pub(crate) fn open_listeners(addresses: &[Address]) -> Result<Vec<OwnedFd>, Error> {
    addresses.iter().map(Address::open).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_network_prefix() {
        assert_eq!(Address::tcp("127.0.0.1:9222").to_string(), "tcp:127.0.0.1:9222");
        assert_eq!(
            Address::unix("/tmp/test.sock").to_string(),
            "unix:/tmp/test.sock"
        );
    }

    #[test]
    fn open_listeners_preserves_registration_order() {
        let addresses = vec![
            Address::tcp("127.0.0.1:0"),
            Address::tcp("127.0.0.1:0"),
            Address::tcp("127.0.0.1:0"),
        ];
        let fds = open_listeners(&addresses).expect("all three should bind");
        assert_eq!(fds.len(), 3);
        // Each ephemeral bind must yield a distinct fd.
        let mut raws: Vec<_> = fds
            .iter()
            .map(std::os::fd::AsRawFd::as_raw_fd)
            .collect();
        raws.sort_unstable();
        raws.dedup();
        assert_eq!(raws.len(), 3);
    }

    #[test]
    fn bind_failure_names_the_address() {
        let err = Address::tcp("not-a-valid-address").open().unwrap_err();
        match err {
            Error::Bind { address, .. } => assert_eq!(address, Address::tcp("not-a-valid-address")),
            other => panic!("expected Error::Bind, got {other:?}"),
        }
    }

    #[test]
    fn unlink_stale_ignores_missing_file() {
        unlink_stale(Path::new("/tmp/graceful-test-definitely-missing.sock"));
    }
}
