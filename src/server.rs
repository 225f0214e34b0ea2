//! The public facade: role detection, configuration, registration, and
//! dispatch to the master or worker role (`SPEC_FULL.md` §4.4).

use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use nix::unistd::Pid;

use crate::address::Address;
use crate::config::{Config, Opt};
use crate::env;
use crate::error::Error;
use crate::handler::{default_handler, Handler};
use crate::{master, worker};

static STARTED_AT: OnceLock<SystemTime> = OnceLock::new();

/// The moment [`Server::run`] was called, set exactly once per process
/// (`SPEC_FULL.md` §9 "Global process state"). `None` before `run()` has been
/// called.
pub fn started_at() -> Option<SystemTime> {
    STARTED_AT.get().copied()
}

/// Registers `(address, handler)` pairs and dispatches to the master or
/// worker role depending on the process environment.
pub struct Server {
    config: Config,
    registrations: Vec<(Address, Arc<dyn Handler>)>,
}

impl Server {
    /// Build a server, applying `options` in order (later options override
    /// earlier ones — `SPEC_FULL.md` §4.5, §8 scenario 8).
    pub fn new(options: impl IntoIterator<Item = Opt>) -> Self {
        let mut config = Config::default();
        for opt in options {
            opt.apply(&mut config);
        }
        Server {
            config,
            registrations: Vec::new(),
        }
    }

    /// Register a TCP address. `addr` is a `host:port` string, resolved the
    /// same way [`std::net::TcpListener::bind`] resolves one. A `None`
    /// handler uses the default (404) responder.
    ///
    /// `H` is inferred from the handler passed in, so a literal `None` needs
    /// a turbofish to name a concrete type, e.g.
    /// `None::<fn(Request<Incoming>) -> std::future::Ready<Response<ResponseBody>>>`.
    /// Passing `Some(handler)` as usual avoids the issue entirely.
    pub fn register<H: Handler>(&mut self, addr: impl Into<String>, handler: Option<H>) -> &mut Self {
        self.push(Address::tcp(addr), handler)
    }

    /// Register a UNIX domain socket address. See [`Server::register`] for
    /// the `None`-handler caveat.
    pub fn register_unix<H: Handler>(
        &mut self,
        path: impl Into<std::path::PathBuf>,
        handler: Option<H>,
    ) -> &mut Self {
        self.push(Address::unix(path), handler)
    }

    fn push<H: Handler>(&mut self, address: Address, handler: Option<H>) -> &mut Self {
        let handler: Arc<dyn Handler> = match handler {
            Some(h) => Arc::new(h),
            None => default_handler(),
        };
        self.registrations.push((address, handler));
        self
    }

    /// Whether this process is the master (no-op convenience matching
    /// [`crate::is_master`]).
    pub fn is_master(&self) -> bool {
        env::is_master()
    }

    /// Whether this process is a worker (no-op convenience matching
    /// [`crate::is_worker`]).
    pub fn is_worker(&self) -> bool {
        env::is_worker()
    }

    /// Dispatch to the master or worker role and block until that role's
    /// process is done. Returns [`Error::NoServers`] if nothing was
    /// registered.
    pub fn run(self) -> Result<(), Error> {
        STARTED_AT.get_or_init(SystemTime::now);

        if self.registrations.is_empty() {
            return Err(Error::NoServers);
        }

        let (addresses, handlers): (Vec<_>, Vec<_>) = self.registrations.into_iter().unzip();

        let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Other(e.into()))?;

        if env::is_worker() {
            runtime.block_on(worker::run(self.config, addresses, handlers))
        } else {
            let exit_code = runtime.block_on(master::run(self.config, addresses))?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
    }

    /// Send the first configured reload signal to the master. A no-op
    /// (returning `Ok(())`) when called from the master role itself.
    pub fn reload(&self) -> Result<(), Error> {
        if env::is_master() {
            return Ok(());
        }
        let parent_pid: i32 = env::var_parsed(env::PARENT_PID)?;
        let signal = self.config.first_reload_signal();
        nix::sys::signal::kill(Pid::from_raw(parent_pid), signal).map_err(Error::Signal)
    }
}

/// One-shot convenience: register a single address and run.
pub fn listen_and_serve<H: Handler>(addr: impl Into<String>, handler: H) -> Result<(), Error> {
    let mut server = Server::new([]);
    server.register(addr, Some(handler));
    server.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_without_registrations_fails_fast() {
        let server = Server::new([]);
        assert!(matches!(server.run(), Err(Error::NoServers)));
    }

    #[test]
    fn reload_in_master_role_is_a_noop() {
        std::env::remove_var(env::WORKER);
        let server = Server::new([]);
        assert!(server.reload().is_ok());
    }

    #[test]
    fn register_unix_accepts_a_path() {
        let mut server = Server::new([]);
        server.register_unix(
            "/tmp/graceful-test.sock",
            Some(|_req: hyper::Request<hyper::body::Incoming>| async move {
                hyper::Response::new(crate::full_body(&b"ok"[..]))
            }),
        );
        assert_eq!(server.registrations.len(), 1);
    }
}
