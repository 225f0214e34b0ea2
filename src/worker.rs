//! The worker role: rematerialize inherited listeners, serve traffic, hand
//! off from the predecessor, detect orphaning, shut down gracefully
//! (`SPEC_FULL.md` §4.3).

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::join_all;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{watch, Mutex};
use tower_service::Service;

use crate::address::Address;
use crate::config::Config;
use crate::env;
use crate::error::Error;
use crate::fd;
use crate::handler::{Handler, ResponseBody};

/// Phase of a single worker's life, guarded by a mutex so a stop-signal and
/// an orphan-detection wakeup racing each other cannot double-drive shutdown
/// (`SPEC_FULL.md` §4.3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerPhase {
    Init,
    Serving,
    Draining,
    Stopped,
}

pub(crate) async fn run(
    config: Config,
    addresses: Vec<Address>,
    handlers: Vec<Arc<dyn Handler>>,
) -> Result<(), Error> {
    let expected = addresses.len();
    let numfd: usize = env::var_parsed(env::NUMFD)?;
    if numfd != expected {
        return Err(Error::FdCountMismatch { expected, got: numfd });
    }
    // Read for the sanity check the spec calls for; the actual orphan test
    // is `getppid() == 1`, not a comparison against this value.
    let _parent_pid: i32 = env::var_parsed(env::PARENT_PID)?;

    let phase = Arc::new(Mutex::new(WorkerPhase::Init));
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks = Vec::with_capacity(addresses.len());
    for (i, (address, handler)) in addresses.into_iter().zip(handlers).enumerate() {
        let listener = reconstruct_listener(&address, env::FIRST_FD + i as RawFd)?;
        let stop_rx = stop_rx.clone();
        let stop_timeout = config.stop_timeout;
        tasks.push(tokio::spawn(serve_listener(
            address,
            listener,
            handler,
            stop_rx,
            stop_timeout,
        )));
    }

    *phase.lock().await = WorkerPhase::Serving;
    log::info!("worker {} serving {} listener(s)", nix::unistd::getpid(), tasks.len());

    signal_predecessor()?;

    let watcher_stop_tx = stop_tx.clone();
    let watch_interval = config.watch_interval;
    let watcher = tokio::spawn(watch_master(watch_interval, watcher_stop_tx));

    wait_for_stop(stop_rx.clone()).await;
    watcher.abort();

    *phase.lock().await = WorkerPhase::Draining;
    log::info!("worker {} draining", nix::unistd::getpid());
    let _ = stop_tx.send(true);

    join_all(tasks).await;
    *phase.lock().await = WorkerPhase::Stopped;
    log::info!("worker {} stopped", nix::unistd::getpid());

    Ok(())
}

/// Reconstruct an async listener from an inherited fd. Re-applies
/// `O_CLOEXEC` so the worker's own descendants (if it spawns any) don't
/// inherit the listening socket a second time.
fn reconstruct_listener(address: &Address, raw_fd: RawFd) -> Result<ListenerKind, Error> {
    fd::set_cloexec(raw_fd, true).map_err(Error::Other)?;
    let listener = match address {
        Address::Tcp(_) => {
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(raw_fd) };
            std_listener.set_nonblocking(true).map_err(|source| Error::Serve {
                address: address.clone(),
                source,
            })?;
            let listener = tokio::net::TcpListener::from_std(std_listener).map_err(|source| Error::Serve {
                address: address.clone(),
                source,
            })?;
            ListenerKind::Tcp(listener)
        }
        Address::Unix(_) => {
            let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(raw_fd) };
            std_listener.set_nonblocking(true).map_err(|source| Error::Serve {
                address: address.clone(),
                source,
            })?;
            let listener = tokio::net::UnixListener::from_std(std_listener).map_err(|source| Error::Serve {
                address: address.clone(),
                source,
            })?;
            ListenerKind::Unix(listener)
        }
    };
    Ok(listener)
}

enum ListenerKind {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

/// Marker trait unifying the two concrete stream types behind one
/// `hyper_util::rt::TokioIo`-compatible object, so `serve_listener` doesn't
/// need to be generic over the listener kind.
trait Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> Conn for T {}

impl ListenerKind {
    async fn accept(&self) -> io::Result<Box<dyn Conn>> {
        match self {
            ListenerKind::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// One listener's whole life: accept connections until told to stop, then
/// drain them within `stop_timeout` (`SPEC_FULL.md` §4.3.3).
///
/// Grounded directly on `proxmox-rest-server`'s `minimal-rest-server.rs`
/// accept loop: `select!` between `accept()` and the shutdown signal, a
/// `GracefulShutdown` watcher handed to each spawned connection, and a final
/// bounded `graceful.shutdown().await`.
async fn serve_listener(
    address: Address,
    listener: ListenerKind,
    handler: Arc<dyn Handler>,
    mut stop_rx: watch::Receiver<bool>,
    stop_timeout: Duration,
) {
    let graceful = GracefulShutdown::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok(io) => {
                        let service = HandlerService(handler.clone());
                        let watcher = graceful.watcher();
                        let address = address.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(io);
                            let conn = auto::Builder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(io, service);
                            if let Err(e) = watcher.watch(conn).await {
                                log::debug!("connection on {address} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("accept error on {address}: {e}"),
                }
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("{address}: draining in-flight connections (up to {stop_timeout:?})");
    if tokio::time::timeout(stop_timeout, graceful.shutdown()).await.is_err() {
        log::warn!("{address}: graceful shutdown exceeded stop_timeout; remaining connections forcibly closed");
    }
}

/// Signal the outgoing worker to drain, if one exists
/// (`SPEC_FULL.md` §4.3, step 4). Only called once this worker is already
/// serving, which eliminates the premature-kill race (§4.3.1).
fn signal_predecessor() -> Result<(), Error> {
    let old_worker_pid: i32 = env::var_parsed(env::OLD_WORKER_PID)?;
    if old_worker_pid > 1 {
        let pid = Pid::from_raw(old_worker_pid);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            log::warn!("failed to signal predecessor worker {pid} to drain: {e}");
        }
    }
    Ok(())
}

/// Poll the worker's parent pid; conclude the master is gone once this
/// worker has been reparented to pid 1 (`SPEC_FULL.md` §4.3.2).
async fn watch_master(watch_interval: Duration, stop_tx: watch::Sender<bool>) {
    let mut ticker = tokio::time::interval(watch_interval);
    loop {
        ticker.tick().await;
        if nix::unistd::getppid().as_raw() == 1 {
            log::warn!("master process is gone; initiating shutdown");
            let _ = stop_tx.send(true);
            break;
        }
    }
}

async fn wait_for_stop(mut stop_rx: watch::Receiver<bool>) {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    let stopped = async {
        loop {
            if *stop_rx.borrow() {
                return;
            }
            if stop_rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::select! {
        _ = sigterm => log::info!("worker {} received SIGTERM, draining", nix::unistd::getpid()),
        _ = stopped => {}
    }
}

/// Adapts a registered [`Handler`] to `tower_service::Service`, the trait
/// `hyper_util`'s connection builder expects. Grounded on
/// `proxmox-rest-server`'s `impl Service<Request<Incoming>> for ApiService`.
struct HandlerService(Arc<dyn Handler>);

impl Service<Request<Incoming>> for HandlerService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move { Ok(handler.call(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_phase_transitions_are_distinct() {
        assert_ne!(WorkerPhase::Init, WorkerPhase::Serving);
        assert_ne!(WorkerPhase::Serving, WorkerPhase::Draining);
        assert_ne!(WorkerPhase::Draining, WorkerPhase::Stopped);
    }

    // Both cases live in one test: `OLD_WORKER_PID` is process-global state,
    // and `cargo test` runs tests in this file on separate threads of the
    // same process, so two tests mutating it independently would race.
    #[test]
    fn signal_predecessor_reads_old_worker_pid() {
        std::env::remove_var(env::OLD_WORKER_PID);
        assert!(matches!(signal_predecessor(), Err(Error::MissingEnv(_))));

        std::env::set_var(env::OLD_WORKER_PID, "0");
        assert!(signal_predecessor().is_ok());
        std::env::remove_var(env::OLD_WORKER_PID);
    }
}
