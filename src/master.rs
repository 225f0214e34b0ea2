//! The master role: owns listener fds, forks workers, translates signals into
//! lifecycle transitions (`SPEC_FULL.md` §4.2).

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::address::{self, Address};
use crate::config::Config;
use crate::env;
use crate::error::Error;

/// One worker's eventual exit, reported by its background waiter task.
struct WorkerExit {
    pid: Pid,
    status: ExitStatus,
}

/// Runs the master role to completion and returns the process exit code
/// (`SPEC_FULL.md` §6 "Exit codes"): `0` after a graceful stop, non-zero if a
/// worker terminated abnormally.
pub(crate) async fn run(config: Config, addresses: Vec<Address>) -> Result<i32, Error> {
    let fds = address::open_listeners(&addresses)?;
    for addr in &addresses {
        log::info!("listening on {addr}");
    }
    let mut master = Master {
        config,
        fds,
        worker_pid: Arc::new(Mutex::new(None)),
        living_worker_num: Arc::new(AtomicU8::new(0)),
    };

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    master.fork_worker(&exit_tx, Pid::from_raw(0)).await?;

    if let Some(path) = master.config.pid_file.clone() {
        if let Err(e) = write_pid_file(&path) {
            log::warn!("failed to write pid file {}: {e}", path.display());
        }
    }

    let mut signals = SignalWaiter::install(&master.config)?;

    let exit_code = loop {
        tokio::select! {
            exited = exit_rx.recv() => {
                match exited {
                    Some(WorkerExit { pid, status }) => {
                        if !status.success() {
                            log::error!("worker {pid} exited abnormally ({status}); stopping");
                            break exit_code_for(status);
                        }
                        let remaining = master.living_worker_num.fetch_sub(1, Ordering::AcqRel) - 1;
                        log::info!("worker {pid} exited cleanly ({remaining} worker(s) remaining)");
                        if remaining == 0 {
                            break 0;
                        }
                    }
                    None => break 0,
                }
            }
            signal = signals.recv() => {
                let Some(signal) = signal else { break 0; };
                if master.config.reload_signals.contains(&signal) {
                    log::info!("received {signal:?}, reloading");
                    if let Err(e) = master.reload(&exit_tx).await {
                        log::error!("reload failed: {e:#}; continuing with the existing worker");
                    }
                } else if master.config.stop_signals.contains(&signal) {
                    log::info!("received {signal:?}, stopping");
                    master.graceful_stop(&mut exit_rx).await;
                    break 0;
                }
            }
        }
    };

    Ok(exit_code)
}

fn exit_code_for(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn write_pid_file(path: &std::path::Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", nix::unistd::getpid()))
}

struct Master {
    config: Config,
    fds: Vec<OwnedFd>,
    /// Guarded together because a reload must record the new pid atomically
    /// with respect to anyone reading the current worker (SPEC_FULL.md §4.2.4).
    worker_pid: Arc<Mutex<Option<Pid>>>,
    living_worker_num: Arc<AtomicU8>,
}

impl Master {
    /// Fork a worker that inherits `self.fds` at `3..3+n` and the
    /// `GRACEFUL_*` environment (`SPEC_FULL.md` §4.2.2).
    ///
    /// Uses `tokio::process::Command` with a `pre_exec` hook rather than a
    /// raw `fork`+`execvp` (contrast the teacher's `Reloader::fork_restart`):
    /// `Command` already knows how to duplicate the environment and argv for
    /// re-exec, and `pre_exec` is the only place fd numbers 3..3+n can be
    /// pinned down deterministically before `execve` runs.
    async fn fork_worker(
        &mut self,
        exit_tx: &UnboundedSender<WorkerExit>,
        old_worker_pid: Pid,
    ) -> Result<(), Error> {
        let exe = std::env::current_exe().map_err(Error::Fork)?;
        let args: Vec<_> = std::env::args_os().skip(1).collect();

        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(&args)
            .env(env::WORKER, "1")
            .env(env::NUMFD, self.fds.len().to_string())
            .env(env::PARENT_PID, nix::unistd::getpid().to_string())
            .env(env::OLD_WORKER_PID, old_worker_pid.to_string());

        let raw_fds: Vec<RawFd> = self.fds.iter().map(OwnedFd::as_raw_fd).collect();
        // SAFETY: the closure only calls `dup2`/`fcntl`, both async-signal-safe,
        // and touches no Rust-managed allocation after `fork` and before `exec`.
        unsafe {
            cmd.pre_exec(move || attach_listener_fds(&raw_fds));
        }

        let mut child = cmd.spawn().map_err(Error::Fork)?;
        let pid = Pid::from_raw(child.id().ok_or_else(|| {
            Error::Fork(io::Error::other("worker exited before its pid could be read"))
        })? as i32);

        *self.worker_pid.lock().await = Some(pid);
        self.living_worker_num.fetch_add(1, Ordering::AcqRel);
        log::info!("forked worker {pid} (old worker: {old_worker_pid})");

        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exit_tx.send(WorkerExit { pid, status });
                }
                Err(e) => log::error!("failed to wait on worker {pid}: {e}"),
            }
        });

        Ok(())
    }

    /// Fork a replacement worker without signaling the outgoing one — the
    /// new worker signals its predecessor itself once serving
    /// (`SPEC_FULL.md` §4.2.2, §4.3.1).
    async fn reload(&mut self, exit_tx: &UnboundedSender<WorkerExit>) -> Result<(), Error> {
        let old_pid: Option<Pid> = *self.worker_pid.lock().await;
        self.fork_worker(exit_tx, old_pid.unwrap_or(Pid::from_raw(0))).await
    }

    /// Signal the current worker with the first configured stop signal and
    /// wait up to `stop_timeout` for it to exit, escalating to `SIGKILL` on
    /// timeout (`SPEC_FULL.md` §4.2.3).
    async fn graceful_stop(&mut self, exit_rx: &mut UnboundedReceiver<WorkerExit>) {
        let current: Option<Pid> = *self.worker_pid.lock().await;
        let Some(pid) = current else {
            return;
        };
        let signal = self.config.first_stop_signal();
        if let Err(e) = kill(pid, signal) {
            log::warn!("failed to signal worker {pid} to stop: {e}");
        }

        match tokio::time::timeout(self.config.stop_timeout, exit_rx.recv()).await {
            Ok(Some(WorkerExit { pid, status })) => {
                log::info!("worker {pid} exited during master stop ({status})");
                self.living_worker_num.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(None) => {}
            Err(_) => {
                log::warn!("worker {pid} did not exit within stop_timeout, sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
    }
}

/// Pin fd `i` onto fd `3+i` and clear `O_CLOEXEC`, for every listener.
///
/// Runs between `fork` and `execve` inside the child; must not allocate or
/// call anything that isn't async-signal-safe.
fn attach_listener_fds(raw_fds: &[RawFd]) -> io::Result<()> {
    for (i, fd) in raw_fds.iter().enumerate() {
        let target = env::FIRST_FD + i as RawFd;
        if *fd != target && unsafe { libc::dup2(*fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
        clear_cloexec(target)?;
    }
    Ok(())
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Merges every configured reload/stop signal into one stream, so the
/// supervisor loop can `select!` over a single source (`SPEC_FULL.md` §5).
struct SignalWaiter {
    streams: Vec<(Signal, tokio::signal::unix::Signal)>,
}

impl SignalWaiter {
    fn install(config: &Config) -> Result<Self, Error> {
        let mut streams = Vec::new();
        let wanted = config
            .reload_signals
            .iter()
            .chain(config.installable_stop_signals());
        for signal in wanted {
            let kind = to_signal_kind(signal);
            let stream = tokio::signal::unix::signal(kind)
                .map_err(|e| Error::Other(anyhow::Error::new(e).context(format!("installing handler for {signal:?}"))))?;
            streams.push((signal, stream));
        }
        Ok(SignalWaiter { streams })
    }

    async fn recv(&mut self) -> Option<Signal> {
        if self.streams.is_empty() {
            return std::future::pending().await;
        }
        let futs = self.streams.iter_mut().map(|(signal, stream)| {
            let signal = *signal;
            Box::pin(async move { (signal, stream.recv().await) })
        });
        let ((signal, got), _index, _rest) = futures::future::select_all(futs).await;
        got?;
        Some(signal)
    }
}

fn to_signal_kind(signal: Signal) -> tokio::signal::unix::SignalKind {
    tokio::signal::unix::SignalKind::from_raw(signal as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mirrors_process_status() {
        let ok = std::process::Command::new("true").status().unwrap();
        assert_eq!(exit_code_for(ok), 0);

        let failed = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .status()
            .unwrap();
        assert_eq!(exit_code_for(failed), 7);
    }
}
