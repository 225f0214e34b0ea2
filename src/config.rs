//! Configuration record and the functional-option builders (`SPEC_FULL.md`
//! §3, §4.5).

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

/// Default upper bound on per-listener graceful shutdown.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(20);
/// Default period at which a worker checks master liveness.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// An ordered, deduplicated set of signals.
///
/// A plain `HashSet` would lose the "first configured signal" that `reload()`
/// and graceful master-stop rely on (SPEC_FULL.md §4.2.3, §4.4), since
/// membership is all these sets need to test but *order* is what picking
/// "the first one" means. A small `Vec` with a dedup-on-insert `from_iter`
/// gives both cheaply at this size.
#[derive(Clone, Debug, Default)]
pub(crate) struct SignalSet(Vec<Signal>);

impl SignalSet {
    pub(crate) fn contains(&self, signal: &Signal) -> bool {
        self.0.contains(signal)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
        self.0.iter().copied()
    }

    pub(crate) fn first(&self) -> Option<Signal> {
        self.0.first().copied()
    }
}

impl FromIterator<Signal> for SignalSet {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut set = Vec::new();
        for signal in iter {
            if !set.contains(&signal) {
                set.push(signal);
            }
        }
        SignalSet(set)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) reload_signals: SignalSet,
    pub(crate) stop_signals: SignalSet,
    pub(crate) stop_timeout: Duration,
    pub(crate) watch_interval: Duration,
    pub(crate) pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reload_signals: [Signal::SIGHUP, Signal::SIGUSR1].into_iter().collect(),
            // SIGKILL is kept here for documentation purposes only: it is
            // uncatchable, so `installable_stop_signals` filters it out
            // before registering a `tokio` signal handler (SPEC_FULL.md §9).
            stop_signals: [Signal::SIGTERM, Signal::SIGINT, Signal::SIGKILL]
                .into_iter()
                .collect(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            pid_file: None,
        }
    }
}

impl Config {
    /// Signals actually installable as a `tokio` signal handler.
    pub(crate) fn installable_stop_signals(&self) -> impl Iterator<Item = Signal> + '_ {
        self.stop_signals.iter().filter(|s| *s != Signal::SIGKILL)
    }

    pub(crate) fn first_reload_signal(&self) -> Signal {
        self.reload_signals.first().unwrap_or(Signal::SIGHUP)
    }

    pub(crate) fn first_stop_signal(&self) -> Signal {
        self.installable_stop_signals().next().unwrap_or(Signal::SIGTERM)
    }
}

/// A single configuration transform, produced by the `with_*` functions
/// below and consumed in order by [`crate::Server::new`].
///
/// The set of options is closed: there is no public trait to implement, only
/// this opaque closure type, so `Server::new` can apply them without any
/// possibility of an embedder-defined option breaking an invariant.
pub struct Opt(Box<dyn FnOnce(&mut Config) + Send>);

impl Opt {
    pub(crate) fn apply(self, config: &mut Config) {
        (self.0)(config)
    }
}

/// Override the set of signals that trigger a reload (default `SIGHUP`,
/// `SIGUSR1`).
pub fn with_reload_signals(signals: impl IntoIterator<Item = Signal>) -> Opt {
    let signals: SignalSet = signals.into_iter().collect();
    Opt(Box::new(move |config| config.reload_signals = signals))
}

/// Override the set of signals that trigger graceful shutdown (default
/// `SIGTERM`, `SIGINT`).
pub fn with_stop_signals(signals: impl IntoIterator<Item = Signal>) -> Opt {
    let signals: SignalSet = signals.into_iter().collect();
    Opt(Box::new(move |config| config.stop_signals = signals))
}

/// Override the upper bound on per-listener graceful shutdown.
pub fn with_stop_timeout(timeout: Duration) -> Opt {
    Opt(Box::new(move |config| config.stop_timeout = timeout))
}

/// Override the period at which a worker checks master liveness.
pub fn with_watch_interval(interval: Duration) -> Opt {
    Opt(Box::new(move |config| config.watch_interval = interval))
}

/// Have the master write its pid to `path` once the initial worker has been
/// forked successfully. Not named by the distilled spec; supplemented from
/// the teacher's `write_pid`/`pid_fn` handling (see `DESIGN.md`).
pub fn with_pid_file(path: impl Into<PathBuf>) -> Opt {
    let path = path.into();
    Opt(Box::new(move |config| config.pid_file = Some(path.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_option_overrides_earlier_one() {
        let mut config = Config::default();
        with_stop_timeout(Duration::from_secs(10)).apply(&mut config);
        with_stop_timeout(Duration::from_secs(30)).apply(&mut config);
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
    }

    #[test]
    fn default_stop_signals_exclude_sigkill_from_installable_set() {
        let config = Config::default();
        assert!(config.stop_signals.contains(&Signal::SIGKILL));
        assert!(!config.installable_stop_signals().any(|s| s == Signal::SIGKILL));
    }

    #[test]
    fn signal_set_dedups_and_preserves_order() {
        let set: SignalSet = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGTERM]
            .into_iter()
            .collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Signal::SIGTERM, Signal::SIGINT]);
    }

    #[test]
    fn default_signal_sets_match_spec() {
        let config = Config::default();
        assert_eq!(config.first_reload_signal(), Signal::SIGHUP);
        assert_eq!(config.first_stop_signal(), Signal::SIGTERM);
    }
}
