//! Zero-downtime reload for long-lived network listeners.
//!
//! A process built with this crate runs in one of two roles, distinguished
//! by a marker in its own environment: a *master*, which owns the listening
//! sockets and never accepts a connection itself, and a *worker*, forked by
//! the master, which inherits those sockets and serves traffic. Sending the
//! master a reload signal forks a new worker, hands it the same sockets, and
//! lets the two workers overlap until the old one has drained — so the
//! listening addresses never close and no `accept()` is ever missed.
//!
//! ```no_run
//! use graceful::Server;
//!
//! fn main() -> Result<(), graceful::Error> {
//!     let mut server = Server::new([]);
//!     server.register("127.0.0.1:9222", Some(|_req: graceful::Request<hyper::body::Incoming>| async move {
//!         graceful::Response::new(graceful::full_body(&b"ok"[..]))
//!     }));
//!     server.run()
//! }
//! ```

mod address;
mod config;
mod env;
mod error;
mod fd;
mod handler;
mod master;
mod server;
mod worker;

pub use address::Address;
pub use config::{
    with_pid_file, with_reload_signals, with_stop_signals, with_stop_timeout, with_watch_interval,
    Opt,
};
pub use env::{is_master, is_worker};
pub use error::Error;
pub use handler::{full_body, Handler, ResponseBody};
pub use server::{listen_and_serve, started_at, Server};

// Re-exported so embedders can write handlers against exactly the `hyper`
// request/response types this crate uses, without pinning their own `hyper`
// dependency version by hand.
pub use hyper::{Request, Response};
