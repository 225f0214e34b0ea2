//! Exercises the crate from outside, the way an embedder would: through
//! `graceful::Server` and friends only, no access to crate-internal items.

use std::time::Duration;

use graceful::{full_body, is_master, with_stop_timeout, Response, Server};

#[test]
fn is_master_is_true_outside_a_forked_worker() {
    // The test binary itself was never forked by a `graceful::Server`, so it
    // is always "the master" by this crate's definition.
    assert!(is_master());
}

#[test]
fn run_without_registrations_reports_no_servers() {
    let server = Server::new([with_stop_timeout(Duration::from_secs(5))]);
    let err = server.run().unwrap_err();
    assert_eq!(err.to_string(), "no listen addresses registered");
}

#[test]
fn registering_a_handler_and_checking_role_does_not_require_running() {
    let mut server = Server::new([]);
    server.register(
        "127.0.0.1:0",
        Some(|_req: graceful::Request<hyper::body::Incoming>| async move {
            Response::new(full_body(&b"ok"[..]))
        }),
    );
    assert!(server.is_master());
    assert!(!server.is_worker());
}
