//! A minimal demonstration binary. Register one handler, run it, and let
//! SIGHUP/SIGUSR1 trigger a reload and SIGTERM/SIGINT a graceful stop.
//!
//! ```text
//! $ cargo run --bin graceful-echo
//! $ curl http://127.0.0.1:9222/
//! $ kill -HUP $(cat /tmp/graceful-echo.pid)   # reload, old worker drains
//! ```

use graceful::{full_body, with_pid_file, Request, Response, Server};

async fn echo(req: Request<hyper::body::Incoming>) -> Response<graceful::ResponseBody> {
    let greeting = format!(
        "hello from worker {} (uptime {:?})\nmethod: {}\npath: {}\n",
        std::process::id(),
        graceful::started_at().and_then(|t| t.elapsed().ok()),
        req.method(),
        req.uri().path(),
    );
    Response::new(full_body(greeting.into_bytes()))
}

fn main() -> Result<(), graceful::Error> {
    env_logger::init();

    let mut server = Server::new([with_pid_file("/tmp/graceful-echo.pid")]);
    server.register("127.0.0.1:9222", Some(echo));

    if server.is_master() {
        log::info!("master {} starting", std::process::id());
    }

    server.run()
}
