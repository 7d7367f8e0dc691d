// Copyright 2020 Joyent, Inc.

use std::env;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use nix::unistd::getpid;
use serde_derive::{Deserialize, Serialize};
use slog::{error, o, Drain, Logger};

use param_rpc::protocol::Param;
use param_rpc::server::{HandlerError, Server, ServerConfig};
use param_rpc::strategy::PoolStrategy;

const DEFAULT_PORT: u16 = 53900;
const DEFAULT_THREADS: usize = 4;

const RPC_DATA: i32 = 1;
const RPC_PING: i32 = 2;
const RPC_ECHO: i32 = 3;

#[derive(Serialize, Deserialize)]
struct EchoRequest {
    msg: String,
}

#[derive(Serialize, Deserialize)]
struct EchoResponse {
    msg: String,
}

fn dispatch(input: &Param) -> Result<Param, HandlerError> {
    match input.ptype {
        // Raw data call: fixed response regardless of the request bytes.
        RPC_DATA => Ok(Param::new(RPC_DATA, b"Hello from RPC server!".to_vec())),

        // Empty call, no data received or sent.
        RPC_PING => Ok(Param::empty(RPC_PING)),

        // Structured call: echo the request message back.
        RPC_ECHO => {
            let req: EchoRequest =
                serde_json::from_slice(&input.data).map_err(|_| HandlerError)?;
            let resp = EchoResponse { msg: req.msg };
            let body = serde_json::to_vec(&resp).map_err(|_| HandlerError)?;
            Ok(Param::new(RPC_ECHO, body))
        }

        _ => Err(HandlerError),
    }
}

fn main() {
    let mut args = env::args().skip(1);
    let port: u16 = args
        .next()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let threads: usize = args
        .next()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_THREADS);

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("pid" => getpid().as_raw()),
    );

    let strategy = match PoolStrategy::new(threads) {
        Ok(strategy) => strategy,
        Err(e) => {
            eprintln!("ERROR: failed to create the worker pool: {}", e);
            process::exit(1);
        }
    };

    println!(
        "RPC server started on port {} with {} worker threads ...",
        port, threads
    );

    let config = ServerConfig {
        poll_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let server = Server::new(
        Box::new(strategy),
        Box::new(dispatch),
        config,
        Some(&root_log),
    );

    if let Err(e) = server.run(port) {
        error!(root_log, "server failed"; "err" => %e);
        process::exit(1);
    }

    println!("RPC server stopped");
}
