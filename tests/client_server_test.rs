// Copyright 2020 Joyent, Inc.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};
use slog::{o, Drain, Level, LevelFilter, Logger};

use param_rpc::client::{CallStatus, ConnectError, RpcClient};
use param_rpc::protocol::Param;
use param_rpc::server::{HandlerError, Server, ServerConfig};
use param_rpc::strategy::{InlineStrategy, PoolStrategy, ThreadStrategy};

const RPC_DATA: i32 = 1;
const RPC_PING: i32 = 2;
const RPC_ECHO: i32 = 3;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct EchoRequest {
    msg: String,
}

#[derive(Serialize, Deserialize)]
struct EchoResponse {
    msg: String,
}

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn test_config() -> ServerConfig {
    ServerConfig {
        poll_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn dispatch(input: &Param) -> Result<Param, HandlerError> {
    match input.ptype {
        RPC_DATA => Ok(Param::new(RPC_DATA, b"Hello from RPC server!".to_vec())),
        RPC_PING => Ok(Param::empty(RPC_PING)),
        RPC_ECHO => Ok(Param::new(RPC_ECHO, input.data.clone())),
        _ => Err(HandlerError),
    }
}

fn start_server(server: &Server, port: u16) -> thread::JoinHandle<()> {
    let runner = server.clone();
    thread::spawn(move || {
        runner.run(port).expect("server failed to run");
    })
}

fn connect_with_retries(port: u16) -> RpcClient {
    let mut client = RpcClient::new(None);
    for _ in 0..50 {
        if client.connect("127.0.0.1", port).is_ok() {
            return client;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("failed to connect to 127.0.0.1:{}", port);
}

#[test]
fn ping_and_data_roundtrip() {
    let log = test_logger();
    let server = Server::new(
        Box::new(InlineStrategy),
        Box::new(dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56710);

    let mut client = connect_with_retries(56710);

    assert!(matches!(
        client.connect("127.0.0.1", 56710),
        Err(ConnectError::AlreadyConnected)
    ));

    let resp = client
        .call_bytes(RPC_PING, &[], CALL_TIMEOUT)
        .expect("ping failed");
    assert!(resp.is_empty());

    let resp = client
        .call_bytes(RPC_DATA, b"Hello from RPC client!", CALL_TIMEOUT)
        .expect("data call failed");
    assert_eq!(resp, b"Hello from RPC server!");

    // An unknown message type is rejected by the dispatcher, and the
    // connection survives it.
    let status = client.call_bytes(99, &[], CALL_TIMEOUT).unwrap_err();
    assert_eq!(status, CallStatus::Failed);
    let resp = client
        .call_bytes(RPC_PING, &[], CALL_TIMEOUT)
        .expect("ping after a rejected call failed");
    assert!(resp.is_empty());

    client.destroy();
    server.stop();
    handle.join().unwrap();
}

#[test]
fn echo_calls_run_concurrently_through_the_pool() {
    let log = test_logger();
    let strategy = PoolStrategy::new(4).expect("failed to create the pool");
    let server = Server::new(
        Box::new(strategy),
        Box::new(dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56711);

    // Make sure the listener is up before spawning the client threads.
    let mut probe = connect_with_retries(56711);
    probe.destroy();

    let mut clients = Vec::new();
    for t in 0..10 {
        clients.push(thread::spawn(move || {
            let mut client = connect_with_retries(56711);
            for i in 0..50 {
                let req = EchoRequest {
                    msg: format!("Client thread={}, call #{}", t, i + 1),
                };
                let resp: EchoResponse = client
                    .call_structured(RPC_ECHO, &req, CALL_TIMEOUT)
                    .expect("echo call failed");
                assert_eq!(resp.msg, req.msg);
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    server.stop();
    handle.join().unwrap();
}

#[test]
fn echo_calls_run_concurrently_on_dedicated_threads() {
    let log = test_logger();
    let server = Server::new(
        Box::new(ThreadStrategy::new()),
        Box::new(dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56712);

    let mut probe = connect_with_retries(56712);
    probe.destroy();

    let mut clients = Vec::new();
    for t in 0..4 {
        clients.push(thread::spawn(move || {
            let mut client = connect_with_retries(56712);
            for i in 0..10 {
                let req = EchoRequest {
                    msg: format!("Client thread={}, call #{}", t, i + 1),
                };
                let resp: EchoResponse = client
                    .call_structured(RPC_ECHO, &req, CALL_TIMEOUT)
                    .expect("echo call failed");
                assert_eq!(resp.msg, req.msg);
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    server.stop();
    handle.join().unwrap();
}

#[test]
fn a_slow_call_times_out_without_destroying_the_handle() {
    fn slow_dispatch(input: &Param) -> Result<Param, HandlerError> {
        thread::sleep(Duration::from_secs(1));
        Ok(Param::new(input.ptype, input.data.clone()))
    }

    let log = test_logger();
    let server = Server::new(
        Box::new(InlineStrategy),
        Box::new(slow_dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56713);

    let mut client = connect_with_retries(56713);
    let status = client
        .call_bytes(RPC_DATA, b"x", Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(status, CallStatus::TimedOut);
    assert!(client.is_connected());

    client.destroy();
    server.stop();
    handle.join().unwrap();
}

#[test]
fn client_reconnects_after_the_server_goes_away() {
    let log = test_logger();
    let server = Server::new(
        Box::new(InlineStrategy),
        Box::new(dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56714);

    let mut client = connect_with_retries(56714);
    let resp = client
        .call_bytes(RPC_PING, &[], CALL_TIMEOUT)
        .expect("ping failed");
    assert!(resp.is_empty());

    server.stop();
    handle.join().unwrap();

    // The transport is gone: the next call fails and destroys the handle.
    let status = client.call_bytes(RPC_PING, &[], CALL_TIMEOUT).unwrap_err();
    assert!(
        status == CallStatus::CantSend || status == CallStatus::CantRecv,
        "unexpected status: {:?}",
        status
    );
    assert!(!client.is_connected());

    // A restarted server accepts a fresh connect from the same client.
    let server = Server::new(
        Box::new(InlineStrategy),
        Box::new(dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56714);

    let mut connected = false;
    for _ in 0..50 {
        if client.connect("127.0.0.1", 56714).is_ok() {
            connected = true;
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    assert!(connected, "failed to reconnect after restart");

    let resp = client
        .call_bytes(RPC_PING, &[], CALL_TIMEOUT)
        .expect("ping after reconnect failed");
    assert!(resp.is_empty());

    client.destroy();
    server.stop();
    handle.join().unwrap();
}

#[test]
fn stop_is_observed_within_the_poll_timeout() {
    let log = test_logger();
    let server = Server::new(
        Box::new(InlineStrategy),
        Box::new(dispatch),
        test_config(),
        Some(&log),
    );
    let handle = start_server(&server, 56715);

    let mut probe = connect_with_retries(56715);
    probe.destroy();

    let start = Instant::now();
    server.stop();
    handle.join().unwrap();
    // Both the connection loop and the accept loop observe the flag at
    // their next 200ms poll boundary.
    assert!(start.elapsed() < Duration::from_secs(2));
}
