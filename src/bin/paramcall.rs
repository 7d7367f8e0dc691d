// Copyright 2020 Joyent, Inc.

use std::process;
use std::time::Instant;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use nix::errno::Errno;
use nix::sys::wait::wait;
use nix::unistd::{fork, getpid, ForkResult};
use serde_derive::{Deserialize, Serialize};

use param_rpc::client::{RpcClient, TIMEOUT_INFINITE};

static APP: &'static str = "paramcall";
static DEFAULT_HOST: &'static str = "localhost";
const DEFAULT_PORT: u16 = 53900;

const RPC_DATA: i32 = 1;
const RPC_PING: i32 = 2;
const RPC_ECHO: i32 = 3;

// The echo run simulates multiple clients running simultaneously. The
// client is single-threaded, so multiprocessing it is.
const ECHO_CLIENTS: usize = 10;
const ECHO_RPCS: usize = 50;

#[derive(Serialize, Deserialize)]
struct EchoRequest {
    msg: String,
}

#[derive(Serialize, Deserialize)]
struct EchoResponse {
    msg: String,
}

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making calls against a param-rpc server")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 53900)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("command")
                .help("echo | data | ping (Default: ping)")
                .index(1),
        )
        .get_matches()
}

fn run_echo(client: &mut RpcClient, count: usize) -> bool {
    let start = Instant::now();

    for i in 0..count {
        let req = EchoRequest {
            msg: format!("Client pid={}, call #{}", getpid(), i + 1),
        };
        match client.call_structured::<_, EchoResponse>(RPC_ECHO, &req, TIMEOUT_INFINITE) {
            Ok(resp) => {
                if resp.msg != req.msg {
                    println!("echo: response is different from request:");
                    println!("echo: req  is '{}'", req.msg);
                    println!("echo: resp is '{}'", resp.msg);
                    return false;
                }
            }
            Err(status) => {
                println!("echo: call #{} failed: {}", i + 1, status);
                return false;
            }
        }
    }

    println!("Elapsed time [{} calls]: {:?}", count, start.elapsed());
    true
}

fn echo_command(host: &str, port: u16) {
    println!(
        "Simulating {} RPC clients, sending {} rpcs each...",
        ECHO_CLIENTS, ECHO_RPCS
    );

    for _ in 0..ECHO_CLIENTS {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let mut client = RpcClient::new(None);
                if client.connect(host, port).is_err() {
                    process::exit(1);
                }
                run_echo(&mut client, ECHO_RPCS);
                process::exit(0);
            }
            Ok(ForkResult::Parent { .. }) => (),
            Err(e) => {
                eprintln!("ERROR: fork failed: {}", e);
                process::exit(1);
            }
        }
    }

    // Wait until every child is reaped.
    loop {
        match wait() {
            Err(Errno::ECHILD) => break,
            _ => (),
        }
    }

    println!("Done");
}

fn data_command(host: &str, port: u16) {
    let mut client = RpcClient::new(None);
    if client.connect(host, port).is_err() {
        process::exit(1);
    }

    let req = b"Hello from RPC client!";
    println!("data: req ='{}'", String::from_utf8_lossy(req));

    match client.call_bytes(RPC_DATA, req, TIMEOUT_INFINITE) {
        Ok(resp) => println!("data: resp='{}'", String::from_utf8_lossy(&resp)),
        Err(status) => {
            println!("data: call failed: {}", status);
            process::exit(1);
        }
    }
}

fn ping_command(host: &str, port: u16) {
    let mut client = RpcClient::new(None);
    if client.connect(host, port).is_err() {
        process::exit(1);
    }

    match client.call_bytes(RPC_PING, &[], TIMEOUT_INFINITE) {
        Ok(ref resp) if resp.is_empty() => println!("ping: succeeded"),
        Ok(resp) => {
            println!("ping: expected an empty response, got {} bytes", resp.len());
            process::exit(1);
        }
        Err(status) => {
            println!("ping: call failed: {}", status);
            process::exit(1);
        }
    }
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);

    match matches.value_of("command").unwrap_or("ping") {
        "echo" => echo_command(&host, port),
        "data" => data_command(&host, port),
        _ => ping_command(&host, port),
    }
}
