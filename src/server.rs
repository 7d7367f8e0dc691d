// Copyright 2020 Joyent, Inc.

//! This module provides the interface for creating servers.
//!
//! A [`Server`] owns a listening socket and a pair of capabilities supplied
//! at construction: the user dispatcher that turns a request [`Param`] into
//! a reply, and a [`Strategy`] that decides where each accepted connection
//! is handled. Both the accept loop and every per-connection loop wait for
//! readiness with a bounded poll so that [`Server::stop`] is observed within
//! one poll timeout.

use std::fmt;
use std::io::{self, Error, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use slog::{debug, error, info, o, Drain, Logger};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::protocol::{self, AcceptStat, Param, ProtocolError, DEFAULT_MAX_FRAGMENT};
use crate::strategy::{Disposition, Strategy};

/// How long the accept loop and each connection loop wait for readiness
/// before re-checking the running flag.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// The default length of the pending-connection queue. When the queue is
/// full a connecting client may see "connection refused".
pub const DEFAULT_BACKLOG: i32 = 100;

/// Notifications sent to the strategy at the top of each wait loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Notify {
    /// The accept loop is about to wait for a connection.
    WaitingForConnection,
    /// A connection loop is about to wait for a call.
    WaitingForCall,
}

/// Returned by a dispatcher to have the server reply with a system error.
/// The connection stays up.
#[derive(Debug)]
pub struct HandlerError;

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler rejected the call")
    }
}

/// The user dispatcher: receives the request `Param` and returns the reply.
/// The reply payload is owned and released after transmission.
pub type CallHandler = Box<dyn Fn(&Param) -> Result<Param, HandlerError> + Send + Sync>;

/// Server tunables.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub poll_timeout: Duration,
    pub backlog: i32,
    /// Largest record fragment accepted from a client.
    pub max_fragment: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
            max_fragment: DEFAULT_MAX_FRAGMENT,
        }
    }
}

/// The state shared by the accept loop, the strategy, and every connection
/// handler, wherever the strategy runs them.
pub struct ServerCore {
    running: AtomicBool,
    pub(crate) config: ServerConfig,
    pub(crate) handler: CallHandler,
    pub(crate) strategy: Box<dyn Strategy>,
    pub(crate) log: Logger,
}

impl ServerCore {
    /// Ask every loop to exit. Each observes the flag at its next poll
    /// timeout boundary.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(self.log, "stopping server");
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }
}

/// A server handle. Cloning shares the same underlying server, so one clone
/// can run the accept loop while another stops it.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// Create a server from a strategy and a dispatcher. If no logger is
    /// provided the slog `StdLog` drain is used by default.
    pub fn new(
        strategy: Box<dyn Strategy>,
        handler: CallHandler,
        config: ServerConfig,
        log: Option<&Logger>,
    ) -> Server {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Server {
            core: Arc::new(ServerCore {
                running: AtomicBool::new(true),
                config,
                handler,
                strategy,
                log,
            }),
        }
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    /// Bind, listen, and serve until [`Server::stop`] is called or the
    /// listener fails. Returns once the accept loop has exited and the
    /// strategy has shut down.
    pub fn run(&self, port: u16) -> io::Result<()> {
        if port == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "invalid (zero) port number",
            ));
        }

        let core = &self.core;
        let listener = create_listener(port, core.config.backlog)?;
        info!(core.log, "waiting for client connections"; "port" => port);

        loop {
            core.strategy.on_notify(core, Notify::WaitingForConnection);
            if !core.running() {
                break;
            }

            match wait_readable(listener.as_raw_fd(), core.config.poll_timeout, &core.log) {
                Ok(false) => continue,
                Ok(true) => (),
                Err(e) => {
                    error!(core.log, "poll failed on the listener"; "err" => %e);
                    break;
                }
            }

            let stream = match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(core.log, "accepted connection"; "peer" => %peer);
                    stream
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    error!(core.log, "accept interrupted"; "err" => %e);
                    continue;
                }
                Err(e) => {
                    error!(core.log, "accept failed"; "err" => %e);
                    thread::sleep(Duration::from_secs(5));
                    continue;
                }
            };

            if let Err(e) = apply_socket_options(&stream) {
                error!(core.log, "failed to set socket options"; "err" => %e);
                continue;
            }

            match core.strategy.on_connection(&self.core, stream) {
                // Declined or adopted elsewhere; a declined stream closes
                // when it drops.
                Disposition::Declined | Disposition::Adopted => (),
                Disposition::Inline(stream) => {
                    if core.running() {
                        handle_connection(core, stream);
                    }
                }
            }
        }

        core.strategy.shutdown();
        info!(core.log, "stopped");
        Ok(())
    }
}

/// Drive one connection to completion: wait for a call with a bounded poll,
/// service exactly one request per readiness, and exit when the peer closes,
/// the poll fails, or the server is stopping. The socket closes on every
/// exit path.
pub fn handle_connection(core: &ServerCore, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    let log = core.log.new(o!("peer" => peer));

    loop {
        core.strategy.on_notify(core, Notify::WaitingForCall);
        if !core.running() {
            break;
        }

        match wait_readable(stream.as_raw_fd(), core.config.poll_timeout, &log) {
            Ok(false) => continue,
            Ok(true) => {
                if !serve_one(core, &mut stream, &log) {
                    break;
                }
            }
            Err(e) => {
                info!(log, "disconnected"; "err" => %e);
                break;
            }
        }
    }

    debug!(log, "connection closed");
}

// Service a single request. Returns false when the connection is over.
fn serve_one(core: &ServerCore, stream: &mut TcpStream, log: &Logger) -> bool {
    let frame = match protocol::read_record(stream, core.config.max_fragment) {
        Ok(frame) => frame,
        Err(ProtocolError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
            info!(log, "disconnected");
            return false;
        }
        Err(e) => {
            error!(log, "failed to read request"; "err" => %e);
            return false;
        }
    };

    let (header, args_off) = match protocol::decode_call(&frame) {
        Ok(res) => res,
        Err(e) => {
            error!(log, "undecodable call header"; "err" => %e);
            return false;
        }
    };

    let mut reply = BytesMut::new();
    if header.prog != protocol::PROGRAM {
        error!(log, "unknown program"; "prog" => header.prog);
        protocol::encode_reply_error(&mut reply, header.xid, AcceptStat::ProgUnavail);
    } else if header.vers != protocol::VERSION {
        error!(log, "unsupported program version"; "vers" => header.vers);
        protocol::encode_reply_error(&mut reply, header.xid, AcceptStat::ProgMismatch);
    } else {
        match header.proc_num {
            protocol::PROC_NULL => {
                debug!(log, "null probe");
                protocol::encode_reply_success(&mut reply, header.xid, None);
            }
            protocol::PROC_CALL => {
                let mut off = args_off;
                match protocol::decode_param(&frame, &mut off) {
                    Ok(input) => {
                        debug!(log, "dispatching call"; "type" => input.ptype);
                        match (core.handler)(&input) {
                            Ok(output) => protocol::encode_reply_success(
                                &mut reply,
                                header.xid,
                                Some(&output),
                            ),
                            Err(_) => {
                                error!(log, "handler rejected call"; "type" => input.ptype);
                                protocol::encode_reply_error(
                                    &mut reply,
                                    header.xid,
                                    AcceptStat::SystemErr,
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!(log, "undecodable call arguments"; "err" => %e);
                        protocol::encode_reply_error(
                            &mut reply,
                            header.xid,
                            AcceptStat::GarbageArgs,
                        );
                    }
                }
            }
            other => {
                error!(log, "no such procedure"; "proc" => other);
                protocol::encode_reply_error(&mut reply, header.xid, AcceptStat::ProcUnavail);
            }
        }
    }

    match protocol::write_record(stream, &reply) {
        Ok(()) => true,
        Err(e) => {
            error!(log, "failed to send reply"; "err" => %e);
            false
        }
    }
}

// Bounded readiness wait. Interrupted waits are retried; the timeout
// restarts on retry.
fn wait_readable(fd: RawFd, timeout: Duration, log: &Logger) -> Result<bool, Errno> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, timeout.as_millis() as i32) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => {
                info!(log, "poll interrupted, continue running");
            }
            Err(e) => return Err(e),
        }
    }
}

fn create_listener(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn apply_socket_options(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_reuse_address(true)?;
    stream.set_nodelay(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    sock.set_nosigpipe(true)?;
    Ok(())
}
