// Copyright 2019 Joyent, Inc.

//! This module provides the interface for creating clients.
//!
//! A client owns at most one TCP connection and issues one call at a time:
//! each call sends a single request [`Param`] and blocks for the single
//! reply, bounded by the supplied timeout. When a call fails to send or
//! receive, the connection handle is torn down so the next use starts from
//! a fresh [`RpcClient::connect`]. Clients are single-threaded; callers
//! wanting concurrency use one client per thread or separate processes.

use std::fmt;
use std::io::{Error, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{error, info, o, Drain, Logger};

use crate::protocol::{self, Param, ProtocolError, ReplyError, DEFAULT_MAX_FRAGMENT, PROC_CALL};

/// One year stands in for an unbounded wait. (Some legacy platforms only
/// honored the two-year variant; no supported target needs it.)
pub const TIMEOUT_INFINITE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// An error type representing a failure to establish a connection.
#[derive(Debug)]
pub enum ConnectError {
    /// The named argument was missing or out of range.
    InvalidArg(&'static str),
    /// The host name did not resolve.
    Resolve(Error),
    /// The TCP connection could not be established.
    Connect(Error),
    /// A connection is already live; destroy it first.
    AlreadyConnected,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidArg(what) => write!(f, "invalid {} argument", what),
            ConnectError::Resolve(e) => write!(f, "host name resolution failed: {}", e),
            ConnectError::Connect(e) => write!(f, "connect failed: {}", e),
            ConnectError::AlreadyConnected => write!(f, "the client is already connected"),
        }
    }
}

/// The non-success outcomes of a call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallStatus {
    /// The request could not be sent. The connection handle is destroyed.
    CantSend,
    /// The reply could not be received. The connection handle is destroyed.
    CantRecv,
    /// The call did not complete within the supplied timeout.
    TimedOut,
    /// The reply was malformed.
    DecodeError,
    /// Application-level misuse or a server-side refusal.
    Failed,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CallStatus::CantSend => "failed to send the call",
            CallStatus::CantRecv => "failed to receive the reply",
            CallStatus::TimedOut => "the call timed out",
            CallStatus::DecodeError => "the reply was malformed",
            CallStatus::Failed => "the call failed",
        };
        write!(f, "{}", msg)
    }
}

/// A blocking RPC client.
pub struct RpcClient {
    stream: Option<TcpStream>,
    xid: u32,
    log: Logger,
}

impl RpcClient {
    /// Create a disconnected client. If no logger is provided the slog
    /// `StdLog` drain is used by default.
    pub fn new(log: Option<&Logger>) -> RpcClient {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        RpcClient {
            stream: None,
            xid: 0,
            log,
        }
    }

    /// Resolve `host` and open a TCP connection to it. The program and
    /// version binding is fixed at construction; no application bytes are
    /// exchanged until the first call.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        if host.is_empty() {
            error!(self.log, "invalid (empty) host name specified");
            return Err(ConnectError::InvalidArg("host"));
        }
        if port == 0 {
            error!(self.log, "invalid (zero) port number specified");
            return Err(ConnectError::InvalidArg("port"));
        }
        if self.stream.is_some() {
            error!(self.log, "a connection already exists"; "host" => %host, "port" => port);
            return Err(ConnectError::AlreadyConnected);
        }

        info!(self.log, "connecting"; "host" => %host, "port" => port);

        let mut addrs = (host, port).to_socket_addrs().map_err(|e| {
            error!(self.log, "host name resolution failed"; "host" => %host, "err" => %e);
            ConnectError::Resolve(e)
        })?;
        let addr = addrs.next().ok_or_else(|| {
            error!(self.log, "host resolved to no addresses"; "host" => %host);
            ConnectError::Resolve(Error::new(
                ErrorKind::NotFound,
                "host resolved to no addresses",
            ))
        })?;

        let stream = TcpStream::connect(addr).map_err(|e| {
            error!(self.log, "connect failed"; "host" => %host, "port" => port, "err" => %e);
            ConnectError::Connect(e)
        })?;
        stream.set_nodelay(true).map_err(ConnectError::Connect)?;

        self.stream = Some(stream);
        info!(self.log, "connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Release the connection handle. Idempotent.
    pub fn destroy(&mut self) {
        self.stream = None;
    }

    /// Send one `Param` with the given tag and payload and await the reply
    /// payload, which may be empty. On `CantSend` or `CantRecv` the handle
    /// is destroyed so the next call path forces a fresh connect.
    pub fn call_bytes(
        &mut self,
        ptype: i32,
        req: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, CallStatus> {
        let xid = self.xid;
        self.xid = self.xid.wrapping_add(1);

        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                error!(self.log, "client is not yet connected");
                return Err(CallStatus::Failed);
            }
        };

        if stream.set_write_timeout(Some(timeout)).is_err()
            || stream.set_read_timeout(Some(timeout)).is_err()
        {
            error!(self.log, "invalid call timeout");
            return Err(CallStatus::Failed);
        }

        let mut buf = BytesMut::new();
        protocol::encode_call(&mut buf, xid, PROC_CALL, &Param::new(ptype, req.to_vec()));

        let outcome = exchange(stream, &buf, xid, &self.log);
        if let Err(status) = &outcome {
            if *status == CallStatus::CantSend || *status == CallStatus::CantRecv {
                self.destroy();
            }
        }
        outcome
    }

    /// Marshal `req`, call, and unmarshal the reply into `R`. An empty reply
    /// is an error here; callers expecting an empty reply use `call_bytes`
    /// and assert emptiness.
    pub fn call_structured<Q, R>(
        &mut self,
        ptype: i32,
        req: &Q,
        timeout: Duration,
    ) -> Result<R, CallStatus>
    where
        Q: Serialize,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(req).map_err(|e| {
            error!(self.log, "failed to serialize the request"; "err" => %e);
            CallStatus::Failed
        })?;

        let resp = self.call_bytes(ptype, &body, timeout)?;
        if resp.is_empty() {
            error!(self.log, "no response received");
            return Err(CallStatus::Failed);
        }

        serde_json::from_slice(&resp).map_err(|e| {
            error!(self.log, "failed to deserialize the response"; "err" => %e);
            CallStatus::DecodeError
        })
    }
}

// One request/reply exchange over an established stream. Timeout handling
// relies on the socket deadlines set by the caller.
fn exchange(
    stream: &mut TcpStream,
    request: &[u8],
    xid: u32,
    log: &Logger,
) -> Result<Vec<u8>, CallStatus> {
    if let Err(e) = protocol::write_record(stream, request) {
        return Err(match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                error!(log, "call timed out sending the request");
                CallStatus::TimedOut
            }
            _ => {
                error!(log, "failed to send the call"; "err" => %e);
                CallStatus::CantSend
            }
        });
    }

    let frame = match protocol::read_record(stream, DEFAULT_MAX_FRAGMENT) {
        Ok(frame) => frame,
        Err(ProtocolError::IoError(e)) => {
            return Err(match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                    error!(log, "call timed out waiting for the reply");
                    CallStatus::TimedOut
                }
                _ => {
                    error!(log, "failed to receive the reply"; "err" => %e);
                    CallStatus::CantRecv
                }
            });
        }
        Err(e) => {
            error!(log, "failed to read the reply frame"; "err" => %e);
            return Err(CallStatus::DecodeError);
        }
    };

    match protocol::decode_reply(&frame) {
        Ok((rxid, _)) if rxid != xid => {
            error!(log, "reply xid mismatch"; "sent" => xid, "received" => rxid);
            Err(CallStatus::DecodeError)
        }
        Ok((_, Ok(param))) => Ok(param.data),
        Ok((_, Err(ReplyError::Denied))) => {
            error!(log, "call denied by the server");
            Err(CallStatus::Failed)
        }
        Ok((_, Err(ReplyError::Rejected(stat)))) => {
            error!(log, "call rejected by the server"; "stat" => ?stat);
            Err(CallStatus::Failed)
        }
        Err(e) => {
            error!(log, "undecodable reply"; "err" => %e);
            Err(CallStatus::DecodeError)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connect_rejects_bad_arguments() {
        let mut client = RpcClient::new(None);
        assert!(matches!(
            client.connect("", 2030),
            Err(ConnectError::InvalidArg("host"))
        ));
        assert!(matches!(
            client.connect("localhost", 0),
            Err(ConnectError::InvalidArg("port"))
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn call_without_connect_fails() {
        let mut client = RpcClient::new(None);
        assert_eq!(
            client.call_bytes(1, b"hi", TIMEOUT_INFINITE),
            Err(CallStatus::Failed)
        );
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut client = RpcClient::new(None);
        client.destroy();
        client.destroy();
        assert!(!client.is_connected());
    }
}
