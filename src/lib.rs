// Copyright 2019 Joyent, Inc.

//! param-rpc: a small RPC system over TCP
//!
//! Protocol overview
//!
//! A param-rpc server listens for TCP connections on a well-known port, and
//! clients connect to it to make RPC requests. Each connection represents a
//! logically separate client, and within one connection requests are
//! strictly serialized: the client sends one request and blocks for the one
//! reply before issuing the next.
//!
//! Messages are XDR record-marked. Each record is one or more fragments,
//! and each fragment is framed by a 4-byte big-endian record mark:
//!
//! | Field | Size | Meaning |
//! | ----- | ---- | ------- |
//! | `MARK` | 4 bytes | high bit: last fragment; low 31 bits: fragment length |
//! | `BODY` | `len` bytes | an RPC call or reply message |
//!
//! The call body names program `0x2FFFFFFF`, version `1`, and a procedure
//! number. Procedure `0` is the standard null probe and replies with a void
//! body. Procedure `1` is the only procedure that carries user data: its
//! argument and its reply are both a single `Param`:
//!
//! | Field | Size | Meaning |
//! | ----- | ---- | ------- |
//! | `TYPE` | 4 bytes | `int32` application tag (`0` is reserved) |
//! | `LEN`  | 4 bytes | payload length in bytes |
//! | `DATA` | `LEN` bytes, zero-padded to a 4-byte boundary | opaque payload |
//!
//! The payload is opaque to the transport. Applications that want typed
//! messages marshal them to bytes (the helpers in [`client`] use JSON via
//! serde) and put the schema identity in the tag.
//!
//! ### Serving connections
//!
//! The server is two nested polling loops. The accept loop waits for a
//! connection with a bounded timeout, re-checking a running flag on every
//! wakeup so that a stop request is observed promptly. Each accepted socket
//! is handed to a concurrency strategy which decides where the connection
//! loop runs:
//!
//! * [`strategy::InlineStrategy`] — on the accept loop itself, one
//!   connection at a time,
//! * [`strategy::ForkStrategy`] — in a forked child process,
//! * [`strategy::ThreadStrategy`] — on a dedicated thread,
//! * [`strategy::PoolStrategy`] — on one of a bounded pool of workers.
//!
//! The connection loop polls with the same bounded timeout, services
//! exactly one request per readiness, and exits when the peer disconnects
//! or the server stops. Whatever the strategy, every accepted socket has
//! exactly one owner and closes exactly once.
//!
//! ### Client failure semantics
//!
//! A call that fails to send or receive destroys the client's connection
//! handle; the next call fails fast until the caller reconnects. Calls are
//! therefore at-most-once across a reconnect, and the caller sees an
//! explicit status for the call the transport lost.

#![allow(missing_docs)]

pub mod client;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod strategy;
