// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode the
//! wire protocol. The contents of this module are not needed for normal client
//! or server consumers of this crate, but they are exposed for the special
//! case of someone needing to implement custom client or server code.
//!
//! The protocol is the classic XDR-framed RPC over TCP. Each message is a
//! record composed of one or more fragments. A fragment starts with a 4-byte
//! big-endian record mark: the high bit is set on the last fragment of the
//! record, and the low 31 bits give the fragment length in bytes. The record
//! body is an RPC call or reply message, and the user payload inside it is a
//! single [`Param`]: an `int32` tag followed by a variable-length opaque byte
//! array (4-byte length, the bytes, zero padding to a 4-byte boundary).

use std::fmt;
use std::io::{self, Error, ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// The RPC program number served and called by this crate.
pub const PROGRAM: u32 = 0x2fff_ffff;
/// The RPC program version.
pub const VERSION: u32 = 1;
/// The null-probe procedure: replies with a void body.
pub const PROC_NULL: u32 = 0;
/// The only procedure that carries user data.
pub const PROC_CALL: u32 = 1;

const RPC_VERSION: u32 = 2;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const FRAGMENT_LEN_MASK: u32 = 0x7fff_ffff;

/// The largest fragment length the decoder accepts by default. This is the
/// whole 31-bit length space, i.e. effectively unbounded.
pub const DEFAULT_MAX_FRAGMENT: usize = FRAGMENT_LEN_MASK as usize;

// Authentication bodies are bounded by the protocol even though this crate
// only ever emits the null flavor.
const MAX_AUTH_LEN: u32 = 400;

/// The sole wire unit: an application tag plus an opaque payload. A tag of
/// `0` is reserved and unused by applications.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Param {
    /// Application-defined message tag.
    pub ptype: i32,
    /// Opaque payload; may be empty.
    pub data: Vec<u8>,
}

impl Param {
    pub fn new(ptype: i32, data: Vec<u8>) -> Param {
        Param { ptype, data }
    }

    /// A `Param` with the given tag and no payload.
    pub fn empty(ptype: i32) -> Param {
        Param {
            ptype,
            data: Vec::new(),
        }
    }
}

/// An error type representing a failure to encode or decode a protocol
/// message.
#[derive(Debug)]
pub enum ProtocolError {
    /// The buffer ended before the field being decoded did. Carries the
    /// number of bytes that were available.
    Truncated(usize),
    /// A fragment declared a length larger than the configured maximum.
    OversizeFragment(usize),
    /// A discriminant field held a value outside its legal range.
    BadDiscriminant(&'static str, u32),
    IoError(Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated(have) => {
                write!(f, "truncated message: only {} bytes available", have)
            }
            ProtocolError::OversizeFragment(len) => {
                write!(f, "fragment length {} exceeds the maximum", len)
            }
            ProtocolError::BadDiscriminant(what, val) => {
                write!(f, "invalid {}: {}", what, val)
            }
            ProtocolError::IoError(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(error: io::Error) -> Self {
        ProtocolError::IoError(error)
    }
}

impl From<ProtocolError> for Error {
    fn from(pe: ProtocolError) -> Self {
        match pe {
            ProtocolError::IoError(e) => e,
            other => Error::new(ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Represents the message type field of an RPC message.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum MsgType {
    Call = 0,
    Reply = 1,
}

/// Represents the reply status of an RPC reply message.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum ReplyStat {
    Accepted = 0,
    Denied = 1,
}

/// Represents the acceptance status of an accepted RPC reply.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

/// The decoded header of an RPC call message.
#[derive(Debug, PartialEq)]
pub struct CallHeader {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc_num: u32,
}

/// The outcome of a call as reported by the server, short of a full result.
#[derive(Debug, PartialEq)]
pub enum ReplyError {
    /// The server denied the call outright.
    Denied,
    /// The server accepted the call but did not execute it.
    Rejected(AcceptStat),
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn get_u32(buf: &[u8], off: &mut usize) -> Result<u32, ProtocolError> {
    if buf.len() < *off + 4 {
        return Err(ProtocolError::Truncated(buf.len()));
    }
    let val = BigEndian::read_u32(&buf[*off..]);
    *off += 4;
    Ok(val)
}

fn get_i32(buf: &[u8], off: &mut usize) -> Result<i32, ProtocolError> {
    get_u32(buf, off).map(|v| v as i32)
}

fn get_opaque(buf: &[u8], off: &mut usize) -> Result<Vec<u8>, ProtocolError> {
    let len = get_u32(buf, off)? as usize;
    let padded = pad4(len);
    if buf.len() < *off + padded {
        return Err(ProtocolError::Truncated(buf.len()));
    }
    let data = buf[*off..*off + len].to_vec();
    *off += padded;
    Ok(data)
}

fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    for _ in data.len()..pad4(data.len()) {
        buf.put_u8(0);
    }
}

// An auth field is a flavor followed by an opaque body. Only AUTH_NONE is
// ever produced; anything within the protocol's length bound is tolerated
// on decode.
fn skip_auth(buf: &[u8], off: &mut usize) -> Result<(), ProtocolError> {
    let _flavor = get_u32(buf, off)?;
    let len = get_u32(buf, off)?;
    if len > MAX_AUTH_LEN {
        return Err(ProtocolError::BadDiscriminant("auth body length", len));
    }
    let padded = pad4(len as usize);
    if buf.len() < *off + padded {
        return Err(ProtocolError::Truncated(buf.len()));
    }
    *off += padded;
    Ok(())
}

fn put_auth_none(buf: &mut BytesMut) {
    buf.put_u32(0); // AUTH_NONE
    buf.put_u32(0); // empty body
}

/// Encode a `Param` into a byte buffer.
pub fn encode_param(buf: &mut BytesMut, param: &Param) {
    buf.put_i32(param.ptype);
    put_opaque(buf, &param.data);
}

/// Decode a `Param` from `buf` starting at `*off`, advancing the offset past
/// it. The payload is copied into a freshly allocated vector owned by the
/// caller.
pub fn decode_param(buf: &[u8], off: &mut usize) -> Result<Param, ProtocolError> {
    let ptype = get_i32(buf, off)?;
    let data = get_opaque(buf, off)?;
    Ok(Param { ptype, data })
}

/// Encode a call message for the given procedure carrying `arg`.
pub fn encode_call(buf: &mut BytesMut, xid: u32, proc_num: u32, arg: &Param) {
    buf.put_u32(xid);
    buf.put_u32(MsgType::Call as u32);
    buf.put_u32(RPC_VERSION);
    buf.put_u32(PROGRAM);
    buf.put_u32(VERSION);
    buf.put_u32(proc_num);
    put_auth_none(buf); // cred
    put_auth_none(buf); // verf
    encode_param(buf, arg);
}

/// Decode the header of a call message. Returns the header and the offset at
/// which the procedure arguments begin.
pub fn decode_call(buf: &[u8]) -> Result<(CallHeader, usize), ProtocolError> {
    let mut off = 0;
    let xid = get_u32(buf, &mut off)?;
    let mtype = get_u32(buf, &mut off)?;
    match MsgType::from_u32(mtype) {
        Some(MsgType::Call) => (),
        _ => return Err(ProtocolError::BadDiscriminant("message type", mtype)),
    }
    let rpcvers = get_u32(buf, &mut off)?;
    if rpcvers != RPC_VERSION {
        return Err(ProtocolError::BadDiscriminant("rpc version", rpcvers));
    }
    let prog = get_u32(buf, &mut off)?;
    let vers = get_u32(buf, &mut off)?;
    let proc_num = get_u32(buf, &mut off)?;
    skip_auth(buf, &mut off)?; // cred
    skip_auth(buf, &mut off)?; // verf
    Ok((
        CallHeader {
            xid,
            prog,
            vers,
            proc_num,
        },
        off,
    ))
}

/// Encode an accepted-success reply. A result of `None` encodes a void body
/// (the null-probe reply).
pub fn encode_reply_success(buf: &mut BytesMut, xid: u32, result: Option<&Param>) {
    buf.put_u32(xid);
    buf.put_u32(MsgType::Reply as u32);
    buf.put_u32(ReplyStat::Accepted as u32);
    put_auth_none(buf); // verf
    buf.put_u32(AcceptStat::Success as u32);
    if let Some(param) = result {
        encode_param(buf, param);
    }
}

/// Encode an accepted-but-not-executed reply with the given status.
pub fn encode_reply_error(buf: &mut BytesMut, xid: u32, stat: AcceptStat) {
    buf.put_u32(xid);
    buf.put_u32(MsgType::Reply as u32);
    buf.put_u32(ReplyStat::Accepted as u32);
    put_auth_none(buf); // verf
    buf.put_u32(stat as u32);
    if stat == AcceptStat::ProgMismatch {
        // Supported version range.
        buf.put_u32(VERSION);
        buf.put_u32(VERSION);
    }
}

/// Decode a reply message. Returns the xid and either the result `Param` or
/// the server's refusal.
pub fn decode_reply(buf: &[u8]) -> Result<(u32, Result<Param, ReplyError>), ProtocolError> {
    let mut off = 0;
    let xid = get_u32(buf, &mut off)?;
    let mtype = get_u32(buf, &mut off)?;
    match MsgType::from_u32(mtype) {
        Some(MsgType::Reply) => (),
        _ => return Err(ProtocolError::BadDiscriminant("message type", mtype)),
    }
    let rstat = get_u32(buf, &mut off)?;
    match ReplyStat::from_u32(rstat) {
        Some(ReplyStat::Accepted) => {
            skip_auth(buf, &mut off)?; // verf
            let astat = get_u32(buf, &mut off)?;
            match AcceptStat::from_u32(astat) {
                Some(AcceptStat::Success) => {
                    let param = decode_param(buf, &mut off)?;
                    Ok((xid, Ok(param)))
                }
                Some(stat) => Ok((xid, Err(ReplyError::Rejected(stat)))),
                None => Err(ProtocolError::BadDiscriminant("accept status", astat)),
            }
        }
        Some(ReplyStat::Denied) => Ok((xid, Err(ReplyError::Denied))),
        None => Err(ProtocolError::BadDiscriminant("reply status", rstat)),
    }
}

/// Read one record-marked message from `r`, reassembling fragments. Any
/// fragment whose declared length exceeds `max_len` is rejected before its
/// body is read.
pub fn read_record<R: Read>(r: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut body: Vec<u8> = Vec::new();
    loop {
        let mut hdr = [0u8; 4];
        r.read_exact(&mut hdr)?;
        let mark = BigEndian::read_u32(&hdr);
        let len = (mark & FRAGMENT_LEN_MASK) as usize;
        if len > max_len {
            return Err(ProtocolError::OversizeFragment(len));
        }
        let start = body.len();
        body.resize(start + len, 0);
        r.read_exact(&mut body[start..])?;
        if mark & LAST_FRAGMENT != 0 {
            return Ok(body);
        }
    }
}

/// Write `body` to `w` as a single last-fragment record.
pub fn write_record<W: Write>(w: &mut W, body: &[u8]) -> io::Result<()> {
    if body.len() > FRAGMENT_LEN_MASK as usize {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "record body exceeds the 31-bit fragment length",
        ));
    }
    let mut hdr = [0u8; 4];
    BigEndian::write_u32(&mut hdr, body.len() as u32 | LAST_FRAGMENT);
    w.write_all(&hdr)?;
    w.write_all(body)?;
    w.flush()
}
