//! The wire protocol: length-framed, AEAD-sealed request/response frames
//! with per-direction sequence numbers bound as AAD (`spec.md` §4.8, §6).
//!
//! Frame shape: `[4B big-endian length][nonce(12) || tag(16) || ciphertext]`.
//! The ciphertext decrypts to `[u32 mtype][u32 otype][op-specific args]`.
//! `mtype` is the `FROM_SERVER`/`TO_SERVER` directional tag; `otype` is the
//! opcode. AAD is the sender's sequence number (`peer_seq.to_le_bytes()`,
//! `SPEC_FULL.md` §4.8) — the receiver's [`UserContext`] tracks the
//! sequence it expects and a mismatch drops the connection rather than
//! advancing.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::crypto::{SecAssociation, NONCE_LEN, TAG_LEN};
use crate::flexbuffer::FlexBuffer;
use crate::fs::ops::Attr;
use crate::MAX_PATH_LEN;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame authentication failed (bad sequence number or tampered payload)")]
    AuthenticationFailed,
    #[error("frame shorter than the nonce+tag header")]
    Truncated,
    #[error("unrecognized message type {0}")]
    BadMsgType(u32),
    #[error("unrecognized opcode {0}")]
    BadOpcode(u32),
    #[error("malformed request body for this opcode")]
    BadBody,
    #[error("string field is not valid UTF-8")]
    BadUtf8,
    #[error("string field exceeds the declared length limit")]
    StringTooLong,
}

/// The `FROM_SERVER`/`TO_SERVER` directional tag every payload carries
/// (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    ToServer,
    FromServer,
}

impl MsgType {
    fn to_u32(self) -> u32 {
        match self {
            MsgType::ToServer => 0,
            MsgType::FromServer => 1,
        }
    }

    fn from_u32(v: u32) -> Result<Self, RpcError> {
        match v {
            0 => Ok(MsgType::ToServer),
            1 => Ok(MsgType::FromServer),
            other => Err(RpcError::BadMsgType(other)),
        }
    }
}

/// The opcode set named in `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Getattr,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Open,
    Read,
    Write,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Init,
    InitMkfs,
    Destroy,
    Create,
    Chmod,
    Truncate,
}

impl Opcode {
    fn to_u32(self) -> u32 {
        match self {
            Opcode::Getattr => 0,
            Opcode::Mkdir => 1,
            Opcode::Unlink => 2,
            Opcode::Rmdir => 3,
            Opcode::Rename => 4,
            Opcode::Open => 5,
            Opcode::Read => 6,
            Opcode::Write => 7,
            Opcode::Release => 8,
            Opcode::Fsync => 9,
            Opcode::Opendir => 10,
            Opcode::Readdir => 11,
            Opcode::Init => 12,
            Opcode::InitMkfs => 13,
            Opcode::Destroy => 14,
            Opcode::Create => 15,
            Opcode::Chmod => 16,
            Opcode::Truncate => 17,
        }
    }

    fn from_u32(v: u32) -> Result<Self, RpcError> {
        Ok(match v {
            0 => Opcode::Getattr,
            1 => Opcode::Mkdir,
            2 => Opcode::Unlink,
            3 => Opcode::Rmdir,
            4 => Opcode::Rename,
            5 => Opcode::Open,
            6 => Opcode::Read,
            7 => Opcode::Write,
            8 => Opcode::Release,
            9 => Opcode::Fsync,
            10 => Opcode::Opendir,
            11 => Opcode::Readdir,
            12 => Opcode::Init,
            13 => Opcode::InitMkfs,
            14 => Opcode::Destroy,
            15 => Opcode::Create,
            16 => Opcode::Chmod,
            17 => Opcode::Truncate,
            other => return Err(RpcError::BadOpcode(other)),
        })
    }
}

/// One decoded request, tagged implicitly by which [`Opcode`] it arrived
/// under (the codec never double-tags the body with its own discriminant).
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Getattr { path: String },
    Mkdir { path: String, mode: u32 },
    Unlink { path: String },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Open { path: String, flags: u32 },
    Read { fh: u64, n: u64, off: u64 },
    Write { fh: u64, off: u64, data: Vec<u8> },
    Release { fh: u64 },
    Fsync { fh: u64 },
    Opendir { path: String },
    Readdir { fh: u64 },
    /// First frame on a new connection: establishes the caller's identity
    /// for the lifetime of the session (`spec.md` §3's `UserContext`).
    Init { uid: u32 },
    InitMkfs { num_inodes: u64, num_data_blocks: u64 },
    Destroy,
    Create { path: String, mode: u32 },
    Chmod { path: String, mode: u32 },
    Truncate { path: String, size: u64 },
}

/// One encoded response. `Error` carries a POSIX errno (`spec.md` §7);
/// every other variant is a success payload shaped by the opcode that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Error(i32),
    Unit,
    Attr(Attr),
    Ino(u64),
    Fh(u64),
    Created { fh: u64, ino: u64 },
    Bytes(Vec<u8>),
    Written(u64),
    Entries(Vec<(u64, String)>),
}

impl PartialEq for Attr {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.ino == other.ino
            && self.mode == other.mode
            && self.size == other.size
            && self.atime == other.atime
            && self.mtime == other.mtime
            && self.ctime == other.ctime
    }
}

fn write_string(buf: &mut FlexBuffer, s: &str, limit: usize) -> Result<(), RpcError> {
    if s.len() > limit {
        return Err(RpcError::StringTooLong);
    }
    buf.push_u32(s.len() as u32);
    buf.append(s.as_bytes());
    Ok(())
}

fn read_string(buf: &mut FlexBuffer, limit: usize) -> Result<String, RpcError> {
    let len = buf.pop_u32_front() as usize;
    if len > limit {
        return Err(RpcError::StringTooLong);
    }
    let bytes = buf.pop_head(len);
    String::from_utf8(bytes).map_err(|_| RpcError::BadUtf8)
}

/// Serializes `req`'s opcode-specific arguments; the opcode itself travels
/// in the frame header, not in this body.
pub fn encode_request_body(req: &Request) -> Vec<u8> {
    let mut buf = FlexBuffer::new();
    match req {
        Request::Getattr { path } | Request::Opendir { path } | Request::Unlink { path } | Request::Rmdir { path } => {
            let _ = write_string(&mut buf, path, MAX_PATH_LEN);
        }
        Request::Mkdir { path, mode } | Request::Create { path, mode } | Request::Chmod { path, mode } => {
            let _ = write_string(&mut buf, path, MAX_PATH_LEN);
            buf.push_u32(*mode);
        }
        Request::Rename { from, to } => {
            let _ = write_string(&mut buf, from, MAX_PATH_LEN);
            let _ = write_string(&mut buf, to, MAX_PATH_LEN);
        }
        Request::Open { path, flags } => {
            let _ = write_string(&mut buf, path, MAX_PATH_LEN);
            buf.push_u32(*flags);
        }
        Request::Read { fh, n, off } => {
            buf.push_u64(*fh);
            buf.push_u64(*n);
            buf.push_u64(*off);
        }
        Request::Write { fh, off, data } => {
            buf.push_u64(*fh);
            buf.push_u64(*off);
            buf.push_u32(data.len() as u32);
            buf.append(data);
        }
        Request::Release { fh } | Request::Fsync { fh } | Request::Readdir { fh } => {
            buf.push_u64(*fh);
        }
        Request::Init { uid } => buf.push_u32(*uid),
        Request::Destroy => {}
        Request::InitMkfs { num_inodes, num_data_blocks } => {
            buf.push_u64(*num_inodes);
            buf.push_u64(*num_data_blocks);
        }
        Request::Truncate { path, size } => {
            let _ = write_string(&mut buf, path, MAX_PATH_LEN);
            buf.push_u64(*size);
        }
    }
    buf.payload().to_vec()
}

/// Parses `body` according to `opcode`'s known shape.
pub fn decode_request_body(opcode: Opcode, body: &[u8]) -> Result<Request, RpcError> {
    let mut buf = FlexBuffer::with_padding(body, 0, 0);
    Ok(match opcode {
        Opcode::Getattr => Request::Getattr { path: read_string(&mut buf, MAX_PATH_LEN)? },
        Opcode::Unlink => Request::Unlink { path: read_string(&mut buf, MAX_PATH_LEN)? },
        Opcode::Rmdir => Request::Rmdir { path: read_string(&mut buf, MAX_PATH_LEN)? },
        Opcode::Opendir => Request::Opendir { path: read_string(&mut buf, MAX_PATH_LEN)? },
        Opcode::Mkdir => {
            let path = read_string(&mut buf, MAX_PATH_LEN)?;
            let mode = buf.pop_u32_front();
            Request::Mkdir { path, mode }
        }
        Opcode::Create => {
            let path = read_string(&mut buf, MAX_PATH_LEN)?;
            let mode = buf.pop_u32_front();
            Request::Create { path, mode }
        }
        Opcode::Chmod => {
            let path = read_string(&mut buf, MAX_PATH_LEN)?;
            let mode = buf.pop_u32_front();
            Request::Chmod { path, mode }
        }
        Opcode::Rename => {
            let from = read_string(&mut buf, MAX_PATH_LEN)?;
            let to = read_string(&mut buf, MAX_PATH_LEN)?;
            Request::Rename { from, to }
        }
        Opcode::Open => {
            let path = read_string(&mut buf, MAX_PATH_LEN)?;
            let flags = buf.pop_u32_front();
            Request::Open { path, flags }
        }
        Opcode::Read => {
            let fh = buf.pop_u64_front();
            let n = buf.pop_u64_front();
            let off = buf.pop_u64_front();
            Request::Read { fh, n, off }
        }
        Opcode::Write => {
            let fh = buf.pop_u64_front();
            let off = buf.pop_u64_front();
            let len = buf.pop_u32_front() as usize;
            let data = buf.pop_head(len);
            Request::Write { fh, off, data }
        }
        Opcode::Release => Request::Release { fh: buf.pop_u64_front() },
        Opcode::Fsync => Request::Fsync { fh: buf.pop_u64_front() },
        Opcode::Readdir => Request::Readdir { fh: buf.pop_u64_front() },
        Opcode::Init => Request::Init { uid: buf.pop_u32_front() },
        Opcode::Destroy => Request::Destroy,
        Opcode::InitMkfs => {
            let num_inodes = buf.pop_u64_front();
            let num_data_blocks = buf.pop_u64_front();
            Request::InitMkfs { num_inodes, num_data_blocks }
        }
        Opcode::Truncate => {
            let path = read_string(&mut buf, MAX_PATH_LEN)?;
            let size = buf.pop_u64_front();
            Request::Truncate { path, size }
        }
    })
}

/// The opcode a request travels under — needed by the codec's caller to
/// put the right value in the frame header.
pub fn request_opcode(req: &Request) -> Opcode {
    match req {
        Request::Getattr { .. } => Opcode::Getattr,
        Request::Mkdir { .. } => Opcode::Mkdir,
        Request::Unlink { .. } => Opcode::Unlink,
        Request::Rmdir { .. } => Opcode::Rmdir,
        Request::Rename { .. } => Opcode::Rename,
        Request::Open { .. } => Opcode::Open,
        Request::Read { .. } => Opcode::Read,
        Request::Write { .. } => Opcode::Write,
        Request::Release { .. } => Opcode::Release,
        Request::Fsync { .. } => Opcode::Fsync,
        Request::Opendir { .. } => Opcode::Opendir,
        Request::Readdir { .. } => Opcode::Readdir,
        Request::Init { .. } => Opcode::Init,
        Request::InitMkfs { .. } => Opcode::InitMkfs,
        Request::Destroy => Opcode::Destroy,
        Request::Create { .. } => Opcode::Create,
        Request::Chmod { .. } => Opcode::Chmod,
        Request::Truncate { .. } => Opcode::Truncate,
    }
}

/// Serializes `resp`. The first field is always a `u32` status: `0` on
/// success (followed by the opcode-specific payload), nonzero is the
/// POSIX errno and nothing else follows (`spec.md` §7's errno mapping).
pub fn encode_response_body(resp: &Response) -> Vec<u8> {
    let mut buf = FlexBuffer::new();
    if let Response::Error(errno) = resp {
        buf.push_u32(*errno as u32);
        return buf.payload().to_vec();
    }
    buf.push_u32(0);
    match resp {
        Response::Error(_) => unreachable!("handled above"),
        Response::Unit => {}
        Response::Attr(a) => {
            buf.push_u32(a.uid);
            buf.push_u64(a.ino);
            buf.push_u32(a.mode);
            buf.push_u64(a.size);
            buf.push_u64(a.atime);
            buf.push_u64(a.mtime);
            buf.push_u64(a.ctime);
        }
        Response::Ino(ino) => buf.push_u64(*ino),
        Response::Fh(fh) => buf.push_u64(*fh),
        Response::Created { fh, ino } => {
            buf.push_u64(*fh);
            buf.push_u64(*ino);
        }
        Response::Bytes(data) => {
            buf.push_u32(data.len() as u32);
            buf.append(data);
        }
        Response::Written(n) => buf.push_u64(*n),
        Response::Entries(entries) => {
            buf.push_u32(entries.len() as u32);
            for (ino, name) in entries {
                buf.push_u64(*ino);
                let _ = write_string(&mut buf, name, crate::MAX_FILE_NAME_LEN);
            }
        }
    }
    buf.payload().to_vec()
}

/// Parses `body` for `opcode`'s known success shape, or the shared error
/// shape if the leading status word is nonzero.
pub fn decode_response_body(opcode: Opcode, body: &[u8]) -> Result<Response, RpcError> {
    let mut buf = FlexBuffer::with_padding(body, 0, 0);
    let status = buf.pop_u32_front();
    if status != 0 {
        return Ok(Response::Error(status as i32));
    }
    Ok(match opcode {
        Opcode::Getattr => {
            let uid = buf.pop_u32_front();
            let ino = buf.pop_u64_front();
            let mode = buf.pop_u32_front();
            let size = buf.pop_u64_front();
            let atime = buf.pop_u64_front();
            let mtime = buf.pop_u64_front();
            let ctime = buf.pop_u64_front();
            Response::Attr(Attr { uid, ino, mode, size, atime, mtime, ctime })
        }
        Opcode::Mkdir => Response::Ino(buf.pop_u64_front()),
        Opcode::Open | Opcode::Opendir => Response::Fh(buf.pop_u64_front()),
        Opcode::Create => {
            let fh = buf.pop_u64_front();
            let ino = buf.pop_u64_front();
            Response::Created { fh, ino }
        }
        Opcode::Read => {
            let len = buf.pop_u32_front() as usize;
            Response::Bytes(buf.pop_head(len))
        }
        Opcode::Write => Response::Written(buf.pop_u64_front()),
        Opcode::Readdir => {
            let count = buf.pop_u32_front();
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let ino = buf.pop_u64_front();
                let name = read_string(&mut buf, crate::MAX_FILE_NAME_LEN)?;
                entries.push((ino, name));
            }
            Response::Entries(entries)
        }
        Opcode::Unlink
        | Opcode::Rmdir
        | Opcode::Rename
        | Opcode::Release
        | Opcode::Fsync
        | Opcode::Init
        | Opcode::InitMkfs
        | Opcode::Destroy
        | Opcode::Chmod
        | Opcode::Truncate => Response::Unit,
    })
}

/// Encrypts and frames `mtype`/`opcode`/`body` and writes it to `w`: the
/// wire shape from `spec.md` §4.8.
pub fn write_frame<W: Write>(
    w: &mut W,
    sa: &SecAssociation,
    seq: u32,
    mtype: MsgType,
    opcode: Opcode,
    body: &[u8],
) -> Result<(), RpcError> {
    let mut plain = FlexBuffer::new();
    plain.push_u32(mtype.to_u32());
    plain.push_u32(opcode.to_u32());
    plain.append(body);
    let (ct, nonce, tag) = sa
        .encrypt(plain.payload(), &seq.to_le_bytes())
        .map_err(|_| RpcError::AuthenticationFailed)?;
    let mut payload = Vec::with_capacity(NONCE_LEN + TAG_LEN + ct.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&tag);
    payload.extend_from_slice(&ct);
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

/// Reads one frame from `r`, decrypting and authenticating it against
/// `expected_seq`. Any decode or authentication failure here means the
/// caller must drop the connection (`spec.md` §4.8, §8 tamper-detection
/// scenario) rather than try to resynchronize.
pub fn read_frame<R: Read>(
    r: &mut R,
    sa: &SecAssociation,
    expected_seq: u32,
) -> Result<(MsgType, Opcode, Vec<u8>), RpcError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < NONCE_LEN + TAG_LEN {
        return Err(RpcError::Truncated);
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let nonce: [u8; NONCE_LEN] = payload[..NONCE_LEN].try_into().unwrap();
    let tag: [u8; TAG_LEN] = payload[NONCE_LEN..NONCE_LEN + TAG_LEN].try_into().unwrap();
    let ct = &payload[NONCE_LEN + TAG_LEN..];
    let pt = sa
        .decrypt(ct, &expected_seq.to_le_bytes(), &nonce, &tag)
        .map_err(|_| RpcError::AuthenticationFailed)?;
    let mut buf = FlexBuffer::with_padding(&pt, 0, 0);
    let mtype = MsgType::from_u32(buf.pop_u32_front())?;
    let opcode = Opcode::from_u32(buf.pop_u32_front())?;
    let body = buf.payload().to_vec();
    Ok((mtype, opcode, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa() -> SecAssociation {
        SecAssociation::new([1u8; 16])
    }

    #[test]
    fn frame_roundtrips_over_a_byte_buffer() {
        let sa = sa();
        let req = Request::Write { fh: 3, off: 128, data: b"payload".to_vec() };
        let body = encode_request_body(&req);
        let mut wire = Vec::new();
        write_frame(&mut wire, &sa, 0, MsgType::ToServer, request_opcode(&req), &body).unwrap();

        let mut cursor = &wire[..];
        let (mtype, opcode, out_body) = read_frame(&mut cursor, &sa, 0).unwrap();
        assert_eq!(mtype, MsgType::ToServer);
        assert_eq!(opcode, Opcode::Write);
        assert_eq!(decode_request_body(opcode, &out_body).unwrap(), req);
    }

    #[test]
    fn stale_sequence_number_fails_authentication() {
        let sa = sa();
        let req = Request::Getattr { path: "/a".to_string() };
        let body = encode_request_body(&req);
        let mut wire = Vec::new();
        write_frame(&mut wire, &sa, 5, MsgType::ToServer, request_opcode(&req), &body).unwrap();

        let mut cursor = &wire[..];
        let err = read_frame(&mut cursor, &sa, 0).unwrap_err();
        assert!(matches!(err, RpcError::AuthenticationFailed));
    }

    #[test]
    fn request_response_roundtrip_for_every_opcode_shape() {
        let cases = vec![
            (Request::Getattr { path: "/x".into() }, Response::Attr(Attr { uid: 1, ino: 2, mode: 0o644, size: 10, atime: 1, mtime: 2, ctime: 3 })),
            (Request::Mkdir { path: "/d".into(), mode: 0o755 }, Response::Ino(9)),
            (Request::Create { path: "/c".into(), mode: 0o644 }, Response::Created { fh: 3, ino: 8 }),
            (Request::Open { path: "/c".into(), flags: 0 }, Response::Fh(4)),
            (Request::Read { fh: 4, n: 10, off: 0 }, Response::Bytes(b"hello".to_vec())),
            (Request::Write { fh: 4, off: 0, data: b"abc".to_vec() }, Response::Written(3)),
            (Request::Readdir { fh: 4 }, Response::Entries(vec![(2, ".".into()), (2, "..".into())])),
            (Request::Unlink { path: "/c".into() }, Response::Unit),
        ];
        for (req, resp) in cases {
            let opcode = request_opcode(&req);
            let rbody = encode_request_body(&req);
            assert_eq!(decode_request_body(opcode, &rbody).unwrap(), req);
            let sbody = encode_response_body(&resp);
            assert_eq!(decode_response_body(opcode, &sbody).unwrap(), resp);
        }
    }

    #[test]
    fn error_response_short_circuits_the_payload() {
        let resp = Response::Error(libc::ENOENT);
        let body = encode_response_body(&resp);
        assert_eq!(decode_response_body(Opcode::Getattr, &body).unwrap(), resp);
    }
}
