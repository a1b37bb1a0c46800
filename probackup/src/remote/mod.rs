//! Remote-agent RPC.
//!
//! The driver reaches a remote data host by executing this same binary
//! with the `agent` subcommand over ssh and speaking a framed
//! request/response protocol over the process pipe. Framing and the
//! operation table live here, in one place, shared by the client
//! ([`client::FioClient`]) and the agent loop ([`agent::run_agent`]) so
//! both sides are checked against the same definition.

pub mod agent;
pub mod client;

use std::io::{Read, Write};

use anyhow::Context;
use bytes::{Buf, BufMut, BytesMut};

/// Both sides keep an `fd[handle]` table of this size; a handle is an
/// index into it.
pub const FIO_FDMAX: u32 = 64;

/// Payload ceiling for a single frame. Streams chunk at this size.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Error codes carried in the `arg` field of an Error frame.
pub const FILE_MISSING: i32 = -1;
pub const OPEN_FAILED: i32 = -2;
pub const READ_FAILED: i32 = -3;
pub const WRITE_FAILED: i32 = -4;

/// Operation table of the wire protocol. The numeric values are the wire
/// format; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cop {
    Open = 1,
    Close = 2,
    Read = 3,
    Pread = 4,
    Write = 5,
    WriteAsync = 6,
    WriteCompressedAsync = 7,
    Seek = 8,
    Truncate = 9,
    Stat = 10,
    Access = 11,
    Rename = 12,
    Unlink = 13,
    Symlink = 14,
    Mkdir = 15,
    Chmod = 16,
    Sync = 17,
    Opendir = 18,
    Readdir = 19,
    Closedir = 20,
    ListDir = 21,
    SendFile = 22,
    SendPages = 23,
    GetCrc32 = 24,
    GetChecksumMap = 25,
    GetLsnMap = 26,
    CheckPostmaster = 27,
    Delete = 28,
    Load = 29,
    GetAsyncError = 30,
    AgentVersion = 31,
    Disconnect = 32,

    /* response-only frame kinds */
    Send = 40,
    Page = 41,
    Error = 42,
    SendFileEof = 43,
    SendFileCorruption = 44,
    Disconnected = 45,
}

impl TryFrom<u32> for Cop {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Cop, ProtocolError> {
        use Cop::*;
        Ok(match value {
            1 => Open,
            2 => Close,
            3 => Read,
            4 => Pread,
            5 => Write,
            6 => WriteAsync,
            7 => WriteCompressedAsync,
            8 => Seek,
            9 => Truncate,
            10 => Stat,
            11 => Access,
            12 => Rename,
            13 => Unlink,
            14 => Symlink,
            15 => Mkdir,
            16 => Chmod,
            17 => Sync,
            18 => Opendir,
            19 => Readdir,
            20 => Closedir,
            21 => ListDir,
            22 => SendFile,
            23 => SendPages,
            24 => GetCrc32,
            25 => GetChecksumMap,
            26 => GetLsnMap,
            27 => CheckPostmaster,
            28 => Delete,
            29 => Load,
            30 => GetAsyncError,
            31 => AgentVersion,
            32 => Disconnect,
            40 => Send,
            41 => Page,
            42 => Error,
            43 => SendFileEof,
            44 => SendFileCorruption,
            45 => Disconnected,
            other => return Err(ProtocolError::UnknownCop(other)),
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown operation code {0} on the agent pipe")]
    UnknownCop(u32),
    #[error("unexpected {got:?} frame in response to {expected:?}")]
    Unexpected { expected: Cop, got: Cop },
    #[error("unexpected EOF on the agent pipe")]
    UnexpectedEof,
    #[error("oversized frame payload ({0} bytes)")]
    Oversized(u64),
    #[error("agent protocol version {agent} is not compatible with {ours}")]
    VersionMismatch { agent: u64, ours: u32 },
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame header on the pipe: little-endian, independent of host
/// endianness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FioHeader {
    pub cop: Cop,
    pub handle: u32,
    /// Payload size in bytes; the payload follows the header.
    pub size: u32,
    pub arg: u64,
}

pub const FIO_HEADER_SIZE: usize = 4 + 4 + 4 + 8;

impl FioHeader {
    pub fn new(cop: Cop, handle: u32, size: u32, arg: u64) -> FioHeader {
        FioHeader {
            cop,
            handle,
            size,
            arg,
        }
    }

    pub fn encode(&self) -> [u8; FIO_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(FIO_HEADER_SIZE);
        buf.put_u32_le(self.cop as u32);
        buf.put_u32_le(self.handle);
        buf.put_u32_le(self.size);
        buf.put_u64_le(self.arg);
        buf[..].try_into().unwrap()
    }

    pub fn decode(mut raw: &[u8]) -> Result<FioHeader, ProtocolError> {
        let cop = Cop::try_from(raw.get_u32_le())?;
        Ok(FioHeader {
            cop,
            handle: raw.get_u32_le(),
            size: raw.get_u32_le(),
            arg: raw.get_u64_le(),
        })
    }
}

/// Write a frame (header plus payload) to the pipe.
pub fn write_frame(w: &mut impl Write, hdr: FioHeader, payload: &[u8]) -> Result<(), ProtocolError> {
    debug_assert_eq!(hdr.size as usize, payload.len());
    w.write_all(&hdr.encode())?;
    if !payload.is_empty() {
        w.write_all(payload)?;
    }
    Ok(())
}

/// Read one frame. A clean EOF at a frame boundary yields
/// [`ProtocolError::UnexpectedEof`]; the callers decide whether the peer
/// was allowed to hang up.
pub fn read_frame(r: &mut impl Read) -> Result<(FioHeader, Vec<u8>), ProtocolError> {
    let mut raw = [0u8; FIO_HEADER_SIZE];
    let mut filled = 0;
    while filled < raw.len() {
        let n = r.read(&mut raw[filled..])?;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof);
        }
        filled += n;
    }
    let hdr = FioHeader::decode(&raw)?;
    if hdr.size as usize > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::Oversized(hdr.size as u64));
    }
    let mut payload = vec![0u8; hdr.size as usize];
    r.read_exact(&mut payload)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::UnexpectedEof,
            _ => ProtocolError::Io(e),
        })?;
    Ok((hdr, payload))
}

/// How a remote file is opened; encoded in the `arg` of an Open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum OpenMode {
    Read = 0,
    /// read+write, create if absent, no truncation (restore targets)
    ReadWrite = 1,
    /// write-only, create, truncate (backup destinations)
    WriteTruncate = 2,
}

impl TryFrom<u64> for OpenMode {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<OpenMode, ProtocolError> {
        match value {
            0 => Ok(OpenMode::Read),
            1 => Ok(OpenMode::ReadWrite),
            2 => Ok(OpenMode::WriteTruncate),
            other => Err(ProtocolError::UnknownCop(other as u32)),
        }
    }
}

/// Payload of a SendPages request, after which the file path and the
/// optional page-map bitmap follow.
#[derive(Debug, Clone, Copy)]
pub struct SendPagesRequest {
    pub nblocks: u32,
    pub segno: u32,
    pub horizon_lsn: u64,
    pub checksum_version: u32,
    pub calg: u8,
    pub clevel: i32,
    pub bitmapsize: u32,
    pub path_len: u32,
}

impl SendPagesRequest {
    pub const SIZE: usize = 4 + 4 + 8 + 4 + 1 + 4 + 4 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.nblocks);
        buf.put_u32_le(self.segno);
        buf.put_u64_le(self.horizon_lsn);
        buf.put_u32_le(self.checksum_version);
        buf.put_u8(self.calg);
        buf.put_i32_le(self.clevel);
        buf.put_u32_le(self.bitmapsize);
        buf.put_u32_le(self.path_len);
        buf.to_vec()
    }

    pub fn decode(mut raw: &[u8]) -> anyhow::Result<SendPagesRequest> {
        if raw.len() < Self::SIZE {
            anyhow::bail!("short SendPages request ({} bytes)", raw.len());
        }
        Ok(SendPagesRequest {
            nblocks: raw.get_u32_le(),
            segno: raw.get_u32_le(),
            horizon_lsn: raw.get_u64_le(),
            checksum_version: raw.get_u32_le(),
            calg: raw.get_u8(),
            clevel: raw.get_i32_le(),
            bitmapsize: raw.get_u32_le(),
            path_len: raw.get_u32_le(),
        })
    }
}

/// Compression algorithm on the wire.
pub fn calg_to_wire(calg: crate::config::CompressAlg) -> u8 {
    match calg {
        crate::config::CompressAlg::None => 0,
        crate::config::CompressAlg::Pglz => 1,
        crate::config::CompressAlg::Zlib => 2,
    }
}

pub fn calg_from_wire(raw: u8) -> anyhow::Result<crate::config::CompressAlg> {
    match raw {
        0 => Ok(crate::config::CompressAlg::None),
        1 => Ok(crate::config::CompressAlg::Pglz),
        2 => Ok(crate::config::CompressAlg::Zlib),
        other => anyhow::bail!("unknown compression algorithm {other} on the wire"),
    }
}

/// Stat result on the wire: `{mode u32, size u64, mtime i64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
}

impl RemoteStat {
    pub const SIZE: usize = 4 + 8 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.mode);
        buf.put_u64_le(self.size);
        buf.put_i64_le(self.mtime);
        buf.to_vec()
    }

    pub fn decode(mut raw: &[u8]) -> anyhow::Result<RemoteStat> {
        if raw.len() < Self::SIZE {
            anyhow::bail!("short stat response ({} bytes)", raw.len());
        }
        Ok(RemoteStat {
            mode: raw.get_u32_le(),
            size: raw.get_u64_le(),
            mtime: raw.get_i64_le(),
        })
    }
}

/// Build the ssh command line that launches the agent on the data host.
pub fn build_ssh_command(remote: &crate::config::RemoteOptions) -> anyhow::Result<Vec<String>> {
    let host = remote
        .host
        .as_deref()
        .context("remote host is not configured")?;
    let mut cmd = vec!["ssh".to_string()];
    // the pipe is the protocol; ssh must not allocate a tty
    cmd.push("-T".to_string());
    if let Some(port) = &remote.port {
        cmd.push("-p".to_string());
        cmd.push(port.clone());
    }
    if let Some(opts) = &remote.ssh_options {
        cmd.extend(opts.split_whitespace().map(|s| s.to_string()));
    }
    match &remote.user {
        Some(user) => cmd.push(format!("{user}@{host}")),
        None => cmd.push(host.to_string()),
    }
    let binary = remote.path.as_deref().unwrap_or("pg_probackup");
    cmd.push(binary.to_string());
    cmd.push("agent".to_string());
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = FioHeader::new(Cop::SendPages, 63, 1024, 0xDEAD_BEEF_0000_0001);
        let raw = hdr.encode();
        assert_eq!(raw.len(), FIO_HEADER_SIZE);
        assert_eq!(FioHeader::decode(&raw).unwrap(), hdr);
        // little-endian on the wire
        assert_eq!(&raw[0..4], &(Cop::SendPages as u32).to_le_bytes());
    }

    #[test]
    fn frame_roundtrip_over_a_pipe() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(
            &mut buf,
            FioHeader::new(Cop::Write, 5, 3, 42),
            b"abc",
        )
        .unwrap();
        write_frame(&mut buf, FioHeader::new(Cop::Close, 5, 0, 0), b"").unwrap();

        let mut cursor = &buf[..];
        let (h1, p1) = read_frame(&mut cursor).unwrap();
        assert_eq!(h1.cop, Cop::Write);
        assert_eq!(p1, b"abc");
        let (h2, p2) = read_frame(&mut cursor).unwrap();
        assert_eq!(h2.cop, Cop::Close);
        assert!(p2.is_empty());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[test]
    fn unknown_cop_is_rejected() {
        let mut raw = FioHeader::new(Cop::Open, 0, 0, 0).encode();
        raw[0..4].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            FioHeader::decode(&raw),
            Err(ProtocolError::UnknownCop(999))
        ));
    }

    #[test]
    fn send_pages_request_roundtrip() {
        let req = SendPagesRequest {
            nblocks: 17,
            segno: 2,
            horizon_lsn: 0x1_0000_0000,
            checksum_version: 1,
            calg: 2,
            clevel: 3,
            bitmapsize: 16,
            path_len: 10,
        };
        let raw = req.encode();
        assert_eq!(raw.len(), SendPagesRequest::SIZE);
        let back = SendPagesRequest::decode(&raw).unwrap();
        assert_eq!(back.nblocks, 17);
        assert_eq!(back.horizon_lsn, 0x1_0000_0000);
        assert_eq!(back.clevel, 3);
    }

    #[test]
    fn ssh_command_shape() {
        let remote = crate::config::RemoteOptions {
            host: Some("db1".to_string()),
            port: Some("2222".to_string()),
            user: Some("postgres".to_string()),
            path: Some("/usr/bin/pg_probackup".to_string()),
            ssh_options: None,
        };
        let cmd = build_ssh_command(&remote).unwrap();
        assert_eq!(
            cmd,
            vec![
                "ssh",
                "-T",
                "-p",
                "2222",
                "postgres@db1",
                "/usr/bin/pg_probackup",
                "agent"
            ]
        );
    }
}
