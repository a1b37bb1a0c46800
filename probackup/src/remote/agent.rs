//! The agent side of the RPC: executed on the data host as
//! `pg_probackup agent` under ssh, strictly request-serial, speaking
//! frames on stdin/stdout. The agent never terminates the driver: any
//! per-operation failure is answered with an error frame and the loop
//! keeps serving until DISCONNECT or the pipe closes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use utils::lsn::Lsn;

use crate::config::AGENT_PROTOCOL_VERSION;
use crate::datafile::{self, ScanError, ScanOptions};
use crate::dir;
use crate::headermap::{encode_headers, PageHeader2};
use crate::pagemap::PageMap;

use super::{
    calg_from_wire, read_frame, write_frame, Cop, FioHeader, ProtocolError, RemoteStat,
    SendPagesRequest, FILE_MISSING, FIO_FDMAX, OPEN_FAILED, READ_FAILED,
};
use super::{CHUNK_SIZE, OpenMode};

struct AgentState {
    files: Vec<Option<File>>,
    dirs: HashMap<u32, std::fs::ReadDir>,
    /// Error of a fire-and-forget write, latched until GET_ASYNC_ERROR.
    async_error: Option<String>,
}

impl AgentState {
    fn new() -> AgentState {
        AgentState {
            files: (0..FIO_FDMAX).map(|_| None).collect(),
            dirs: HashMap::new(),
            async_error: None,
        }
    }

    fn file(&mut self, handle: u32) -> Result<&mut File, String> {
        self.files
            .get_mut(handle as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| format!("no open file at handle {handle}"))
    }
}

fn errno_of(e: &std::io::Error) -> u64 {
    e.raw_os_error().unwrap_or(libc::EIO) as u64
}

fn reply(tx: &mut impl Write, cop: Cop, arg: u64, payload: &[u8]) -> Result<(), ProtocolError> {
    write_frame(tx, FioHeader::new(cop, 0, payload.len() as u32, arg), payload)
}

fn reply_ok(tx: &mut impl Write, arg: u64, payload: &[u8]) -> Result<(), ProtocolError> {
    reply(tx, Cop::Send, arg, payload)
}

fn reply_io_err(tx: &mut impl Write, e: &std::io::Error) -> Result<(), ProtocolError> {
    reply(tx, Cop::Error, errno_of(e), e.to_string().as_bytes())
}

fn payload_path(payload: &[u8]) -> Result<&Utf8Path, ProtocolError> {
    std::str::from_utf8(payload)
        .map(Utf8Path::new)
        .map_err(|_| ProtocolError::UnexpectedEof)
}

/// Split a `a\0b` two-path payload.
fn payload_two_paths(payload: &[u8]) -> Result<(&Utf8Path, &Utf8Path), ProtocolError> {
    let pos = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnexpectedEof)?;
    Ok((payload_path(&payload[..pos])?, payload_path(&payload[pos + 1..])?))
}

/// Serve the pipe until DISCONNECT or EOF. Called from the `agent`
/// subcommand with stdin/stdout wired to the ssh channel.
pub fn run_agent() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_agent_on(stdin.lock(), stdout.lock())
}

/// The agent loop over arbitrary streams; split out so the protocol can
/// be exercised in-process.
pub fn run_agent_on(mut rx: impl Read, tx: impl Write) -> anyhow::Result<()> {
    let mut tx = std::io::BufWriter::new(tx);
    let mut state = AgentState::new();

    info!("remote agent started, protocol version {AGENT_PROTOCOL_VERSION}");

    loop {
        let (hdr, payload) = match read_frame(&mut rx) {
            Ok(frame) => frame,
            Err(ProtocolError::UnexpectedEof) => {
                debug!("driver hung up, exiting");
                return Ok(());
            }
            Err(e) => return Err(e).context("cannot read request frame"),
        };

        if !dispatch(&mut state, &mut tx, hdr, payload)? {
            return Ok(());
        }
        tx.flush().context("cannot flush the response pipe")?;
    }
}

/// Handle one request; false means DISCONNECT was served.
fn dispatch(
    state: &mut AgentState,
    tx: &mut impl Write,
    hdr: FioHeader,
    payload: Vec<u8>,
) -> anyhow::Result<bool> {
    match hdr.cop {
        Cop::AgentVersion => {
            reply_ok(
                tx,
                AGENT_PROTOCOL_VERSION as u64,
                crate::config::PROGRAM_VERSION.as_bytes(),
            )?;
        }
        Cop::Disconnect => {
            reply(tx, Cop::Disconnected, 0, &[])?;
            tx.flush()?;
            debug!("disconnect requested");
            return Ok(false);
        }

        Cop::Open => {
            let path = payload_path(&payload)?;
            let mode = OpenMode::try_from(hdr.arg)?;
            let result = match mode {
                OpenMode::Read => File::open(path),
                OpenMode::ReadWrite => OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path),
                OpenMode::WriteTruncate => File::create(path),
            };
            match result {
                Ok(file) => {
                    if hdr.handle >= FIO_FDMAX {
                        reply(tx, Cop::Error, libc::EBADF as u64, b"handle out of range")?;
                    } else {
                        state.files[hdr.handle as usize] = Some(file);
                        reply_ok(tx, 0, &[])?;
                    }
                }
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Close => {
            if let Some(slot) = state.files.get_mut(hdr.handle as usize) {
                slot.take();
            }
            reply_ok(tx, 0, &[])?;
        }
        Cop::Read => {
            let wanted = (hdr.arg as usize).min(super::MAX_FRAME_PAYLOAD);
            match state.file(hdr.handle) {
                Ok(file) => {
                    let mut buf = vec![0u8; wanted];
                    match file.read(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            reply_ok(tx, n as u64, &buf)?;
                        }
                        Err(e) => reply_io_err(tx, &e)?,
                    }
                }
                Err(msg) => reply(tx, Cop::Error, libc::EBADF as u64, msg.as_bytes())?,
            }
        }
        Cop::Pread => {
            let wanted = payload
                .get(0..4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize)
                .unwrap_or(0)
                .min(super::MAX_FRAME_PAYLOAD);
            match state.file(hdr.handle) {
                Ok(file) => {
                    use std::os::unix::fs::FileExt;
                    let mut buf = vec![0u8; wanted];
                    let mut filled = 0usize;
                    let mut failed: Option<std::io::Error> = None;
                    while filled < wanted {
                        match file.read_at(&mut buf[filled..], hdr.arg + filled as u64) {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(e) => {
                                failed = Some(e);
                                break;
                            }
                        }
                    }
                    match failed {
                        None => {
                            buf.truncate(filled);
                            reply_ok(tx, filled as u64, &buf)?;
                        }
                        Some(e) => reply_io_err(tx, &e)?,
                    }
                }
                Err(msg) => reply(tx, Cop::Error, libc::EBADF as u64, msg.as_bytes())?,
            }
        }
        Cop::Write => match state.file(hdr.handle) {
            Ok(file) => match file.write_all(&payload) {
                Ok(()) => reply_ok(tx, payload.len() as u64, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            },
            Err(msg) => reply(tx, Cop::Error, libc::EBADF as u64, msg.as_bytes())?,
        },
        Cop::WriteAsync => {
            // fire and forget: errors are latched, not answered
            match state.file(hdr.handle) {
                Ok(file) => {
                    if let Err(e) = file.write_all(&payload) {
                        state.async_error.get_or_insert(e.to_string());
                    }
                }
                Err(msg) => {
                    state.async_error.get_or_insert(msg);
                }
            }
        }
        Cop::WriteCompressedAsync => {
            let result = datafile::decompress_payload(crate::config::CompressAlg::Zlib, &payload)
                .map_err(|e| e.to_string())
                .and_then(|data| match state.file(hdr.handle) {
                    Ok(file) => file.write_all(&data).map_err(|e| e.to_string()),
                    Err(msg) => Err(msg),
                });
            if let Err(msg) = result {
                state.async_error.get_or_insert(msg);
            }
        }
        Cop::GetAsyncError => {
            let msg = state.async_error.take().unwrap_or_default();
            reply_ok(tx, !msg.is_empty() as u64, msg.as_bytes())?;
        }
        Cop::Seek => match state.file(hdr.handle) {
            Ok(file) => match file.seek(SeekFrom::Start(hdr.arg)) {
                Ok(_) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            },
            Err(msg) => reply(tx, Cop::Error, libc::EBADF as u64, msg.as_bytes())?,
        },
        Cop::Truncate => match state.file(hdr.handle) {
            Ok(file) => match file.set_len(hdr.arg) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            },
            Err(msg) => reply(tx, Cop::Error, libc::EBADF as u64, msg.as_bytes())?,
        },

        Cop::Stat => {
            let path = payload_path(&payload)?;
            let follow = hdr.arg != 0;
            let result = if follow {
                std::fs::metadata(path.as_std_path())
            } else {
                std::fs::symlink_metadata(path.as_std_path())
            };
            match result {
                Ok(meta) => {
                    use std::os::unix::fs::MetadataExt;
                    let stat = RemoteStat {
                        mode: meta.permissions().mode(),
                        size: meta.len(),
                        mtime: meta.mtime(),
                    };
                    reply_ok(tx, 0, &stat.encode())?;
                }
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Access => {
            let path = payload_path(&payload)?;
            match path.try_exists() {
                Ok(true) => reply_ok(tx, 0, &[])?,
                Ok(false) => reply(tx, Cop::Error, libc::ENOENT as u64, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Rename => {
            let (from, to) = payload_two_paths(&payload)?;
            match std::fs::rename(from, to) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Unlink => {
            let path = payload_path(&payload)?;
            match std::fs::remove_file(path) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Symlink => {
            let (target, link) = payload_two_paths(&payload)?;
            match std::os::unix::fs::symlink(target, link) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Mkdir => {
            let path = payload_path(&payload)?;
            match std::fs::create_dir_all(path).and_then(|()| {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(hdr.arg as u32))
            }) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Chmod => {
            let path = payload_path(&payload)?;
            match std::fs::set_permissions(path, std::fs::Permissions::from_mode(hdr.arg as u32)) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Sync => {
            let path = payload_path(&payload)?;
            match File::open(path).and_then(|f| f.sync_all()) {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Delete => {
            let path = payload_path(&payload)?;
            let result = match std::fs::symlink_metadata(path.as_std_path()) {
                Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
                Ok(_) => std::fs::remove_file(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }

        Cop::Opendir => {
            let path = payload_path(&payload)?;
            match std::fs::read_dir(path.as_std_path()) {
                Ok(rd) => {
                    state.dirs.insert(hdr.handle, rd);
                    reply_ok(tx, 0, &[])?;
                }
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::Readdir => match state.dirs.get_mut(&hdr.handle) {
            Some(rd) => match rd.next() {
                Some(Ok(entry)) => {
                    let name = entry.file_name();
                    reply_ok(tx, 0, name.to_string_lossy().as_bytes())?;
                }
                Some(Err(e)) => reply_io_err(tx, &e)?,
                None => reply_ok(tx, 0, &[])?,
            },
            None => reply(tx, Cop::Error, libc::EBADF as u64, b"no open directory")?,
        },
        Cop::Closedir => {
            state.dirs.remove(&hdr.handle);
            reply_ok(tx, 0, &[])?;
        }
        Cop::ListDir => {
            let backup_logs = hdr.arg != 0;
            let path = payload_path(&payload)?;
            match dir::list_data_directory(path, backup_logs) {
                Ok(files) => {
                    let mut out = String::new();
                    for f in &files {
                        out.push_str(&f.to_manifest_line());
                        out.push('\n');
                    }
                    reply_ok(tx, files.len() as u64, out.as_bytes())?;
                }
                Err(e) => reply(tx, Cop::Error, libc::EIO as u64, format!("{e:#}").as_bytes())?,
            }
        }

        Cop::Load => {
            let path = payload_path(&payload)?;
            match std::fs::read(path.as_std_path()) {
                Ok(content) => reply_ok(tx, 1, &content)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => reply_ok(tx, 0, &[])?,
                Err(e) => reply_io_err(tx, &e)?,
            }
        }
        Cop::SendFile => {
            let path = payload_path(&payload)?;
            send_file(tx, path)?;
        }
        Cop::SendPages => {
            send_pages(tx, &payload)?;
        }
        Cop::GetCrc32 => {
            let path = payload_path(&payload)?;
            match datafile::file_crc32(path) {
                Ok(crc) => reply_ok(tx, crc as u64, &[])?,
                Err(e) => reply(tx, Cop::Error, libc::EIO as u64, format!("{e:#}").as_bytes())?,
            }
        }
        Cop::GetChecksumMap => {
            get_checksum_map(tx, &payload)?;
        }
        Cop::GetLsnMap => {
            get_lsn_map(tx, &payload)?;
        }
        Cop::CheckPostmaster => {
            let pgdata = payload_path(&payload)?;
            reply_ok(tx, check_postmaster(pgdata), &[])?;
        }

        // response-only frame kinds are never valid requests
        other => {
            reply(
                tx,
                Cop::Error,
                libc::EINVAL as u64,
                format!("unexpected request frame {other:?}").as_bytes(),
            )?;
        }
    }
    Ok(true)
}

/// Stream a whole file in chunks, terminated by SendFileEof carrying the
/// total size in `arg`.
fn send_file(tx: &mut impl Write, path: &Utf8Path) -> Result<(), ProtocolError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                FILE_MISSING
            } else {
                OPEN_FAILED
            };
            return reply(tx, Cop::Error, code as i64 as u64, e.to_string().as_bytes());
        }
    };

    let mut total: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                reply(tx, Cop::Page, total, &buf[..n])?;
                total += n as u64;
            }
            Err(e) => {
                return reply(
                    tx,
                    Cop::Error,
                    READ_FAILED as i64 as u64,
                    e.to_string().as_bytes(),
                );
            }
        }
    }
    reply(tx, Cop::SendFileEof, total, &[])
}

/// Iterate the data file on this side of the pipe and stream only the
/// records to be stored. The header-map entries
/// travel in the EOF frame.
fn send_pages(tx: &mut impl Write, payload: &[u8]) -> anyhow::Result<()> {
    let req = SendPagesRequest::decode(payload)?;
    let rest = &payload[SendPagesRequest::SIZE..];
    if rest.len() < req.path_len as usize + req.bitmapsize as usize {
        anyhow::bail!("malformed SendPages request");
    }
    let path = std::str::from_utf8(&rest[..req.path_len as usize])
        .context("non-UTF8 path in SendPages request")?;
    let pagemap = if req.bitmapsize > 0 {
        Some(PageMap::from_bytes(
            rest[req.path_len as usize..req.path_len as usize + req.bitmapsize as usize].to_vec(),
        ))
    } else {
        None
    };

    let calg = calg_from_wire(req.calg)?;
    let opts = ScanOptions {
        nblocks: req.nblocks,
        segno: req.segno,
        horizon_lsn: Lsn(req.horizon_lsn),
        checksum_version: req.checksum_version,
        calg,
        clevel: req.clevel,
        pagemap: pagemap.as_ref(),
        cancel: None,
    };

    let mut headers: Vec<PageHeader2> = Vec::new();
    let mut pos: i64 = 0;
    let mut sink_err: Option<std::io::Error> = None;

    let scan = {
        let sink_err = &mut sink_err;
        let headers = &mut headers;
        let pos = &mut pos;
        datafile::scan_data_file(Utf8Path::new(path), &opts, &mut |page| {
            write_frame(
                tx,
                FioHeader::new(Cop::Page, 0, page.record.len() as u32, page.blkno as u64),
                page.record,
            )
            .map_err(|e| {
                if let ProtocolError::Io(io) = &e {
                    *sink_err = Some(std::io::Error::new(io.kind(), io.to_string()));
                }
                anyhow::Error::new(e)
            })?;
            headers.push(PageHeader2 {
                lsn: page.lsn,
                block: page.blkno,
                pos: *pos as i32,
                checksum: page.checksum,
            });
            *pos += page.record.len() as i64;
            Ok(())
        })
    };

    match scan {
        Ok(stats) => {
            let encoded = if headers.is_empty() {
                Vec::new()
            } else {
                headers.push(PageHeader2 {
                    lsn: Lsn::INVALID,
                    block: 0,
                    pos: pos as i32,
                    checksum: 0,
                });
                encode_headers(&headers)
            };
            write_frame(
                tx,
                FioHeader::new(
                    Cop::SendFileEof,
                    0,
                    encoded.len() as u32,
                    stats.n_read as u64,
                ),
                &encoded,
            )?;
            Ok(())
        }
        Err(ScanError::Missing) => {
            reply(tx, Cop::Error, FILE_MISSING as i64 as u64, &[])?;
            Ok(())
        }
        Err(ScanError::Open(e)) => {
            reply(
                tx,
                Cop::Error,
                OPEN_FAILED as i64 as u64,
                format!("Cannot open file \"{path}\": {e}").as_bytes(),
            )?;
            Ok(())
        }
        Err(ScanError::Read { blkno, source }) => {
            reply(
                tx,
                Cop::Error,
                READ_FAILED as i64 as u64,
                format!("Cannot read block {blkno} of \"{path}\": {source}").as_bytes(),
            )?;
            Ok(())
        }
        Err(ScanError::Corruption { blkno, msg }) => {
            write_frame(
                tx,
                FioHeader::new(
                    Cop::SendFileCorruption,
                    0,
                    msg.len() as u32,
                    blkno as u64,
                ),
                msg.as_bytes(),
            )?;
            Ok(())
        }
        // the pipe itself broke: nothing sensible left to send
        Err(ScanError::Sink(e)) => match sink_err {
            Some(io) => Err(anyhow::Error::new(io).context("agent pipe broken")),
            None => Err(e),
        },
        Err(e @ (ScanError::OddSize(_) | ScanError::Interrupted)) => {
            reply(
                tx,
                Cop::Error,
                READ_FAILED as i64 as u64,
                e.to_string().as_bytes(),
            )?;
            Ok(())
        }
    }
}

fn get_checksum_map(tx: &mut impl Write, payload: &[u8]) -> Result<(), ProtocolError> {
    match decode_map_request(payload) {
        Ok((path, n_blocks, lsn, segno, checksum_version)) => {
            match datafile::get_checksum_map(&path, checksum_version, n_blocks, lsn, segno) {
                Ok(map) => {
                    let mut out = Vec::with_capacity(map.len() * 11);
                    for entry in &map {
                        match entry {
                            Some((checksum, lsn)) => {
                                out.push(1u8);
                                out.extend_from_slice(&checksum.to_le_bytes());
                                out.extend_from_slice(&lsn.0.to_le_bytes());
                            }
                            None => {
                                out.push(0u8);
                                out.extend_from_slice(&[0u8; 10]);
                            }
                        }
                    }
                    reply_ok(tx, map.len() as u64, &out)
                }
                Err(e) => reply(tx, Cop::Error, libc::EIO as u64, format!("{e:#}").as_bytes()),
            }
        }
        Err(e) => reply(tx, Cop::Error, libc::EINVAL as u64, e.to_string().as_bytes()),
    }
}

fn get_lsn_map(tx: &mut impl Write, payload: &[u8]) -> Result<(), ProtocolError> {
    match decode_map_request(payload) {
        Ok((path, n_blocks, lsn, segno, checksum_version)) => {
            match datafile::get_lsn_map(&path, checksum_version, n_blocks, lsn, segno) {
                Ok(map) => reply_ok(tx, 0, map.as_bytes()),
                Err(e) => reply(tx, Cop::Error, libc::EIO as u64, format!("{e:#}").as_bytes()),
            }
        }
        Err(e) => reply(tx, Cop::Error, libc::EINVAL as u64, e.to_string().as_bytes()),
    }
}

/// `{n_blocks u32, segno u32, lsn u64, checksum_version u32}` + path.
pub(super) fn encode_map_request(
    path: &Utf8Path,
    n_blocks: u32,
    lsn: Lsn,
    segno: u32,
    checksum_version: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + path.as_str().len());
    out.extend_from_slice(&n_blocks.to_le_bytes());
    out.extend_from_slice(&segno.to_le_bytes());
    out.extend_from_slice(&lsn.0.to_le_bytes());
    out.extend_from_slice(&checksum_version.to_le_bytes());
    out.extend_from_slice(path.as_str().as_bytes());
    out
}

fn decode_map_request(payload: &[u8]) -> anyhow::Result<(Utf8PathBuf, u32, Lsn, u32, u32)> {
    if payload.len() < 20 {
        anyhow::bail!("short map request");
    }
    let n_blocks = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let segno = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let lsn = Lsn(u64::from_le_bytes(payload[8..16].try_into().unwrap()));
    let checksum_version = u32::from_le_bytes(payload[16..20].try_into().unwrap());
    let path = std::str::from_utf8(&payload[20..]).context("non-UTF8 path in map request")?;
    Ok((Utf8PathBuf::from(path), n_blocks, lsn, segno, checksum_version))
}

/// Pid of a live postmaster in `pgdata`, or 0.
fn check_postmaster(pgdata: &Utf8Path) -> u64 {
    let pid_path = pgdata.join("postmaster.pid");
    let Ok(content) = std::fs::read_to_string(&pid_path) else {
        return 0;
    };
    let Some(pid) = content.lines().next().and_then(|l| l.trim().parse::<i32>().ok()) else {
        return 0;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => pid as u64,
        Err(_) => 0,
    }
}
