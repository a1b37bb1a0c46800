//! The driver side of the RPC. One [`FioClient`] owns the pipe to one
//! agent process; workers that need remote I/O serialize their calls
//! through its mutex, which also preserves the strict FIFO the protocol
//! relies on.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use anyhow::Context;
use camino::Utf8Path;
use tracing::{debug, info, warn};

use utils::lsn::Lsn;

use crate::catalog::BackupMode;
use crate::config::{CompressAlg, RemoteOptions, AGENT_PROTOCOL_VERSION};
use crate::datafile::DataFileBackupResult;
use crate::error::{ClassifiedError, ErrorKind};
use crate::headermap::{decode_headers, HeaderMapWriter};
use crate::pgfile::{PgFile, BYTES_INVALID, FILE_NOT_FOUND};
use crate::workers::CancelToken;

use super::{
    build_ssh_command, calg_to_wire, read_frame, write_frame, Cop, FioHeader, OpenMode,
    ProtocolError, RemoteStat, SendPagesRequest, FILE_MISSING, FIO_FDMAX,
};

struct Pipes {
    tx: Box<dyn Write + Send>,
    rx: Box<dyn Read + Send>,
    /// Bitmask of allocated file handles, one bit per slot below
    /// [`FIO_FDMAX`].
    fd_slots: u64,
    child: Option<Child>,
}

pub struct FioClient {
    inner: Mutex<Pipes>,
}

/// A file opened on the agent side; an index into both sides' fd tables.
#[derive(Debug, Clone, Copy)]
pub struct RemoteHandle(u32);

impl FioClient {
    /// Spawn the agent over ssh and verify protocol compatibility before
    /// any backup work.
    pub fn connect(remote: &RemoteOptions) -> anyhow::Result<FioClient> {
        let cmd = build_ssh_command(remote)?;
        info!("launching remote agent: {}", cmd.join(" "));

        let mut child = Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // agent log lines (ERROR:/WARNING: prefixed) surface directly
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("cannot launch remote agent via \"{}\"", cmd[0]))?;

        let tx = child.stdin.take().expect("stdin is piped");
        let rx = child.stdout.take().expect("stdout is piped");
        let client = FioClient {
            inner: Mutex::new(Pipes {
                tx: Box::new(BufWriter::new(tx)),
                rx: Box::new(BufReader::new(rx)),
                fd_slots: 0,
                child: Some(child),
            }),
        };
        client.handshake()?;
        Ok(client)
    }

    /// Wrap pre-connected streams (in-process agents, tests).
    pub fn from_streams(
        rx: impl Read + Send + 'static,
        tx: impl Write + Send + 'static,
    ) -> FioClient {
        FioClient {
            inner: Mutex::new(Pipes {
                tx: Box::new(BufWriter::new(tx)),
                rx: Box::new(BufReader::new(rx)),
                fd_slots: 0,
                child: None,
            }),
        }
    }

    /// AGENT_VERSION exchange; version skew is fatal before any work.
    pub fn handshake(&self) -> anyhow::Result<()> {
        let (hdr, payload) = self.call(Cop::AgentVersion, 0, 0, &[])?;
        let version_str = String::from_utf8_lossy(&payload).to_string();
        if hdr.arg != AGENT_PROTOCOL_VERSION as u64 {
            return Err(anyhow::Error::new(ProtocolError::VersionMismatch {
                agent: hdr.arg,
                ours: AGENT_PROTOCOL_VERSION,
            })
            .context(format!("remote agent is version {version_str}")));
        }
        debug!("remote agent {version_str} connected");
        Ok(())
    }

    pub fn disconnect(&self) -> anyhow::Result<()> {
        let mut pipes = self.inner.lock().unwrap();
        write_frame(
            &mut pipes.tx,
            FioHeader::new(Cop::Disconnect, 0, 0, 0),
            &[],
        )?;
        pipes.tx.flush().map_err(ProtocolError::Io)?;
        let (hdr, _) = read_frame(&mut pipes.rx)?;
        if hdr.cop != Cop::Disconnected {
            return Err(anyhow::Error::new(ProtocolError::Unexpected {
                expected: Cop::Disconnected,
                got: hdr.cop,
            }));
        }
        if let Some(child) = pipes.child.as_mut() {
            let _ = child.wait();
        }
        Ok(())
    }

    /// One request, one response frame. Locks the pipe for the exchange.
    fn call(
        &self,
        cop: Cop,
        handle: u32,
        arg: u64,
        payload: &[u8],
    ) -> anyhow::Result<(FioHeader, Vec<u8>)> {
        let mut pipes = self.inner.lock().unwrap();
        write_frame(
            &mut pipes.tx,
            FioHeader::new(cop, handle, payload.len() as u32, arg),
            payload,
        )?;
        pipes.tx.flush().map_err(ProtocolError::Io)?;
        let frame = read_frame(&mut pipes.rx)?;
        Ok(frame)
    }

    /// Fire-and-forget request; any error is latched agent-side.
    fn cast(&self, cop: Cop, handle: u32, arg: u64, payload: &[u8]) -> anyhow::Result<()> {
        let mut pipes = self.inner.lock().unwrap();
        write_frame(
            &mut pipes.tx,
            FioHeader::new(cop, handle, payload.len() as u32, arg),
            payload,
        )?;
        Ok(())
    }

    /// Map an Error frame to `io::Error` via the errno it carries.
    fn expect_ok(&self, op: &str, frame: (FioHeader, Vec<u8>)) -> anyhow::Result<(FioHeader, Vec<u8>)> {
        let (hdr, payload) = frame;
        match hdr.cop {
            Cop::Error => {
                let msg = String::from_utf8_lossy(&payload).to_string();
                let io = std::io::Error::from_raw_os_error(hdr.arg as i32);
                if msg.is_empty() {
                    Err(anyhow::Error::new(io).context(format!("remote {op} failed")))
                } else {
                    Err(anyhow::anyhow!("remote {op} failed: {msg}"))
                }
            }
            Cop::Send => Ok((hdr, payload)),
            got => Err(anyhow::Error::new(ProtocolError::Unexpected {
                expected: Cop::Send,
                got,
            })),
        }
    }

    pub fn open(&self, path: &Utf8Path, mode: OpenMode) -> anyhow::Result<RemoteHandle> {
        let handle = {
            let mut pipes = self.inner.lock().unwrap();
            let slot = (0..FIO_FDMAX).find(|i| pipes.fd_slots & (1 << i) == 0);
            let Some(slot) = slot else {
                anyhow::bail!("no free remote file handles");
            };
            pipes.fd_slots |= 1 << slot;
            slot
        };
        let frame = self.call(Cop::Open, handle, mode as u64, path.as_str().as_bytes())?;
        match self.expect_ok("open", frame) {
            Ok(_) => Ok(RemoteHandle(handle)),
            Err(e) => {
                self.inner.lock().unwrap().fd_slots &= !(1 << handle);
                Err(e.context(format!("file \"{path}\"")))
            }
        }
    }

    pub fn close(&self, handle: RemoteHandle) -> anyhow::Result<()> {
        let frame = self.call(Cop::Close, handle.0, 0, &[])?;
        self.expect_ok("close", frame)?;
        self.inner.lock().unwrap().fd_slots &= !(1 << handle.0);
        Ok(())
    }

    pub fn write(&self, handle: RemoteHandle, data: &[u8]) -> anyhow::Result<()> {
        let frame = self.call(Cop::Write, handle.0, 0, data)?;
        self.expect_ok("write", frame)?;
        Ok(())
    }

    /// Batched small writes without per-call round trips; check
    /// [`FioClient::get_async_error`] at the next synchronization point.
    pub fn write_async(&self, handle: RemoteHandle, data: &[u8]) -> anyhow::Result<()> {
        self.cast(Cop::WriteAsync, handle.0, 0, data)
    }

    pub fn get_async_error(&self) -> anyhow::Result<()> {
        let (hdr, payload) = self.call(Cop::GetAsyncError, 0, 0, &[])?;
        if hdr.arg != 0 {
            anyhow::bail!(
                "remote agent error: {}",
                String::from_utf8_lossy(&payload)
            );
        }
        Ok(())
    }

    /// Compress locally, ship the small payload, let the agent inflate
    /// and write; errors latch like [`FioClient::write_async`].
    pub fn write_compressed_async(&self, handle: RemoteHandle, data: &[u8]) -> anyhow::Result<()> {
        use std::io::Write as _;
        let mut encoder = flate2::write::ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::default(),
        );
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();
        self.cast(
            Cop::WriteCompressedAsync,
            handle.0,
            data.len() as u64,
            &compressed,
        )
    }

    /// Read from the handle's current position.
    pub fn read(&self, handle: RemoteHandle, len: u32) -> anyhow::Result<Vec<u8>> {
        let frame = self.call(Cop::Read, handle.0, len as u64, &[])?;
        let (_, payload) = self.expect_ok("read", frame)?;
        Ok(payload)
    }

    pub fn pread(&self, handle: RemoteHandle, offset: u64, len: u32) -> anyhow::Result<Vec<u8>> {
        let frame = self.call(Cop::Pread, handle.0, offset, &len.to_le_bytes())?;
        let (_, payload) = self.expect_ok("pread", frame)?;
        Ok(payload)
    }

    pub fn seek(&self, handle: RemoteHandle, offset: u64) -> anyhow::Result<()> {
        let frame = self.call(Cop::Seek, handle.0, offset, &[])?;
        self.expect_ok("seek", frame)?;
        Ok(())
    }

    pub fn truncate(&self, handle: RemoteHandle, len: u64) -> anyhow::Result<()> {
        let frame = self.call(Cop::Truncate, handle.0, len, &[])?;
        self.expect_ok("truncate", frame)?;
        Ok(())
    }

    /// Raw directory listing (OPENDIR/READDIR/CLOSEDIR); [`Self::list_dir`]
    /// is the structured form used by the backup driver.
    pub fn read_dir_names(&self, path: &Utf8Path) -> anyhow::Result<Vec<String>> {
        let dir_handle = FIO_FDMAX - 1;
        let frame = self.call(Cop::Opendir, dir_handle, 0, path.as_str().as_bytes())?;
        self.expect_ok("opendir", frame)?;

        let mut names = Vec::new();
        loop {
            let frame = self.call(Cop::Readdir, dir_handle, 0, &[])?;
            let (_, payload) = self.expect_ok("readdir", frame)?;
            if payload.is_empty() {
                break;
            }
            names.push(String::from_utf8_lossy(&payload).to_string());
        }
        let frame = self.call(Cop::Closedir, dir_handle, 0, &[])?;
        self.expect_ok("closedir", frame)?;
        Ok(names)
    }

    pub fn stat(&self, path: &Utf8Path, follow: bool) -> anyhow::Result<Option<RemoteStat>> {
        let frame = self.call(Cop::Stat, 0, follow as u64, path.as_str().as_bytes())?;
        match frame.0.cop {
            Cop::Error if frame.0.arg == libc::ENOENT as u64 => Ok(None),
            _ => {
                let (_, payload) = self.expect_ok("stat", frame)?;
                Ok(Some(RemoteStat::decode(&payload)?))
            }
        }
    }

    pub fn access(&self, path: &Utf8Path) -> anyhow::Result<bool> {
        let frame = self.call(Cop::Access, 0, 0, path.as_str().as_bytes())?;
        match frame.0.cop {
            Cop::Send => Ok(true),
            Cop::Error if frame.0.arg == libc::ENOENT as u64 => Ok(false),
            _ => {
                self.expect_ok("access", frame)?;
                Ok(true)
            }
        }
    }

    pub fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> anyhow::Result<()> {
        let mut payload = from.as_str().as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(to.as_str().as_bytes());
        let frame = self.call(Cop::Rename, 0, 0, &payload)?;
        self.expect_ok("rename", frame)?;
        Ok(())
    }

    pub fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> anyhow::Result<()> {
        let mut payload = target.as_str().as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(link.as_str().as_bytes());
        let frame = self.call(Cop::Symlink, 0, 0, &payload)?;
        self.expect_ok("symlink", frame)?;
        Ok(())
    }

    pub fn unlink(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let frame = self.call(Cop::Unlink, 0, 0, path.as_str().as_bytes())?;
        self.expect_ok("unlink", frame)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Utf8Path, mode: u32) -> anyhow::Result<()> {
        let frame = self.call(Cop::Mkdir, 0, mode as u64, path.as_str().as_bytes())?;
        self.expect_ok("mkdir", frame)?;
        Ok(())
    }

    pub fn chmod(&self, path: &Utf8Path, mode: u32) -> anyhow::Result<()> {
        let frame = self.call(Cop::Chmod, 0, mode as u64, path.as_str().as_bytes())?;
        self.expect_ok("chmod", frame)?;
        Ok(())
    }

    pub fn sync(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let frame = self.call(Cop::Sync, 0, 0, path.as_str().as_bytes())?;
        self.expect_ok("sync", frame)?;
        Ok(())
    }

    /// Remove a file or a whole directory tree.
    pub fn delete(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let frame = self.call(Cop::Delete, 0, 0, path.as_str().as_bytes())?;
        self.expect_ok("delete", frame)?;
        Ok(())
    }

    /// Small whole-file fetch; `None` if the file does not exist.
    pub fn load(&self, path: &Utf8Path) -> anyhow::Result<Option<Vec<u8>>> {
        let frame = self.call(Cop::Load, 0, 0, path.as_str().as_bytes())?;
        let (hdr, payload) = self.expect_ok("load", frame)?;
        Ok((hdr.arg != 0).then_some(payload))
    }

    pub fn get_crc32(&self, path: &Utf8Path) -> anyhow::Result<u32> {
        let frame = self.call(Cop::GetCrc32, 0, 0, path.as_str().as_bytes())?;
        let (hdr, _) = self.expect_ok("crc32", frame)?;
        Ok(hdr.arg as u32)
    }

    /// Per-block (checksum, lsn) map of a file on the agent side, for
    /// checksum-mode incremental restore of a remote destination.
    pub fn get_checksum_map(
        &self,
        path: &Utf8Path,
        checksum_version: u32,
        n_blocks: u32,
        stop_lsn: Lsn,
        segno: u32,
    ) -> anyhow::Result<Vec<Option<(u16, Lsn)>>> {
        let payload =
            super::agent::encode_map_request(path, n_blocks, stop_lsn, segno, checksum_version);
        let frame = self.call(Cop::GetChecksumMap, 0, 0, &payload)?;
        let (_, raw) = self.expect_ok("checksum map", frame)?;
        if raw.len() % 11 != 0 {
            anyhow::bail!("malformed checksum map response ({} bytes)", raw.len());
        }
        Ok(raw
            .chunks_exact(11)
            .map(|chunk| {
                (chunk[0] != 0).then(|| {
                    (
                        u16::from_le_bytes(chunk[1..3].try_into().unwrap()),
                        Lsn(u64::from_le_bytes(chunk[3..11].try_into().unwrap())),
                    )
                })
            })
            .collect())
    }

    /// Must-overwrite block map of a file on the agent side, for LSN-mode
    /// incremental restore.
    pub fn get_lsn_map(
        &self,
        path: &Utf8Path,
        checksum_version: u32,
        n_blocks: u32,
        shift_lsn: Lsn,
        segno: u32,
    ) -> anyhow::Result<crate::pagemap::PageMap> {
        let payload =
            super::agent::encode_map_request(path, n_blocks, shift_lsn, segno, checksum_version);
        let frame = self.call(Cop::GetLsnMap, 0, 0, &payload)?;
        let (_, raw) = self.expect_ok("lsn map", frame)?;
        Ok(crate::pagemap::PageMap::from_bytes(raw))
    }

    pub fn check_postmaster(&self, pgdata: &Utf8Path) -> anyhow::Result<Option<i32>> {
        let frame = self.call(Cop::CheckPostmaster, 0, 0, pgdata.as_str().as_bytes())?;
        let (hdr, _) = self.expect_ok("postmaster check", frame)?;
        Ok((hdr.arg != 0).then_some(hdr.arg as i32))
    }

    /// Enumerate a remote data directory (LIST_DIR).
    pub fn list_dir(&self, path: &Utf8Path, backup_logs: bool) -> anyhow::Result<Vec<PgFile>> {
        let frame = self.call(
            Cop::ListDir,
            0,
            backup_logs as u64,
            path.as_str().as_bytes(),
        )?;
        let (_, payload) = self.expect_ok("directory listing", frame)?;
        let text = String::from_utf8(payload).context("non-UTF8 directory listing")?;
        let mut files = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            files.push(PgFile::from_manifest_line(line).context("bad directory listing entry")?);
        }
        Ok(files)
    }

    /// Fetch a whole remote file into a local one, returning its size and
    /// CRC32C; `None` when the remote file vanished.
    pub fn send_file_to_local(
        &self,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> anyhow::Result<Option<(u64, u32)>> {
        let mut pipes = self.inner.lock().unwrap();
        write_frame(
            &mut pipes.tx,
            FioHeader::new(Cop::SendFile, 0, from.as_str().len() as u32, 0),
            from.as_str().as_bytes(),
        )?;
        pipes.tx.flush().map_err(ProtocolError::Io)?;

        let mut out: Option<BufWriter<File>> = None;
        let mut crc: u32 = 0;
        let mut size: u64 = 0;
        loop {
            let (hdr, payload) = read_frame(&mut pipes.rx)?;
            match hdr.cop {
                Cop::Page => {
                    if out.is_none() {
                        let f = File::create(to)
                            .with_context(|| format!("cannot open \"{to}\""))?;
                        out = Some(BufWriter::new(f));
                    }
                    out.as_mut()
                        .unwrap()
                        .write_all(&payload)
                        .with_context(|| format!("cannot write \"{to}\""))?;
                    crc = crc32c::crc32c_append(crc, &payload);
                    size += payload.len() as u64;
                }
                Cop::SendFileEof => {
                    match out {
                        Some(w) => {
                            let f = w.into_inner().map_err(|e| {
                                anyhow::anyhow!("cannot flush \"{to}\": {e}")
                            })?;
                            f.sync_all().with_context(|| format!("cannot sync \"{to}\""))?;
                        }
                        None => {
                            // zero-length remote file
                            File::create(to)
                                .with_context(|| format!("cannot create \"{to}\""))?;
                        }
                    }
                    return Ok(Some((size, crc)));
                }
                Cop::Error => {
                    if hdr.arg as i64 as i32 == FILE_MISSING {
                        return Ok(None);
                    }
                    anyhow::bail!(
                        "remote read of \"{from}\" failed: {}",
                        String::from_utf8_lossy(&payload)
                    );
                }
                got => {
                    return Err(anyhow::Error::new(ProtocolError::Unexpected {
                        expected: Cop::Page,
                        got,
                    }))
                }
            }
        }
    }

    /// The page-backup engine over the wire: the agent iterates,
    /// validates and classifies
    /// the blocks and streams back only the records to store; this side
    /// writes them into the backup file and the header map.
    #[allow(clippy::too_many_arguments)]
    pub fn backup_data_file_remote(
        &self,
        from_fullpath: &Utf8Path,
        to_fullpath: &Utf8Path,
        file: &PgFile,
        prev_start_lsn: Lsn,
        mode: BackupMode,
        calg: CompressAlg,
        clevel: i32,
        checksum_version: u32,
        hdr_map: &HeaderMapWriter,
        missing_ok: bool,
        cancel: &CancelToken,
    ) -> Result<DataFileBackupResult, ClassifiedError> {
        let run = || -> Result<DataFileBackupResult, ClassifiedError> {
            if file.size % 8192 != 0 {
                return Err(ClassifiedError::new(
                    ErrorKind::Format,
                    anyhow::anyhow!(
                        "file \"{from_fullpath}\": invalid file size {}",
                        file.size
                    ),
                ));
            }
            let horizon_lsn = match mode {
                BackupMode::Full => Lsn::INVALID,
                _ => prev_start_lsn,
            };
            let bitmap = file.pagemap.as_ref().map(|m| m.as_bytes()).unwrap_or(&[]);
            let req = SendPagesRequest {
                nblocks: (file.size / 8192) as u32,
                segno: file.segno,
                horizon_lsn: horizon_lsn.0,
                checksum_version,
                calg: calg_to_wire(calg),
                clevel,
                bitmapsize: bitmap.len() as u32,
                path_len: from_fullpath.as_str().len() as u32,
            };
            let mut payload = req.encode();
            payload.extend_from_slice(from_fullpath.as_str().as_bytes());
            payload.extend_from_slice(bitmap);

            let mut pipes = self.inner.lock().unwrap();
            write_frame(
                &mut pipes.tx,
                FioHeader::new(Cop::SendPages, 0, payload.len() as u32, 0),
                &payload,
            )
            .map_err(remote_err)?;
            pipes.tx.flush().map_err(|e| remote_err(ProtocolError::Io(e)))?;

            let mut out: Option<BufWriter<File>> = None;
            let mut crc: u32 = 0;
            let mut write_size: i64 = 0;
            let mut n_emitted: u64 = 0;

            loop {
                if cancel.is_cancelled() {
                    return Err(ClassifiedError::new(
                        ErrorKind::Policy,
                        anyhow::anyhow!("interrupted during page streaming"),
                    ));
                }
                let (hdr, frame_payload) = read_frame(&mut pipes.rx).map_err(remote_err)?;
                match hdr.cop {
                    Cop::Page => {
                        if out.is_none() {
                            let f = File::create(to_fullpath).map_err(|e| {
                                ClassifiedError::new(
                                    ErrorKind::SystemIo,
                                    anyhow::Error::new(e)
                                        .context(format!("cannot open \"{to_fullpath}\"")),
                                )
                            })?;
                            out = Some(BufWriter::new(f));
                        }
                        out.as_mut()
                            .unwrap()
                            .write_all(&frame_payload)
                            .map_err(|e| {
                                ClassifiedError::new(
                                    ErrorKind::SystemIo,
                                    anyhow::Error::new(e)
                                        .context(format!("cannot write \"{to_fullpath}\"")),
                                )
                            })?;
                        crc = crc32c::crc32c_append(crc, &frame_payload);
                        write_size += frame_payload.len() as i64;
                        n_emitted += 1;
                    }
                    Cop::SendFileEof => {
                        let n_read = hdr.arg as u32;
                        let coords = if frame_payload.is_empty() {
                            None
                        } else {
                            let headers = decode_headers(&frame_payload).map_err(|e| {
                                ClassifiedError::new(ErrorKind::Remote, e)
                            })?;
                            Some(hdr_map.append(&headers).map_err(|e| {
                                ClassifiedError::new(ErrorKind::SystemIo, e)
                            })?)
                        };

                        if n_emitted == 0 && n_read > 0 {
                            return Ok(DataFileBackupResult {
                                read_size: n_read as u64 * 8192,
                                write_size: BYTES_INVALID,
                                ..Default::default()
                            });
                        }
                        match out {
                            Some(w) => {
                                let f = w.into_inner().map_err(|e| {
                                    ClassifiedError::new(
                                        ErrorKind::SystemIo,
                                        anyhow::anyhow!("cannot flush \"{to_fullpath}\": {e}"),
                                    )
                                })?;
                                f.sync_all().map_err(|e| {
                                    ClassifiedError::new(
                                        ErrorKind::SystemIo,
                                        anyhow::Error::new(e)
                                            .context(format!("cannot sync \"{to_fullpath}\"")),
                                    )
                                })?;
                            }
                            None => {
                                File::create(to_fullpath).map_err(|e| {
                                    ClassifiedError::new(
                                        ErrorKind::SystemIo,
                                        anyhow::Error::new(e)
                                            .context(format!("cannot create \"{to_fullpath}\"")),
                                    )
                                })?;
                            }
                        }
                        return Ok(DataFileBackupResult {
                            read_size: n_read as u64 * 8192,
                            write_size,
                            uncompressed_size: n_emitted * 8192,
                            crc,
                            coords,
                        });
                    }
                    Cop::SendFileCorruption => {
                        let blkno = hdr.arg;
                        let msg = String::from_utf8_lossy(&frame_payload).to_string();
                        return Err(ClassifiedError::new(
                            ErrorKind::Format,
                            anyhow::anyhow!(
                                "corrupted page at block {blkno} of \"{from_fullpath}\": {msg}"
                            ),
                        ));
                    }
                    Cop::Error => {
                        let code = hdr.arg as i64 as i32;
                        if code == FILE_MISSING && missing_ok {
                            return Ok(DataFileBackupResult {
                                write_size: FILE_NOT_FOUND,
                                ..Default::default()
                            });
                        }
                        let msg = String::from_utf8_lossy(&frame_payload).to_string();
                        let kind = if code == FILE_MISSING {
                            ErrorKind::Missing
                        } else {
                            ErrorKind::SystemIo
                        };
                        return Err(ClassifiedError::new(
                            kind,
                            anyhow::anyhow!("remote backup of \"{from_fullpath}\" failed: {msg}"),
                        ));
                    }
                    got => {
                        return Err(remote_err(ProtocolError::Unexpected {
                            expected: Cop::Page,
                            got,
                        }));
                    }
                }
            }
        };

        let result = run();
        if result.is_err() {
            // half-written destinations are not a backup
            if let Err(e) = std::fs::remove_file(to_fullpath) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot remove partial file \"{to_fullpath}\": {e}");
                }
            }
        }
        result
    }
}

fn remote_err(e: ProtocolError) -> ClassifiedError {
    ClassifiedError::new(ErrorKind::Remote, anyhow::Error::new(e))
}

impl Drop for FioClient {
    fn drop(&mut self) {
        // best effort: the agent exits on pipe EOF anyway
        if let Ok(mut pipes) = self.inner.lock() {
            let _ = write_frame(
                &mut pipes.tx,
                FioHeader::new(Cop::Disconnect, 0, 0, 0),
                &[],
            );
            let _ = pipes.tx.flush();
            if let Some(child) = pipes.child.as_mut() {
                let _ = child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::agent::run_agent_on;
    use super::*;
    use crate::headermap::HeaderMapWriter;
    use crate::workers::CancelToken;
    use std::os::unix::net::UnixStream;

    /// Spin up a real agent loop in-process, connected over a socketpair.
    fn in_process_agent() -> (FioClient, std::thread::JoinHandle<()>) {
        let (driver_side, agent_side) = UnixStream::pair().unwrap();
        let agent_rx = agent_side.try_clone().unwrap();
        let handle = std::thread::spawn(move || {
            run_agent_on(agent_rx, agent_side).unwrap();
        });
        let client_rx = driver_side.try_clone().unwrap();
        let client = FioClient::from_streams(client_rx, driver_side);
        client.handshake().unwrap();
        (client, handle)
    }

    #[test]
    fn version_handshake_and_disconnect() {
        let (client, agent) = in_process_agent();
        client.disconnect().unwrap();
        agent.join().unwrap();
    }

    #[test]
    fn file_ops_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (client, agent) = in_process_agent();

        let path = dir.path().join("remote.bin");
        let h = client.open(&path, OpenMode::WriteTruncate).unwrap();
        client.write(h, b"hello ").unwrap();
        client.write_async(h, b"world").unwrap();
        client.get_async_error().unwrap();
        client.close(h).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");

        let st = client.stat(&path, true).unwrap().unwrap();
        assert_eq!(st.size, 11);
        assert!(client.access(&path).unwrap());
        assert_eq!(client.get_crc32(&path).unwrap(), crc32c::crc32c(b"hello world"));
        assert_eq!(client.load(&path).unwrap().unwrap(), b"hello world");

        let h = client.open(&path, OpenMode::Read).unwrap();
        assert_eq!(client.pread(h, 6, 5).unwrap(), b"world");
        client.seek(h, 0).unwrap();
        assert_eq!(client.read(h, 5).unwrap(), b"hello");
        client.close(h).unwrap();

        let names = client.read_dir_names(dir.path()).unwrap();
        assert!(names.contains(&"remote.bin".to_string()));

        let renamed = dir.path().join("renamed.bin");
        client.rename(&path, &renamed).unwrap();
        assert!(!client.access(&path).unwrap());
        client.unlink(&renamed).unwrap();
        assert!(client.stat(&renamed, true).unwrap().is_none());

        client.disconnect().unwrap();
        agent.join().unwrap();
    }

    #[test]
    fn async_error_is_latched_until_queried() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (client, agent) = in_process_agent();

        let path = dir.path().join("f");
        let h = client.open(&path, OpenMode::WriteTruncate).unwrap();
        client.close(h).unwrap();
        // writing to a closed handle latches instead of failing the call
        client.write_async(h, b"zzz").unwrap();
        assert!(client.get_async_error().is_err());
        // the latch is consumed
        client.get_async_error().unwrap();

        client.disconnect().unwrap();
        agent.join().unwrap();
    }

    #[test]
    fn send_file_streams_content() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (client, agent) = in_process_agent();

        let from = dir.path().join("src");
        let to = dir.path().join("dst");
        let content: Vec<u8> = (0..300_000u32).map(|i| i as u8).collect();
        std::fs::write(&from, &content).unwrap();

        let (size, crc) = client.send_file_to_local(&from, &to).unwrap().unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(crc, crc32c::crc32c(&content));
        assert_eq!(std::fs::read(&to).unwrap(), content);

        assert!(client
            .send_file_to_local(&dir.path().join("nope"), &to)
            .unwrap()
            .is_none());

        client.disconnect().unwrap();
        agent.join().unwrap();
    }

    #[test]
    fn remote_and_local_page_backup_agree() {
        use crate::catalog::BackupMode;
        use postgres_ffi::page::page_checksum;
        use postgres_ffi::pg_constants::{BLCKSZ, PG_PAGE_LAYOUT_VERSION, SIZEOF_PAGE_HEADER_DATA};

        let make_page = |lsn: u64, blkno: u32| -> Vec<u8> {
            let mut page = vec![0u8; BLCKSZ as usize];
            page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
            page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
            page[12..14].copy_from_slice(&(SIZEOF_PAGE_HEADER_DATA as u16).to_le_bytes());
            page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
            page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
            page[18..20].copy_from_slice(&(BLCKSZ | PG_PAGE_LAYOUT_VERSION as u16).to_le_bytes());
            let sum = page_checksum(&page, blkno);
            page[8..10].copy_from_slice(&sum.to_le_bytes());
            page
        };

        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("16384");
        let mut content = Vec::new();
        for blkno in 0..4u32 {
            content.extend_from_slice(&make_page(0x2000 + blkno as u64 * 0x100, blkno));
        }
        std::fs::write(&src, &content).unwrap();

        let file = PgFile::new("base/1/16384", 0o100600, content.len() as u64, 0);
        let cancel = CancelToken::new();

        // local
        let local_map = HeaderMapWriter::new(dir.path().join("hm_local"));
        let local_dst = dir.path().join("local.out");
        let local = crate::datafile::backup_data_file(
            &src,
            &local_dst,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::None,
            1,
            1,
            &local_map,
            true,
            &cancel,
        )
        .unwrap();

        // remote (E6 at the file level)
        let (client, agent) = in_process_agent();
        let remote_map = HeaderMapWriter::new(dir.path().join("hm_remote"));
        let remote_dst = dir.path().join("remote.out");
        let remote = client
            .backup_data_file_remote(
                &src,
                &remote_dst,
                &file,
                Lsn::INVALID,
                BackupMode::Full,
                CompressAlg::None,
                1,
                1,
                &remote_map,
                true,
                &cancel,
            )
            .unwrap();

        assert_eq!(local.write_size, remote.write_size);
        assert_eq!(local.crc, remote.crc);
        assert_eq!(
            std::fs::read(&local_dst).unwrap(),
            std::fs::read(&remote_dst).unwrap()
        );
        // identical header-map slices
        assert_eq!(
            std::fs::read(dir.path().join("hm_local")).unwrap(),
            std::fs::read(dir.path().join("hm_remote")).unwrap()
        );

        client.disconnect().unwrap();
        agent.join().unwrap();
    }

    #[test]
    fn remote_delta_skip_yields_bytes_invalid() {
        use crate::catalog::BackupMode;
        use postgres_ffi::page::page_checksum;
        use postgres_ffi::pg_constants::{BLCKSZ, PG_PAGE_LAYOUT_VERSION, SIZEOF_PAGE_HEADER_DATA};

        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("16385");
        let mut page = vec![0u8; BLCKSZ as usize];
        page[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
        page[12..14].copy_from_slice(&(SIZEOF_PAGE_HEADER_DATA as u16).to_le_bytes());
        page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[18..20].copy_from_slice(&(BLCKSZ | PG_PAGE_LAYOUT_VERSION as u16).to_le_bytes());
        let sum = page_checksum(&page, 0);
        page[8..10].copy_from_slice(&sum.to_le_bytes());
        std::fs::write(&src, &page).unwrap();

        let file = PgFile::new("base/1/16385", 0o100600, page.len() as u64, 0);
        let (client, agent) = in_process_agent();
        let map = HeaderMapWriter::new(dir.path().join("hm"));
        let dst = dir.path().join("out");
        let res = client
            .backup_data_file_remote(
                &src,
                &dst,
                &file,
                Lsn(0x9000),
                BackupMode::Delta,
                CompressAlg::None,
                1,
                1,
                &map,
                true,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(res.write_size, BYTES_INVALID);
        assert!(!dst.exists());

        client.disconnect().unwrap();
        agent.join().unwrap();
    }
}
