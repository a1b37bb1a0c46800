//! Per-file engine for relation data: iterate 8 KiB blocks (whole file or
//! via a page map), validate and classify each page, and emit only the
//! blocks worth storing; the inverse for restore, overlaying every backup
//! of a chain.
//!
//! The read-retry loop lives here on purpose: the database writer may
//! tear a write across the 8 KiB boundary, and a partial write self-heals
//! when the writer completes. Its failure semantics (300 attempts with a
//! 100 µs delay) are part of the backup's correctness guarantee.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::Utf8Path;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use postgres_ffi::page::{classify_page, PageClass, PageHeader};
use postgres_ffi::pg_constants::BLCKSZ;
use postgres_ffi::{BlockNumber, RELSEG_SIZE};
use utils::lsn::Lsn;

use crate::catalog::BackupMode;
use crate::config::CompressAlg;
use crate::error::{ClassifiedError, ErrorKind};
use crate::headermap::{HeaderMapCoords, HeaderMapWriter, PageHeader2};
use crate::pagemap::PageMap;
use crate::pgfile::{PgFile, BYTES_INVALID, FILE_NOT_FOUND};
use crate::workers::CancelToken;

pub const PAGE_READ_ATTEMPTS: u32 = 300;
const PAGE_RETRY_DELAY: Duration = Duration::from_micros(100);

const BLCKSZ_USZ: usize = BLCKSZ as usize;
/// Size of the per-block record header: `{block u32, compressed_size i32}`.
pub const SIZEOF_BACKUP_PAGE_HEADER: usize = 8;

/// What went wrong while scanning a data file. The remote agent maps
/// these onto its error frames; locally they map onto the error taxonomy.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("file is missing")]
    Missing,
    #[error("cannot open file: {0}")]
    Open(#[source] io::Error),
    #[error("cannot read block {blkno}: {source}")]
    Read {
        blkno: BlockNumber,
        #[source]
        source: io::Error,
    },
    #[error("corrupted page at block {blkno}: {msg}")]
    Corruption { blkno: BlockNumber, msg: String },
    #[error("invalid file size {0}: not a multiple of block size")]
    OddSize(u64),
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Sink(anyhow::Error),
}

impl ScanError {
    pub fn classify(self, path: &Utf8Path) -> ClassifiedError {
        let kind = match &self {
            ScanError::Missing => ErrorKind::Missing,
            ScanError::Open(_) | ScanError::Read { .. } | ScanError::Sink(_) => ErrorKind::SystemIo,
            ScanError::Corruption { .. } | ScanError::OddSize(_) => ErrorKind::Format,
            ScanError::Interrupted => ErrorKind::Policy,
        };
        ClassifiedError::new(kind, anyhow::Error::new(self).context(format!("file \"{path}\"")))
    }
}

/// Outcome of reading one block with the retry loop.
enum PageRead {
    /// File ended before this block (concurrent truncation).
    Eof,
    /// All zeroes: a valid uninitialized block.
    Zero,
    Valid { lsn: Lsn, checksum: u16 },
}

/// Read and classify one page, retrying while the header or checksum is
/// invalid. Accepts a page that turns all-zero on any attempt.
fn read_page_with_retry(
    file: &File,
    blkno: BlockNumber,
    absolute_blkno: BlockNumber,
    checksum_version: u32,
    buf: &mut [u8; BLCKSZ_USZ],
) -> Result<PageRead, ScanError> {
    let offset = blkno as u64 * BLCKSZ as u64;
    let mut last_failure = String::new();

    for attempt in 0..PAGE_READ_ATTEMPTS {
        let mut filled = 0usize;
        while filled < BLCKSZ_USZ {
            let n = file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|source| ScanError::Read { blkno, source })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(PageRead::Eof);
        }
        if filled < BLCKSZ_USZ {
            // writer truncated the file under us; the tail block is gone
            return Ok(PageRead::Eof);
        }

        match classify_page(buf, absolute_blkno, checksum_version, Lsn::INVALID) {
            PageClass::Zero => return Ok(PageRead::Zero),
            PageClass::Valid { lsn } => {
                let header = PageHeader::from_bytes(buf);
                return Ok(PageRead::Valid {
                    lsn,
                    checksum: header.pd_checksum,
                });
            }
            PageClass::HeaderInvalid => {
                last_failure = "page header is invalid".to_string();
            }
            PageClass::ChecksumMismatch { expected, found } => {
                last_failure = format!("page checksum {found}, expected {expected}");
            }
            PageClass::LsnFromFuture { .. } => unreachable!("no horizon given"),
        }

        if attempt + 1 < PAGE_READ_ATTEMPTS {
            std::thread::sleep(PAGE_RETRY_DELAY);
        }
    }

    Err(ScanError::Corruption {
        blkno,
        msg: last_failure,
    })
}

fn compress_payload(calg: CompressAlg, clevel: i32, page: &[u8]) -> Option<Vec<u8>> {
    match calg {
        CompressAlg::None | CompressAlg::Pglz => None,
        CompressAlg::Zlib => {
            let mut encoder =
                ZlibEncoder::new(Vec::with_capacity(1024), Compression::new(clevel as u32));
            // writing into a Vec cannot fail
            encoder.write_all(page).unwrap();
            let compressed = encoder.finish().unwrap();
            // storing a page that didn't shrink is pointless
            if compressed.is_empty() || compressed.len() >= BLCKSZ_USZ {
                None
            } else {
                Some(compressed)
            }
        }
    }
}

pub fn decompress_payload(calg: CompressAlg, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    match calg {
        CompressAlg::Zlib => {
            let mut decoder = ZlibDecoder::new(payload);
            let mut page = Vec::with_capacity(BLCKSZ_USZ);
            decoder
                .read_to_end(&mut page)
                .context("cannot decompress page")?;
            if page.len() != BLCKSZ_USZ {
                bail!("decompressed page has size {}", page.len());
            }
            Ok(page)
        }
        CompressAlg::None => bail!("compressed page in an uncompressed backup"),
        CompressAlg::Pglz => bail!("pglz compression is not supported"),
    }
}

/// One emitted block, handed to the scan sink as a ready-to-store record:
/// `{block_no u32, comp_size i32}` header followed by the payload
/// (`comp_size == BLCKSZ` means the payload is the raw page).
pub struct ScanPage<'a> {
    pub blkno: BlockNumber,
    pub lsn: Lsn,
    pub checksum: u16,
    pub record: &'a [u8],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub n_read: u32,
    pub n_emitted: u32,
    pub n_skipped: u32,
    pub read_bytes: u64,
    pub uncompressed_bytes: u64,
}

pub struct ScanOptions<'a> {
    pub nblocks: BlockNumber,
    pub segno: u32,
    /// Skip blocks whose page LSN predates this (incremental modes);
    /// `Lsn::INVALID` backs up every block.
    pub horizon_lsn: Lsn,
    pub checksum_version: u32,
    pub calg: CompressAlg,
    pub clevel: i32,
    pub pagemap: Option<&'a PageMap>,
    pub cancel: Option<&'a CancelToken>,
}

/// Iterate the blocks of one relation segment file, classify each page,
/// and feed the records to store into `sink`. Both the local backup path
/// and the remote agent's SEND_PAGES run on this.
pub fn scan_data_file(
    path: &Utf8Path,
    opts: &ScanOptions,
    sink: &mut dyn FnMut(ScanPage<'_>) -> anyhow::Result<()>,
) -> Result<ScanStats, ScanError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ScanError::Missing
        } else {
            ScanError::Open(e)
        }
    })?;

    let mut stats = ScanStats::default();
    let mut page_buf = [0u8; BLCKSZ_USZ];
    let mut record_buf: Vec<u8> = Vec::with_capacity(SIZEOF_BACKUP_PAGE_HEADER + BLCKSZ_USZ);

    let blocks: Box<dyn Iterator<Item = BlockNumber> + '_> = match opts.pagemap {
        Some(map) => Box::new(map.iter()),
        None => Box::new(0..opts.nblocks),
    };

    for blkno in blocks {
        if blkno >= opts.nblocks {
            // the page map may carry bits past a concurrent truncation
            break;
        }
        if opts.cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(ScanError::Interrupted);
        }

        let absolute_blkno = opts.segno * RELSEG_SIZE + blkno;
        let (lsn, checksum) = match read_page_with_retry(
            &file,
            blkno,
            absolute_blkno,
            opts.checksum_version,
            &mut page_buf,
        )? {
            PageRead::Eof => break,
            PageRead::Zero => (Lsn::INVALID, 0),
            PageRead::Valid { lsn, checksum } => {
                // Unchanged since the parent backup: a zeroed page never
                // hits this (its LSN is 0), so those are always stored.
                if opts.horizon_lsn.is_valid() && lsn.is_valid() && lsn < opts.horizon_lsn {
                    stats.n_read += 1;
                    stats.read_bytes += BLCKSZ as u64;
                    stats.n_skipped += 1;
                    continue;
                }
                (lsn, checksum)
            }
        };

        stats.n_read += 1;
        stats.read_bytes += BLCKSZ as u64;

        let compressed = compress_payload(opts.calg, opts.clevel, &page_buf);
        let (payload, comp_size) = match &compressed {
            Some(c) => (c.as_slice(), c.len() as i32),
            None => (&page_buf[..], BLCKSZ as i32),
        };

        record_buf.clear();
        record_buf.extend_from_slice(&blkno.to_le_bytes());
        record_buf.extend_from_slice(&comp_size.to_le_bytes());
        record_buf.extend_from_slice(payload);

        sink(ScanPage {
            blkno,
            lsn,
            checksum,
            record: &record_buf,
        })
        .map_err(ScanError::Sink)?;

        stats.n_emitted += 1;
        stats.uncompressed_bytes += BLCKSZ as u64;
    }

    Ok(stats)
}

/// Result of backing up one data file, to be merged into its manifest
/// entry by the driver after the workers join.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataFileBackupResult {
    pub read_size: u64,
    pub write_size: i64,
    pub uncompressed_size: u64,
    pub crc: u32,
    pub coords: Option<HeaderMapCoords>,
}

/// Back up one relation segment file into `to_fullpath`. Returns
/// `write_size == BYTES_INVALID` when every block was skipped (the
/// parent's copy is authoritative) and `FILE_NOT_FOUND` when the source
/// vanished.
#[allow(clippy::too_many_arguments)]
pub fn backup_data_file(
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
    if file.size % BLCKSZ as u64 != 0 {
        return Err(ScanError::OddSize(file.size).classify(from_fullpath));
    }

    let horizon_lsn = match mode {
        BackupMode::Full => Lsn::INVALID,
        BackupMode::Delta | BackupMode::Page | BackupMode::Ptrack => prev_start_lsn,
    };

    let opts = ScanOptions {
        nblocks: (file.size / BLCKSZ as u64) as BlockNumber,
        segno: file.segno,
        horizon_lsn,
        checksum_version,
        calg,
        clevel,
        pagemap: file.pagemap.as_ref(),
        cancel: Some(cancel),
    };

    let mut out: Option<BufWriter<File>> = None;
    let mut headers: Vec<PageHeader2> = Vec::new();
    let mut crc: u32 = 0;
    let mut pos: i64 = 0;

    let scan = scan_data_file(from_fullpath, &opts, &mut |page: ScanPage<'_>| {
        if out.is_none() {
            let f = File::create(to_fullpath)
                .with_context(|| format!("cannot open backup file \"{to_fullpath}\""))?;
            out = Some(BufWriter::new(f));
        }
        let w = out.as_mut().unwrap();
        w.write_all(page.record)
            .with_context(|| format!("cannot write backup file \"{to_fullpath}\""))?;
        crc = crc32c::crc32c_append(crc, page.record);
        headers.push(PageHeader2 {
            lsn: page.lsn,
            block: page.blkno,
            pos: pos as i32,
            checksum: page.checksum,
        });
        pos += page.record.len() as i64;
        Ok(())
    });

    let stats = match scan {
        Ok(stats) => stats,
        Err(ScanError::Missing) if missing_ok => {
            debug!("file \"{from_fullpath}\" is not found");
            return Ok(DataFileBackupResult {
                write_size: FILE_NOT_FOUND,
                ..Default::default()
            });
        }
        Err(e) => return Err(e.classify(from_fullpath)),
    };

    // Every iterated block was unchanged: drop the (never-created)
    // destination and let the parent's copy stand.
    if stats.n_emitted == 0 && stats.n_skipped > 0 {
        debug_assert!(out.is_none());
        return Ok(DataFileBackupResult {
            read_size: stats.read_bytes,
            write_size: BYTES_INVALID,
            ..Default::default()
        });
    }

    let coords = if headers.is_empty() {
        None
    } else {
        headers.push(PageHeader2 {
            lsn: Lsn::INVALID,
            block: 0,
            pos: pos as i32,
            checksum: 0,
        });
        Some(
            hdr_map
                .append(&headers)
                .map_err(|e| ClassifiedError::new(ErrorKind::SystemIo, e))?,
        )
    };

    match out {
        Some(w) => {
            let f = w
                .into_inner()
                .map_err(|e| anyhow::anyhow!("cannot flush \"{to_fullpath}\": {e}"))?;
            f.sync_all()
                .with_context(|| format!("cannot sync \"{to_fullpath}\""))?;
        }
        None => {
            // an empty relation file is stored as an empty file
            File::create(to_fullpath)
                .with_context(|| format!("cannot create \"{to_fullpath}\""))?;
        }
    }

    Ok(DataFileBackupResult {
        read_size: stats.read_bytes,
        write_size: pos,
        uncompressed_size: stats.uncompressed_bytes,
        crc,
        coords,
    })
}

/// One member of a restore chain that actually stores the file.
#[derive(Debug, Clone)]
pub struct RestoreSource {
    pub path: camino::Utf8PathBuf,
    pub compress_alg: CompressAlg,
}

/// Per-block knowledge about the pre-existing destination file, used by
/// incremental restore to avoid rewriting blocks that are already right.
pub enum IncrementalMap {
    /// For each existing block: its (checksum, lsn) if the page was valid.
    Checksum(Vec<Option<(u16, Lsn)>>),
    /// Blocks that must be overwritten (LSN at or past the shift point,
    /// or unreadable).
    Lsn(PageMap),
}

/// Restore one data file by overlaying the stored blocks of every backup
/// in the chain, FULL first; later backups overwrite earlier ones. The
/// destination is truncated to the target backup's recorded size.
pub fn restore_data_file_chain(
    sources: &[RestoreSource],
    to_fullpath: &Utf8Path,
    target_size: u64,
    incremental: Option<&IncrementalMap>,
) -> anyhow::Result<u64> {
    let out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(to_fullpath)
        .with_context(|| format!("cannot open restore target file \"{to_fullpath}\""))?;

    let mut written: u64 = 0;
    for source in sources {
        let in_file = File::open(&source.path)
            .with_context(|| format!("cannot open backup file \"{}\"", source.path))?;
        let mut reader = std::io::BufReader::new(in_file);
        written += apply_backup_records(
            &mut reader,
            source.compress_alg,
            &out,
            incremental,
            &source.path,
        )?;
    }

    out.set_len(target_size)
        .with_context(|| format!("cannot truncate \"{to_fullpath}\""))?;
    out.sync_all()
        .with_context(|| format!("cannot sync \"{to_fullpath}\""))?;
    Ok(written)
}

/// Sequentially apply the backup-page records of one stored file onto the
/// destination.
fn apply_backup_records(
    reader: &mut impl Read,
    calg: CompressAlg,
    out: &File,
    incremental: Option<&IncrementalMap>,
    from_path: &Utf8Path,
) -> anyhow::Result<u64> {
    let mut written = 0u64;
    loop {
        let mut hdr = [0u8; SIZEOF_BACKUP_PAGE_HEADER];
        match reader.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read \"{from_path}\""));
            }
        }
        let blkno = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let comp_size = i32::from_le_bytes(hdr[4..8].try_into().unwrap());

        if comp_size < 0 || comp_size > BLCKSZ as i32 {
            bail!("backup file \"{from_path}\" is broken at block {blkno}: compressed size {comp_size}");
        }

        let mut payload = vec![0u8; comp_size as usize];
        reader
            .read_exact(&mut payload)
            .with_context(|| format!("cannot read block {blkno} of \"{from_path}\""))?;

        let page = if comp_size == BLCKSZ as i32 {
            payload
        } else {
            decompress_payload(calg, &payload)
                .with_context(|| format!("block {blkno} of \"{from_path}\""))?
        };

        if let Some(map) = incremental {
            let skip = match map {
                IncrementalMap::Checksum(checksums) => {
                    let header = PageHeader::from_bytes(&page);
                    checksums
                        .get(blkno as usize)
                        .copied()
                        .flatten()
                        .is_some_and(|(cksum, lsn)| {
                            cksum == header.pd_checksum && lsn == header.pd_lsn
                        })
                }
                IncrementalMap::Lsn(need_overwrite) => !need_overwrite.contains(blkno),
            };
            if skip {
                continue;
            }
        }

        out.write_all_at(&page, blkno as u64 * BLCKSZ as u64)
            .with_context(|| format!("cannot write block {blkno}"))?;
        written += page.len() as u64;
    }
    Ok(written)
}

/// Build the per-block (checksum, lsn) map of an existing destination
/// file, for checksum-mode incremental restore. Unreadable or
/// future-LSN pages yield `None` (always rewritten).
pub fn get_checksum_map(
    fullpath: &Utf8Path,
    checksum_version: u32,
    n_blocks: BlockNumber,
    stop_lsn: Lsn,
    segno: u32,
) -> anyhow::Result<Vec<Option<(u16, Lsn)>>> {
    let file =
        File::open(fullpath).with_context(|| format!("cannot open file \"{fullpath}\""))?;
    let mut map = vec![None; n_blocks as usize];
    let mut buf = [0u8; BLCKSZ_USZ];

    for blkno in 0..n_blocks {
        let n = file
            .read_at(&mut buf, blkno as u64 * BLCKSZ as u64)
            .with_context(|| format!("cannot read block {blkno} of \"{fullpath}\""))?;
        if n < BLCKSZ_USZ {
            break;
        }
        let absolute_blkno = segno * RELSEG_SIZE + blkno;
        if let PageClass::Valid { lsn } =
            classify_page(&buf, absolute_blkno, checksum_version, stop_lsn)
        {
            let header = PageHeader::from_bytes(&buf);
            map[blkno as usize] = Some((header.pd_checksum, lsn));
        }
    }
    Ok(map)
}

/// Build the must-overwrite map of an existing destination file for
/// LSN-mode incremental restore: blocks whose page LSN is at or past
/// `shift_lsn`, plus anything unreadable.
pub fn get_lsn_map(
    fullpath: &Utf8Path,
    checksum_version: u32,
    n_blocks: BlockNumber,
    shift_lsn: Lsn,
    segno: u32,
) -> anyhow::Result<PageMap> {
    let file =
        File::open(fullpath).with_context(|| format!("cannot open file \"{fullpath}\""))?;
    let mut map = PageMap::new();
    let mut buf = [0u8; BLCKSZ_USZ];

    for blkno in 0..n_blocks {
        let n = file
            .read_at(&mut buf, blkno as u64 * BLCKSZ as u64)
            .with_context(|| format!("cannot read block {blkno} of \"{fullpath}\""))?;
        if n < BLCKSZ_USZ {
            map.add(blkno);
            continue;
        }
        let absolute_blkno = segno * RELSEG_SIZE + blkno;
        match classify_page(&buf, absolute_blkno, checksum_version, Lsn::INVALID) {
            PageClass::Valid { lsn } if lsn < shift_lsn => {}
            PageClass::Zero => {}
            _ => map.add(blkno),
        }
    }
    Ok(map)
}

/// Verify the stored records of one data file, preferably through its
/// header-map slice; backups that predate the header map are scanned
/// sequentially.
pub fn validate_file_pages(
    file: &PgFile,
    data_path: &Utf8Path,
    headers: Option<&[PageHeader2]>,
    calg: CompressAlg,
    checksum_version: u32,
    stop_lsn: Lsn,
) -> anyhow::Result<()> {
    let f = File::open(data_path)
        .with_context(|| format!("cannot open backup file \"{data_path}\""))?;
    let mut reader = std::io::BufReader::new(f);

    let mut validate_one = |blkno: BlockNumber,
                            page: &[u8],
                            expected: Option<&PageHeader2>|
     -> anyhow::Result<()> {
        let absolute_blkno = file.segno * RELSEG_SIZE + blkno;
        match classify_page(page, absolute_blkno, checksum_version, stop_lsn) {
            PageClass::Valid { lsn } => {
                if let Some(h) = expected {
                    if h.lsn != lsn || h.checksum != PageHeader::from_bytes(page).pd_checksum {
                        bail!(
                            "block {blkno} of \"{}\" does not match its header map entry",
                            file.rel_path
                        );
                    }
                }
                Ok(())
            }
            PageClass::Zero => Ok(()),
            PageClass::LsnFromFuture { lsn } => {
                warn!(
                    "block {blkno} of \"{}\" has LSN {lsn} past stop LSN {stop_lsn}",
                    file.rel_path
                );
                Ok(())
            }
            bad => bail!(
                "block {blkno} of \"{}\" is corrupt in backup: {bad:?}",
                file.rel_path
            ),
        }
    };

    match headers {
        Some(headers) => {
            // entries minus the trailing sentinel
            for window in headers.windows(2) {
                let h = &window[0];
                let record_len = (window[1].pos - h.pos) as usize;
                reader
                    .seek(SeekFrom::Start(h.pos as u64))
                    .with_context(|| format!("cannot seek \"{data_path}\""))?;
                let mut record = vec![0u8; record_len];
                reader
                    .read_exact(&mut record)
                    .with_context(|| format!("cannot read \"{data_path}\""))?;

                let blkno = u32::from_le_bytes(record[0..4].try_into().unwrap());
                let comp_size = i32::from_le_bytes(record[4..8].try_into().unwrap());
                if blkno != h.block || comp_size as usize + SIZEOF_BACKUP_PAGE_HEADER != record_len
                {
                    bail!(
                        "header map entry for block {} of \"{}\" does not match the data file",
                        h.block,
                        file.rel_path
                    );
                }
                let payload = &record[SIZEOF_BACKUP_PAGE_HEADER..];
                let page;
                let page_ref: &[u8] = if comp_size == BLCKSZ as i32 {
                    payload
                } else {
                    page = decompress_payload(calg, payload)?;
                    &page
                };
                validate_one(blkno, page_ref, Some(h))?;
            }
            Ok(())
        }
        None => {
            loop {
                let mut hdr = [0u8; SIZEOF_BACKUP_PAGE_HEADER];
                match reader.read_exact(&mut hdr) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        return Err(e).with_context(|| format!("cannot read \"{data_path}\""))
                    }
                }
                let blkno = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
                let comp_size = i32::from_le_bytes(hdr[4..8].try_into().unwrap());
                if comp_size < 0 || comp_size > BLCKSZ as i32 {
                    bail!(
                        "backup file \"{data_path}\" is broken at block {blkno}: compressed size {comp_size}"
                    );
                }
                let mut payload = vec![0u8; comp_size as usize];
                reader
                    .read_exact(&mut payload)
                    .with_context(|| format!("cannot read \"{data_path}\""))?;
                let page;
                let page_ref: &[u8] = if comp_size == BLCKSZ as i32 {
                    &payload
                } else {
                    page = decompress_payload(calg, &payload)?;
                    &page
                };
                validate_one(blkno, page_ref, None)?;
            }
            Ok(())
        }
    }
}

/// Copy relation pages straight into a destination data file at their
/// block offsets (the catchup path): blocks come from the page map when
/// given, otherwise all of them; with a valid horizon, pages whose LSN
/// predates it are left alone. The destination is truncated to the
/// source size.
#[allow(clippy::too_many_arguments)]
pub fn catchup_data_file(
    from_fullpath: &Utf8Path,
    to_fullpath: &Utf8Path,
    file: &PgFile,
    horizon_lsn: Lsn,
    checksum_version: u32,
    pagemap: Option<&PageMap>,
    cancel: &CancelToken,
) -> Result<u64, ClassifiedError> {
    if file.size % BLCKSZ as u64 != 0 {
        return Err(ScanError::OddSize(file.size).classify(from_fullpath));
    }
    let opts = ScanOptions {
        nblocks: (file.size / BLCKSZ as u64) as BlockNumber,
        segno: file.segno,
        horizon_lsn,
        checksum_version,
        calg: CompressAlg::None,
        clevel: 0,
        pagemap,
        cancel: Some(cancel),
    };

    let out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(to_fullpath)
        .map_err(|e| {
            ClassifiedError::new(
                ErrorKind::SystemIo,
                anyhow::Error::new(e).context(format!("cannot open \"{to_fullpath}\"")),
            )
        })?;

    let mut written: u64 = 0;
    let scan = scan_data_file(from_fullpath, &opts, &mut |page: ScanPage<'_>| {
        let raw = &page.record[SIZEOF_BACKUP_PAGE_HEADER..];
        out.write_all_at(raw, page.blkno as u64 * BLCKSZ as u64)
            .with_context(|| format!("cannot write block {} of \"{to_fullpath}\"", page.blkno))?;
        written += raw.len() as u64;
        Ok(())
    });
    match scan {
        Ok(_) => {}
        Err(e) => return Err(e.classify(from_fullpath)),
    }

    out.set_len(file.size).map_err(|e| {
        ClassifiedError::new(
            ErrorKind::SystemIo,
            anyhow::Error::new(e).context(format!("cannot truncate \"{to_fullpath}\"")),
        )
    })?;
    out.sync_all().map_err(|e| {
        ClassifiedError::new(
            ErrorKind::SystemIo,
            anyhow::Error::new(e).context(format!("cannot sync \"{to_fullpath}\"")),
        )
    })?;
    Ok(written)
}

/// Copy a non-data file whole, computing the CRC32C of the stored bytes.
/// Returns `None` when the source vanished.
pub fn copy_non_data_file(
    from_fullpath: &Utf8Path,
    to_fullpath: &Utf8Path,
) -> anyhow::Result<Option<(u64, u32)>> {
    let mut in_file = match File::open(from_fullpath) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("cannot open source file \"{from_fullpath}\""))
        }
    };
    let out_file = File::create(to_fullpath)
        .with_context(|| format!("cannot open destination file \"{to_fullpath}\""))?;
    let mut writer = BufWriter::new(out_file);

    let mut crc: u32 = 0;
    let mut size: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = in_file
            .read(&mut buf)
            .with_context(|| format!("cannot read \"{from_fullpath}\""))?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        writer
            .write_all(&buf[..n])
            .with_context(|| format!("cannot write \"{to_fullpath}\""))?;
        size += n as u64;
    }
    let out_file = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("cannot flush \"{to_fullpath}\": {e}"))?;
    out_file
        .sync_all()
        .with_context(|| format!("cannot sync \"{to_fullpath}\""))?;
    Ok(Some((size, crc)))
}

/// CRC32C of a whole file's contents.
pub fn file_crc32(path: &Utf8Path) -> anyhow::Result<u32> {
    let mut file = File::open(path).with_context(|| format!("cannot open \"{path}\""))?;
    let mut crc: u32 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("cannot read \"{path}\""))?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
    }
    Ok(crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::page::page_checksum;
    use postgres_ffi::pg_constants::{PG_PAGE_LAYOUT_VERSION, SIZEOF_PAGE_HEADER_DATA};

    /// An initialized page with the given LSN and a correct checksum for
    /// the given absolute block number.
    fn make_page(lsn: Lsn, absolute_blkno: u32, filler: u8) -> Vec<u8> {
        let mut page = vec![filler; BLCKSZ_USZ];
        page[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
        page[4..8].copy_from_slice(&(lsn.0 as u32).to_le_bytes());
        page[10..12].copy_from_slice(&0u16.to_le_bytes()); // pd_flags
        page[12..14].copy_from_slice(&(SIZEOF_PAGE_HEADER_DATA as u16).to_le_bytes());
        page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[18..20]
            .copy_from_slice(&(BLCKSZ | PG_PAGE_LAYOUT_VERSION as u16).to_le_bytes());
        page[20..24].copy_from_slice(&0u32.to_le_bytes());
        let sum = page_checksum(&page, absolute_blkno);
        page[8..10].copy_from_slice(&sum.to_le_bytes());
        page
    }

    fn write_relfile(path: &Utf8Path, pages: &[Vec<u8>]) {
        let mut content = Vec::new();
        for p in pages {
            content.extend_from_slice(p);
        }
        std::fs::write(path, content).unwrap();
    }

    struct Fixture {
        dir: camino_tempfile::Utf8TempDir,
        hdr_map: HeaderMapWriter,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = camino_tempfile::tempdir().unwrap();
            let hdr_map = HeaderMapWriter::new(dir.path().join("page_header_map"));
            Fixture {
                dir,
                hdr_map,
                cancel: CancelToken::new(),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn backup(
            &self,
            src: &Utf8Path,
            dst: &Utf8Path,
            file: &PgFile,
            horizon: Lsn,
            mode: BackupMode,
            calg: CompressAlg,
        ) -> DataFileBackupResult {
            backup_data_file(
                src,
                dst,
                file,
                horizon,
                mode,
                calg,
                1,
                1,
                &self.hdr_map,
                true,
                &self.cancel,
            )
            .unwrap()
        }
    }

    #[test]
    fn full_backup_restore_roundtrip() {
        for calg in [CompressAlg::None, CompressAlg::Zlib] {
            let fx = Fixture::new();
            let src = fx.dir.path().join("16384");
            let dst = fx.dir.path().join("16384.backup");
            let restored = fx.dir.path().join("16384.restored");

            let pages = vec![
                make_page(Lsn(0x1000), 0, 1),
                vec![0u8; BLCKSZ_USZ], // zero page
                make_page(Lsn(0x3000), 2, 3),
            ];
            write_relfile(&src, &pages);

            let file = PgFile::new("base/1/16384", 0o100600, (BLCKSZ_USZ * 3) as u64, 0);
            let res = fx.backup(&src, &dst, &file, Lsn::INVALID, BackupMode::Full, calg);
            assert!(res.write_size > 0);
            assert_eq!(res.read_size, (BLCKSZ_USZ * 3) as u64);
            assert_eq!(res.coords.unwrap().n_headers, 3);

            restore_data_file_chain(
                &[RestoreSource {
                    path: dst.clone(),
                    compress_alg: calg,
                }],
                &restored,
                (BLCKSZ_USZ * 3) as u64,
                None,
            )
            .unwrap();

            let original = std::fs::read(&src).unwrap();
            let roundtripped = std::fs::read(&restored).unwrap();
            assert_eq!(original, roundtripped, "mismatch with {calg}");
        }
    }

    #[test]
    fn uncompressed_full_write_size_is_exact() {
        // E1: write_size of an uncompressed FULL copy is
        // nblocks * (header + page)
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst = fx.dir.path().join("16384.backup");
        let pages: Vec<_> = (0..17u32).map(|i| make_page(Lsn(0x1000), i, 0x11)).collect();
        write_relfile(&src, &pages);
        let file = PgFile::new("base/1/16384", 0o100600, (BLCKSZ_USZ * 17) as u64, 0);
        let res = fx.backup(
            &src,
            &dst,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::None,
        );
        assert_eq!(
            res.write_size,
            17 * (SIZEOF_BACKUP_PAGE_HEADER + BLCKSZ_USZ) as i64
        );
    }

    #[test]
    fn delta_skips_unchanged_blocks() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst_full = fx.dir.path().join("16384.full");
        let dst_delta = fx.dir.path().join("16384.delta");
        let restored = fx.dir.path().join("16384.restored");

        let old = vec![
            make_page(Lsn(0x1000), 0, 1),
            make_page(Lsn(0x1000), 1, 2),
        ];
        write_relfile(&src, &old);
        let file = PgFile::new("base/1/16384", 0o100600, (BLCKSZ_USZ * 2) as u64, 0);
        fx.backup(
            &src,
            &dst_full,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::None,
        );

        // block 1 changes after the "parent backup started" at 0x2000
        let new = vec![old[0].clone(), make_page(Lsn(0x5000), 1, 9)];
        write_relfile(&src, &new);
        let res = fx.backup(
            &src,
            &dst_delta,
            &file,
            Lsn(0x2000),
            BackupMode::Delta,
            CompressAlg::None,
        );
        // E2: exactly one block stored
        assert_eq!(
            res.write_size,
            (SIZEOF_BACKUP_PAGE_HEADER + BLCKSZ_USZ) as i64
        );

        restore_data_file_chain(
            &[
                RestoreSource {
                    path: dst_full.clone(),
                    compress_alg: CompressAlg::None,
                },
                RestoreSource {
                    path: dst_delta.clone(),
                    compress_alg: CompressAlg::None,
                },
            ],
            &restored,
            (BLCKSZ_USZ * 2) as u64,
            None,
        )
        .unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&src).unwrap());
    }

    #[test]
    fn all_blocks_skipped_yields_bytes_invalid() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst = fx.dir.path().join("16384.delta");

        write_relfile(&src, &[make_page(Lsn(0x1000), 0, 1)]);
        let file = PgFile::new("base/1/16384", 0o100600, BLCKSZ_USZ as u64, 0);
        let res = fx.backup(
            &src,
            &dst,
            &file,
            Lsn(0x2000),
            BackupMode::Delta,
            CompressAlg::None,
        );
        assert_eq!(res.write_size, BYTES_INVALID);
        assert!(!dst.exists());
    }

    #[test]
    fn vanished_source_yields_file_not_found() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("gone");
        let dst = fx.dir.path().join("gone.backup");
        let file = PgFile::new("base/1/99999", 0o100600, 0, 0);
        let res = fx.backup(
            &src,
            &dst,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::None,
        );
        assert_eq!(res.write_size, FILE_NOT_FOUND);
    }

    #[test]
    fn pagemap_limits_iteration() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst = fx.dir.path().join("16384.page");

        let pages: Vec<_> = (0..5u32).map(|i| make_page(Lsn(0x9000), i, 0x22)).collect();
        write_relfile(&src, &pages);
        let mut file = PgFile::new("base/1/16384", 0o100600, (BLCKSZ_USZ * 5) as u64, 0);
        let mut map = PageMap::new();
        map.add(1);
        map.add(4);
        file.pagemap = Some(map);

        let res = fx.backup(
            &src,
            &dst,
            &file,
            Lsn(0x100),
            BackupMode::Page,
            CompressAlg::None,
        );
        assert_eq!(
            res.write_size,
            2 * (SIZEOF_BACKUP_PAGE_HEADER + BLCKSZ_USZ) as i64
        );
    }

    #[test]
    fn persistent_corruption_is_an_error() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst = fx.dir.path().join("16384.backup");

        let mut page = make_page(Lsn(0x1000), 0, 1);
        page[8] ^= 0xFF; // break the stored checksum
        write_relfile(&src, &[page]);
        let file = PgFile::new("base/1/16384", 0o100600, BLCKSZ_USZ as u64, 0);

        let err = backup_data_file(
            &src,
            &dst,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::None,
            1,
            1,
            &fx.hdr_map,
            true,
            &fx.cancel,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
    }

    #[test]
    fn validate_pages_via_header_map() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst = fx.dir.path().join("16384.backup");

        let pages = vec![make_page(Lsn(0x1000), 0, 1), make_page(Lsn(0x2000), 1, 2)];
        write_relfile(&src, &pages);
        let mut file = PgFile::new("base/1/16384", 0o100600, (BLCKSZ_USZ * 2) as u64, 0);
        let res = fx.backup(
            &src,
            &dst,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::Zlib,
        );
        res.coords.unwrap().apply(&mut file);

        let headers =
            crate::headermap::get_data_file_headers(fx.hdr_map.path(), &file)
                .unwrap()
                .unwrap();
        validate_file_pages(
            &file,
            &dst,
            Some(&headers),
            CompressAlg::Zlib,
            1,
            Lsn(0x10000),
        )
        .unwrap();

        // sequential fallback works too
        validate_file_pages(&file, &dst, None, CompressAlg::Zlib, 1, Lsn(0x10000)).unwrap();

        // flip one payload byte: the stored page no longer validates
        let mut bytes = std::fs::read(&dst).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&dst, bytes).unwrap();
        assert!(validate_file_pages(
            &file,
            &dst,
            Some(&headers),
            CompressAlg::Zlib,
            1,
            Lsn(0x10000)
        )
        .is_err());
    }

    #[test]
    fn incremental_checksum_map_skips_identical_blocks() {
        let fx = Fixture::new();
        let src = fx.dir.path().join("16384");
        let dst = fx.dir.path().join("16384.backup");
        let restored = fx.dir.path().join("16384.restored");

        let pages = vec![make_page(Lsn(0x1000), 0, 1), make_page(Lsn(0x2000), 1, 2)];
        write_relfile(&src, &pages);
        let file = PgFile::new("base/1/16384", 0o100600, (BLCKSZ_USZ * 2) as u64, 0);
        fx.backup(
            &src,
            &dst,
            &file,
            Lsn::INVALID,
            BackupMode::Full,
            CompressAlg::None,
        );

        // destination already has block 0 right but block 1 stale
        let stale = vec![pages[0].clone(), make_page(Lsn(0x500), 1, 7)];
        write_relfile(&restored, &stale);
        let map = get_checksum_map(&restored, 1, 2, Lsn(0x10000), 0).unwrap();
        assert!(map[0].is_some());

        restore_data_file_chain(
            &[RestoreSource {
                path: dst.clone(),
                compress_alg: CompressAlg::None,
            }],
            &restored,
            (BLCKSZ_USZ * 2) as u64,
            Some(&IncrementalMap::Checksum(map)),
        )
        .unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&src).unwrap());
    }
}
