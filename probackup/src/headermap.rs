//! The per-backup `page_header_map`: for every block emitted into a data
//! file, `{lsn u64, block u32, pos i32, checksum u16}` little-endian.
//! Each data file owns a contiguous slice of the map, addressed from its
//! manifest entry (`hdr_off`, `hdr_size`, `hdr_crc`, `n_headers`), which
//! is what makes random-access restore possible without scanning the
//! whole backup file.
//!
//! A slice holds `n_headers + 1` entries: the trailing sentinel's `pos`
//! is the end offset of the last record in the data file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use anyhow::{bail, Context};
use bytes::{Buf, BufMut, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};

use utils::lsn::Lsn;

use crate::pgfile::PgFile;

pub const SIZEOF_PAGE_HEADER2: usize = 8 + 4 + 4 + 2;

/// One block's entry in the header map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader2 {
    pub lsn: Lsn,
    pub block: u32,
    /// Offset of the block's record in the backup data file.
    pub pos: i32,
    pub checksum: u16,
}

pub fn encode_headers(headers: &[PageHeader2]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(headers.len() * SIZEOF_PAGE_HEADER2);
    for h in headers {
        buf.put_u64_le(h.lsn.0);
        buf.put_u32_le(h.block);
        buf.put_i32_le(h.pos);
        buf.put_u16_le(h.checksum);
    }
    buf.to_vec()
}

pub fn decode_headers(mut buf: &[u8]) -> anyhow::Result<Vec<PageHeader2>> {
    if buf.len() % SIZEOF_PAGE_HEADER2 != 0 {
        bail!("header map slice has odd size {}", buf.len());
    }
    let mut headers = Vec::with_capacity(buf.len() / SIZEOF_PAGE_HEADER2);
    while buf.has_remaining() {
        headers.push(PageHeader2 {
            lsn: Lsn(buf.get_u64_le()),
            block: buf.get_u32_le(),
            pos: buf.get_i32_le(),
            checksum: buf.get_u16_le(),
        });
    }
    Ok(headers)
}

/// Coordinates of one file's slice, to be copied into its manifest entry.
#[derive(Debug, Clone, Copy)]
pub struct HeaderMapCoords {
    pub n_headers: u32,
    pub hdr_off: i64,
    pub hdr_size: i32,
    pub hdr_crc: u32,
}

impl HeaderMapCoords {
    pub fn apply(&self, file: &mut PgFile) {
        file.n_headers = self.n_headers;
        file.hdr_off = self.hdr_off;
        file.hdr_size = self.hdr_size;
        file.hdr_crc = self.hdr_crc;
    }
}

/// Append-only writer, shared by the backup workers behind a mutex.
pub struct HeaderMapWriter {
    path: Utf8PathBuf,
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    file: Option<File>,
    offset: i64,
}

impl HeaderMapWriter {
    pub fn new(path: Utf8PathBuf) -> HeaderMapWriter {
        HeaderMapWriter {
            path,
            inner: Mutex::new(WriterInner {
                file: None,
                offset: 0,
            }),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Append one file's headers (with the trailing sentinel already in
    /// place) and return the slice coordinates.
    pub fn append(&self, headers: &[PageHeader2]) -> anyhow::Result<HeaderMapCoords> {
        assert!(!headers.is_empty());
        let encoded = encode_headers(headers);
        let crc = crc32c::crc32c(&encoded);

        let mut inner = self.inner.lock().unwrap();
        if inner.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("cannot open header map \"{}\"", self.path))?;
            inner.file = Some(file);
        }
        let offset = inner.offset;
        let file = inner.file.as_mut().unwrap();
        file.write_all(&encoded)
            .with_context(|| format!("cannot write header map \"{}\"", self.path))?;
        inner.offset += encoded.len() as i64;

        Ok(HeaderMapCoords {
            n_headers: headers.len() as u32 - 1,
            hdr_off: offset,
            hdr_size: encoded.len() as i32,
            hdr_crc: crc,
        })
    }

    /// Flush and fsync; call after the workers joined.
    pub fn finish(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_mut() {
            file.sync_all()
                .with_context(|| format!("cannot sync header map \"{}\"", self.path))?;
        }
        Ok(())
    }
}

/// Read one file's headers back, verifying the slice CRC. Returns `None`
/// for files without header-map coordinates (backups taken before the
/// map existed); callers fall back to a sequential scan.
pub fn get_data_file_headers(
    map_path: &Utf8Path,
    file: &PgFile,
) -> anyhow::Result<Option<Vec<PageHeader2>>> {
    if file.n_headers == 0 {
        return Ok(None);
    }
    let mut f = File::open(map_path)
        .with_context(|| format!("cannot open header map \"{map_path}\""))?;
    f.seek(SeekFrom::Start(file.hdr_off as u64))
        .with_context(|| format!("cannot seek header map \"{map_path}\""))?;
    let mut buf = vec![0u8; file.hdr_size as usize];
    f.read_exact(&mut buf)
        .with_context(|| format!("cannot read header map \"{map_path}\""))?;

    let crc = crc32c::crc32c(&buf);
    if crc != file.hdr_crc {
        bail!(
            "header map for file \"{}\" is corrupt: CRC {crc}, expected {}",
            file.rel_path,
            file.hdr_crc
        );
    }

    let headers = decode_headers(&buf)?;
    if headers.len() != file.n_headers as usize + 1 {
        bail!(
            "header map for file \"{}\" has {} entries, expected {}",
            file.rel_path,
            headers.len(),
            file.n_headers + 1
        );
    }
    Ok(Some(headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_of(file_blocks: &[(u32, i32)]) -> Vec<PageHeader2> {
        let mut hs: Vec<PageHeader2> = file_blocks
            .iter()
            .map(|&(block, pos)| PageHeader2 {
                lsn: Lsn(0x1000 + block as u64),
                block,
                pos,
                checksum: 7,
            })
            .collect();
        let end = hs.last().map(|h| h.pos + 8200).unwrap_or(0);
        hs.push(PageHeader2 {
            lsn: Lsn::INVALID,
            block: 0,
            pos: end,
            checksum: 0,
        });
        hs
    }

    #[test]
    fn append_and_read_back() {
        let dir = camino_tempfile::tempdir().unwrap();
        let map_path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::new(map_path.clone());

        let h1 = headers_of(&[(0, 0), (3, 8200)]);
        let h2 = headers_of(&[(17, 0)]);
        let c1 = writer.append(&h1).unwrap();
        let c2 = writer.append(&h2).unwrap();
        writer.finish().unwrap();

        assert_eq!(c1.n_headers, 2);
        assert_eq!(c2.n_headers, 1);
        assert_eq!(c2.hdr_off, c1.hdr_size as i64);

        let mut f1 = PgFile::new("base/1/100", 0o100600, 8192 * 4, 0);
        c1.apply(&mut f1);
        let got = get_data_file_headers(&map_path, &f1).unwrap().unwrap();
        assert_eq!(got, h1);

        let mut f2 = PgFile::new("base/1/200", 0o100600, 8192 * 18, 0);
        c2.apply(&mut f2);
        let got = get_data_file_headers(&map_path, &f2).unwrap().unwrap();
        assert_eq!(got, h2);

        // damaged slice is detected
        let mut bytes = std::fs::read(&map_path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&map_path, bytes).unwrap();
        assert!(get_data_file_headers(&map_path, &f1).is_err());
    }

    #[test]
    fn files_without_headers_fall_back() {
        let dir = camino_tempfile::tempdir().unwrap();
        let map_path = dir.path().join("page_header_map");
        let f = PgFile::new("base/1/100", 0o100600, 8192, 0);
        assert!(get_data_file_headers(&map_path, &f).unwrap().is_none());
    }
}
