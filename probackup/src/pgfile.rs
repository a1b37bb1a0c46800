//! Manifest entries: one [`PgFile`] per file, directory or symlink that a
//! backup knows about, with the per-file bookkeeping the engine needs
//! (sizes, CRC, data-file coordinates, page map, header-map coordinates).

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context};
use postgres_ffi::pg_constants::{DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID};
use postgres_ffi::{ForkNumber, Oid};

use crate::pagemap::PageMap;

/// `write_size` of a file that existed but was unchanged since the parent
/// backup and therefore was not re-stored.
pub const BYTES_INVALID: i64 = -1;
/// `write_size` of a file that vanished while the backup was running.
pub const FILE_NOT_FOUND: i64 = -2;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Information about a single file (or dir) in a backup.
#[derive(Debug)]
pub struct PgFile {
    /// Path relative to the data directory (or external directory),
    /// always '/'-separated.
    pub rel_path: String,
    /// protection (file type and permission)
    pub mode: u32,
    /// Size of the file on the source side.
    pub size: u64,
    /// st_mtime at enumeration time; only meaningful during backup.
    pub mtime: i64,
    /// Bytes actually read from the source.
    pub read_size: u64,
    /// Bytes stored in the backup, or one of [`BYTES_INVALID`] /
    /// [`FILE_NOT_FOUND`].
    pub write_size: i64,
    /// Size before compression and block headers.
    pub uncompressed_size: u64,
    /// CRC32C over the stored bytes.
    pub crc: u32,

    pub is_datafile: bool,
    pub tblspc_oid: Oid,
    pub db_oid: Oid,
    pub rel_oid: Oid,
    pub forkname: Option<ForkNumber>,
    pub segno: u32,

    /// Symlink target, if the entry is a symlink.
    pub linked: Option<String>,
    /// Ordinal of the external directory this entry came from; 0 for the
    /// data directory itself.
    pub external_dir_num: i32,

    /// Set while building an incremental backup when the parent backup
    /// also has this file.
    pub exists_in_prev: bool,
    /// Blocks to back up; `None` means the whole file.
    pub pagemap: Option<PageMap>,

    /* Coordinates in the backup's header map */
    pub n_headers: u32,
    pub hdr_crc: u32,
    pub hdr_off: i64,
    pub hdr_size: i32,

    /// Claim flag for the worker pool: test-and-set to take ownership.
    pub lock: AtomicBool,
}

impl Clone for PgFile {
    fn clone(&self) -> PgFile {
        PgFile {
            rel_path: self.rel_path.clone(),
            linked: self.linked.clone(),
            pagemap: self.pagemap.clone(),
            lock: AtomicBool::new(false),
            ..*self
        }
    }
}

impl PgFile {
    /// A fresh entry for a relative path; the datafile coordinates are
    /// parsed out of the path.
    pub fn new(rel_path: &str, mode: u32, size: u64, mtime: i64) -> PgFile {
        let mut file = PgFile {
            rel_path: rel_path.to_string(),
            mode,
            size,
            mtime,
            read_size: 0,
            write_size: 0,
            uncompressed_size: 0,
            crc: 0,
            is_datafile: false,
            tblspc_oid: 0,
            db_oid: 0,
            rel_oid: 0,
            forkname: None,
            segno: 0,
            linked: None,
            external_dir_num: 0,
            exists_in_prev: false,
            pagemap: None,
            n_headers: 0,
            hdr_crc: 0,
            hdr_off: 0,
            hdr_size: 0,
            lock: AtomicBool::new(false),
        };
        if file.is_regular() {
            file.parse_datafile_coordinates();
        }
        file
    }

    pub fn file_name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        !self.is_dir() && !self.is_symlink()
    }

    /// Claim this entry for processing. Returns true exactly once.
    pub fn try_claim(&self) -> bool {
        !self.lock.swap(true, Ordering::AcqRel)
    }

    pub fn clear_claim(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Decide whether this path is a relation data file and fill the
    /// (tablespace, db, relation, fork, segment) coordinates.
    ///
    /// Relation files live under `global/`, `base/<dbOid>/` or
    /// `pg_tblspc/<tsOid>/<version>/<dbOid>/` and are named
    /// `<relOid>[_<fork>][.<segno>]`. Only the main fork is treated as a
    /// data file; other forks are copied whole.
    fn parse_datafile_coordinates(&mut self) {
        let parts: Vec<&str> = self.rel_path.split('/').collect();

        let (tblspc_oid, db_oid, name) = match parts.as_slice() {
            ["global", name] => (GLOBALTABLESPACE_OID, 0, *name),
            ["base", db, name] => {
                let Ok(db) = db.parse::<Oid>() else { return };
                (DEFAULTTABLESPACE_OID, db, *name)
            }
            ["pg_tblspc", ts, _version, db, name] => {
                let (Ok(ts), Ok(db)) = (ts.parse::<Oid>(), db.parse::<Oid>()) else {
                    return;
                };
                (ts, db, *name)
            }
            _ => return,
        };

        // temp relations (t<backendid>_<reloid>) and helper files are not
        // relation storage
        let Some((rel, forkname, segno)) = parse_relfile_name(name) else {
            return;
        };

        self.tblspc_oid = tblspc_oid;
        self.db_oid = db_oid;
        self.rel_oid = rel;
        self.forkname = Some(forkname);
        self.segno = segno;
        self.is_datafile = forkname == ForkNumber::Main;
    }

    /// One manifest line: `key="value"` pairs. Unrecognized keys are
    /// ignored on read, so the format can grow.
    pub fn to_manifest_line(&self) -> String {
        let mut line = String::with_capacity(128);
        write!(
            line,
            "path=\"{}\" size=\"{}\" mode=\"{}\" mtime=\"{}\" is_datafile=\"{}\" \
             crc=\"{}\" write_size=\"{}\" uncompressed_size=\"{}\" is_partial_copy=\"0\"",
            self.rel_path,
            self.size,
            self.mode,
            self.mtime,
            self.is_datafile as u8,
            self.crc,
            self.write_size,
            self.uncompressed_size,
        )
        .unwrap();
        if self.is_datafile {
            write!(line, " segno=\"{}\"", self.segno).unwrap();
        }
        if self.external_dir_num != 0 {
            write!(line, " external_dir_num=\"{}\"", self.external_dir_num).unwrap();
        }
        if let Some(linked) = &self.linked {
            write!(line, " linked=\"{linked}\"").unwrap();
        }
        if self.n_headers > 0 {
            write!(
                line,
                " n_headers=\"{}\" hdr_crc=\"{}\" hdr_off=\"{}\" hdr_size=\"{}\"",
                self.n_headers, self.hdr_crc, self.hdr_off, self.hdr_size
            )
            .unwrap();
        }
        line
    }

    pub fn from_manifest_line(line: &str) -> anyhow::Result<PgFile> {
        let kv = parse_manifest_line(line)?;

        let mut path: Option<String> = None;
        let mut mode: u32 = 0;
        let mut size: u64 = 0;
        let mut mtime: i64 = 0;
        let mut crc: u32 = 0;
        let mut write_size: i64 = 0;
        let mut uncompressed_size: u64 = 0;
        let mut segno: u32 = 0;
        let mut external_dir_num: i32 = 0;
        let mut linked: Option<String> = None;
        let mut n_headers: u32 = 0;
        let mut hdr_crc: u32 = 0;
        let mut hdr_off: i64 = 0;
        let mut hdr_size: i32 = 0;

        for (key, value) in kv {
            fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
            where
                T::Err: std::error::Error + Send + Sync + 'static,
            {
                value
                    .parse()
                    .with_context(|| format!("manifest field {key}=\"{value}\""))
            }
            match key.as_str() {
                "path" => path = Some(value),
                "mode" => mode = parsed(&key, &value)?,
                "size" => size = parsed(&key, &value)?,
                "mtime" => mtime = parsed(&key, &value)?,
                "crc" => crc = parsed(&key, &value)?,
                "write_size" => write_size = parsed(&key, &value)?,
                "uncompressed_size" => uncompressed_size = parsed(&key, &value)?,
                "segno" => segno = parsed(&key, &value)?,
                "external_dir_num" => external_dir_num = parsed(&key, &value)?,
                "linked" => linked = Some(value),
                "n_headers" => n_headers = parsed(&key, &value)?,
                "hdr_crc" => hdr_crc = parsed(&key, &value)?,
                "hdr_off" => hdr_off = parsed(&key, &value)?,
                "hdr_size" => hdr_size = parsed(&key, &value)?,
                "is_partial_copy" => {
                    // only ever written by the enterprise compressed-storage
                    // variant; we refuse anything but the trivial value
                    if value != "0" {
                        bail!("unsupported is_partial_copy value \"{value}\"");
                    }
                }
                // is_datafile is re-derived from the path below
                _ => {}
            }
        }

        let path = path.context("manifest line without path")?;
        let mut file = PgFile::new(&path, mode, size, mtime);
        file.crc = crc;
        file.write_size = write_size;
        file.uncompressed_size = uncompressed_size;
        file.external_dir_num = external_dir_num;
        file.linked = linked;
        file.n_headers = n_headers;
        file.hdr_crc = hdr_crc;
        file.hdr_off = hdr_off;
        file.hdr_size = hdr_size;
        if file.is_datafile {
            file.segno = segno;
        }
        Ok(file)
    }
}

/// Parse `<relOid>[_<fork>][.<segno>]`. Returns None for names that are
/// not relation storage (temp tables, `pg_filenode.map`, `PG_VERSION`,
/// `pg_internal.init`, ...).
fn parse_relfile_name(name: &str) -> Option<(Oid, ForkNumber, u32)> {
    let (name, segno) = match name.split_once('.') {
        Some((base, seg)) => (base, seg.parse::<u32>().ok()?),
        None => (name, 0),
    };

    let (rel, fork) = match name.split_once('_') {
        Some((base, suffix)) => (base, ForkNumber::from_suffix(suffix)?),
        None => (name, ForkNumber::Main),
    };

    if rel.is_empty() || !rel.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((rel.parse().ok()?, fork, segno))
}

/// Scan a manifest line of `key="value"` tokens.
pub fn parse_manifest_line(line: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut result = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .with_context(|| format!("malformed manifest line: \"{line}\""))?;
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        if !rest.starts_with('"') {
            bail!("malformed manifest line (unquoted value): \"{line}\"");
        }
        rest = &rest[1..];
        let end = rest
            .find('"')
            .with_context(|| format!("malformed manifest line (unterminated value): \"{line}\""))?;
        result.push((key, rest[..end].to_string()));
        rest = rest[end + 1..].trim_start();
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datafile_detection() {
        let f = PgFile::new("base/13010/16384", 0o100600, 8192 * 3, 0);
        assert!(f.is_datafile);
        assert_eq!(f.tblspc_oid, DEFAULTTABLESPACE_OID);
        assert_eq!(f.db_oid, 13010);
        assert_eq!(f.rel_oid, 16384);
        assert_eq!(f.segno, 0);

        let f = PgFile::new("base/13010/16384.3", 0o100600, 8192, 0);
        assert!(f.is_datafile);
        assert_eq!(f.segno, 3);

        // non-main forks are not data files, but keep their coordinates
        let f = PgFile::new("base/13010/16384_fsm", 0o100600, 8192, 0);
        assert!(!f.is_datafile);
        assert_eq!(f.forkname, Some(ForkNumber::Fsm));

        let f = PgFile::new("global/1262", 0o100600, 8192, 0);
        assert!(f.is_datafile);
        assert_eq!(f.tblspc_oid, GLOBALTABLESPACE_OID);

        let f = PgFile::new("pg_tblspc/16500/PG_14_202107181/13010/16385", 0o100600, 0, 0);
        assert!(f.is_datafile);
        assert_eq!(f.tblspc_oid, 16500);

        for not_data in [
            "base/13010/pg_filenode.map",
            "base/13010/PG_VERSION",
            "base/13010/pg_internal.init",
            "base/13010/t3_16400",
            "postgresql.conf",
            "pg_twophase/00001234",
        ] {
            let f = PgFile::new(not_data, 0o100600, 0, 0);
            assert!(!f.is_datafile, "{not_data} misdetected as datafile");
        }
    }

    #[test]
    fn manifest_line_roundtrip() {
        let mut f = PgFile::new("base/13010/16384", 0o100600, 8192 * 17, 1700000000);
        f.crc = 0xDEADBEEF;
        f.write_size = 8192;
        f.uncompressed_size = 8192;
        f.n_headers = 1;
        f.hdr_crc = 42;
        f.hdr_off = 180;
        f.hdr_size = 36;

        let line = f.to_manifest_line();
        let parsed = PgFile::from_manifest_line(&line).unwrap();
        assert_eq!(parsed.rel_path, f.rel_path);
        assert_eq!(parsed.size, f.size);
        assert_eq!(parsed.crc, f.crc);
        assert_eq!(parsed.write_size, 8192);
        assert!(parsed.is_datafile);
        assert_eq!(parsed.n_headers, 1);
        assert_eq!(parsed.hdr_off, 180);
    }

    #[test]
    fn unknown_keys_ignored_and_partial_copy_rejected() {
        let line = "path=\"base/1/2\" size=\"0\" mode=\"33152\" future_key=\"x\"";
        PgFile::from_manifest_line(line).unwrap();

        let line = "path=\"base/1/2\" size=\"0\" is_partial_copy=\"1\"";
        assert!(PgFile::from_manifest_line(line).is_err());
    }

    #[test]
    fn vanished_and_unchanged_sentinels() {
        let line = "path=\"base/1/2\" size=\"8192\" mode=\"33152\" write_size=\"-1\"";
        let f = PgFile::from_manifest_line(line).unwrap();
        assert_eq!(f.write_size, BYTES_INVALID);

        let line = "path=\"base/1/2\" size=\"8192\" mode=\"33152\" write_size=\"-2\"";
        let f = PgFile::from_manifest_line(line).unwrap();
        assert_eq!(f.write_size, FILE_NOT_FOUND);
    }

    #[test]
    fn claim_is_exclusive() {
        let f = PgFile::new("base/1/2", 0o100600, 0, 0);
        assert!(f.try_claim());
        assert!(!f.try_claim());
        f.clear_claim();
        assert!(f.try_claim());
    }
}
