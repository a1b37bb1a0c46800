//! The backup catalog: everything stored under
//! `<catalog>/backups/<instance>/<id>/` and the in-memory [`Backup`]
//! record parsed from `backup.control`.
//!
//! Status transitions are linearized per backup by the advisory
//! `backup.pid` lock; every control-file rewrite goes through
//! write-to-temp-then-rename with fsync of both the file and the parent
//! directory.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tracing::warn;

use postgres_ffi::pg_constants::BLCKSZ;
use postgres_ffi::pg_constants::XLOG_BLCKSZ;
use postgres_ffi::{TimeLineID, TransactionId};
use utils::lock_file::{self, LockGuard};
use utils::lsn::Lsn;

use crate::config::{
    CompressAlg, InstanceContext, BACKUP_CONTROL_FILE, BACKUP_LOCK_FILE, DATABASE_DIR,
    DATABASE_FILE_LIST, PROGRAM_VERSION,
};
use crate::pgfile::PgFile;

/// Maximum length of a user note attached to a backup.
pub const MAX_NOTE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    /// Incremental via WAL-derived page maps.
    Page,
    /// Incremental via the in-database ptrack bitmap.
    Ptrack,
    /// Incremental via per-block LSN comparison.
    Delta,
}

impl FromStr for BackupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<BackupMode> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupMode::Full),
            "PAGE" => Ok(BackupMode::Page),
            "PTRACK" => Ok(BackupMode::Ptrack),
            "DELTA" => Ok(BackupMode::Delta),
            _ => bail!("invalid backup-mode \"{s}\""),
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupMode::Full => "FULL",
            BackupMode::Page => "PAGE",
            BackupMode::Ptrack => "PTRACK",
            BackupMode::Delta => "DELTA",
        })
    }
}

/// Current state of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    /// The record could not be read; placeholder entry.
    Invalid,
    Ok,
    Error,
    Running,
    Merging,
    /// Merged and awaiting the assignment of its new id.
    Merged,
    Deleting,
    Deleted,
    /// Completed but not validated yet.
    Done,
    /// Validity unknown: at least one ancestor is corrupted or missing.
    Orphan,
    Corrupt,
}

impl FromStr for BackupStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<BackupStatus> {
        match s {
            "INVALID" => Ok(BackupStatus::Invalid),
            "OK" => Ok(BackupStatus::Ok),
            "ERROR" => Ok(BackupStatus::Error),
            "RUNNING" => Ok(BackupStatus::Running),
            "MERGING" => Ok(BackupStatus::Merging),
            "MERGED" => Ok(BackupStatus::Merged),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DELETED" => Ok(BackupStatus::Deleted),
            "DONE" => Ok(BackupStatus::Done),
            "ORPHAN" => Ok(BackupStatus::Orphan),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            _ => bail!("invalid backup status \"{s}\""),
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Merged => "MERGED",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Done => "DONE",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        })
    }
}

/// Backup id: the start-time instant, encoded base-36 uppercase in paths
/// and user-facing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId(pub i64);

impl BackupId {
    pub const INVALID: BackupId = BackupId(0);
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base36enc(self.0))
    }
}

impl FromStr for BackupId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<BackupId> {
        Ok(BackupId(base36dec(s)?))
    }
}

pub fn base36enc(mut value: i64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

pub fn base36dec(s: &str) -> anyhow::Result<i64> {
    if s.is_empty() {
        bail!("empty backup id");
    }
    let mut value: i64 = 0;
    for c in s.chars() {
        let digit = c
            .to_digit(36)
            .with_context(|| format!("invalid backup id \"{s}\""))?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit as i64))
            .with_context(|| format!("backup id \"{s}\" out of range"))?;
    }
    Ok(value)
}

/// Information about a single backup, stored in `backup.control`.
#[derive(Debug, Clone)]
pub struct Backup {
    pub mode: BackupMode,
    pub status: BackupStatus,
    /// Same as `start_time`; the catalog id.
    pub start_time: i64,
    pub tli: TimeLineID,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub end_time: Option<i64>,
    /// Earliest moment the cluster can be restored to using this backup.
    pub recovery_time: Option<i64>,
    pub recovery_xid: TransactionId,
    /// Pinning: retention may not remove the backup before this moment.
    pub expire_time: Option<i64>,
    /// Parent backup id; `None` iff FULL.
    pub parent_backup: Option<BackupId>,
    /// For FULL backups in MERGING/MERGED state: the incremental backup
    /// this one is merging with.
    pub merge_dest_backup: Option<BackupId>,

    pub block_size: u32,
    pub wal_block_size: u32,
    pub checksum_version: u32,
    pub program_version: String,
    pub server_version: String,

    /// Was this backup taken in stream mode, i.e. does it carry all the
    /// WAL needed to reach consistency?
    pub stream: bool,
    pub data_bytes: i64,
    pub wal_bytes: i64,
    pub uncompressed_bytes: i64,
    pub pgdata_bytes: i64,

    pub compress_alg: CompressAlg,
    pub compress_level: i32,

    pub note: Option<String>,
    /// CRC32C over the `backup_content.control` byte stream.
    pub content_crc: u32,

    /// Full path of the backup directory; filled on load.
    pub root_dir: Utf8PathBuf,
}

impl Backup {
    pub fn new(mode: BackupMode, start_time: i64) -> Backup {
        Backup {
            mode,
            status: BackupStatus::Running,
            start_time,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            end_time: None,
            recovery_time: None,
            recovery_xid: 0,
            expire_time: None,
            parent_backup: None,
            merge_dest_backup: None,
            block_size: BLCKSZ as u32,
            wal_block_size: XLOG_BLCKSZ as u32,
            checksum_version: 0,
            program_version: PROGRAM_VERSION.to_string(),
            server_version: String::new(),
            stream: false,
            data_bytes: 0,
            wal_bytes: 0,
            uncompressed_bytes: 0,
            pgdata_bytes: 0,
            compress_alg: CompressAlg::None,
            compress_level: 1,
            note: None,
            content_crc: 0,
            root_dir: Utf8PathBuf::new(),
        }
    }

    pub fn id(&self) -> BackupId {
        BackupId(self.start_time)
    }

    pub fn is_full(&self) -> bool {
        self.mode == BackupMode::Full
    }

    /// A backup usable as a restore source or incremental parent.
    pub fn is_ok(&self) -> bool {
        matches!(self.status, BackupStatus::Ok | BackupStatus::Done)
    }

    pub fn is_pinned(&self, now: i64) -> bool {
        self.expire_time.is_some_and(|t| t > now)
    }

    pub fn database_dir(&self) -> Utf8PathBuf {
        self.root_dir.join(DATABASE_DIR)
    }

    pub fn control_path(&self) -> Utf8PathBuf {
        self.root_dir.join(BACKUP_CONTROL_FILE)
    }

    pub fn filelist_path(&self) -> Utf8PathBuf {
        self.root_dir.join(DATABASE_FILE_LIST)
    }

    pub fn lock_path(&self) -> Utf8PathBuf {
        self.root_dir.join(BACKUP_LOCK_FILE)
    }

    /// Serialize to `backup.control` contents.
    pub fn to_control_contents(&self) -> String {
        let mut out = String::new();
        out.push_str("#Configuration\n");
        out.push_str(&format!("backup-mode = {}\n", self.mode));
        out.push_str(&format!("stream = {}\n", self.stream));
        out.push_str(&format!("compress-alg = {}\n", self.compress_alg));
        out.push_str(&format!("compress-level = {}\n", self.compress_level));

        out.push_str("\n#Compatibility\n");
        out.push_str(&format!("block-size = {}\n", self.block_size));
        out.push_str(&format!("xlog-block-size = {}\n", self.wal_block_size));
        out.push_str(&format!("checksum-version = {}\n", self.checksum_version));
        out.push_str(&format!("program-version = {}\n", self.program_version));
        if !self.server_version.is_empty() {
            out.push_str(&format!("server-version = {}\n", self.server_version));
        }

        out.push_str("\n#Result backup info\n");
        out.push_str(&format!("timelineid = {}\n", self.tli));
        out.push_str(&format!("start-lsn = {}\n", self.start_lsn));
        out.push_str(&format!("stop-lsn = {}\n", self.stop_lsn));
        out.push_str(&format!("start-time = '{}'\n", format_time(self.start_time)));
        if let Some(t) = self.end_time {
            out.push_str(&format!("end-time = '{}'\n", format_time(t)));
        }
        out.push_str(&format!("recovery-xid = {}\n", self.recovery_xid));
        if let Some(t) = self.recovery_time {
            out.push_str(&format!("recovery-time = '{}'\n", format_time(t)));
        }
        if let Some(t) = self.expire_time {
            out.push_str(&format!("expire-time = '{}'\n", format_time(t)));
        }
        out.push_str(&format!("data-bytes = {}\n", self.data_bytes));
        out.push_str(&format!("wal-bytes = {}\n", self.wal_bytes));
        out.push_str(&format!(
            "uncompressed-bytes = {}\n",
            self.uncompressed_bytes
        ));
        out.push_str(&format!("pgdata-bytes = {}\n", self.pgdata_bytes));
        out.push_str(&format!("status = {}\n", self.status));
        if let Some(parent) = self.parent_backup {
            out.push_str(&format!("parent-backup-id = '{parent}'\n"));
        }
        if let Some(dest) = self.merge_dest_backup {
            out.push_str(&format!("merge-dest-id = '{dest}'\n"));
        }
        if let Some(note) = &self.note {
            out.push_str(&format!("note = '{note}'\n"));
        }
        if self.content_crc != 0 {
            out.push_str(&format!("content-crc = {}\n", self.content_crc));
        }
        out
    }

    pub fn from_control_contents(content: &str) -> anyhow::Result<Backup> {
        let kv = crate::config::parse_kv_file(content)?;
        let mut backup = Backup::new(BackupMode::Full, 0);
        let mut status: Option<BackupStatus> = None;

        for (key, value) in kv {
            match key.as_str() {
                "backup-mode" => backup.mode = value.parse()?,
                "stream" => backup.stream = value == "true",
                "compress-alg" => backup.compress_alg = value.parse()?,
                "compress-level" => backup.compress_level = value.parse()?,
                "block-size" => backup.block_size = value.parse()?,
                "xlog-block-size" => backup.wal_block_size = value.parse()?,
                "checksum-version" => backup.checksum_version = value.parse()?,
                "program-version" => backup.program_version = value,
                "server-version" => backup.server_version = value,
                "timelineid" => backup.tli = value.parse()?,
                "start-lsn" => {
                    backup.start_lsn = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid start-lsn \"{value}\""))?
                }
                "stop-lsn" => {
                    backup.stop_lsn = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid stop-lsn \"{value}\""))?
                }
                "start-time" => backup.start_time = parse_time(&value)?,
                "end-time" => backup.end_time = Some(parse_time(&value)?),
                "recovery-xid" => backup.recovery_xid = value.parse()?,
                "recovery-time" => backup.recovery_time = Some(parse_time(&value)?),
                "expire-time" => backup.expire_time = Some(parse_time(&value)?),
                "data-bytes" => backup.data_bytes = value.parse()?,
                "wal-bytes" => backup.wal_bytes = value.parse()?,
                "uncompressed-bytes" => backup.uncompressed_bytes = value.parse()?,
                "pgdata-bytes" => backup.pgdata_bytes = value.parse()?,
                "status" => status = Some(value.parse()?),
                "parent-backup-id" => backup.parent_backup = Some(value.parse()?),
                "merge-dest-id" => backup.merge_dest_backup = Some(value.parse()?),
                "note" => backup.note = Some(value),
                "content-crc" => backup.content_crc = value.parse()?,
                _ => {}
            }
        }

        backup.status = status.context("backup.control without status")?;
        if backup.start_time == 0 {
            bail!("backup.control without start-time");
        }
        if backup.is_full() && backup.parent_backup.is_some() {
            bail!("FULL backup with a parent-backup-id");
        }
        Ok(backup)
    }
}

pub fn format_time(secs: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());
    dt.format("%Y-%m-%d %H:%M:%S%z").to_string()
}

pub fn parse_time(s: &str) -> anyhow::Result<i64> {
    let dt = DateTime::<FixedOffset>::parse_from_str(s, "%Y-%m-%d %H:%M:%S%z")
        .with_context(|| format!("invalid timestamp \"{s}\""))?;
    Ok(dt.timestamp())
}

/// Read one backup record out of its directory. The caller is expected
/// to have at least a shared hold on the backup lock.
pub fn read_backup(root_dir: &Utf8Path) -> anyhow::Result<Backup> {
    let control_path = root_dir.join(BACKUP_CONTROL_FILE);
    let content = std::fs::read_to_string(&control_path)
        .with_context(|| format!("cannot read \"{control_path}\""))?;
    let mut backup = Backup::from_control_contents(&content)
        .with_context(|| format!("cannot parse \"{control_path}\""))?;
    backup.root_dir = root_dir.to_owned();
    Ok(backup)
}

/// Atomically rewrite `backup.control`.
pub fn write_backup(backup: &Backup) -> anyhow::Result<()> {
    let path = backup.control_path();
    utils::crashsafe::overwrite_file(&path, backup.to_control_contents().as_bytes())
        .with_context(|| format!("cannot write \"{path}\""))?;
    Ok(())
}

/// Change the status and persist it. The exclusive backup lock must be
/// held by the caller.
pub fn write_backup_status(backup: &mut Backup, status: BackupStatus) -> anyhow::Result<()> {
    backup.status = status;
    write_backup(backup)
}

/// Take the per-backup advisory lock: exclusive for any state mutation.
pub fn lock_backup(backup: &Backup) -> anyhow::Result<LockGuard> {
    lock_file::acquire(&backup.lock_path())
        .with_context(|| format!("cannot lock backup {}", backup.id()))
}

/// Verify no live process is mutating the backup; for read paths.
pub fn check_backup_unlocked(backup: &Backup) -> anyhow::Result<()> {
    lock_file::check_unlocked(&backup.lock_path())
        .with_context(|| format!("backup {} is in use", backup.id()))
}

/// Create the on-disk skeleton of a new backup.
pub fn init_backup_dir(backup: &mut Backup, instance: &InstanceContext) -> anyhow::Result<()> {
    let root = instance.backup_dir(&backup.id().to_string());
    if root.exists() {
        bail!("backup directory \"{root}\" already exists");
    }
    utils::crashsafe::create_dir_all(&root)?;
    utils::crashsafe::create_dir(root.join(DATABASE_DIR))?;
    backup.root_dir = root;
    Ok(())
}

/// Load every backup of an instance, newest first. Unreadable records
/// become INVALID placeholders so that `show` can surface them.
pub fn get_backup_list(instance: &InstanceContext) -> anyhow::Result<Vec<Backup>> {
    let mut backups = Vec::new();
    let dir = &instance.backup_instance_path;
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("cannot open instance directory \"{dir}\""))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Ok(id) = name.parse::<BackupId>() else {
            // stray directory, not a backup
            continue;
        };
        match read_backup(entry.path()) {
            Ok(backup) => backups.push(backup),
            Err(e) => {
                warn!("skipping unreadable backup {name}: {e:#}");
                let mut invalid = Backup::new(BackupMode::Full, id.0);
                invalid.status = BackupStatus::Invalid;
                invalid.root_dir = entry.path().to_owned();
                backups.push(invalid);
            }
        }
    }
    backups.sort_by_key(|b| std::cmp::Reverse(b.start_time));
    Ok(backups)
}

pub fn find_backup<'a>(list: &'a [Backup], id: BackupId) -> Option<&'a Backup> {
    list.iter().find(|b| b.id() == id)
}

/// Result of walking a backup's ancestry.
#[derive(Debug)]
pub enum ParentChain {
    /// Ancestry reaches a FULL backup and every link is OK/DONE.
    /// Ordered FULL first, the given backup last.
    Ok(Vec<Backup>),
    /// Ancestry reaches FULL but some link is not usable; the offender
    /// is carried alongside the (complete) chain.
    Invalid(Vec<Backup>, BackupId),
    /// A parent id does not exist in the catalog.
    Broken { missing: BackupId },
}

/// Walk parent links from `backup` to its FULL ancestor.
pub fn scan_parent_chain(backup: &Backup, list: &[Backup]) -> ParentChain {
    let mut chain = vec![backup.clone()];
    let mut current = backup.clone();

    while !current.is_full() {
        let Some(parent_id) = current.parent_backup else {
            // non-FULL backup without a parent link: the chain can never
            // converge
            return ParentChain::Broken {
                missing: BackupId::INVALID,
            };
        };
        match find_backup(list, parent_id) {
            Some(parent) => {
                chain.push(parent.clone());
                current = parent.clone();
            }
            None => return ParentChain::Broken { missing: parent_id },
        }
    }

    chain.reverse();
    if let Some(bad) = chain.iter().find(|b| !b.is_ok()) {
        let bad_id = bad.id();
        return ParentChain::Invalid(chain, bad_id);
    }
    ParentChain::Ok(chain)
}

/// Find the FULL ancestor, if the chain converges.
pub fn find_parent_full_backup(backup: &Backup, list: &[Backup]) -> Option<Backup> {
    match scan_parent_chain(backup, list) {
        ParentChain::Ok(chain) | ParentChain::Invalid(chain, _) => chain.into_iter().next(),
        ParentChain::Broken { .. } => None,
    }
}

/// Is `parent_id` an ancestor of `child` (inclusively, if asked)?
pub fn is_parent(parent_id: BackupId, child: &Backup, list: &[Backup], inclusive: bool) -> bool {
    if inclusive && child.id() == parent_id {
        return true;
    }
    let mut current = child.clone();
    while let Some(pid) = current.parent_backup {
        if pid == parent_id {
            return true;
        }
        match find_backup(list, pid) {
            Some(p) => current = p.clone(),
            None => return false,
        }
    }
    false
}

/// The latest usable backup on the given timeline, to serve as the parent
/// of a new incremental backup.
pub fn get_last_data_backup(list: &[Backup], tli: TimeLineID) -> Option<&Backup> {
    list.iter().find(|b| b.is_ok() && b.tli == tli)
}

/// Serialize the manifest, sorted by path, and return the CRC32C of the
/// written byte stream. The caller stores the CRC in `backup.control`.
pub fn write_backup_filelist(backup: &Backup, files: &mut [PgFile]) -> anyhow::Result<u32> {
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    let mut content = String::new();
    for file in files.iter() {
        content.push_str(&file.to_manifest_line());
        content.push('\n');
    }
    let crc = crc32c::crc32c(content.as_bytes());

    let path = backup.filelist_path();
    utils::crashsafe::overwrite_file(&path, content.as_bytes())
        .with_context(|| format!("cannot write \"{path}\""))?;
    Ok(crc)
}

/// Read the manifest back. With `strict`, a `content-crc` mismatch is an
/// error; otherwise it is only logged (the validate command downgrades
/// the backup itself).
pub fn get_backup_filelist(backup: &Backup, strict: bool) -> anyhow::Result<Vec<PgFile>> {
    let path = backup.filelist_path();
    let content =
        std::fs::read(&path).with_context(|| format!("cannot read \"{path}\""))?;

    if backup.content_crc != 0 {
        let crc = crc32c::crc32c(&content);
        if crc != backup.content_crc {
            let msg = format!(
                "invalid CRC of backup control file \"{path}\": {crc}, expected {}",
                backup.content_crc
            );
            if strict {
                bail!(msg);
            } else {
                warn!("{msg}");
            }
        }
    }

    let content = String::from_utf8(content)
        .with_context(|| format!("manifest \"{path}\" is not valid UTF-8"))?;
    let mut files = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        files.push(
            PgFile::from_manifest_line(line)
                .with_context(|| format!("cannot parse manifest \"{path}\""))?,
        );
    }
    Ok(files)
}

/// Attach or detach a pin. `ttl` seconds counts from the backup's
/// recovery time; an explicit expire-time wins.
pub fn pin_backup(
    backup: &mut Backup,
    ttl: Option<i64>,
    expire_time: Option<i64>,
) -> anyhow::Result<()> {
    let new_expire = match (ttl, expire_time) {
        (_, Some(t)) => Some(t),
        (Some(0), None) => None, // unpin
        (Some(ttl), None) => {
            let base = backup.recovery_time.unwrap_or(backup.start_time);
            Some(base + ttl)
        }
        (None, None) => return Ok(()),
    };

    if let Some(t) = new_expire {
        if t <= Utc::now().timestamp() {
            bail!("expire time for backup {} is in the past", backup.id());
        }
    }

    backup.expire_time = new_expire;
    write_backup(backup)
}

pub fn add_note(backup: &mut Backup, note: Option<&str>) -> anyhow::Result<()> {
    match note {
        None | Some("none") => backup.note = None,
        Some(text) => {
            if text.len() > MAX_NOTE_SIZE {
                bail!(
                    "backup note cannot exceed {MAX_NOTE_SIZE} bytes ({} given)",
                    text.len()
                );
            }
            if text.contains('\n') || text.contains('\'') {
                bail!("backup note may not contain newline or quote characters");
            }
            backup.note = Some(text.to_string());
        }
    }
    write_backup(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_roundtrip() {
        assert_eq!(base36enc(0), "0");
        assert_eq!(base36enc(35), "Z");
        assert_eq!(base36enc(36), "10");
        let t = 1_700_000_000i64;
        assert_eq!(base36dec(&base36enc(t)).unwrap(), t);
        // ids are case-insensitive on input
        assert_eq!(base36dec("qz6hqw").unwrap(), base36dec("QZ6HQW").unwrap());
        assert!(base36dec("no!").is_err());
    }

    fn sample_backup(mode: BackupMode, start_time: i64) -> Backup {
        let mut b = Backup::new(mode, start_time);
        b.tli = 1;
        b.start_lsn = Lsn(0x2000028);
        b.stop_lsn = Lsn(0x2000130);
        b.status = BackupStatus::Ok;
        b.checksum_version = 1;
        b.data_bytes = 123456;
        b.wal_bytes = 16 * 1024 * 1024;
        b
    }

    #[test]
    fn control_file_roundtrip() {
        let mut b = sample_backup(BackupMode::Delta, 1_700_000_000);
        b.parent_backup = Some(BackupId(1_699_000_000));
        b.end_time = Some(1_700_000_100);
        b.recovery_time = Some(1_700_000_099);
        b.note = Some("weekly".to_string());
        b.content_crc = 0xCAFE;
        b.compress_alg = CompressAlg::Zlib;

        let text = b.to_control_contents();
        let parsed = Backup::from_control_contents(&text).unwrap();
        assert_eq!(parsed.mode, BackupMode::Delta);
        assert_eq!(parsed.status, BackupStatus::Ok);
        assert_eq!(parsed.start_time, b.start_time);
        assert_eq!(parsed.start_lsn, b.start_lsn);
        assert_eq!(parsed.stop_lsn, b.stop_lsn);
        assert_eq!(parsed.parent_backup, b.parent_backup);
        assert_eq!(parsed.end_time, b.end_time);
        assert_eq!(parsed.recovery_time, b.recovery_time);
        assert_eq!(parsed.note.as_deref(), Some("weekly"));
        assert_eq!(parsed.content_crc, 0xCAFE);
        assert_eq!(parsed.compress_alg, CompressAlg::Zlib);
    }

    #[test]
    fn full_with_parent_is_rejected() {
        let mut b = sample_backup(BackupMode::Full, 1_700_000_000);
        b.parent_backup = Some(BackupId(1));
        let text = b.to_control_contents();
        assert!(Backup::from_control_contents(&text).is_err());
    }

    #[test]
    fn chain_resolution() {
        let mut full = sample_backup(BackupMode::Full, 100);
        let mut d1 = sample_backup(BackupMode::Delta, 200);
        d1.parent_backup = Some(full.id());
        let mut d2 = sample_backup(BackupMode::Delta, 300);
        d2.parent_backup = Some(d1.id());

        let list = vec![d2.clone(), d1.clone(), full.clone()];
        match scan_parent_chain(&d2, &list) {
            ParentChain::Ok(chain) => {
                let ids: Vec<_> = chain.iter().map(|b| b.start_time).collect();
                assert_eq!(ids, vec![100, 200, 300]);
            }
            other => panic!("unexpected chain state: {other:?}"),
        }

        assert!(is_parent(full.id(), &d2, &list, false));
        assert!(!is_parent(d2.id(), &full, &list, false));

        // break the middle link
        let list_broken = vec![d2.clone(), full.clone()];
        assert!(matches!(
            scan_parent_chain(&d2, &list_broken),
            ParentChain::Broken { missing } if missing == d1.id()
        ));

        // corrupt the middle link
        d1.status = BackupStatus::Corrupt;
        let list_bad = vec![d2.clone(), d1.clone(), full.clone()];
        assert!(matches!(
            scan_parent_chain(&d2, &list_bad),
            ParentChain::Invalid(_, bad) if bad == d1.id()
        ));
    }

    #[test]
    fn filelist_roundtrip_with_crc() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut b = sample_backup(BackupMode::Full, 1_700_000_000);
        b.root_dir = dir.path().to_owned();

        let mut files = vec![
            PgFile::new("base/1/3000", 0o100600, 8192, 0),
            PgFile::new("PG_VERSION", 0o100600, 3, 0),
            PgFile::new("base/1/1000", 0o100600, 16384, 0),
        ];
        let crc = write_backup_filelist(&b, &mut files).unwrap();
        b.content_crc = crc;
        write_backup(&b).unwrap();

        let loaded = read_backup(dir.path()).unwrap();
        let files = get_backup_filelist(&loaded, true).unwrap();
        // sorted by path
        let paths: Vec<_> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["PG_VERSION", "base/1/1000", "base/1/3000"]);

        // corrupting the manifest must trip the CRC in strict mode
        let manifest = loaded.filelist_path();
        let mut bytes = std::fs::read(&manifest).unwrap();
        bytes[0] ^= 1;
        std::fs::write(&manifest, bytes).unwrap();
        assert!(get_backup_filelist(&loaded, true).is_err());
    }

    #[test]
    fn time_format_roundtrip() {
        let t = 1_700_000_000i64;
        assert_eq!(parse_time(&format_time(t)).unwrap(), t);
        // local-offset timestamps from other writers parse too
        assert_eq!(
            parse_time("2023-11-14 25:13:20+0300").ok(),
            None,
        );
        assert!(parse_time("2023-11-14 22:13:20+0300").is_ok());
    }
}
