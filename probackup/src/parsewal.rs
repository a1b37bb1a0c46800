//! Reading the WAL archive for semantic content: the page-change map for
//! PAGE backups, validation that the archive is replayable, and recovery
//! time/xid extraction.

use std::collections::HashMap;

use anyhow::{bail, Context};
use camino::Utf8Path;
use tracing::{info, warn};

use postgres_ffi::waldecoder::{
    decode_record, record_timestamp, WalReaderError, WalStreamReader,
};
use postgres_ffi::xlog_utils::{timestamptz_to_unix, TimelineHistoryEntry};
use postgres_ffi::{ForkNumber, RelFileNode, TimeLineID, TransactionId, RELSEG_SIZE};
use utils::lsn::Lsn;

use crate::catalog::{format_time, Backup};
use crate::pagemap::PageMap;

/// A relation segment: the granularity at which page maps are kept.
pub type RelSegKey = (RelFileNode, u32);

/// Read WAL from `start` to `end` on the given timeline and collect the
/// modified main-fork blocks into per-relation-segment page maps. Any
/// gap or corruption before `end` is fatal: an
/// incomplete map would silently produce an unrestorable PAGE backup.
pub fn extract_page_map(
    archive_dir: &Utf8Path,
    wal_seg_size: usize,
    tli: TimeLineID,
    history: Vec<TimelineHistoryEntry>,
    start: Lsn,
    end: Lsn,
) -> anyhow::Result<HashMap<RelSegKey, PageMap>> {
    let mut reader = WalStreamReader::new(archive_dir, tli, start, wal_seg_size)
        .context("cannot read WAL archive")?
        .with_history(history);
    let mut maps: HashMap<RelSegKey, PageMap> = HashMap::new();

    loop {
        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => bail!(
                "WAL archive ends at {} before reaching {end}",
                reader.end_rec_ptr()
            ),
            Err(e) => return Err(anyhow::Error::new(e).context("cannot build page map")),
        };

        let decoded = decode_record(&record)
            .with_context(|| format!("cannot decode WAL record at {}", record.start_lsn))?;
        for block in &decoded.blocks {
            // Only the main fork takes part in the page map; other forks
            // are copied whole by the file-level engine.
            if block.forknum != ForkNumber::Main {
                continue;
            }
            let key = (block.rnode, block.blkno / RELSEG_SIZE);
            maps.entry(key)
                .or_default()
                .add(block.blkno % RELSEG_SIZE);
        }

        if reader.end_rec_ptr() >= end {
            break;
        }
    }

    info!(
        "page map built from WAL interval {start}..{end}: {} relation segments touched",
        maps.len()
    );
    Ok(maps)
}

/// First validation stage: the archive holds an unbroken record stream
/// from the
/// backup's start LSN to its stop LSN. On failure the caller downgrades
/// the backup to CORRUPT.
pub fn validate_wal_closure(
    backup: &Backup,
    archive_dir: &Utf8Path,
    wal_seg_size: usize,
    history: Vec<TimelineHistoryEntry>,
) -> anyhow::Result<()> {
    if backup.start_lsn.block_offset() == 0 {
        bail!(
            "invalid start_lsn value {} of backup {}",
            backup.start_lsn,
            backup.id()
        );
    }
    if backup.stop_lsn.block_offset() == 0 {
        bail!(
            "invalid stop_lsn value {} of backup {}",
            backup.stop_lsn,
            backup.id()
        );
    }

    let mut reader =
        WalStreamReader::new(archive_dir, backup.tli, backup.start_lsn, wal_seg_size)?
            .with_history(history);

    loop {
        match reader.read_record() {
            Ok(Some(_)) => {
                if reader.read_rec_ptr() == backup.stop_lsn {
                    return Ok(());
                }
                if reader.read_rec_ptr() > backup.stop_lsn {
                    // the stop LSN should itself be a record start
                    warn!(
                        "record at {} passed stop LSN {}",
                        reader.read_rec_ptr(),
                        backup.stop_lsn
                    );
                    return Ok(());
                }
            }
            Ok(None) => bail!(
                "there are not enough WAL records to restore from {} to {}",
                backup.start_lsn,
                backup.stop_lsn
            ),
            Err(e @ WalReaderError::SegmentAbsent { .. }) => {
                return Err(anyhow::Error::new(e));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!(
                    "there are not enough WAL records to restore from {} to {}",
                    backup.start_lsn, backup.stop_lsn
                )));
            }
        }
    }
}

/// A recovery target for restore/validate.
#[derive(Debug, Clone, Default)]
pub struct RecoveryTarget {
    pub time: Option<i64>,
    pub xid: Option<TransactionId>,
    pub lsn: Option<Lsn>,
    pub inclusive: bool,
    pub tli: Option<TimeLineID>,
}

impl RecoveryTarget {
    pub fn is_set(&self) -> bool {
        self.time.is_some() || self.xid.is_some() || self.lsn.is_some()
    }
}

/// Second validation stage: from the backup's stop LSN forward, the
/// archive
/// reaches the recovery target. Fails naming the latest reachable
/// `(timestamp, xid, LSN)` triple.
pub fn validate_wal_target(
    backup: &Backup,
    archive_dir: &Utf8Path,
    wal_seg_size: usize,
    history: Vec<TimelineHistoryEntry>,
    target: &RecoveryTarget,
) -> anyhow::Result<()> {
    // We can restore at least up to the backup end.
    let mut last_time = backup.recovery_time;
    let mut last_xid = backup.recovery_xid;
    let mut last_lsn = backup.stop_lsn;

    let reached = |time: Option<i64>, xid: TransactionId, lsn: Lsn| -> bool {
        if let Some(t) = target.xid {
            if xid == t {
                return true;
            }
        }
        if let (Some(t), Some(at)) = (target.time, time) {
            if at >= t {
                return true;
            }
        }
        if let Some(t) = target.lsn {
            if lsn >= t {
                return true;
            }
        }
        false
    };

    if reached(last_time, last_xid, last_lsn) {
        return Ok(());
    }

    let mut reader =
        WalStreamReader::new(archive_dir, backup.tli, backup.stop_lsn, wal_seg_size)?
            .with_history(history);

    loop {
        match reader.read_record() {
            Ok(Some(record)) => {
                last_lsn = record.start_lsn;
                if record.xid != 0 {
                    last_xid = record.xid;
                }
                if let Ok(decoded) = decode_record(&record) {
                    if let Some(ts) = record_timestamp(&record, &decoded) {
                        last_time = Some(timestamptz_to_unix(ts));
                    }
                }
                if reached(last_time, last_xid, last_lsn) {
                    return Ok(());
                }
            }
            Ok(None) | Err(WalReaderError::SegmentAbsent { .. }) => {
                let time_str = last_time.map(format_time).unwrap_or_else(|| "-".to_string());
                bail!(
                    "recovery can be done only up to time {time_str}, xid {last_xid} and LSN {last_lsn}: \
                     not enough WAL records in the archive to reach the recovery target"
                );
            }
            Err(e) => return Err(anyhow::Error::new(e)),
        }
    }
}

/// Latest recovery time and xid reachable by replaying the archive from
/// `start_lsn` through `stop_lsn`. All segments are expected present;
/// the driver waited for `stop_lsn` to be archived.
pub fn read_recovery_info(
    archive_dir: &Utf8Path,
    wal_seg_size: usize,
    tli: TimeLineID,
    start_lsn: Lsn,
    stop_lsn: Lsn,
) -> anyhow::Result<Option<(i64, TransactionId)>> {
    let mut reader = WalStreamReader::new(archive_dir, tli, start_lsn, wal_seg_size)?;
    let mut result = None;

    loop {
        match reader.read_record()? {
            Some(record) => {
                if record.start_lsn > stop_lsn {
                    break;
                }
                if let Ok(decoded) = decode_record(&record) {
                    if let Some(ts) = record_timestamp(&record, &decoded) {
                        result = Some((timestamptz_to_unix(ts), record.xid));
                    }
                }
                if reader.read_rec_ptr() == stop_lsn {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(result)
}

/// Does the archive contain a readable record at `lsn`?
pub fn wal_contains_lsn(
    archive_dir: &Utf8Path,
    wal_seg_size: usize,
    tli: TimeLineID,
    lsn: Lsn,
) -> bool {
    match WalStreamReader::new(archive_dir, tli, lsn, wal_seg_size) {
        Ok(mut reader) => matches!(reader.read_record(), Ok(Some(_))),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackupMode, BackupStatus};
    use postgres_ffi::pg_constants::{self, WAL_SEGMENT_SIZE};
    use postgres_ffi::waldecoder::test_utils::{block_touch_payload, WalBuilder};
    use postgres_ffi::xlog_utils::{unix_to_timestamptz, XLogFileName};

    const SEG: usize = WAL_SEGMENT_SIZE;

    fn rnode(rel: u32) -> RelFileNode {
        RelFileNode {
            spcnode: 1663,
            dbnode: 13010,
            relnode: rel,
        }
    }

    #[test]
    fn page_map_soundness() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut b = WalBuilder::new(1, SEG, 1);
        let start = b.append_record(1, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        b.append_record(
            2,
            pg_constants::RM_HEAP_ID,
            0,
            &block_touch_payload(rnode(16384), 7, &[]),
        );
        b.append_record(
            3,
            pg_constants::RM_HEAP_ID,
            0,
            &block_touch_payload(rnode(16384), RELSEG_SIZE + 1, &[]),
        );
        b.append_record(
            4,
            pg_constants::RM_HEAP_ID,
            0,
            &block_touch_payload(rnode(16500), 0, &[]),
        );
        let end = b.append_record(5, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        b.write_to_dir(dir.path());

        let maps =
            extract_page_map(dir.path(), SEG, 1, Vec::new(), start, end).unwrap();

        let seg0 = maps.get(&(rnode(16384), 0)).unwrap();
        assert!(seg0.contains(7));
        assert_eq!(seg0.n_set_bits(), 1);
        // block RELSEG_SIZE + 1 belongs to segment file 1, bit 1
        let seg1 = maps.get(&(rnode(16384), 1)).unwrap();
        assert!(seg1.contains(1));
        assert!(maps.contains_key(&(rnode(16500), 0)));
    }

    fn backup_for(start: Lsn, stop: Lsn) -> Backup {
        let mut backup = Backup::new(BackupMode::Full, 1_700_000_000);
        backup.status = BackupStatus::Ok;
        backup.tli = 1;
        backup.start_lsn = start;
        backup.stop_lsn = stop;
        backup
    }

    #[test]
    fn closure_detects_missing_segment() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut b = WalBuilder::new(1, SEG, 1);
        let start = b.append_record(1, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        let filler = vec![0u8; SEG];
        b.append_record(2, pg_constants::RM_XLOG_ID, 0, &filler);
        let stop = b.append_record(3, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        b.write_to_dir(dir.path());

        let backup = backup_for(start, stop);
        validate_wal_closure(&backup, dir.path(), SEG, Vec::new()).unwrap();

        // E5: a gap in the archive fails validation naming the segment
        std::fs::remove_file(dir.path().join(XLogFileName(1, 2, SEG))).unwrap();
        let err =
            validate_wal_closure(&backup, dir.path(), SEG, Vec::new()).unwrap_err();
        assert!(err.to_string().contains("is absent"), "{err:#}");
    }

    #[test]
    fn target_reachability() {
        let dir = camino_tempfile::tempdir().unwrap();
        let commit_at = 1_700_000_500i64;
        let mut b = WalBuilder::new(1, SEG, 1);
        let start = b.append_record(1, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        let stop = b.append_record(2, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        b.append_record(
            77,
            pg_constants::RM_XACT_ID,
            pg_constants::XLOG_XACT_COMMIT,
            &block_touch_payload(
                rnode(16384),
                1,
                &unix_to_timestamptz(commit_at).to_le_bytes(),
            ),
        );
        b.write_to_dir(dir.path());

        let backup = backup_for(start, stop);

        // xid target that exists
        validate_wal_target(
            &backup,
            dir.path(),
            SEG,
            Vec::new(),
            &RecoveryTarget {
                xid: Some(77),
                ..Default::default()
            },
        )
        .unwrap();

        // time target that exists
        validate_wal_target(
            &backup,
            dir.path(),
            SEG,
            Vec::new(),
            &RecoveryTarget {
                time: Some(commit_at - 10),
                ..Default::default()
            },
        )
        .unwrap();

        // unreachable xid: the error names the furthest point
        let err = validate_wal_target(
            &backup,
            dir.path(),
            SEG,
            Vec::new(),
            &RecoveryTarget {
                xid: Some(12345),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("xid 77"), "{err:#}");
    }

    #[test]
    fn recovery_info_finds_last_commit_time() {
        let dir = camino_tempfile::tempdir().unwrap();
        let t1 = 1_700_000_100i64;
        let t2 = 1_700_000_200i64;
        let mut b = WalBuilder::new(1, SEG, 1);
        let start = b.append_record(1, pg_constants::RM_XLOG_ID, 0, &[0; 8]);
        b.append_record(
            10,
            pg_constants::RM_XACT_ID,
            pg_constants::XLOG_XACT_COMMIT,
            &block_touch_payload(rnode(1), 0, &unix_to_timestamptz(t1).to_le_bytes()),
        );
        let stop = b.append_record(
            11,
            pg_constants::RM_XACT_ID,
            pg_constants::XLOG_XACT_COMMIT,
            &block_touch_payload(rnode(1), 1, &unix_to_timestamptz(t2).to_le_bytes()),
        );
        b.write_to_dir(dir.path());

        let info = read_recovery_info(dir.path(), SEG, 1, start, stop)
            .unwrap()
            .unwrap();
        assert_eq!(info, (t2, 11));
    }
}
