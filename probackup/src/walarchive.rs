//! A catalog of the WAL archive of one instance: which timelines exist,
//! which segments each one holds (and which are lost), how timelines
//! link to their parents, and which backups sit on which timeline.
//!
//! Timeline records live in an arena (`Vec<TimelineInfo>`); parents are
//! referred to by index, never by pointer.

use anyhow::Context;
use camino::Utf8PathBuf;
use tracing::warn;

use postgres_ffi::xlog_utils::{
    parse_timeline_history, timeline_history_file_name, IsBackupHistoryFileName,
    IsPartialXLogFileName, IsTLHistoryFileName, IsXLogFileName, TimelineHistoryEntry,
    XLogFromFileName,
};
use postgres_ffi::{TimeLineID, XLogSegNo};
use utils::lsn::Lsn;

use crate::catalog::{Backup, BackupId};
use crate::config::InstanceContext;

#[derive(Debug)]
pub struct TimelineInfo {
    pub tli: TimeLineID,
    /// Parent timeline id (0 if none) and its arena index, if its WAL is
    /// present in this archive.
    pub parent_tli: TimeLineID,
    pub parent: Option<usize>,
    /// Switchpoint from the parent; 0 if none.
    pub switchpoint: Lsn,
    pub begin_segno: XLogSegNo,
    pub end_segno: XLogSegNo,
    /// Segments really existing on disk, ascending.
    pub segments: Vec<XLogSegNo>,
    /// Space taken by regular WAL files.
    pub size: u64,
    /// Intervals `[from, to]` of segments that should exist but do not.
    pub lost_segments: Vec<(XLogSegNo, XLogSegNo)>,
    /// Ids of backups whose start timeline is this one, newest first.
    pub backups: Vec<BackupId>,
    /// Ancestor entries parsed from this timeline's history file.
    pub history: Vec<TimelineHistoryEntry>,
}

impl TimelineInfo {
    fn new(tli: TimeLineID) -> TimelineInfo {
        TimelineInfo {
            tli,
            parent_tli: 0,
            parent: None,
            switchpoint: Lsn::INVALID,
            begin_segno: 0,
            end_segno: 0,
            segments: Vec::new(),
            size: 0,
            lost_segments: Vec::new(),
            backups: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// Scan `wal/<instance>` and build the timeline arena, sorted by
/// timeline id ascending.
pub fn catalog_get_timelines(
    instance: &InstanceContext,
    backups: &[Backup],
) -> anyhow::Result<Vec<TimelineInfo>> {
    let wal_dir = &instance.wal_instance_path;
    let seg_size = instance.config.xlog_seg_size;

    let mut timelines: Vec<TimelineInfo> = Vec::new();
    let find_or_insert = |timelines: &mut Vec<TimelineInfo>, tli: TimeLineID| -> usize {
        match timelines.iter().position(|t| t.tli == tli) {
            Some(i) => i,
            None => {
                timelines.push(TimelineInfo::new(tli));
                timelines.len() - 1
            }
        }
    };

    if !wal_dir.is_dir() {
        return Ok(timelines);
    }

    let mut history_files: Vec<(TimeLineID, Utf8PathBuf)> = Vec::new();
    for entry in wal_dir
        .read_dir_utf8()
        .with_context(|| format!("cannot open WAL archive directory \"{wal_dir}\""))?
    {
        let entry = entry?;
        let name = entry.file_name();

        if IsXLogFileName(name) {
            let Some((segno, tli)) = XLogFromFileName(name, seg_size) else {
                continue;
            };
            let idx = find_or_insert(&mut timelines, tli);
            let info = &mut timelines[idx];
            info.segments.push(segno);
            info.size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        } else if IsTLHistoryFileName(name) {
            if let Ok(tli) = TimeLineID::from_str_radix(&name[0..8], 16) {
                history_files.push((tli, entry.path().to_owned()));
            }
        } else if IsPartialXLogFileName(name) || IsBackupHistoryFileName(name) {
            // in-flight or backup-history files don't participate in
            // retention accounting
        } else {
            warn!("unexpected file \"{name}\" in WAL archive");
        }
    }

    for (tli, path) in history_files {
        let idx = find_or_insert(&mut timelines, tli);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read history file \"{path}\""))?;
        let history = parse_timeline_history(&content)
            .with_context(|| format!("cannot parse history file \"{path}\""))?;
        if let Some(last) = history.last() {
            timelines[idx].parent_tli = last.tli;
            timelines[idx].switchpoint = last.switchpoint;
        }
        timelines[idx].history = history;
    }

    timelines.sort_by_key(|t| t.tli);

    // resolve arena indexes and per-timeline segment stats
    let parents: Vec<Option<usize>> = timelines
        .iter()
        .map(|t| {
            if t.parent_tli == 0 {
                None
            } else {
                timelines.iter().position(|p| p.tli == t.parent_tli)
            }
        })
        .collect();
    for (info, parent) in timelines.iter_mut().zip(parents) {
        info.parent = parent;
        info.segments.sort_unstable();
        info.begin_segno = info.segments.first().copied().unwrap_or(0);
        info.end_segno = info.segments.last().copied().unwrap_or(0);

        let mut prev: Option<XLogSegNo> = None;
        for &segno in &info.segments {
            if let Some(p) = prev {
                if segno > p + 1 {
                    info.lost_segments.push((p + 1, segno - 1));
                }
            }
            prev = Some(segno);
        }

        for backup in backups {
            if backup.tli == info.tli {
                info.backups.push(backup.id());
            }
        }
    }

    Ok(timelines)
}

/// Load the timeline history of `tli` from the archive. Timeline 1 has
/// no history file; for any other timeline a missing file is an error.
pub fn read_timeline_history(
    instance: &InstanceContext,
    tli: TimeLineID,
    strict: bool,
) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    if tli == 1 {
        return Ok(Vec::new());
    }
    let path = instance
        .wal_instance_path
        .join(timeline_history_file_name(tli));
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            parse_timeline_history(&content).with_context(|| format!("history file \"{path}\""))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !strict => Ok(Vec::new()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            anyhow::bail!("timeline {tli} does not exist in the WAL archive")
        }
        Err(e) => Err(e).with_context(|| format!("cannot read history file \"{path}\"")),
    }
}

/// Is a backup taken on timeline `backup_tli` (stopping at `stop_lsn`)
/// restorable on a timeline with the given history? True iff the history
/// contains a prefix ending at an LSN at or past the backup's stop LSN.
pub fn satisfy_timeline(
    history: &[TimelineHistoryEntry],
    target_tli: TimeLineID,
    backup_tli: TimeLineID,
    stop_lsn: Lsn,
) -> bool {
    if backup_tli == target_tli {
        return true;
    }
    history
        .iter()
        .any(|entry| entry.tli == backup_tli && stop_lsn <= entry.switchpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupMode;
    use crate::config::InstanceConfig;
    use postgres_ffi::pg_constants::WAL_SEGMENT_SIZE;
    use postgres_ffi::xlog_utils::XLogFileName;

    fn make_instance(dir: &camino::Utf8Path) -> InstanceContext {
        InstanceContext {
            name: "node".to_string(),
            backup_instance_path: dir.join("backups/node"),
            wal_instance_path: dir.join("wal/node"),
            config: InstanceConfig::default(),
        }
    }

    #[test]
    fn timeline_scan_with_gap() {
        let dir = camino_tempfile::tempdir().unwrap();
        let instance = make_instance(dir.path());
        std::fs::create_dir_all(&instance.wal_instance_path).unwrap();

        for segno in [1u64, 2, 5, 6] {
            let name = XLogFileName(1, segno, WAL_SEGMENT_SIZE);
            std::fs::write(instance.wal_instance_path.join(name), b"x").unwrap();
        }
        std::fs::write(
            instance.wal_instance_path.join("00000002.history"),
            "1\t0/5000028\tsplit\n",
        )
        .unwrap();
        let name = XLogFileName(2, 6, WAL_SEGMENT_SIZE);
        std::fs::write(instance.wal_instance_path.join(name), b"x").unwrap();

        let mut backup = Backup::new(BackupMode::Full, 1000);
        backup.tli = 1;
        let timelines = catalog_get_timelines(&instance, &[backup]).unwrap();

        assert_eq!(timelines.len(), 2);
        let t1 = &timelines[0];
        assert_eq!(t1.tli, 1);
        assert_eq!(t1.begin_segno, 1);
        assert_eq!(t1.end_segno, 6);
        assert_eq!(t1.lost_segments, vec![(3, 4)]);
        assert_eq!(t1.backups.len(), 1);

        let t2 = &timelines[1];
        assert_eq!(t2.tli, 2);
        assert_eq!(t2.parent_tli, 1);
        assert_eq!(t2.parent, Some(0));
        assert_eq!(t2.switchpoint, Lsn(0x5000028));
    }

    #[test]
    fn timeline_satisfaction() {
        let history = vec![
            TimelineHistoryEntry {
                tli: 1,
                switchpoint: Lsn(0x5000000),
            },
            TimelineHistoryEntry {
                tli: 2,
                switchpoint: Lsn(0x9000000),
            },
        ];
        // same timeline always works
        assert!(satisfy_timeline(&history, 3, 3, Lsn(0x100)));
        // ancestor before its switchpoint works
        assert!(satisfy_timeline(&history, 3, 1, Lsn(0x4000000)));
        // ancestor past its switchpoint does not
        assert!(!satisfy_timeline(&history, 3, 1, Lsn(0x6000000)));
        // unrelated timeline does not
        assert!(!satisfy_timeline(&history, 3, 7, Lsn(0x100)));
    }

    #[test]
    fn history_of_timeline_one_is_empty() {
        let dir = camino_tempfile::tempdir().unwrap();
        let instance = make_instance(dir.path());
        assert!(read_timeline_history(&instance, 1, true).unwrap().is_empty());
        assert!(read_timeline_history(&instance, 5, true).is_err());
        assert!(read_timeline_history(&instance, 5, false).unwrap().is_empty());
    }
}
