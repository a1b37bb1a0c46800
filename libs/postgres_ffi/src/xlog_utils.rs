//
// This file contains common utilities for dealing with PostgreSQL WAL files and
// LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

use crate::{TimeLineID, TimestampTz, XLogSegNo};
use utils::lsn::Lsn;

pub const XLOG_FNAME_LEN: usize = 24;

/// Seconds between the PostgreSQL epoch (2000-01-01) and the Unix epoch.
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;
const USECS_PER_SEC: i64 = 1_000_000;

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(segno: XLogSegNo, offset: u32, wal_segsz_bytes: usize) -> Lsn {
    Lsn(segno * (wal_segsz_bytes as u64) + (offset as u64))
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, log_segno: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        log_segno / XLogSegmentsPerXLogId(wal_segsz_bytes),
        log_segno % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> Option<(XLogSegNo, TimeLineID)> {
    if !IsXLogFileName(fname) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u32::from_str_radix(&fname[8..16], 16).ok()? as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16).ok()? as XLogSegNo;
    Some((log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli))
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname.ends_with(".partial") && IsXLogFileName(&fname[0..fname.len() - 8])
}

#[allow(non_snake_case)]
pub fn IsBackupHistoryFileName(fname: &str) -> bool {
    fname.len() > XLOG_FNAME_LEN
        && fname.ends_with(".backup")
        && fname[0..XLOG_FNAME_LEN].chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsTLHistoryFileName(fname: &str) -> bool {
    fname.len() == 8 + ".history".len()
        && fname.ends_with(".history")
        && fname[0..8].chars().all(|c| c.is_ascii_hexdigit())
}

/// Name of the history file for the given timeline, e.g. `00000002.history`.
pub fn timeline_history_file_name(tli: TimeLineID) -> String {
    format!("{:>08X}.history", tli)
}

/// Convert a PostgreSQL timestamp (microseconds since 2000-01-01) to Unix
/// seconds.
pub fn timestamptz_to_unix(t: TimestampTz) -> i64 {
    t / USECS_PER_SEC + PG_EPOCH_OFFSET_SECS
}

/// Convert Unix seconds to a PostgreSQL timestamp.
pub fn unix_to_timestamptz(secs: i64) -> TimestampTz {
    (secs - PG_EPOCH_OFFSET_SECS) * USECS_PER_SEC
}

/// One line of a timeline history file: `tli` ended at `switchpoint`, and
/// the child timeline continues from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    pub switchpoint: Lsn,
}

/// Parse the contents of a `<tli>.history` file, based on
/// readTimeLineHistory() in timeline.c. Returns the ancestor entries in
/// file order (oldest first). The target timeline itself is not listed in
/// the file and is not appended here.
pub fn parse_timeline_history(content: &str) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();

    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let tli: TimeLineID = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty history line"))?
            .parse()
            .map_err(|_| {
                anyhow::anyhow!("syntax error in history file: expected a numeric timeline ID")
            })?;
        let switchpoint: Lsn = fields
            .next()
            .ok_or_else(|| {
                anyhow::anyhow!("syntax error in history file: expected a switchpoint location")
            })?
            .parse()
            .map_err(|_| {
                anyhow::anyhow!("syntax error in history file: expected a switchpoint location")
            })?;
        // the remainder of the line is a free-form comment

        if let Some(last) = entries.last() {
            if tli <= last.tli {
                anyhow::bail!("timeline IDs must be in increasing sequence");
            }
        }
        entries.push(TimelineHistoryEntry { tli, switchpoint });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        let seg_sz = 16 * 1024 * 1024;
        assert_eq!(XLogFileName(1, 1, seg_sz), "000000010000000000000001");
        // segment 256 rolls over into the next xlog id at 16 MiB segments
        assert_eq!(XLogFileName(1, 256, seg_sz), "000000010000000100000000");
        assert_eq!(
            XLogFromFileName("000000010000000100000000", seg_sz),
            Some((256, 1))
        );
        assert_eq!(XLogFromFileName("garbage", seg_sz), None);

        assert!(IsXLogFileName("00000001000000000000000A"));
        assert!(!IsXLogFileName("00000001000000000000000G"));
        assert!(IsPartialXLogFileName("00000001000000000000000A.partial"));
        assert!(IsTLHistoryFileName("00000002.history"));
        assert!(!IsTLHistoryFileName("0000000A"));
    }

    #[test]
    fn test_segment_names_1g() {
        // with 1 GiB segments there are only 4 segments per xlog id
        let seg_sz = 1024 * 1024 * 1024;
        assert_eq!(XLogFileName(3, 5, seg_sz), "000000030000000100000001");
    }

    #[test]
    fn test_history_parse() {
        let content = "# comment\n1\t0/16C9C70\tno recovery target specified\n\n2\t0/2000000\tbefore 2000-01-01\n";
        let entries = parse_timeline_history(content).unwrap();
        assert_eq!(
            entries,
            vec![
                TimelineHistoryEntry {
                    tli: 1,
                    switchpoint: Lsn(0x16C9C70)
                },
                TimelineHistoryEntry {
                    tli: 2,
                    switchpoint: Lsn(0x2000000)
                },
            ]
        );

        // out-of-order timelines are rejected
        assert!(parse_timeline_history("2\t0/1000\n1\t0/2000\n").is_err());
    }

    #[test]
    fn test_pg_epoch() {
        assert_eq!(timestamptz_to_unix(0), PG_EPOCH_OFFSET_SECS);
        let now = 1_700_000_000i64;
        assert_eq!(timestamptz_to_unix(unix_to_timestamptz(now)), now);
    }
}
