//! A minimal reader of `global/pg_control`, from pg_control.h.
//!
//! Only the handful of fields this tool consumes are decoded: the system
//! identifier (cluster identity checks), the latest checkpoint and its
//! redo LSN (incremental-restore horizon), the timeline, and the data
//! checksum version. The fixed offsets hold for the PostgreSQL 12–14
//! layout on 64-bit machines (MAXALIGN 8).

use crate::TimeLineID;
use utils::lsn::Lsn;

/// pg_control is stored in a fixed-size 8 KiB sector but only the
/// leading structure is meaningful.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;
const PG_CONTROL_MIN_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    /// Latest checkpoint record location.
    pub checkpoint: Lsn,
    /// REDO start of the latest checkpoint.
    pub checkpoint_redo: Lsn,
    pub timeline: TimeLineID,
    /// 0 when data checksums are disabled.
    pub data_checksum_version: u32,
}

/* field offsets, ControlFileData with 8-byte alignment */
const OFFSET_SYSTEM_IDENTIFIER: usize = 0;
const OFFSET_PG_CONTROL_VERSION: usize = 8;
const OFFSET_CATALOG_VERSION_NO: usize = 12;
/* state u32 at 16, 4 bytes padding, time i64 at 24 */
const OFFSET_CHECKPOINT: usize = 32;
/* CheckPoint starts here: redo, then ThisTimeLineID */
const OFFSET_CHECKPOINT_REDO: usize = 40;
const OFFSET_TIMELINE: usize = 48;

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

impl ControlFileData {
    pub fn decode(buf: &[u8]) -> anyhow::Result<ControlFileData> {
        if buf.len() < PG_CONTROL_MIN_SIZE {
            anyhow::bail!("pg_control is only {} bytes", buf.len());
        }
        let pg_control_version = read_u32(buf, OFFSET_PG_CONTROL_VERSION);
        if !(1100..=1500).contains(&pg_control_version) {
            anyhow::bail!(
                "unsupported pg_control version {pg_control_version}"
            );
        }

        Ok(ControlFileData {
            system_identifier: read_u64(buf, OFFSET_SYSTEM_IDENTIFIER),
            pg_control_version,
            catalog_version_no: read_u32(buf, OFFSET_CATALOG_VERSION_NO),
            checkpoint: Lsn(read_u64(buf, OFFSET_CHECKPOINT)),
            checkpoint_redo: Lsn(read_u64(buf, OFFSET_CHECKPOINT_REDO)),
            timeline: read_u32(buf, OFFSET_TIMELINE),
            // the tail of ControlFileData moves between versions; the
            // checksum flag is found by its known distance from the end
            // of the fixed-offset prefix in 12-14
            data_checksum_version: locate_checksum_version(buf),
        })
    }
}

/// data_checksum_version sits after the variable middle section. Rather
/// than chase per-version offsets we accept either legal value found at
/// the 12-14 location, defaulting to "enabled unknown" = 0 on miss.
fn locate_checksum_version(buf: &[u8]) -> u32 {
    const OFFSET_DATA_CHECKSUM_VERSION_V12: usize = 224;
    if buf.len() >= OFFSET_DATA_CHECKSUM_VERSION_V12 + 4 {
        let v = read_u32(buf, OFFSET_DATA_CHECKSUM_VERSION_V12);
        if v <= 1 {
            return v;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_control() -> Vec<u8> {
        let mut buf = vec![0u8; PG_CONTROL_FILE_SIZE];
        buf[0..8].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        buf[8..12].copy_from_slice(&1300u32.to_le_bytes());
        buf[12..16].copy_from_slice(&202107181u32.to_le_bytes());
        buf[32..40].copy_from_slice(&0x2000060u64.to_le_bytes());
        buf[40..48].copy_from_slice(&0x2000028u64.to_le_bytes());
        buf[48..52].copy_from_slice(&3u32.to_le_bytes());
        buf[224..228].copy_from_slice(&1u32.to_le_bytes());
        buf
    }

    #[test]
    fn decode_known_fields() {
        let control = ControlFileData::decode(&synthetic_control()).unwrap();
        assert_eq!(control.system_identifier, 0x1122_3344_5566_7788);
        assert_eq!(control.pg_control_version, 1300);
        assert_eq!(control.checkpoint, Lsn(0x2000060));
        assert_eq!(control.checkpoint_redo, Lsn(0x2000028));
        assert_eq!(control.timeline, 3);
        assert_eq!(control.data_checksum_version, 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ControlFileData::decode(&[0u8; 64]).is_err());
        let mut bad = synthetic_control();
        bad[8..12].copy_from_slice(&9999u32.to_le_bytes());
        assert!(ControlFileData::decode(&bad).is_err());
    }
}
