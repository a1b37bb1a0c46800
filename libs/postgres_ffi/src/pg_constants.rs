//!
//! Misc constants, copied from PostgreSQL headers.
//!
//! Only the ones this tool actually consumes are kept; it's nice to have
//! them all here in one place, and have the ability to add comments on
//! them.
//!

/// Size of a relation data block, from pg_config.h
pub const BLCKSZ: u16 = 8192;

/// Blocks per relation segment file (1 GiB at 8 KiB blocks), from pg_config.h
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / (BLCKSZ as u32);

/// Size of a WAL page, from pg_config.h
pub const XLOG_BLCKSZ: usize = 8192;

/// Default WAL segment size. The run-time value is a power of two between
/// [`WAL_SEGMENT_MIN_SIZE`] and [`WAL_SEGMENT_MAX_SIZE`].
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
pub const WAL_SEGMENT_MIN_SIZE: usize = 1024 * 1024;
pub const WAL_SEGMENT_MAX_SIZE: usize = 1024 * 1024 * 1024;

//
// From pg_tablespace_d.h
//
pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

//
// Fork numbers, from relpath.h
//
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

//
// From bufpage.h
//
pub const SIZEOF_PAGE_HEADER_DATA: usize = 24;
pub const PD_VALID_FLAG_BITS: u16 = 0x0007;
pub const PG_PAGE_LAYOUT_VERSION: u8 = 4;

/* From transam.h */
pub const FIRST_NORMAL_TRANSACTION_ID: u32 = 3;
pub const INVALID_TRANSACTION_ID: u32 = 0;

// From pg_control.h and rmgrlist.h
pub const XLOG_SWITCH: u8 = 0x40;
pub const XLOG_RESTORE_POINT: u8 = 0x70;

pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const RM_SMGR_ID: u8 = 2;
pub const RM_DBASE_ID: u8 = 4;
pub const RM_HEAP2_ID: u8 = 9;
pub const RM_HEAP_ID: u8 = 10;
pub const RM_MAX_ID: u8 = 21;

// From xact.h
pub const XLOG_XACT_COMMIT: u8 = 0x00;
pub const XLOG_XACT_ABORT: u8 = 0x20;
pub const XLOG_XACT_COMMIT_PREPARED: u8 = 0x30;
pub const XLOG_XACT_ABORT_PREPARED: u8 = 0x40;

/* mask for filtering opcodes out of xl_info */
pub const XLOG_XACT_OPMASK: u8 = 0x70;

// from dbcommands_xlog.h
pub const XLOG_DBASE_CREATE: u8 = 0x00;
pub const XLOG_DBASE_DROP: u8 = 0x10;

// From storage_xlog.h
pub const XLOG_SMGR_CREATE: u8 = 0x10;
pub const XLOG_SMGR_TRUNCATE: u8 = 0x20;

// from xlogreader.h
pub const XLR_INFO_MASK: u8 = 0x0F;
/// Record modifies a relation in a way the rmgr itself must describe;
/// an unrecognized rmgr carrying it means we cannot track the change.
pub const XLR_SPECIAL_REL_UPDATE: u8 = 0x01;

pub const SIZEOF_XLOGRECORD: u32 = 24;

//
// from xlogrecord.h
//
pub const XLR_MAX_BLOCK_ID: u8 = 32;

pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;
pub const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10; /* block data is an XLogRecordBlockImage */
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40; /* redo will re-init the page */
pub const BKPBLOCK_SAME_REL: u8 = 0x80; /* RelFileNode omitted, same as previous */

/* Information stored in bimg_info */
pub const BKPIMAGE_HAS_HOLE: u8 = 0x01; /* page image has "hole" */
pub const BKPIMAGE_IS_COMPRESSED: u8 = 0x02; /* page image is compressed */
pub const BKPIMAGE_APPLY: u8 = 0x04; /* page image should be restored during replay */

//
// from xlog_internal.h
//
pub const XLOG_PAGE_MAGIC: u16 = 0xD10D; /* PG 14 */
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;
pub const XLP_BKP_REMOVABLE: u16 = 0x0004;
pub const XLP_FIRST_IS_OVERWRITE_CONTRECORD: u16 = 0x0008;
pub const XLP_ALL_FLAGS: u16 = 0x000F;

pub const PG_MAJORVERSION: &str = "14";
