//! On-disk PostgreSQL data formats, rewritten in Rust.
//!
//! Everything in this crate works on plain bytes read from disk; it never
//! talks to a server. The layouts match PostgreSQL 14. Function and
//! constant names follow the PostgreSQL sources where a direct
//! counterpart exists, which is why some of them are not snake_case.

pub mod controlfile;
pub mod page;
pub mod pg_constants;
pub mod waldecoder;
pub mod xlog_utils;

pub use page::{classify_page, page_checksum, PageClass, PageHeader};

// Export some widely used datatypes that are unlikely to change across Postgres versions
pub use pg_constants::{BLCKSZ, RELSEG_SIZE, XLOG_BLCKSZ};

pub type Oid = u32;
pub type TransactionId = u32;
pub type BlockNumber = u32;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogRecPtr = u64;
pub type XLogSegNo = u64;

/// Relation fork, from relpath.h. Only the main fork takes part in
/// page-level bookkeeping; the others are copied whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForkNumber {
    Main,
    Fsm,
    VisibilityMap,
    Init,
}

impl ForkNumber {
    pub fn from_forknum(forknum: u8) -> Option<ForkNumber> {
        match forknum {
            pg_constants::MAIN_FORKNUM => Some(ForkNumber::Main),
            pg_constants::FSM_FORKNUM => Some(ForkNumber::Fsm),
            pg_constants::VISIBILITYMAP_FORKNUM => Some(ForkNumber::VisibilityMap),
            pg_constants::INIT_FORKNUM => Some(ForkNumber::Init),
            _ => None,
        }
    }

    /// The suffix appended to the relfilenode in data file names, e.g.
    /// `12345_fsm`. The main fork has none.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            ForkNumber::Main => None,
            ForkNumber::Fsm => Some("fsm"),
            ForkNumber::VisibilityMap => Some("vm"),
            ForkNumber::Init => Some("init"),
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<ForkNumber> {
        match suffix {
            "fsm" => Some(ForkNumber::Fsm),
            "vm" => Some(ForkNumber::VisibilityMap),
            "init" => Some(ForkNumber::Init),
            _ => None,
        }
    }
}

/// Identifier of a relation file, from relfilenode.h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileNode {
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
}
