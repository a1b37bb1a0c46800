//!
//! Relation page headers and the block checksum, from bufpage.h and
//! checksum_impl.h.
//!

use bytes::Buf;

use crate::pg_constants::{
    BLCKSZ, PD_VALID_FLAG_BITS, PG_PAGE_LAYOUT_VERSION, SIZEOF_PAGE_HEADER_DATA,
};
use crate::BlockNumber;
use utils::lsn::Lsn;

/// Fixed-size header at the start of every relation page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub pd_lsn: Lsn,
    pub pd_checksum: u16,
    pub pd_flags: u16,
    pub pd_lower: u16,
    pub pd_upper: u16,
    pub pd_special: u16,
    pub pd_pagesize_version: u16,
    pub pd_prune_xid: u32,
}

impl PageHeader {
    pub fn from_bytes(page: &[u8]) -> PageHeader {
        let mut buf = &page[..SIZEOF_PAGE_HEADER_DATA];
        // pd_lsn is a {xlogid, xrecoff} pair of u32
        let xlogid = buf.get_u32_le();
        let xrecoff = buf.get_u32_le();
        PageHeader {
            pd_lsn: Lsn(((xlogid as u64) << 32) | xrecoff as u64),
            pd_checksum: buf.get_u16_le(),
            pd_flags: buf.get_u16_le(),
            pd_lower: buf.get_u16_le(),
            pd_upper: buf.get_u16_le(),
            pd_special: buf.get_u16_le(),
            pd_pagesize_version: buf.get_u16_le(),
            pd_prune_xid: buf.get_u32_le(),
        }
    }

    pub fn page_size(&self) -> u16 {
        self.pd_pagesize_version & 0xFF00
    }

    pub fn layout_version(&self) -> u8 {
        (self.pd_pagesize_version & 0x00FF) as u8
    }

    /// PageHeaderIsValid() from bufpage.c.
    pub fn is_valid(&self) -> bool {
        self.page_size() == BLCKSZ
            && self.layout_version() == PG_PAGE_LAYOUT_VERSION
            && (self.pd_flags & !PD_VALID_FLAG_BITS) == 0
            && self.pd_lower >= SIZEOF_PAGE_HEADER_DATA as u16
            && self.pd_lower <= self.pd_upper
            && self.pd_upper <= self.pd_special
            && self.pd_special <= BLCKSZ
            && self.pd_special % 8 == 0
    }
}

/// What a page read from disk turned out to be. Exactly one variant
/// applies to any 8 KiB buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Header invariants hold and, if requested, the checksum matches.
    Valid { lsn: Lsn },
    /// All BLCKSZ bytes are zero: a valid uninitialized block.
    Zero,
    HeaderInvalid,
    ChecksumMismatch { expected: u16, found: u16 },
    /// Page LSN is past the horizon the caller knows to be flushed.
    LsnFromFuture { lsn: Lsn },
}

/// Classify one page. `blkno` is the absolute block number within the
/// relation (segno * RELSEG_SIZE + block-in-file): the checksum mixes it
/// in. `checksum_version != 0` means the cluster has data checksums
/// enabled. `horizon_lsn`, when valid, flags pages whose LSN lies beyond
/// the end of known WAL.
pub fn classify_page(
    page: &[u8],
    blkno: BlockNumber,
    checksum_version: u32,
    horizon_lsn: Lsn,
) -> PageClass {
    debug_assert_eq!(page.len(), BLCKSZ as usize);

    if page.iter().all(|&b| b == 0) {
        return PageClass::Zero;
    }

    let header = PageHeader::from_bytes(page);
    if !header.is_valid() {
        return PageClass::HeaderInvalid;
    }

    if checksum_version != 0 {
        let expected = page_checksum(page, blkno);
        if expected != header.pd_checksum {
            return PageClass::ChecksumMismatch {
                expected,
                found: header.pd_checksum,
            };
        }
    }

    if horizon_lsn.is_valid() && header.pd_lsn > horizon_lsn {
        return PageClass::LsnFromFuture { lsn: header.pd_lsn };
    }

    PageClass::Valid { lsn: header.pd_lsn }
}

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

/// Base offsets to initialize each of the parallel FNV hashes with.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8], pd_checksum_zeroed: bool) -> u32 {
    debug_assert_eq!(page.len(), BLCKSZ as usize);

    let mut sums = CHECKSUM_BASE_OFFSETS;

    let words_per_row = N_SUMS;
    let rows = BLCKSZ as usize / 4 / words_per_row;

    for row in 0..rows {
        for lane in 0..words_per_row {
            let off = (row * words_per_row + lane) * 4;
            let mut word = u32::from_le_bytes(page[off..off + 4].try_into().unwrap());
            // the checksum is computed as if pd_checksum were zero;
            // it sits in bytes 8..10 of the header
            if pd_checksum_zeroed && off == 8 {
                word &= 0xFFFF0000;
            }
            sums[lane] = checksum_comp(sums[lane], word);
        }
    }

    // finally add in two rounds of zeroes for additional mixing
    for _ in 0..2 {
        for lane in 0..words_per_row {
            sums[lane] = checksum_comp(sums[lane], 0);
        }
    }

    sums.iter().fold(0, |acc, &s| acc ^ s)
}

/// pg_checksum_page() from checksum_impl.h: the FNV-style block checksum
/// mixed with the absolute block number, folded to a non-zero u16.
pub fn page_checksum(page: &[u8], blkno: BlockNumber) -> u16 {
    let checksum = checksum_block(page, true) ^ blkno;
    ((checksum % 65535) + 1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_constants::RELSEG_SIZE;

    /// A minimal empty-but-initialized heap page.
    fn empty_page(lsn: Lsn) -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ as usize];
        page[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
        page[4..8].copy_from_slice(&(lsn.0 as u32).to_le_bytes());
        // pd_lower = header size, pd_upper = pd_special = BLCKSZ
        page[12..14].copy_from_slice(&(SIZEOF_PAGE_HEADER_DATA as u16).to_le_bytes());
        page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[18..20].copy_from_slice(&(BLCKSZ | PG_PAGE_LAYOUT_VERSION as u16).to_le_bytes());
        page
    }

    fn with_checksum(mut page: Vec<u8>, blkno: BlockNumber) -> Vec<u8> {
        let sum = page_checksum(&page, blkno);
        page[8..10].copy_from_slice(&sum.to_le_bytes());
        page
    }

    #[test]
    fn classification_is_exclusive() {
        let zero = vec![0u8; BLCKSZ as usize];
        assert_eq!(classify_page(&zero, 0, 1, Lsn::INVALID), PageClass::Zero);

        let page = with_checksum(empty_page(Lsn(0x1000)), 3);
        assert_eq!(
            classify_page(&page, 3, 1, Lsn::INVALID),
            PageClass::Valid { lsn: Lsn(0x1000) }
        );

        // same bytes at a different block number: checksum no longer matches
        assert!(matches!(
            classify_page(&page, 4, 1, Lsn::INVALID),
            PageClass::ChecksumMismatch { .. }
        ));

        // with checksums disabled the block number does not matter
        assert_eq!(
            classify_page(&page, 4, 0, Lsn::INVALID),
            PageClass::Valid { lsn: Lsn(0x1000) }
        );

        let mut torn = page.clone();
        torn[14..16].copy_from_slice(&1u16.to_le_bytes()); // pd_upper < pd_lower
        assert_eq!(
            classify_page(&torn, 3, 1, Lsn::INVALID),
            PageClass::HeaderInvalid
        );
    }

    #[test]
    fn lsn_from_future() {
        let page = with_checksum(empty_page(Lsn(0x5000)), 0);
        assert_eq!(
            classify_page(&page, 0, 1, Lsn(0x4000)),
            PageClass::LsnFromFuture { lsn: Lsn(0x5000) }
        );
        assert_eq!(
            classify_page(&page, 0, 1, Lsn(0x5000)),
            PageClass::Valid { lsn: Lsn(0x5000) }
        );
    }

    #[test]
    fn checksum_mixes_in_block_number() {
        let page = empty_page(Lsn(0x2000));
        let a = page_checksum(&page, 0);
        let b = page_checksum(&page, 1);
        let c = page_checksum(&page, RELSEG_SIZE);
        assert_ne!(a, b);
        assert_ne!(a, c);
        // deterministic
        assert_eq!(a, page_checksum(&page, 0));
        // never zero
        assert_ne!(a, 0);
    }

    #[test]
    fn checksum_ignores_stored_checksum_field() {
        let blank = empty_page(Lsn(0x2000));
        let stamped = with_checksum(blank.clone(), 7);
        assert_eq!(page_checksum(&blank, 7), page_checksum(&stamped, 7));
    }
}
