//! Shared fixtures for unit tests: synthetic relation pages and files.

use camino::Utf8Path;
use postgres_ffi::page::page_checksum;
use postgres_ffi::pg_constants::{BLCKSZ, PG_PAGE_LAYOUT_VERSION, SIZEOF_PAGE_HEADER_DATA};
use utils::lsn::Lsn;

/// An initialized, empty page with the given LSN and a correct checksum
/// for the given absolute block number. `filler` makes contents unique.
pub fn make_page(lsn: Lsn, absolute_blkno: u32, filler: u8) -> Vec<u8> {
    let mut page = vec![0u8; BLCKSZ as usize];
    page[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn.0 as u32).to_le_bytes());
    page[12..14].copy_from_slice(&(SIZEOF_PAGE_HEADER_DATA as u16).to_le_bytes());
    page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
    page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
    page[18..20].copy_from_slice(&(BLCKSZ | PG_PAGE_LAYOUT_VERSION as u16).to_le_bytes());
    // leave a recognizable byte in the hole so pages differ
    page[100] = filler;
    let sum = page_checksum(&page, absolute_blkno);
    page[8..10].copy_from_slice(&sum.to_le_bytes());
    page
}

pub fn write_relfile(path: &Utf8Path, pages: &[Vec<u8>]) {
    let mut content = Vec::new();
    for p in pages {
        content.extend_from_slice(p);
    }
    std::fs::write(path, content).unwrap();
}
