//! Merging an incremental chain down into its FULL ancestor.
//!
//! The FULL backup's directory is rewritten in place: every data file is
//! reconstructed from the chain and re-encoded, non-data files take the
//! newest stored copy, and the FULL record then adopts the merge
//! target's identity. Block writes are keyed by block number, so
//! re-running an interrupted merge converges on the same result.

use std::collections::HashMap;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use tracing::{info, warn};

use utils::lsn::Lsn;

use crate::catalog::{self, Backup, BackupId, BackupMode, BackupStatus};
use crate::config::{InstanceContext, HEADER_MAP};
use crate::datafile::{self, RestoreSource};
use crate::headermap::HeaderMapWriter;
use crate::pgfile::{PgFile, BYTES_INVALID, FILE_NOT_FOUND};
use crate::workers::CancelToken;

const HEADER_MAP_TMP: &str = "page_header_map_tmp";
const MERGE_RAW_SUFFIX: &str = "merge_raw";
const MERGE_OUT_SUFFIX: &str = "merge_out";

/// `merge -i <id>`: merge the chain ending at the given incremental
/// backup into its FULL ancestor.
pub fn do_merge(
    instance: &InstanceContext,
    backup_id: BackupId,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let list = catalog::get_backup_list(instance)?;
    let dest = catalog::find_backup(&list, backup_id)
        .with_context(|| format!("backup {backup_id} does not exist"))?
        .clone();

    // crash recovery: a FULL left in MERGING/MERGED resumes its merge
    if dest.is_full() {
        match (dest.status, dest.merge_dest_backup) {
            (BackupStatus::Merged, Some(_)) => {
                info!("backup {backup_id} is MERGED, finishing the interrupted merge");
                return finish_merge(instance, dest);
            }
            (BackupStatus::Merging, Some(merge_dest)) => {
                info!(
                    "backup {backup_id} is MERGING into {merge_dest}, retrying the merge"
                );
                return do_merge(instance, merge_dest, cancel);
            }
            _ => bail!("backup {backup_id} is a FULL backup, nothing to merge"),
        }
    }
    if !dest.is_ok() && dest.status != BackupStatus::Merging {
        bail!(
            "backup {backup_id} has status {}, cannot merge",
            dest.status
        );
    }

    let chain = match catalog::scan_parent_chain(&dest, &list) {
        catalog::ParentChain::Ok(chain) => chain,
        catalog::ParentChain::Invalid(chain, bad) => {
            // a chain already mid-merge is expected to be partly MERGING
            if chain
                .iter()
                .all(|b| b.is_ok() || b.status == BackupStatus::Merging)
            {
                chain
            } else {
                bail!("backup {backup_id} has an unusable ancestor {bad}")
            }
        }
        catalog::ParentChain::Broken { missing } => {
            bail!("backup {backup_id} has a missing ancestor {missing}")
        }
    };
    merge_chain(instance, chain, cancel)
}

/// Merge `[FULL, B1, …, Bk]`; Bk survives under its own id with the
/// FULL's (rewritten) directory.
pub fn merge_chain(
    instance: &InstanceContext,
    chain: Vec<Backup>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    assert!(chain.len() >= 2, "a merge chain has at least FULL and one child");
    let dest = chain.last().unwrap().clone();
    info!(
        "merging chain {} into its FULL ancestor {}",
        chain
            .iter()
            .map(|b| b.id().to_string())
            .collect::<Vec<_>>()
            .join(" <- "),
        chain[0].id()
    );

    // exclusive hold on every member for the whole operation
    let mut locks = Vec::with_capacity(chain.len());
    for member in &chain {
        locks.push(catalog::lock_backup(member)?);
    }

    let mut full = chain[0].clone();
    full.merge_dest_backup = Some(dest.id());
    catalog::write_backup_status(&mut full, BackupStatus::Merging)?;
    for member in &chain[1..] {
        let mut member = member.clone();
        catalog::write_backup_status(&mut member, BackupStatus::Merging)?;
    }

    let manifests: Vec<(Backup, HashMap<String, PgFile>)> = chain
        .iter()
        .map(|member| {
            catalog::get_backup_filelist(member, false).map(|files| {
                (
                    member.clone(),
                    files
                        .into_iter()
                        .map(|f| (f.rel_path.clone(), f))
                        .collect::<HashMap<_, _>>(),
                )
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let dest_manifest = &manifests.last().unwrap().1;

    let full_database = full.database_dir();
    let hdr_map = HeaderMapWriter::new(full.root_dir.join(HEADER_MAP_TMP));

    let mut new_files: Vec<PgFile> = Vec::with_capacity(dest_manifest.len());
    for entry in dest_manifest.values() {
        if cancel.is_cancelled() {
            bail!("interrupted during merge");
        }
        let mut entry = entry.clone();

        if !entry.is_regular() {
            utils::crashsafe::create_dir_all(full_database.join(&entry.rel_path))?;
            new_files.push(entry);
            continue;
        }
        if entry.write_size == FILE_NOT_FOUND {
            // vanished during the destination backup: drop it
            continue;
        }

        let final_path = full_database.join(&entry.rel_path);
        if entry.is_datafile {
            merge_data_file(&manifests, &mut entry, &final_path, &dest, &hdr_map)?;
        } else {
            merge_non_data_file(&manifests, &mut entry, &final_path)?;
        }
        new_files.push(entry);
    }
    hdr_map.finish()?;

    // files the destination no longer knows about are dropped relations
    remove_unlisted_files(&full_database, &new_files)?;
    utils::crashsafe::durable_rename(
        &full.root_dir.join(HEADER_MAP_TMP),
        &full.root_dir.join(HEADER_MAP),
    )
    .or_else(|e| {
        // no data files were re-encoded at all
        if e.kind() == std::io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(e)
        }
    })?;

    // adopt the destination's identity and coordinates
    full.mode = BackupMode::Full;
    full.parent_backup = None;
    full.tli = dest.tli;
    full.start_lsn = dest.start_lsn;
    full.stop_lsn = dest.stop_lsn;
    full.recovery_time = dest.recovery_time;
    full.recovery_xid = dest.recovery_xid;
    full.expire_time = dest.expire_time;
    full.note = dest.note.clone();
    full.stream = dest.stream;
    full.compress_alg = dest.compress_alg;
    full.compress_level = dest.compress_level;
    full.checksum_version = dest.checksum_version;
    full.data_bytes = new_files.iter().map(|f| f.write_size.max(0)).sum();
    full.uncompressed_bytes = new_files.iter().map(|f| f.uncompressed_size as i64).sum();
    full.content_crc = catalog::write_backup_filelist(&full, &mut new_files)?;
    catalog::write_backup_status(&mut full, BackupStatus::Merged)?;

    // the merged originals disappear; then the FULL takes the dest's id
    drop(locks);
    for member in &chain[1..] {
        info!("removing merged backup {}", member.id());
        std::fs::remove_dir_all(member.root_dir.as_std_path())
            .with_context(|| format!("cannot remove \"{}\"", member.root_dir))?;
    }
    finish_merge_inner(instance, full, dest.start_time)
}

/// Final step, shared with crash recovery: rename the FULL's directory to
/// the destination id and flip it back to OK.
fn finish_merge(instance: &InstanceContext, full: Backup) -> anyhow::Result<()> {
    let dest_id = full
        .merge_dest_backup
        .expect("MERGED backup carries merge-dest-id");
    // leftovers of merged members, if the crash hit mid-removal
    let list = catalog::get_backup_list(instance)?;
    for member in &list {
        if member.id() != full.id()
            && (member.status == BackupStatus::Merging || member.id() == dest_id)
        {
            warn!("removing merged backup {}", member.id());
            std::fs::remove_dir_all(member.root_dir.as_std_path())
                .with_context(|| format!("cannot remove \"{}\"", member.root_dir))?;
        }
    }
    finish_merge_inner(instance, full, dest_id.0)
}

fn finish_merge_inner(
    instance: &InstanceContext,
    mut full: Backup,
    new_start_time: i64,
) -> anyhow::Result<()> {
    let new_root = instance.backup_dir(&BackupId(new_start_time).to_string());
    if full.root_dir != new_root {
        std::fs::rename(full.root_dir.as_std_path(), new_root.as_std_path())
            .with_context(|| {
                format!("cannot rename \"{}\" to \"{new_root}\"", full.root_dir)
            })?;
        utils::crashsafe::fsync(
            new_root.parent().expect("backup dir has a parent"),
        )?;
        full.root_dir = new_root;
    }
    full.start_time = new_start_time;
    full.merge_dest_backup = None;
    let _lock = catalog::lock_backup(&full)?;
    catalog::write_backup_status(&mut full, BackupStatus::Ok)?;
    info!("merge completed, surviving backup is {}", full.id());
    Ok(())
}

/// Rebuild one data file from the whole chain and re-encode it as a
/// fresh FULL copy of the merged backup.
fn merge_data_file(
    manifests: &[(Backup, HashMap<String, PgFile>)],
    entry: &mut PgFile,
    final_path: &Utf8PathBuf,
    dest: &Backup,
    hdr_map: &HeaderMapWriter,
) -> anyhow::Result<()> {
    let sources: Vec<RestoreSource> = manifests
        .iter()
        .filter_map(|(member, manifest)| {
            manifest.get(&entry.rel_path).and_then(|e| {
                (e.write_size > 0).then(|| RestoreSource {
                    path: member.database_dir().join(&entry.rel_path),
                    compress_alg: member.compress_alg,
                })
            })
        })
        .collect();

    let raw_path = utils::crashsafe::path_with_suffix_extension(final_path, MERGE_RAW_SUFFIX);
    let out_path = utils::crashsafe::path_with_suffix_extension(final_path, MERGE_OUT_SUFFIX);

    datafile::restore_data_file_chain(&sources, &raw_path, entry.size, None)
        .with_context(|| format!("cannot reconstruct \"{}\" for merge", entry.rel_path))?;

    let result = datafile::backup_data_file(
        &raw_path,
        &out_path,
        entry,
        Lsn::INVALID,
        BackupMode::Full,
        dest.compress_alg,
        dest.compress_level,
        // pages were validated when they were backed up; the chain copies
        // carry no live-writer races to retry against
        0,
        hdr_map,
        false,
        &CancelToken::new(),
    )
    .map_err(|e| e.source.context(format!("cannot re-encode \"{}\"", entry.rel_path)))?;

    std::fs::remove_file(raw_path.as_std_path())
        .with_context(|| format!("cannot remove \"{raw_path}\""))?;
    utils::crashsafe::durable_rename(&out_path, final_path)?;

    entry.read_size = result.read_size;
    entry.write_size = result.write_size;
    entry.uncompressed_size = result.uncompressed_size;
    entry.crc = result.crc;
    // stale coordinates from the destination's own header map must not
    // survive into the merged manifest
    entry.n_headers = 0;
    entry.hdr_off = 0;
    entry.hdr_size = 0;
    entry.hdr_crc = 0;
    if let Some(coords) = result.coords {
        coords.apply(entry);
    }
    Ok(())
}

/// Take the newest stored copy of a non-data file.
fn merge_non_data_file(
    manifests: &[(Backup, HashMap<String, PgFile>)],
    entry: &mut PgFile,
    final_path: &Utf8PathBuf,
) -> anyhow::Result<()> {
    for (member, manifest) in manifests.iter().rev() {
        let Some(found) = manifest.get(&entry.rel_path) else {
            continue;
        };
        match found.write_size {
            BYTES_INVALID => continue, // that member deferred to its parent
            FILE_NOT_FOUND => {
                // dropped; the caller has already filtered the dest's own
                // -2 entries, so this member is an ancestor - keep walking
                continue;
            }
            _ => {
                let from = member.database_dir().join(&entry.rel_path);
                if from != *final_path {
                    std::fs::copy(from.as_std_path(), final_path.as_std_path())
                        .with_context(|| format!("cannot copy \"{from}\" for merge"))?;
                }
                entry.size = found.size;
                entry.write_size = found.write_size;
                entry.uncompressed_size = found.uncompressed_size;
                entry.crc = found.crc;
                return Ok(());
            }
        }
    }
    warn!(
        "no backup in the merge chain stores file \"{}\"",
        entry.rel_path
    );
    Ok(())
}

/// Remove files of the FULL directory that the merged manifest no longer
/// lists (relations dropped during the chain's lifetime).
fn remove_unlisted_files(
    full_database: &Utf8PathBuf,
    new_files: &[PgFile],
) -> anyhow::Result<()> {
    let keep: std::collections::HashSet<&str> =
        new_files.iter().map(|f| f.rel_path.as_str()).collect();
    for entry in walkdir::WalkDir::new(full_database.as_std_path()) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = camino::Utf8Path::from_path(entry.path()) else {
            continue;
        };
        let rel = path
            .strip_prefix(full_database)
            .expect("walkdir stays under the root");
        if !keep.contains(rel.as_str()) {
            info!("removing \"{rel}\" dropped by the merged chain");
            std::fs::remove_file(path.as_std_path())
                .with_context(|| format!("cannot remove \"{path}\""))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::test_helpers::{make_page, write_relfile};

    const BLK: usize = 8192;

    struct Fixture {
        _dir: camino_tempfile::Utf8TempDir,
        instance: InstanceContext,
    }

    fn fixture() -> Fixture {
        let dir = camino_tempfile::tempdir().unwrap();
        let instance = InstanceContext {
            name: "node".to_string(),
            backup_instance_path: dir.path().join("backups/node"),
            wal_instance_path: dir.path().join("wal/node"),
            config: InstanceConfig::default(),
        };
        std::fs::create_dir_all(&instance.backup_instance_path).unwrap();
        Fixture {
            _dir: dir,
            instance,
        }
    }

    /// Store `pages` as a FULL-style or DELTA-style backup of one
    /// relation file plus a PG_VERSION non-data file.
    fn store_backup(
        fx: &Fixture,
        mode: BackupMode,
        start_time: i64,
        parent: Option<BackupId>,
        pages: &[(u32, Vec<u8>)],
        rel_size: u64,
    ) -> Backup {
        let mut backup = Backup::new(mode, start_time);
        backup.status = BackupStatus::Ok;
        backup.tli = 1;
        backup.start_lsn = Lsn(0x1000 + start_time as u64);
        backup.stop_lsn = Lsn(0x2000 + start_time as u64);
        backup.recovery_time = Some(start_time + 1);
        backup.parent_backup = parent;
        catalog::init_backup_dir(&mut backup, &fx.instance).unwrap();

        // lay the raw pages out as a synthetic relation and run the real
        // engine so the stored format is authentic
        let scratch = backup.root_dir.join("scratch");
        let nblocks = (rel_size / BLK as u64) as u32;
        let mut raw: Vec<Vec<u8>> = (0..nblocks).map(|_| vec![0u8; BLK]).collect();
        for (blkno, page) in pages {
            raw[*blkno as usize] = page.clone();
        }
        write_relfile(&scratch, &raw);

        let mut rel = PgFile::new("base/1/16384", 0o100600, rel_size, 0);
        if mode != BackupMode::Full {
            // emulate the engine's skip of unchanged blocks with a map
            let mut map = crate::pagemap::PageMap::new();
            for (blkno, _) in pages {
                map.add(*blkno);
            }
            rel.pagemap = Some(map);
        }
        let hdr_map = HeaderMapWriter::new(backup.root_dir.join(HEADER_MAP));
        std::fs::create_dir_all(backup.database_dir().join("base/1")).unwrap();
        let result = datafile::backup_data_file(
            &scratch,
            &backup.database_dir().join("base/1/16384"),
            &rel,
            Lsn::INVALID,
            BackupMode::Full,
            crate::config::CompressAlg::None,
            1,
            0,
            &hdr_map,
            false,
            &CancelToken::new(),
        )
        .unwrap();
        hdr_map.finish().unwrap();
        std::fs::remove_file(&scratch).unwrap();
        rel.write_size = result.write_size;
        rel.crc = result.crc;
        rel.uncompressed_size = result.uncompressed_size;
        if let Some(coords) = result.coords {
            coords.apply(&mut rel);
        }

        let version_path = backup.database_dir().join("PG_VERSION");
        std::fs::write(&version_path, b"14\n").unwrap();
        let mut version = PgFile::new("PG_VERSION", 0o100600, 3, 0);
        version.write_size = 3;
        version.crc = crc32c::crc32c(b"14\n");

        let mut base = PgFile::new("base", 0o040700, 0, 0);
        base.write_size = 0;
        let mut base1 = PgFile::new("base/1", 0o040700, 0, 0);
        base1.write_size = 0;

        let mut files = vec![rel, version, base, base1];
        backup.content_crc = catalog::write_backup_filelist(&backup, &mut files).unwrap();
        catalog::write_backup(&backup).unwrap();
        backup
    }

    fn restore_rel(fx: &Fixture, id: BackupId, out: &camino::Utf8Path) {
        let list = catalog::get_backup_list(&fx.instance).unwrap();
        let backup = catalog::find_backup(&list, id).unwrap();
        let chain = match catalog::scan_parent_chain(backup, &list) {
            catalog::ParentChain::Ok(chain) => chain,
            other => panic!("chain not ok: {other:?}"),
        };
        let mut sources = Vec::new();
        let mut size = 0;
        for member in &chain {
            let manifest = catalog::get_backup_filelist(member, true).unwrap();
            if let Some(e) = manifest.iter().find(|f| f.rel_path == "base/1/16384") {
                if e.write_size > 0 {
                    sources.push(RestoreSource {
                        path: member.database_dir().join("base/1/16384"),
                        compress_alg: member.compress_alg,
                    });
                }
                size = e.size;
            }
        }
        datafile::restore_data_file_chain(&sources, out, size, None).unwrap();
    }

    #[test]
    fn merge_chain_preserves_restore_content() {
        let fx = fixture();
        let cancel = CancelToken::new();

        // FULL with three blocks
        let full_pages: Vec<(u32, Vec<u8>)> = (0..3)
            .map(|i| (i, make_page(Lsn(0x1000), i, i as u8 + 1)))
            .collect();
        let full = store_backup(&fx, BackupMode::Full, 100, None, &full_pages, 3 * BLK as u64);

        // DELTA changes block 1
        let delta_pages = vec![(1u32, make_page(Lsn(0x9000), 1, 0xAA))];
        let delta = store_backup(
            &fx,
            BackupMode::Delta,
            200,
            Some(full.id()),
            &delta_pages,
            3 * BLK as u64,
        );

        // what a restore of the chain produces before the merge
        let before = fx.instance.backup_instance_path.join("before.bin");
        restore_rel(&fx, delta.id(), &before);

        do_merge(&fx.instance, delta.id(), &cancel).unwrap();

        // E4: one FULL backup under the destination id survives
        let list = catalog::get_backup_list(&fx.instance).unwrap();
        assert_eq!(list.len(), 1);
        let merged = &list[0];
        assert_eq!(merged.id(), delta.id());
        assert!(merged.is_full());
        assert_eq!(merged.status, BackupStatus::Ok);
        assert_eq!(merged.stop_lsn, delta.stop_lsn);
        assert!(merged.parent_backup.is_none());

        let after = fx.instance.backup_instance_path.join("after.bin");
        restore_rel(&fx, merged.id(), &after);
        assert_eq!(
            std::fs::read(&before).unwrap(),
            std::fs::read(&after).unwrap()
        );

        // the merged manifest passes its own CRC check
        catalog::get_backup_filelist(merged, true).unwrap();
    }

    #[test]
    fn merging_a_full_without_state_is_rejected() {
        let fx = fixture();
        let full = store_backup(&fx, BackupMode::Full, 100, None, &[], 0);
        let err = do_merge(&fx.instance, full.id(), &CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("nothing to merge"));
    }
}
