//! Backup validation: per-file CRC against the manifest, page-level
//! checks through the header map, and the WAL replayability checks. A
//! backup that
//! fails turns CORRUPT; its descendants turn ORPHAN.

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::catalog::{
    self, Backup, BackupStatus,
};
use crate::config::{InstanceContext, HEADER_MAP, PG_XLOG_DIR};
use crate::datafile;
use crate::headermap;
use crate::parsewal::{self, RecoveryTarget};
use crate::pgfile::{BYTES_INVALID, FILE_NOT_FOUND};
use crate::walarchive;

/// Check every stored file of the backup against its manifest and verify
/// the WAL closure from start to stop LSN. Flips the status to OK or
/// CORRUPT accordingly; returns an error when the backup is bad.
pub fn validate_backup(instance: &InstanceContext, backup: &mut Backup) -> anyhow::Result<()> {
    match backup.status {
        BackupStatus::Ok | BackupStatus::Done | BackupStatus::Orphan | BackupStatus::Corrupt => {}
        other => bail!(
            "backup {} has status {other}, cannot validate",
            backup.id()
        ),
    }

    info!("validating backup {}", backup.id());
    match validate_backup_files(backup).and_then(|()| validate_backup_wal(instance, backup)) {
        Ok(()) => {
            catalog::write_backup_status(backup, BackupStatus::Ok)?;
            info!("backup {} is valid", backup.id());
            Ok(())
        }
        Err(e) => {
            warn!("backup {} is corrupt: {e:#}", backup.id());
            catalog::write_backup_status(backup, BackupStatus::Corrupt)?;
            Err(e.context(format!("backup {} is corrupt", backup.id())))
        }
    }
}

fn validate_backup_files(backup: &Backup) -> anyhow::Result<()> {
    let files = catalog::get_backup_filelist(backup, true)?;
    let database_dir = backup.database_dir();
    let hdr_map_path = backup.root_dir.join(HEADER_MAP);

    for file in &files {
        if !file.is_regular() {
            continue;
        }
        if file.write_size == BYTES_INVALID || file.write_size == FILE_NOT_FOUND {
            continue;
        }
        if file.external_dir_num != 0 {
            continue;
        }

        let path = database_dir.join(&file.rel_path);
        let meta = std::fs::metadata(path.as_std_path())
            .with_context(|| format!("backup file \"{path}\" is missing"))?;
        if meta.len() as i64 != file.write_size {
            bail!(
                "backup file \"{path}\" has size {}, expected {}",
                meta.len(),
                file.write_size
            );
        }

        let crc = datafile::file_crc32(&path)?;
        if crc != file.crc {
            bail!(
                "backup file \"{path}\" has CRC {crc}, expected {}",
                file.crc
            );
        }

        if file.is_datafile && file.write_size > 0 {
            let headers = headermap::get_data_file_headers(&hdr_map_path, file)
                .with_context(|| format!("backup file \"{path}\""))?;
            datafile::validate_file_pages(
                file,
                &path,
                headers.as_deref(),
                backup.compress_alg,
                backup.checksum_version,
                backup.stop_lsn,
            )?;
        }
    }
    Ok(())
}

fn validate_backup_wal(instance: &InstanceContext, backup: &Backup) -> anyhow::Result<()> {
    let wal_dir = if backup.stream {
        backup.database_dir().join(PG_XLOG_DIR)
    } else {
        instance.wal_instance_path.clone()
    };
    let history = walarchive::read_timeline_history(instance, backup.tli, false)?;
    parsewal::validate_wal_closure(backup, &wal_dir, instance.config.xlog_seg_size, history)
}

/// Verify that the archive can carry the backup to the recovery target.
pub fn validate_recovery_target(
    instance: &InstanceContext,
    backup: &Backup,
    target: &RecoveryTarget,
) -> anyhow::Result<()> {
    if !target.is_set() {
        return Ok(());
    }
    // even for a streamed backup, anything past stop_lsn comes from the
    // archive
    let history = walarchive::read_timeline_history(instance, backup.tli, false)?;
    parsewal::validate_wal_target(
        backup,
        &instance.wal_instance_path,
        instance.config.xlog_seg_size,
        history,
        target,
    )
}

/// `validate` command: one backup (with its ancestors) or the whole
/// instance. Corruption propagates ORPHAN status to descendants.
pub fn do_validate(
    instance: &InstanceContext,
    backup_id: Option<crate::catalog::BackupId>,
    target: &RecoveryTarget,
) -> anyhow::Result<()> {
    let mut list = catalog::get_backup_list(instance)?;
    let ids: Vec<_> = match backup_id {
        Some(id) => {
            let backup = catalog::find_backup(&list, id)
                .with_context(|| format!("backup {id} does not exist"))?;
            // the whole ancestry must be sound to restore from this one
            match catalog::scan_parent_chain(backup, &list) {
                catalog::ParentChain::Ok(chain) => chain.iter().map(|b| b.id()).collect(),
                catalog::ParentChain::Invalid(_, bad) => {
                    bail!("backup {id} has an unusable ancestor {bad}")
                }
                catalog::ParentChain::Broken { missing } => {
                    bail!("backup {id} has a missing ancestor {missing}")
                }
            }
        }
        None => list
            .iter()
            .filter(|b| b.is_ok())
            .map(|b| b.id())
            .collect(),
    };

    let mut corrupted: Vec<crate::catalog::BackupId> = Vec::new();
    for id in ids {
        let index = list.iter().position(|b| b.id() == id).unwrap();
        let mut backup = list[index].clone();
        let _lock = catalog::lock_backup(&backup)?;
        let result = validate_backup(instance, &mut backup);
        if backup_id.is_some() && result.is_ok() {
            validate_recovery_target(instance, &backup, target)?;
        }
        let failed = result.is_err();
        list[index] = backup;
        if failed {
            corrupted.push(id);
        }
    }

    if corrupted.is_empty() {
        return Ok(());
    }

    // every descendant of a corrupt backup is now of unknown validity
    for bad in &corrupted {
        let orphans: Vec<_> = list
            .iter()
            .filter(|b| b.is_ok() && catalog::is_parent(*bad, b, &list, false))
            .map(|b| b.id())
            .collect();
        for orphan_id in orphans {
            let index = list.iter().position(|b| b.id() == orphan_id).unwrap();
            let mut orphan = list[index].clone();
            let _lock = catalog::lock_backup(&orphan)?;
            warn!(
                "backup {orphan_id} is orphaned because its ancestor {bad} is corrupt"
            );
            catalog::write_backup_status(&mut orphan, BackupStatus::Orphan)?;
            list[index] = orphan;
        }
    }

    bail!(
        "some backups are corrupt: {}",
        corrupted
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}
