//! Restore: resolve the backup chain, validate it, lay out the
//! destination, and rebuild every file by overlaying the chain's stored
//! blocks, FULL ancestor first.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use postgres_ffi::controlfile::ControlFileData;
use utils::lsn::Lsn;

use crate::catalog::{self, Backup, BackupId};
use crate::config::{InstanceContext, PG_BACKUP_LABEL_FILE};
use crate::datafile::{self, IncrementalMap, RestoreSource};
use crate::dir::{self, TablespaceMapping};
use crate::error::{ClassifiedError, ErrorKind};
use crate::parsewal::RecoveryTarget;
use crate::pgfile::{PgFile, BYTES_INVALID, FILE_NOT_FOUND};
use crate::validate;
use crate::walarchive;
use crate::workers::{run_parallel, CancelToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncrRestoreMode {
    #[default]
    None,
    Checksum,
    Lsn,
}

impl FromStr for IncrRestoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<IncrRestoreMode> {
        match s {
            "none" => Ok(IncrRestoreMode::None),
            "checksum" => Ok(IncrRestoreMode::Checksum),
            "lsn" => Ok(IncrRestoreMode::Lsn),
            _ => bail!("invalid incremental restore mode \"{s}\""),
        }
    }
}

impl fmt::Display for IncrRestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IncrRestoreMode::None => "none",
            IncrRestoreMode::Checksum => "checksum",
            IncrRestoreMode::Lsn => "lsn",
        })
    }
}

pub struct RestoreOptions {
    pub backup_id: Option<BackupId>,
    pub target: RecoveryTarget,
    pub num_threads: usize,
    pub no_validate: bool,
    pub incremental_mode: IncrRestoreMode,
    pub tablespace_mapping: TablespaceMapping,
    pub restore_command: Option<String>,
    pub pgdata: Option<Utf8PathBuf>,
    pub force: bool,
}

pub fn do_restore(
    instance: &InstanceContext,
    opts: &RestoreOptions,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let pgdata = opts
        .pgdata
        .clone()
        .or_else(|| instance.config.pgdata.clone())
        .context("required parameter not specified: PGDATA (-D, --pgdata)")?;

    let list = catalog::get_backup_list(instance)?;
    let target_backup = select_backup(instance, &list, opts)?;
    info!(
        "restoring the database from backup {} ({})",
        target_backup.id(),
        target_backup.mode
    );

    let chain = match catalog::scan_parent_chain(&target_backup, &list) {
        catalog::ParentChain::Ok(chain) => chain,
        catalog::ParentChain::Invalid(_, bad) => {
            bail!(
                "backup {} has an unusable ancestor {bad}; restore another backup or run validate",
                target_backup.id()
            )
        }
        catalog::ParentChain::Broken { missing } => {
            bail!(
                "backup {} is orphaned: its ancestor {missing} is missing from the catalog",
                target_backup.id()
            )
        }
    };

    if !opts.no_validate {
        for member in &chain {
            let mut member = member.clone();
            validate::validate_backup(instance, &mut member)?;
        }
        validate::validate_recovery_target(instance, &target_backup, &opts.target)?;
    } else {
        warn!("backup validation was skipped on user request");
    }

    let shift_lsn = check_destination(&pgdata, instance, opts, &chain)?;

    // load every chain member's manifest once, newest last
    let manifests: Vec<(Backup, HashMap<String, PgFile>)> = chain
        .iter()
        .map(|member| {
            catalog::get_backup_filelist(member, !opts.no_validate).map(|files| {
                let map = files
                    .into_iter()
                    .map(|f| (f.rel_path.clone(), f))
                    .collect::<HashMap<_, _>>();
                (member.clone(), map)
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let (_, dest_manifest) = manifests.last().expect("chain is never empty");
    let mut dest_files: Vec<PgFile> = dest_manifest.values().cloned().collect();
    dest_files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    dir::create_data_directories(
        &dest_files,
        &pgdata,
        &opts.tablespace_mapping,
        opts.incremental_mode != IncrRestoreMode::None,
    )?;

    let checksum_version = target_backup.checksum_version;
    let results = run_parallel(opts.num_threads, &dest_files, cancel, |_, file| {
        restore_one_file(
            file,
            &pgdata,
            &manifests,
            opts.incremental_mode,
            shift_lsn,
            checksum_version,
        )
    })
    .map_err(|e| anyhow::Error::new(e).context("restore of data files failed"))?;
    let restored_bytes: u64 = results.iter().map(|&(_, n)| n).sum();

    // files present at the destination but unknown to the backup are
    // leftovers of a diverged cluster
    if opts.incremental_mode != IncrRestoreMode::None {
        remove_redundant_files(&pgdata, dest_manifest)?;
    }

    write_recovery_settings(&pgdata, instance, &target_backup, opts)?;

    info!(
        "restore of backup {} completed, {restored_bytes} bytes written",
        target_backup.id()
    );
    Ok(())
}

/// Pick the backup to restore: the requested id, or the latest usable
/// backup satisfying the recovery target and timeline.
fn select_backup(
    instance: &InstanceContext,
    list: &[Backup],
    opts: &RestoreOptions,
) -> anyhow::Result<Backup> {
    if let Some(id) = opts.backup_id {
        let backup = catalog::find_backup(list, id)
            .with_context(|| format!("backup {id} does not exist"))?;
        if !backup.is_ok() {
            bail!("backup {id} has status {}, cannot restore", backup.status);
        }
        return Ok(backup.clone());
    }

    let target_history = match opts.target.tli {
        Some(tli) => Some(walarchive::read_timeline_history(instance, tli, true)?),
        None => None,
    };

    for backup in list {
        if !backup.is_ok() {
            continue;
        }
        if let (Some(history), Some(tli)) = (&target_history, opts.target.tli) {
            if !walarchive::satisfy_timeline(history, tli, backup.tli, backup.stop_lsn) {
                continue;
            }
        }
        if let Some(t) = opts.target.time {
            if backup.recovery_time.unwrap_or(i64::MAX) > t {
                continue;
            }
        }
        if let Some(xid) = opts.target.xid {
            if backup.recovery_xid > xid {
                continue;
            }
        }
        if let Some(lsn) = opts.target.lsn {
            if backup.stop_lsn > lsn {
                continue;
            }
        }
        return Ok(backup.clone());
    }
    bail!("cannot find a backup satisfying the recovery target");
}

/// Sanity-check the destination directory; returns the LSN horizon for
/// LSN-mode incremental restore.
fn check_destination(
    pgdata: &Utf8Path,
    instance: &InstanceContext,
    opts: &RestoreOptions,
    chain: &[Backup],
) -> anyhow::Result<Lsn> {
    let empty = !pgdata.exists()
        || pgdata
            .read_dir_utf8()
            .map(|mut it| it.next().is_none())
            .unwrap_or(true);

    if empty {
        if opts.incremental_mode != IncrRestoreMode::None {
            info!("destination directory is empty, falling back to a plain restore");
        }
        return Ok(Lsn::INVALID);
    }

    // a live postmaster owns the directory
    let pid_path = pgdata.join("postmaster.pid");
    if pid_path.exists() {
        let pid = std::fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.lines().next().and_then(|l| l.trim().parse::<i32>().ok()));
        if let Some(pid) = pid {
            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
                bail!(
                    "postmaster with pid {pid} is running in the destination directory \"{pgdata}\""
                );
            }
        }
    }

    if opts.incremental_mode == IncrRestoreMode::None {
        if opts.force {
            warn!("destination directory \"{pgdata}\" is not empty, removing its contents");
            for entry in pgdata.read_dir_utf8()? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(entry.path())?;
                } else {
                    std::fs::remove_file(entry.path())?;
                }
            }
            return Ok(Lsn::INVALID);
        }
        bail!("restore destination directory \"{pgdata}\" is not empty");
    }

    // incremental restore safety: same cluster, not mid-backup
    if pgdata.join(PG_BACKUP_LABEL_FILE).exists() && !opts.force {
        bail!(
            "destination directory contains backup_label: an online backup was interrupted there"
        );
    }
    let control_path = pgdata.join("global/pg_control");
    let control_bytes = std::fs::read(control_path.as_std_path())
        .with_context(|| format!("cannot read \"{control_path}\" for incremental restore"))?;
    let control = ControlFileData::decode(&control_bytes)?;
    if instance.config.system_identifier != 0
        && control.system_identifier != instance.config.system_identifier
    {
        bail!(
            "system id {} of the destination does not match the instance's {}",
            control.system_identifier,
            instance.config.system_identifier
        );
    }

    match opts.incremental_mode {
        IncrRestoreMode::Lsn => {
            let full = &chain[0];
            if control.checkpoint_redo < full.start_lsn {
                bail!(
                    "destination redo point {} predates the FULL backup start {}; use --incremental-mode=checksum",
                    control.checkpoint_redo,
                    full.start_lsn
                );
            }
            Ok(control.checkpoint_redo)
        }
        _ => Ok(Lsn::INVALID),
    }
}

/// Restore one manifest entry; returns bytes written.
fn restore_one_file(
    file: &PgFile,
    pgdata: &Utf8Path,
    manifests: &[(Backup, HashMap<String, PgFile>)],
    incremental_mode: IncrRestoreMode,
    shift_lsn: Lsn,
    checksum_version: u32,
) -> Result<u64, ClassifiedError> {
    let run = || -> anyhow::Result<u64> {
        if !file.is_regular() {
            return Ok(0);
        }
        // the relation vanished while the target backup ran
        if file.write_size == FILE_NOT_FOUND {
            return Ok(0);
        }
        // tablespace files are reached through the symlink that
        // create_data_directories just laid out
        let to_fullpath = pgdata.join(&file.rel_path);
        let (target_backup, _) = manifests.last().expect("chain is never empty");

        if file.is_datafile {
            let mut sources = Vec::new();
            for (member, manifest) in manifests {
                if let Some(entry) = manifest.get(&file.rel_path) {
                    if entry.write_size > 0 {
                        sources.push(RestoreSource {
                            path: member.database_dir().join(&file.rel_path),
                            compress_alg: member.compress_alg,
                        });
                    }
                }
            }

            let incremental = match incremental_mode {
                IncrRestoreMode::None => None,
                _ if !to_fullpath.is_file() => None,
                IncrRestoreMode::Checksum => {
                    let existing = std::fs::metadata(to_fullpath.as_std_path())?.len();
                    let n_blocks = (existing / 8192) as u32;
                    Some(IncrementalMap::Checksum(datafile::get_checksum_map(
                        &to_fullpath,
                        checksum_version,
                        n_blocks,
                        target_backup.stop_lsn,
                        file.segno,
                    )?))
                }
                IncrRestoreMode::Lsn => {
                    let existing = std::fs::metadata(to_fullpath.as_std_path())?.len();
                    let n_blocks = (existing / 8192) as u32;
                    Some(IncrementalMap::Lsn(datafile::get_lsn_map(
                        &to_fullpath,
                        checksum_version,
                        n_blocks,
                        shift_lsn,
                        file.segno,
                    )?))
                }
            };

            datafile::restore_data_file_chain(
                &sources,
                &to_fullpath,
                file.size,
                incremental.as_ref(),
            )
        } else {
            // newest chain member that stores the file wins
            for (member, manifest) in manifests.iter().rev() {
                if let Some(entry) = manifest.get(&file.rel_path) {
                    if entry.write_size >= 0 {
                        let from = member.database_dir().join(&file.rel_path);
                        std::fs::copy(from.as_std_path(), to_fullpath.as_std_path())
                            .with_context(|| {
                                format!("cannot restore file \"{to_fullpath}\"")
                            })?;
                        return Ok(entry.write_size as u64);
                    }
                    if entry.write_size == FILE_NOT_FOUND {
                        return Ok(0);
                    }
                    debug_assert_eq!(entry.write_size, BYTES_INVALID);
                }
            }
            warn!(
                "no backup in the chain stores file \"{}\"",
                file.rel_path
            );
            Ok(0)
        }
    };

    run().map_err(|e| {
        ClassifiedError::new(
            ErrorKind::SystemIo,
            e.context(format!("file \"{}\"", file.rel_path)),
        )
    })
}

/// Incremental restore: delete files the target backup does not know
/// about (relations dropped after the destination diverged).
fn remove_redundant_files(
    pgdata: &Utf8Path,
    dest_manifest: &HashMap<String, PgFile>,
) -> anyhow::Result<()> {
    let on_disk = dir::list_data_directory(pgdata, false)?;
    for found in on_disk {
        if !found.is_regular() {
            continue;
        }
        if !dest_manifest.contains_key(&found.rel_path) {
            let path = pgdata.join(&found.rel_path);
            info!("removing redundant file \"{path}\"");
            if let Err(e) = std::fs::remove_file(path.as_std_path()) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e).with_context(|| format!("cannot remove \"{path}\""));
                }
            }
        }
    }
    Ok(())
}

/// Arrange for point-in-time recovery on first start: recovery settings
/// into `postgresql.auto.conf` plus the `recovery.signal` marker.
fn write_recovery_settings(
    pgdata: &Utf8Path,
    instance: &InstanceContext,
    backup: &Backup,
    opts: &RestoreOptions,
) -> anyhow::Result<()> {
    if backup.stream && !opts.target.is_set() {
        // a self-contained streamed backup recovers from its own pg_wal
        return Ok(());
    }

    let mut settings = String::new();
    settings.push_str(&format!(
        "\n# recovery settings added by pg_probackup restore of backup {}\n",
        backup.id()
    ));
    let restore_command = opts
        .restore_command
        .clone()
        .or_else(|| instance.config.restore_command.clone())
        .unwrap_or_else(|| format!("cp {}/%f %p", instance.wal_instance_path));
    settings.push_str(&format!("restore_command = '{restore_command}'\n"));

    if let Some(time) = opts.target.time {
        settings.push_str(&format!(
            "recovery_target_time = '{}'\n",
            catalog::format_time(time)
        ));
    } else if let Some(xid) = opts.target.xid {
        settings.push_str(&format!("recovery_target_xid = '{xid}'\n"));
    } else if let Some(lsn) = opts.target.lsn {
        settings.push_str(&format!("recovery_target_lsn = '{lsn}'\n"));
    } else {
        settings.push_str("recovery_target = 'immediate'\n");
        settings.push_str("recovery_target_action = 'promote'\n");
    }
    if opts.target.is_set() && !opts.target.inclusive {
        settings.push_str("recovery_target_inclusive = 'false'\n");
    }
    if let Some(tli) = opts.target.tli {
        settings.push_str(&format!("recovery_target_timeline = '{tli}'\n"));
    }

    let auto_conf = pgdata.join("postgresql.auto.conf");
    let mut content = std::fs::read_to_string(auto_conf.as_std_path()).unwrap_or_default();
    content.push_str(&settings);
    utils::crashsafe::overwrite_file(&auto_conf, content.as_bytes())?;

    utils::crashsafe::overwrite_file(&pgdata.join("recovery.signal"), b"")?;
    Ok(())
}
