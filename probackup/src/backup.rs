//! The backup driver: single-threaded orchestration of one backup, from
//! `pg_start_backup` through file fan-out to the archived-WAL wait and
//! the final catalog write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use camino::Utf8Path;
use chrono::Utc;
use tracing::{error, info, warn};

use postgres_ffi::xlog_utils::XLogFileName;
use postgres_ffi::RelFileNode;
use utils::lsn::Lsn;

use crate::catalog::{self, Backup, BackupId, BackupMode, BackupStatus};
use crate::config::{
    CatalogContext, InstanceContext, HEADER_MAP, PG_BACKUP_LABEL_FILE, PG_TABLESPACE_MAP_FILE,
    PG_XLOG_DIR,
};
use crate::datafile::{self, DataFileBackupResult};
use crate::dir;
use crate::error::{ClassifiedError, ErrorKind};
use crate::headermap::HeaderMapWriter;
use crate::pagemap::PageMap;
use crate::parsewal;
use crate::pgfile::{PgFile, BYTES_INVALID};
use crate::remote::client::FioClient;
use crate::source::PgSession;
use crate::walarchive;
use crate::workers::{run_parallel, CancelToken};

pub struct BackupOptions {
    pub mode: BackupMode,
    pub num_threads: usize,
    pub stream: bool,
    pub no_validate: bool,
    pub backup_logs: bool,
    pub smooth_checkpoint: bool,
    pub note: Option<String>,
    pub ttl: Option<i64>,
    pub expire_time: Option<i64>,
}

/// The stop segment never appeared in the archive. Distinguished so the
/// driver can throw the unrestorable backup away.
#[derive(thiserror::Error, Debug)]
#[error("WAL segment \"{name}\" was not archived in {timeout} seconds")]
struct WalArchiveTimeout {
    name: String,
    timeout: u64,
}

/// Run one backup; returns the new backup id.
pub fn do_backup(
    _catalog: &CatalogContext,
    instance: &mut InstanceContext,
    opts: &BackupOptions,
    cancel: &CancelToken,
) -> anyhow::Result<BackupId> {
    let pgdata = instance
        .config
        .pgdata
        .clone()
        .context("required parameter not specified: PGDATA (-D, --pgdata)")?;
    instance.config.validate()?;

    // 1-2. connect and verify we are looking at the right cluster
    let mut session = PgSession::connect(&instance.config.conn_opt)?;
    let node = session.node_info().clone();
    if instance.config.system_identifier != 0
        && instance.config.system_identifier != node.system_identifier
    {
        bail!(
            "backup data directory was initialized for system id {}, but connected instance has id {}",
            instance.config.system_identifier,
            node.system_identifier
        );
    }
    if instance.config.system_identifier == 0 {
        instance.config.system_identifier = node.system_identifier;
        instance.write_config()?;
    }

    if opts.mode == BackupMode::Ptrack && node.ptrack_version.is_none() {
        bail!("ptrack backup is requested, but the ptrack extension is not installed");
    }

    // create the catalog record first so a crash leaves an ERROR entry
    let mut start_time = Utc::now().timestamp();
    while instance
        .backup_dir(&BackupId(start_time).to_string())
        .exists()
    {
        start_time += 1;
    }
    let mut backup = Backup::new(opts.mode, start_time);
    backup.stream = opts.stream;
    backup.compress_alg = instance.config.compress_alg;
    backup.compress_level = instance.config.compress_level;
    backup.checksum_version = node.checksum_version;
    backup.server_version = node.server_version_str.clone();
    catalog::init_backup_dir(&mut backup, instance)?;
    let _lock = catalog::lock_backup(&backup)?;
    catalog::write_backup(&backup)?;
    info!(
        "backup start, backup ID: {}, backup mode: {}, instance: {}",
        backup.id(),
        backup.mode,
        instance.name
    );

    match run_backup(instance, opts, cancel, &mut session, &pgdata, &mut backup) {
        Ok(()) => {
            if !opts.no_validate {
                crate::validate::validate_backup(instance, &mut backup)?;
            } else {
                catalog::write_backup_status(&mut backup, BackupStatus::Ok)?;
            }
            if opts.note.is_some() {
                catalog::add_note(&mut backup, opts.note.as_deref())?;
            }
            if opts.ttl.is_some() || opts.expire_time.is_some() {
                catalog::pin_backup(&mut backup, opts.ttl, opts.expire_time)?;
            }
            info!("backup {} completed", backup.id());
            Ok(backup.id())
        }
        Err(e) => {
            error!("backup {} failed: {e:#}", backup.id());
            backup.end_time = Some(Utc::now().timestamp());
            if let Err(werr) = catalog::write_backup_status(&mut backup, BackupStatus::Error) {
                warn!("cannot record ERROR status: {werr:#}");
            }
            // a backup whose stop segment never made it to the archive
            // can never be restored; keep it only on explicit request
            if e.downcast_ref::<WalArchiveTimeout>().is_some() && !opts.no_validate {
                warn!("removing unrestorable backup {}", backup.id());
                if let Err(rerr) = std::fs::remove_dir_all(backup.root_dir.as_std_path()) {
                    warn!("cannot remove \"{}\": {rerr}", backup.root_dir);
                }
            }
            Err(e)
        }
    }
}

fn run_backup(
    instance: &InstanceContext,
    opts: &BackupOptions,
    cancel: &CancelToken,
    session: &mut PgSession,
    pgdata: &Utf8Path,
    backup: &mut Backup,
) -> anyhow::Result<()> {
    let node = session.node_info().clone();

    // 3. start point
    backup.tli = session.current_timeline()?;
    let label = format!("pg_probackup, backup ID: {}", backup.id());
    backup.start_lsn = session.start_backup(&label, opts.smooth_checkpoint)?;
    catalog::write_backup(backup)?;

    // resolve the incremental parent
    let parent = if backup.is_full() {
        None
    } else {
        let list = catalog::get_backup_list(instance)?;
        let parent = catalog::get_last_data_backup(&list, backup.tli)
            .cloned()
            .with_context(|| {
                format!(
                    "valid backup on current timeline {} is not found, create a new FULL backup before an incremental one",
                    backup.tli
                )
            })?;
        match catalog::scan_parent_chain(&parent, &list) {
            catalog::ParentChain::Ok(_) => {}
            catalog::ParentChain::Invalid(_, bad) => {
                bail!("backup {} has an unusable ancestor {bad}", parent.id())
            }
            catalog::ParentChain::Broken { missing } => {
                bail!("backup {} has a missing ancestor {missing}", parent.id())
            }
        }
        if parent.stop_lsn > backup.start_lsn {
            bail!(
                "parent backup {} has stop LSN {} past our start LSN {}",
                parent.id(),
                parent.stop_lsn,
                backup.start_lsn
            );
        }
        backup.parent_backup = Some(parent.id());
        catalog::write_backup(backup)?;
        Some(parent)
    };

    // 4. enumerate the data directory
    let fio = if instance.config.remote.is_remote() {
        Some(Arc::new(FioClient::connect(&instance.config.remote)?))
    } else {
        None
    };
    let mut files = match &fio {
        Some(client) => client.list_dir(pgdata, opts.backup_logs)?,
        None => dir::list_data_directory(pgdata, opts.backup_logs)?,
    };
    if files.is_empty() {
        bail!("data directory \"{pgdata}\" is empty");
    }
    backup.pgdata_bytes = files
        .iter()
        .filter(|f| f.is_regular())
        .map(|f| f.size as i64)
        .sum();
    info!(
        "{} files to consider, {} bytes in the data directory",
        files.len(),
        backup.pgdata_bytes
    );

    // what the parent already holds, for change detection
    let prev_entries: HashMap<String, (i64, u32)> = match &parent {
        Some(parent) => catalog::get_backup_filelist(parent, false)?
            .into_iter()
            .map(|f| (f.rel_path.clone(), (f.mtime, f.crc)))
            .collect(),
        None => HashMap::new(),
    };
    for file in files.iter_mut() {
        file.exists_in_prev = prev_entries.contains_key(&file.rel_path);
    }

    // 5. page maps for the incremental modes that have them
    match backup.mode {
        BackupMode::Page => {
            let parent = parent.as_ref().expect("PAGE backup has a parent");
            let history = walarchive::read_timeline_history(instance, backup.tli, false)?;
            let maps = parsewal::extract_page_map(
                &instance.wal_instance_path,
                instance.config.xlog_seg_size,
                backup.tli,
                history,
                parent.start_lsn,
                backup.start_lsn,
            )?;
            attach_page_maps(&mut files, &maps);
        }
        BackupMode::Ptrack => {
            let parent = parent.as_ref().expect("PTRACK backup has a parent");
            let init_lsn = session.ptrack_init_lsn()?;
            if init_lsn > parent.start_lsn {
                bail!(
                    "ptrack tracking was reset at {init_lsn}, after the parent backup started at {}; take a new FULL backup",
                    parent.start_lsn
                );
            }
            let pagemaps = session.ptrack_get_pagemapset(parent.start_lsn)?;
            let by_path: HashMap<String, Vec<u8>> = pagemaps.into_iter().collect();
            for file in files.iter_mut() {
                if !file.is_datafile {
                    continue;
                }
                match by_path.get(&file.rel_path) {
                    Some(bitmap) => file.pagemap = Some(PageMap::from_bytes(bitmap.clone())),
                    None => file.pagemap = None,
                }
            }
            // files ptrack did not report are unchanged
            for file in files.iter_mut() {
                if file.is_datafile && file.pagemap.is_none() && file.exists_in_prev {
                    file.write_size = BYTES_INVALID;
                }
            }
        }
        BackupMode::Full | BackupMode::Delta => {}
    }

    // 6. fan out
    let database_dir = backup.database_dir();
    for file in &files {
        if file.is_dir() || file.is_symlink() {
            utils::crashsafe::create_dir_all(database_dir.join(&file.rel_path))?;
        }
    }
    let hdr_map = HeaderMapWriter::new(backup.root_dir.join(HEADER_MAP));
    let prev_start_lsn = parent.as_ref().map(|p| p.start_lsn).unwrap_or(Lsn::INVALID);
    let parent_start_time = parent.as_ref().map(|p| p.start_time).unwrap_or(0);

    let results = run_parallel(opts.num_threads, &files, cancel, |_, file| {
        backup_one_file(
            file,
            pgdata,
            &database_dir,
            backup,
            prev_start_lsn,
            parent_start_time,
            node.checksum_version,
            &hdr_map,
            fio.as_deref(),
            cancel,
        )
    })
    .map_err(|e| anyhow::Error::new(e).context("backup of data files failed"))?;
    hdr_map.finish()?;

    for (index, result) in results {
        let file = &mut files[index];
        file.read_size = result.read_size;
        file.write_size = result.write_size;
        file.uncompressed_size = result.uncompressed_size;
        file.crc = result.crc;
        if let Some(coords) = result.coords {
            coords.apply(file);
        }
        if file.write_size == BYTES_INVALID {
            // the parent's copy is authoritative; keep its CRC visible
            if let Some((_, crc)) = prev_entries.get(&file.rel_path) {
                file.crc = *crc;
            }
        }
    }

    // 8. stop point
    let stop = session.stop_backup()?;
    backup.stop_lsn = stop.stop_lsn;

    let label_path = database_dir.join(PG_BACKUP_LABEL_FILE);
    utils::crashsafe::overwrite_file(&label_path, stop.backup_label.as_bytes())?;
    files.push(special_file_entry(PG_BACKUP_LABEL_FILE, stop.backup_label.as_bytes()));
    if let Some(map) = &stop.tablespace_map {
        let map_path = database_dir.join(PG_TABLESPACE_MAP_FILE);
        utils::crashsafe::overwrite_file(&map_path, map.as_bytes())?;
        files.push(special_file_entry(PG_TABLESPACE_MAP_FILE, map.as_bytes()));
    }

    // 9. the backup is only restorable once the stop segment is archived
    if opts.stream {
        backup.wal_bytes = capture_stream_wal(instance, backup)?;
    } else {
        wait_wal_archived(instance, backup, cancel)?;
        let seg_size = instance.config.xlog_seg_size as u64;
        let first = backup.start_lsn.segment_number(seg_size as usize);
        let last = backup.stop_lsn.segment_number(seg_size as usize);
        backup.wal_bytes = ((last - first + 1) * seg_size) as i64;
    }

    // recovery coordinates from the archived records
    let wal_dir = if opts.stream {
        database_dir.join(PG_XLOG_DIR)
    } else {
        instance.wal_instance_path.clone()
    };
    match parsewal::read_recovery_info(
        &wal_dir,
        instance.config.xlog_seg_size,
        backup.tli,
        backup.start_lsn,
        backup.stop_lsn,
    ) {
        Ok(Some((time, xid))) => {
            backup.recovery_time = Some(time);
            backup.recovery_xid = xid;
        }
        Ok(None) => {
            backup.recovery_time = Some(Utc::now().timestamp());
        }
        Err(e) => {
            warn!("cannot extract recovery time: {e:#}");
            backup.recovery_time = Some(Utc::now().timestamp());
        }
    }

    backup.data_bytes = files
        .iter()
        .map(|f| f.write_size.max(0))
        .sum();
    backup.uncompressed_bytes = files.iter().map(|f| f.uncompressed_size as i64).sum();

    // 10. persist the manifest and flip the status
    backup.content_crc = catalog::write_backup_filelist(backup, &mut files)?;
    backup.end_time = Some(Utc::now().timestamp());
    catalog::write_backup_status(backup, BackupStatus::Done)?;

    if let Some(client) = &fio {
        client.disconnect()?;
    }
    info!(
        "backup {} data: {} bytes, wal: {} bytes",
        backup.id(),
        backup.data_bytes,
        backup.wal_bytes
    );
    Ok(())
}

/// Process one manifest entry on a worker.
#[allow(clippy::too_many_arguments)]
fn backup_one_file(
    file: &PgFile,
    pgdata: &Utf8Path,
    database_dir: &Utf8Path,
    backup: &Backup,
    prev_start_lsn: Lsn,
    parent_start_time: i64,
    checksum_version: u32,
    hdr_map: &HeaderMapWriter,
    fio: Option<&FioClient>,
    cancel: &CancelToken,
) -> Result<DataFileBackupResult, ClassifiedError> {
    // directories and symlinks are manifest-only
    if !file.is_regular() {
        return Ok(DataFileBackupResult::default());
    }
    // PAGE/PTRACK marked it unchanged before the fan-out
    if file.write_size == BYTES_INVALID {
        return Ok(DataFileBackupResult {
            write_size: BYTES_INVALID,
            ..Default::default()
        });
    }

    let from = pgdata.join(&file.rel_path);
    let to = database_dir.join(&file.rel_path);

    if file.is_datafile {
        match fio {
            Some(client) => client.backup_data_file_remote(
                &from,
                &to,
                file,
                prev_start_lsn,
                backup.mode,
                backup.compress_alg,
                backup.compress_level,
                checksum_version,
                hdr_map,
                true,
                cancel,
            ),
            None => datafile::backup_data_file(
                &from,
                &to,
                file,
                prev_start_lsn,
                backup.mode,
                backup.compress_alg,
                backup.compress_level,
                checksum_version,
                hdr_map,
                true,
                cancel,
            ),
        }
    } else {
        // unchanged non-data files are not re-stored in incrementals
        if backup.mode != BackupMode::Full
            && file.exists_in_prev
            && file.mtime != 0
            && file.mtime < parent_start_time
        {
            return Ok(DataFileBackupResult {
                write_size: BYTES_INVALID,
                ..Default::default()
            });
        }
        let copied = match fio {
            Some(client) => client
                .send_file_to_local(&from, &to)
                .map_err(|e| ClassifiedError::new(ErrorKind::Remote, e))?,
            None => datafile::copy_non_data_file(&from, &to)
                .map_err(|e| ClassifiedError::new(ErrorKind::SystemIo, e))?,
        };
        Ok(match copied {
            Some((size, crc)) => DataFileBackupResult {
                read_size: size,
                write_size: size as i64,
                uncompressed_size: size,
                crc,
                coords: None,
            },
            None => DataFileBackupResult {
                write_size: crate::pgfile::FILE_NOT_FOUND,
                ..Default::default()
            },
        })
    }
}

/// Attach WAL-derived page maps to the matching data files. Data files
/// that exist in the parent and saw no WAL traffic are unchanged.
fn attach_page_maps(files: &mut [PgFile], maps: &HashMap<(RelFileNode, u32), PageMap>) {
    let mut matched: HashSet<(RelFileNode, u32)> = HashSet::new();
    for file in files.iter_mut() {
        if !file.is_datafile {
            continue;
        }
        let key = (
            RelFileNode {
                spcnode: file.tblspc_oid,
                dbnode: file.db_oid,
                relnode: file.rel_oid,
            },
            file.segno,
        );
        match maps.get(&key) {
            Some(map) => {
                file.pagemap = Some(map.clone());
                matched.insert(key);
            }
            None if file.exists_in_prev => file.write_size = BYTES_INVALID,
            None => {
                // a relation the parent has never seen: copy it whole
            }
        }
    }
    let unmatched = maps.len() - matched.len();
    if unmatched > 0 {
        // blocks changed in relations that vanished before enumeration
        info!("{unmatched} changed relation segments no longer exist");
    }
}

fn special_file_entry(rel_path: &str, content: &[u8]) -> PgFile {
    let mut file = PgFile::new(rel_path, 0o100600, content.len() as u64, 0);
    file.crc = crc32c::crc32c(content);
    file.read_size = content.len() as u64;
    file.write_size = content.len() as i64;
    file.uncompressed_size = content.len() as u64;
    file
}

/// Poll the archive until the segment holding the stop LSN appears.
/// Exceeding `archive_timeout` fails the backup.
fn wait_wal_archived(
    instance: &InstanceContext,
    backup: &Backup,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let seg_size = instance.config.xlog_seg_size;
    let segno = backup.stop_lsn.segment_number(seg_size);
    let name = XLogFileName(backup.tli, segno, seg_size);
    let path = instance.wal_instance_path.join(&name);
    let timeout = Duration::from_secs(instance.config.archive_timeout as u64);
    let started = Instant::now();

    info!(
        "waiting for WAL segment \"{name}\" to be archived (timeout {}s)",
        timeout.as_secs()
    );
    loop {
        if path.exists() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            bail!("interrupted while waiting for WAL archiving");
        }
        if started.elapsed() >= timeout {
            return Err(WalArchiveTimeout {
                name: name.clone(),
                timeout: timeout.as_secs(),
            }
            .into());
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Stream-mode WAL capture: place the `[start_lsn, stop_lsn]` segment
/// range into the backup's own `database/pg_wal` so the backup directory
/// is self-contained. Returns the bytes stored.
fn capture_stream_wal(instance: &InstanceContext, backup: &Backup) -> anyhow::Result<i64> {
    let seg_size = instance.config.xlog_seg_size;
    let wal_dir = backup.database_dir().join(PG_XLOG_DIR);
    utils::crashsafe::create_dir_all(&wal_dir)?;

    let first = backup.start_lsn.segment_number(seg_size);
    let last = backup.stop_lsn.segment_number(seg_size);
    let mut total: i64 = 0;
    let deadline = Instant::now() + Duration::from_secs(instance.config.archive_timeout as u64);

    for segno in first..=last {
        let name = XLogFileName(backup.tli, segno, seg_size);
        let src = instance.wal_instance_path.join(&name);
        // the final segment may still be in flight
        while !src.exists() {
            if Instant::now() >= deadline {
                bail!("WAL segment \"{name}\" was not archived for the streamed backup");
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        let dst = wal_dir.join(&name);
        std::fs::copy(&src, &dst)
            .with_context(|| format!("cannot copy WAL segment \"{src}\""))?;
        utils::crashsafe::fsync_file_and_parent(&dst)?;
        total += seg_size as i64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_maps_mark_unseen_files_unchanged() {
        let node = RelFileNode {
            spcnode: 1663,
            dbnode: 13010,
            relnode: 16384,
        };
        let mut changed = PageMap::new();
        changed.add(3);
        let mut maps = HashMap::new();
        maps.insert((node, 0u32), changed);

        let mut touched = PgFile::new("base/13010/16384", 0o100600, 8192 * 8, 0);
        touched.exists_in_prev = true;
        let mut untouched = PgFile::new("base/13010/16500", 0o100600, 8192, 0);
        untouched.exists_in_prev = true;
        let mut fresh = PgFile::new("base/13010/17000", 0o100600, 8192, 0);
        fresh.exists_in_prev = false;

        let mut files = vec![touched, untouched, fresh];
        attach_page_maps(&mut files, &maps);

        assert!(files[0].pagemap.is_some());
        assert_eq!(files[0].write_size, 0);
        // unchanged relation is carried as -1 without reading it
        assert!(files[1].pagemap.is_none());
        assert_eq!(files[1].write_size, BYTES_INVALID);
        // a new relation is copied whole
        assert!(files[2].pagemap.is_none());
        assert_eq!(files[2].write_size, 0);
    }

    #[test]
    fn special_entries_carry_their_own_crc() {
        let entry = special_file_entry(PG_BACKUP_LABEL_FILE, b"START WAL LOCATION: 0/2000028\n");
        assert_eq!(entry.rel_path, "backup_label");
        assert_eq!(entry.write_size, 30);
        assert_eq!(entry.crc, crc32c::crc32c(b"START WAL LOCATION: 0/2000028\n"));
    }
}
