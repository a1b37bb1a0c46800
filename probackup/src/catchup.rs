//! `catchup`: clone a running cluster straight into a data directory,
//! without going through the backup catalog. FULL copies everything;
//! DELTA rewrites only blocks changed since the destination's checkpoint;
//! PTRACK asks the in-database bitmap which blocks those are.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{bail, Context};
use camino::Utf8Path;
use tracing::{info, warn};

use postgres_ffi::controlfile::ControlFileData;
use postgres_ffi::xlog_utils::XLogFileName;
use utils::lsn::Lsn;

use crate::config::ConnectionOptions;
use crate::datafile;
use crate::dir::{self, TablespaceMapping};
use crate::error::{ClassifiedError, ErrorKind};
use crate::pagemap::PageMap;
use crate::pgfile::PgFile;
use crate::source::PgSession;
use crate::workers::{run_parallel, CancelToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupMode {
    Full,
    Delta,
    Ptrack,
}

impl FromStr for CatchupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<CatchupMode> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(CatchupMode::Full),
            "DELTA" => Ok(CatchupMode::Delta),
            "PTRACK" => Ok(CatchupMode::Ptrack),
            _ => bail!("invalid catchup mode \"{s}\""),
        }
    }
}

pub struct CatchupOptions {
    pub mode: CatchupMode,
    pub source_pgdata: camino::Utf8PathBuf,
    pub dest_pgdata: camino::Utf8PathBuf,
    pub conn_opt: ConnectionOptions,
    pub num_threads: usize,
}

pub fn do_catchup(opts: &CatchupOptions, cancel: &CancelToken) -> anyhow::Result<()> {
    let mut session = PgSession::connect(&opts.conn_opt)?;
    let node = session.node_info().clone();
    let dest = &opts.dest_pgdata;

    // the destination must not be a live cluster
    let dest_pid = dest.join("postmaster.pid");
    if dest_pid.exists() {
        bail!("destination directory \"{dest}\" contains postmaster.pid, is a server running there?");
    }

    let horizon = match opts.mode {
        CatchupMode::Full => {
            let occupied = dest.is_dir()
                && dest
                    .read_dir_utf8()
                    .map(|mut it| it.next().is_some())
                    .unwrap_or(false);
            if occupied {
                bail!("destination directory \"{dest}\" is not empty");
            }
            Lsn::INVALID
        }
        CatchupMode::Delta | CatchupMode::Ptrack => {
            let control_bytes = std::fs::read(dest.join("global/pg_control").as_std_path())
                .with_context(|| {
                    format!("cannot read pg_control of \"{dest}\" for incremental catchup")
                })?;
            let control = ControlFileData::decode(&control_bytes)?;
            if control.system_identifier != node.system_identifier {
                bail!(
                    "source and destination are different clusters: system id {} vs {}",
                    node.system_identifier,
                    control.system_identifier
                );
            }
            control.checkpoint_redo
        }
    };

    if opts.mode == CatchupMode::Ptrack {
        let init_lsn = session.ptrack_init_lsn()?;
        if init_lsn.is_valid() && init_lsn > horizon {
            bail!(
                "ptrack tracking was reset at {init_lsn}, after the destination checkpoint {horizon}; use DELTA or FULL"
            );
        }
    }

    let label = "pg_probackup, catchup";
    let start_lsn = session.start_backup(label, false)?;
    info!(
        "catchup ({:?}) from \"{}\" into \"{dest}\" started at {start_lsn}, horizon {horizon}",
        opts.mode, opts.source_pgdata
    );

    let files = dir::list_data_directory(&opts.source_pgdata, false)?;
    dir::create_data_directories(&files, dest, &TablespaceMapping::default(), true)?;

    // ptrack supplies per-file block maps
    let ptrack_maps: HashMap<String, PageMap> = if opts.mode == CatchupMode::Ptrack {
        session
            .ptrack_get_pagemapset(horizon)?
            .into_iter()
            .map(|(path, bitmap)| (path, PageMap::from_bytes(bitmap)))
            .collect()
    } else {
        HashMap::new()
    };

    let checksum_version = node.checksum_version;
    let mode = opts.mode;
    let source_root = &opts.source_pgdata;
    run_parallel(opts.num_threads, &files, cancel, |_, file| {
        catchup_one_file(
            file,
            source_root,
            dest,
            mode,
            horizon,
            checksum_version,
            &ptrack_maps,
            cancel,
        )
    })
    .map_err(|e| anyhow::Error::new(e).context("catchup of data files failed"))?;

    let stop = session.stop_backup()?;

    // the destination recovers from the backup-start checkpoint
    utils::crashsafe::overwrite_file(&dest.join("backup_label"), stop.backup_label.as_bytes())?;
    if let Some(map) = &stop.tablespace_map {
        utils::crashsafe::overwrite_file(&dest.join("tablespace_map"), map.as_bytes())?;
    }

    copy_wal_range(&opts.source_pgdata, dest, &mut session, start_lsn, stop.stop_lsn)?;
    info!("catchup completed at {}", stop.stop_lsn);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn catchup_one_file(
    file: &PgFile,
    source_root: &Utf8Path,
    dest_root: &Utf8Path,
    mode: CatchupMode,
    horizon: Lsn,
    checksum_version: u32,
    ptrack_maps: &HashMap<String, PageMap>,
    cancel: &CancelToken,
) -> Result<(), ClassifiedError> {
    if !file.is_regular() {
        return Ok(());
    }
    let from = source_root.join(&file.rel_path);
    let to = dest_root.join(&file.rel_path);

    if file.is_datafile {
        let pagemap = match mode {
            CatchupMode::Ptrack => {
                match ptrack_maps.get(&file.rel_path) {
                    Some(map) => Some(map),
                    // untouched per ptrack: nothing to copy
                    None if horizon.is_valid() && to.is_file() => return Ok(()),
                    None => None,
                }
            }
            _ => None,
        };
        let lsn_horizon = match mode {
            CatchupMode::Full => Lsn::INVALID,
            CatchupMode::Delta => horizon,
            // the bitmap already says which blocks changed
            CatchupMode::Ptrack => Lsn::INVALID,
        };
        datafile::catchup_data_file(
            &from,
            &to,
            file,
            lsn_horizon,
            checksum_version,
            pagemap,
            cancel,
        )?;
        Ok(())
    } else {
        match datafile::copy_non_data_file(&from, &to)
            .map_err(|e| ClassifiedError::new(ErrorKind::SystemIo, e))?
        {
            Some(_) => Ok(()),
            None => {
                warn!("file \"{from}\" vanished during catchup");
                Ok(())
            }
        }
    }
}

/// The destination needs the WAL covering `[start, stop]` to reach
/// consistency; take the segments straight from the source's `pg_wal`.
fn copy_wal_range(
    source_root: &Utf8Path,
    dest_root: &Utf8Path,
    session: &mut PgSession,
    start_lsn: Lsn,
    stop_lsn: Lsn,
) -> anyhow::Result<()> {
    let tli = session.current_timeline()?;
    let seg_size = postgres_ffi::pg_constants::WAL_SEGMENT_SIZE;
    let src_wal = source_root.join("pg_wal");
    let dst_wal = dest_root.join("pg_wal");
    utils::crashsafe::create_dir_all(&dst_wal)?;

    for segno in start_lsn.segment_number(seg_size)..=stop_lsn.segment_number(seg_size) {
        let name = XLogFileName(tli, segno, seg_size);
        let src = src_wal.join(&name);
        let dst = dst_wal.join(&name);
        std::fs::copy(src.as_std_path(), dst.as_std_path())
            .with_context(|| format!("cannot copy WAL segment \"{src}\""))?;
        utils::crashsafe::fsync_file_and_parent(&dst)?;
    }
    Ok(())
}
