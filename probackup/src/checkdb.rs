//! `checkdb`: validate every block of a live data directory, with the
//! same torn-write retry loop the backup path uses, but without writing
//! anything anywhere.

use anyhow::{bail, Context};
use camino::Utf8Path;
use tracing::{error, info};

use postgres_ffi::controlfile::ControlFileData;
use utils::lsn::Lsn;

use crate::config::CompressAlg;
use crate::datafile::{scan_data_file, ScanError, ScanOptions};
use crate::dir;
use crate::workers::{run_parallel, CancelToken};

pub fn do_checkdb(
    pgdata: &Utf8Path,
    num_threads: usize,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let control_bytes = std::fs::read(pgdata.join("global/pg_control").as_std_path())
        .with_context(|| format!("cannot read pg_control of \"{pgdata}\""))?;
    let control = ControlFileData::decode(&control_bytes)?;
    if control.data_checksum_version == 0 {
        info!("data checksums are disabled, only page headers will be verified");
    }

    let files = dir::list_data_directory(pgdata, false)?;
    let datafiles: Vec<_> = files.into_iter().filter(|f| f.is_datafile).collect();
    info!("checking {} data files in \"{pgdata}\"", datafiles.len());

    // block problems are collected, not fatal per file: the point of
    // checkdb is a full damage report
    let results = run_parallel(num_threads, &datafiles, cancel, |_, file| {
        let path = pgdata.join(&file.rel_path);
        if file.size % 8192 != 0 {
            return Ok(Some(format!(
                "file \"{path}\" has odd size {}",
                file.size
            )));
        }
        let opts = ScanOptions {
            nblocks: (file.size / 8192) as u32,
            segno: file.segno,
            horizon_lsn: Lsn::INVALID,
            checksum_version: control.data_checksum_version,
            calg: CompressAlg::None,
            clevel: 0,
            pagemap: None,
            cancel: Some(cancel),
        };
        match scan_data_file(&path, &opts, &mut |_| Ok(())) {
            Ok(_) => Ok(None),
            Err(ScanError::Missing) => Ok(None), // dropped concurrently
            Err(ScanError::Corruption { blkno, msg }) => Ok(Some(format!(
                "file \"{path}\", block {blkno}: {msg}"
            ))),
            Err(e) => Err(e.classify(&path)),
        }
    })
    .map_err(|e| anyhow::Error::new(e).context("checkdb failed"))?;

    let corruptions: Vec<String> = results.into_iter().filter_map(|(_, r)| r).collect();
    if corruptions.is_empty() {
        info!("data files are valid");
        Ok(())
    } else {
        for problem in &corruptions {
            error!("{problem}");
        }
        bail!("checkdb found {} corrupted data files", corruptions.len());
    }
}
