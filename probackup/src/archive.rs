//! `archive-push` / `archive-get`: move completed WAL segments between
//! the cluster's `pg_wal` and the catalog's archive, durably and without
//! ever exposing a half-copied segment.

use anyhow::{bail, Context};
use camino::Utf8Path;
use tracing::{info, warn};

use postgres_ffi::xlog_utils::{IsBackupHistoryFileName, IsTLHistoryFileName, IsXLogFileName};

use crate::config::InstanceContext;
use crate::datafile::file_crc32;

const PART_SUFFIX: &str = "part";

fn is_archivable_name(name: &str) -> bool {
    IsXLogFileName(name) || IsTLHistoryFileName(name) || IsBackupHistoryFileName(name)
}

/// `archive-push`: called by the server's `archive_command` with a
/// segment that is complete and ready.
pub fn do_archive_push(
    instance: &InstanceContext,
    wal_file_path: &Utf8Path,
    wal_file_name: &str,
    overwrite: bool,
) -> anyhow::Result<()> {
    if !is_archivable_name(wal_file_name) {
        bail!("\"{wal_file_name}\" does not look like a WAL file name");
    }
    let source = if wal_file_path.is_absolute() {
        wal_file_path.to_owned()
    } else {
        // archive_command gives %p relative to the data directory
        match &instance.config.pgdata {
            Some(pgdata) => pgdata.join(wal_file_path),
            None => wal_file_path.to_owned(),
        }
    };
    let dest = instance.wal_instance_path.join(wal_file_name);

    if dest.exists() {
        let src_crc = file_crc32(&source)?;
        let dst_crc = file_crc32(&dest)?;
        if src_crc == dst_crc {
            info!("WAL segment \"{wal_file_name}\" already exists in the archive, skipping");
            return Ok(());
        }
        if !overwrite {
            bail!(
                "WAL segment \"{wal_file_name}\" already exists in the archive with different content"
            );
        }
        warn!("overwriting WAL segment \"{wal_file_name}\" in the archive");
    }

    // in-flight copies carry a .part suffix; the final name appears only
    // after fsync + rename
    let part = utils::crashsafe::path_with_suffix_extension(&dest, PART_SUFFIX);
    std::fs::copy(source.as_std_path(), part.as_std_path())
        .with_context(|| format!("cannot copy \"{source}\" to the archive"))?;
    utils::crashsafe::fsync(&part)?;
    utils::crashsafe::durable_rename(&part, &dest)?;

    info!("pushed WAL file \"{wal_file_name}\" to the archive");
    Ok(())
}

/// `archive-get`: called by `restore_command` to fetch one segment back.
pub fn do_archive_get(
    instance: &InstanceContext,
    wal_file_name: &str,
    wal_file_path: &Utf8Path,
) -> anyhow::Result<()> {
    let source = instance.wal_instance_path.join(wal_file_name);
    if !source.exists() {
        // the server probes for segments past the end of the archive;
        // a missing file is a normal end-of-recovery signal, but it must
        // fail the command
        bail!("WAL file \"{wal_file_name}\" is absent from the archive");
    }

    let part = utils::crashsafe::path_with_suffix_extension(wal_file_path, PART_SUFFIX);
    std::fs::copy(source.as_std_path(), part.as_std_path())
        .with_context(|| format!("cannot copy \"{source}\" from the archive"))?;
    std::fs::rename(part.as_std_path(), wal_file_path.as_std_path())
        .with_context(|| format!("cannot rename into \"{wal_file_path}\""))?;

    info!("fetched WAL file \"{wal_file_name}\" from the archive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;

    fn instance(dir: &Utf8Path) -> InstanceContext {
        let instance = InstanceContext {
            name: "node".to_string(),
            backup_instance_path: dir.join("backups/node"),
            wal_instance_path: dir.join("wal/node"),
            config: InstanceConfig::default(),
        };
        std::fs::create_dir_all(&instance.wal_instance_path).unwrap();
        instance
    }

    const SEG: &str = "000000010000000000000001";

    #[test]
    fn push_and_get_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let instance = instance(dir.path());

        let src = dir.path().join(SEG);
        std::fs::write(&src, b"wal bytes").unwrap();

        do_archive_push(&instance, &src, SEG, false).unwrap();
        let archived = instance.wal_instance_path.join(SEG);
        assert_eq!(std::fs::read(&archived).unwrap(), b"wal bytes");
        // no .part leftovers
        assert!(!instance
            .wal_instance_path
            .join(format!("{SEG}.part"))
            .exists());

        // pushing identical content again is a no-op
        do_archive_push(&instance, &src, SEG, false).unwrap();

        // different content is rejected without --overwrite
        std::fs::write(&src, b"DIFFERENT").unwrap();
        assert!(do_archive_push(&instance, &src, SEG, false).is_err());
        do_archive_push(&instance, &src, SEG, true).unwrap();
        assert_eq!(std::fs::read(&archived).unwrap(), b"DIFFERENT");

        let fetched = dir.path().join("fetched");
        do_archive_get(&instance, SEG, &fetched).unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"DIFFERENT");

        assert!(do_archive_get(&instance, "000000010000000000000099", &fetched).is_err());
    }

    #[test]
    fn only_wal_like_names_are_accepted() {
        let dir = camino_tempfile::tempdir().unwrap();
        let instance = instance(dir.path());
        let src = dir.path().join("rogue");
        std::fs::write(&src, b"x").unwrap();
        assert!(do_archive_push(&instance, &src, "rogue", false).is_err());
        // history files are archivable
        let hist = dir.path().join("00000002.history");
        std::fs::write(&hist, b"1\t0/1000000\tsplit\n").unwrap();
        do_archive_push(&instance, &hist, "00000002.history", false).unwrap();
    }
}
