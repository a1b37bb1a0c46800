//! Directory enumeration and (re)creation.
//!
//! Enumeration walks the data directory, producing one manifest entry per
//! file, directory or tablespace symlink; the well-known transient
//! directories are kept as empty entries so a restored cluster gets their
//! permissions back, and transient files are dropped entirely.

use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{PG_TBLSPC_DIR, PG_XLOG_DIR};
use crate::pgfile::PgFile;

/// The contents of these directories are removed or recreated during
/// server start, so they are not included in backups. The directories
/// themselves are kept and included as empty to preserve access
/// permissions.
const PGDATA_EXCLUDE_DIR: &[&str] = &[
    PG_XLOG_DIR,
    "pg_xlog",
    // Skip temporary statistics files.
    "pg_stat_tmp",
    "pgsql_tmp",
    // It is generally not useful to backup the contents of this
    // directory even if the intention is to restore to another master.
    "pg_replslot",
    // Contents removed on startup.
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    // Contents zeroed on startup.
    "pg_subtrans",
];

/// Skipped entirely.
const PGDATA_EXCLUDE_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "postgresql.auto.conf.tmp",
    "current_logfiles.tmp",
    "recovery.conf",
    "standby.signal",
    "recovery.signal",
    "probackup_recovery.conf",
    "pg_internal.init",
];

fn is_excluded_dir(name: &str) -> bool {
    PGDATA_EXCLUDE_DIR.contains(&name)
}

fn is_excluded_file(name: &str) -> bool {
    PGDATA_EXCLUDE_FILES.contains(&name)
}

/// Temp relations (`t<backendid>_<reloid>`) vanish with their backend.
fn is_temp_relation(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('t') else {
        return false;
    };
    let Some((backend, rel)) = rest.split_once('_') else {
        return false;
    };
    !backend.is_empty()
        && backend.bytes().all(|b| b.is_ascii_digit())
        && !rel.is_empty()
        && rel.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

/// Enumerate the data directory into manifest entries, relative paths
/// sorted ascending. Tablespace symlinks under `pg_tblspc/` are recorded
/// with their target and their content is walked through the link.
pub fn list_data_directory(pgdata: &Utf8Path, backup_logs: bool) -> anyhow::Result<Vec<PgFile>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(pgdata.as_std_path())
        .follow_links(true)
        .sort_by_file_name();

    let mut it = walker.into_iter();
    while let Some(entry) = it.next() {
        let entry = entry.with_context(|| format!("cannot list directory \"{pgdata}\""))?;
        let path = Utf8Path::from_path(entry.path())
            .with_context(|| format!("non-UTF8 path under \"{pgdata}\""))?;
        if path == pgdata {
            continue;
        }
        let rel_path = path
            .strip_prefix(pgdata)
            .expect("walkdir yields children of the root")
            .as_str()
            .to_string();
        let name = entry.file_name().to_string_lossy().to_string();

        let meta = entry
            .metadata()
            .with_context(|| format!("cannot stat \"{path}\""))?;

        if meta.is_dir() {
            let is_tblspc_link = entry.path_is_symlink()
                && rel_path.starts_with(PG_TBLSPC_DIR)
                && rel_path.matches('/').count() == 1;

            let mut file = PgFile::new(
                &rel_path,
                if is_tblspc_link {
                    0o120000 | (meta.permissions().mode() & 0o7777)
                } else {
                    0o040000 | (meta.permissions().mode() & 0o7777)
                },
                0,
                meta.mtime(),
            );
            if is_tblspc_link {
                let target = std::fs::read_link(path.as_std_path())
                    .with_context(|| format!("cannot read symlink \"{path}\""))?;
                file.linked = Some(
                    target
                        .to_str()
                        .with_context(|| format!("non-UTF8 symlink target of \"{path}\""))?
                        .to_string(),
                );
            }
            files.push(file);

            // transient and log directories survive as empty entries
            if is_excluded_dir(&name) || (!backup_logs && (name == "log" || name == "pg_log")) {
                it.skip_current_dir();
            }
            continue;
        }

        if !meta.is_file() {
            // sockets, fifos and friends have no place in a backup
            warn!("skipping special file \"{path}\"");
            continue;
        }
        if is_excluded_file(&name) || is_temp_relation(&name) {
            continue;
        }
        // editor droppings and in-flight temp files
        if name.ends_with(".tmp") || name.starts_with("pgsql_tmp") {
            continue;
        }

        files.push(PgFile::new(
            &rel_path,
            0o100000 | (meta.permissions().mode() & 0o7777),
            meta.len(),
            meta.mtime(),
        ));
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// `--tablespace-mapping=OLDDIR=NEWDIR` remappings.
#[derive(Debug, Clone, Default)]
pub struct TablespaceMapping {
    map: HashMap<String, String>,
}

impl TablespaceMapping {
    pub fn parse(args: &[String]) -> anyhow::Result<TablespaceMapping> {
        let mut map = HashMap::new();
        for arg in args {
            let Some((old, new)) = arg.split_once('=') else {
                bail!("invalid tablespace mapping \"{arg}\", expected OLDDIR=NEWDIR");
            };
            if old.is_empty() || new.is_empty() {
                bail!("invalid tablespace mapping \"{arg}\", expected OLDDIR=NEWDIR");
            }
            if map.insert(old.to_string(), new.to_string()).is_some() {
                bail!("duplicate tablespace mapping for \"{old}\"");
            }
        }
        Ok(TablespaceMapping { map })
    }

    pub fn remap<'a>(&'a self, dir: &'a str) -> &'a str {
        self.map.get(dir).map(|s| s.as_str()).unwrap_or(dir)
    }
}

/// Recreate the directory tree and tablespace symlinks of a backup at the
/// restore destination, in manifest order (parents sort before children).
pub fn create_data_directories(
    dest_files: &[PgFile],
    data_dir: &Utf8Path,
    mapping: &TablespaceMapping,
    incremental: bool,
) -> anyhow::Result<()> {
    utils::crashsafe::create_dir_all(data_dir)
        .with_context(|| format!("cannot create directory \"{data_dir}\""))?;

    for file in dest_files {
        if file.is_dir() {
            let path = data_dir.join(&file.rel_path);
            if !(incremental && path.is_dir()) {
                utils::crashsafe::create_dir_all(&path)
                    .with_context(|| format!("cannot create directory \"{path}\""))?;
            }
        } else if file.is_symlink() {
            let target_raw = file
                .linked
                .as_deref()
                .with_context(|| format!("symlink entry \"{}\" without target", file.rel_path))?;
            let target = mapping.remap(target_raw);
            let link_path = data_dir.join(&file.rel_path);

            utils::crashsafe::create_dir_all(Utf8PathBuf::from(target))
                .with_context(|| format!("cannot create tablespace directory \"{target}\""))?;
            if let Some(parent) = link_path.parent() {
                utils::crashsafe::create_dir_all(parent)
                    .with_context(|| format!("cannot create directory \"{parent}\""))?;
            }
            if incremental && link_path.is_symlink() {
                continue;
            }
            std::os::unix::fs::symlink(target, link_path.as_std_path())
                .with_context(|| format!("cannot create symlink \"{link_path}\""))?;
        }
    }
    Ok(())
}

/// The tablespace symlinks recorded in a manifest: `(oid dir, target)`.
pub fn tablespace_links(files: &[PgFile]) -> Vec<(String, String)> {
    files
        .iter()
        .filter(|f| f.is_symlink())
        .filter_map(|f| {
            f.linked
                .as_ref()
                .map(|target| (f.rel_path.clone(), target.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Utf8Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn enumeration_applies_exclusions() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path();

        touch(&pgdata.join("PG_VERSION"), b"14\n");
        touch(&pgdata.join("postmaster.pid"), b"1234\n");
        touch(&pgdata.join("base/13010/16384"), &[0u8; 8192]);
        touch(&pgdata.join("base/13010/t3_16500"), &[0u8; 8192]);
        touch(&pgdata.join("pg_wal/000000010000000000000001"), b"x");
        touch(&pgdata.join("pg_notify/0000"), b"x");
        touch(&pgdata.join("global/pg_control"), b"ctrl");

        let files = list_data_directory(pgdata, false).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();

        assert!(paths.contains(&"PG_VERSION"));
        assert!(paths.contains(&"base/13010/16384"));
        assert!(paths.contains(&"global/pg_control"));
        // excluded directories survive as bare entries
        assert!(paths.contains(&"pg_wal"));
        assert!(paths.contains(&"pg_notify"));
        // ... their contents do not
        assert!(!paths.iter().any(|p| p.starts_with("pg_wal/")));
        assert!(!paths.iter().any(|p| p.starts_with("pg_notify/")));
        // excluded files and temp relations are dropped
        assert!(!paths.contains(&"postmaster.pid"));
        assert!(!paths.contains(&"base/13010/t3_16500"));
        // sorted
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn temp_relation_names() {
        assert!(is_temp_relation("t3_16500"));
        assert!(is_temp_relation("t12_16500.2"));
        assert!(!is_temp_relation("16500"));
        assert!(!is_temp_relation("t_16500"));
        assert!(!is_temp_relation("toast"));
    }

    #[test]
    fn tablespace_mapping_parse() {
        let m = TablespaceMapping::parse(&["/old/ts=/new/ts".to_string()]).unwrap();
        assert_eq!(m.remap("/old/ts"), "/new/ts");
        assert_eq!(m.remap("/other"), "/other");
        assert!(TablespaceMapping::parse(&["nonsense".to_string()]).is_err());
        assert!(TablespaceMapping::parse(&[
            "/a=/b".to_string(),
            "/a=/c".to_string()
        ])
        .is_err());
    }

    #[test]
    fn recreate_directories_and_links() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dest = dir.path().join("restored");
        let ts_target = dir.path().join("tsdata");

        let mut link = PgFile::new("pg_tblspc/16500", 0o120777, 0, 0);
        link.linked = Some(ts_target.to_string());
        let files = vec![
            PgFile::new("base", 0o040700, 0, 0),
            PgFile::new("base/13010", 0o040700, 0, 0),
            link,
            PgFile::new("pg_wal", 0o040700, 0, 0),
        ];

        create_data_directories(&files, &dest, &TablespaceMapping::default(), false).unwrap();
        assert!(dest.join("base/13010").is_dir());
        assert!(dest.join("pg_wal").is_dir());
        assert!(dest.join("pg_tblspc/16500").is_symlink());
        assert!(ts_target.is_dir());
    }
}
