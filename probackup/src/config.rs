//! Catalog and instance configuration.
//!
//! The catalog path, instance config and friends are deliberately not
//! process globals: commands receive a [`CatalogContext`] /
//! [`InstanceContext`] value, initialized once in `main`.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};

use postgres_ffi::pg_constants::{
    WAL_SEGMENT_MAX_SIZE, WAL_SEGMENT_MIN_SIZE, WAL_SEGMENT_SIZE,
};

pub const BACKUPS_DIR: &str = "backups";
pub const WAL_SUBDIR: &str = "wal";
pub const DATABASE_DIR: &str = "database";
pub const BACKUP_CONTROL_FILE: &str = "backup.control";
pub const BACKUP_CATALOG_CONF_FILE: &str = "pg_probackup.conf";
pub const BACKUP_LOCK_FILE: &str = "backup.pid";
pub const DATABASE_FILE_LIST: &str = "backup_content.control";
pub const PG_BACKUP_LABEL_FILE: &str = "backup_label";
pub const PG_TABLESPACE_MAP_FILE: &str = "tablespace_map";
pub const HEADER_MAP: &str = "page_header_map";
pub const PG_XLOG_DIR: &str = "pg_wal";
pub const PG_TBLSPC_DIR: &str = "pg_tblspc";

/// Wait timeout for WAL segment archiving, seconds.
pub const ARCHIVE_TIMEOUT_DEFAULT: u32 = 300;

pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// update when remote agent API or behaviour changes
pub const AGENT_PROTOCOL_VERSION: u32 = 20509;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressAlg {
    #[default]
    None,
    /// Recognized for catalog compatibility, rejected on use.
    Pglz,
    Zlib,
}

pub const COMPRESS_LEVEL_DEFAULT: i32 = 1;

impl FromStr for CompressAlg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<CompressAlg> {
        match s {
            "none" => Ok(CompressAlg::None),
            "pglz" => Ok(CompressAlg::Pglz),
            "zlib" => Ok(CompressAlg::Zlib),
            _ => bail!("invalid compress algorithm value \"{s}\""),
        }
    }
}

impl fmt::Display for CompressAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressAlg::None => "none",
            CompressAlg::Pglz => "pglz",
            CompressAlg::Zlib => "zlib",
        })
    }
}

/// Connection parameters of the source database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub pgdatabase: Option<String>,
    pub pghost: Option<String>,
    pub pgport: Option<String>,
    pub pguser: Option<String>,
}

/// How to reach the data host when it is not local.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOptions {
    pub host: Option<String>,
    pub port: Option<String>,
    pub user: Option<String>,
    /// Path to the pg_probackup binary on the remote host.
    pub path: Option<String>,
    pub ssh_options: Option<String>,
}

impl RemoteOptions {
    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }
}

/// An instance configuration, stored in `pg_probackup.conf` and
/// overridable from the command line.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub pgdata: Option<Utf8PathBuf>,
    pub system_identifier: u64,
    pub xlog_seg_size: usize,

    pub conn_opt: ConnectionOptions,
    pub remote: RemoteOptions,

    /// Wait timeout for WAL segment archiving, seconds.
    pub archive_timeout: u32,

    /// Retention options. 0 disables the option.
    pub retention_redundancy: u32,
    pub retention_window: u32,
    pub wal_depth: u32,

    pub compress_alg: CompressAlg,
    pub compress_level: i32,

    /// cmdline to be used as restore_command
    pub restore_command: Option<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            pgdata: None,
            system_identifier: 0,
            xlog_seg_size: WAL_SEGMENT_SIZE,
            conn_opt: ConnectionOptions::default(),
            remote: RemoteOptions::default(),
            archive_timeout: ARCHIVE_TIMEOUT_DEFAULT,
            retention_redundancy: 0,
            retention_window: 0,
            wal_depth: 0,
            compress_alg: CompressAlg::None,
            compress_level: COMPRESS_LEVEL_DEFAULT,
            restore_command: None,
        }
    }
}

impl InstanceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.xlog_seg_size.is_power_of_two()
            || self.xlog_seg_size < WAL_SEGMENT_MIN_SIZE
            || self.xlog_seg_size > WAL_SEGMENT_MAX_SIZE
        {
            bail!(
                "invalid WAL segment size {}: must be a power of 2 between 1MB and 1GB",
                self.xlog_seg_size
            );
        }
        if self.compress_alg == CompressAlg::Pglz {
            bail!("compression algorithm \"pglz\" is not supported");
        }
        Ok(())
    }

    /// Serialize to `pg_probackup.conf` contents.
    pub fn to_file_contents(&self) -> String {
        let mut out = String::new();
        out.push_str("# Backup instance information\n");
        if let Some(pgdata) = &self.pgdata {
            out.push_str(&format!("pgdata = {pgdata}\n"));
        }
        out.push_str(&format!(
            "system-identifier = {}\n",
            self.system_identifier
        ));
        out.push_str(&format!("xlog-seg-size = {}\n", self.xlog_seg_size));

        out.push_str("\n# Connection parameters\n");
        if let Some(v) = &self.conn_opt.pgdatabase {
            out.push_str(&format!("pgdatabase = {v}\n"));
        }
        if let Some(v) = &self.conn_opt.pghost {
            out.push_str(&format!("pghost = {v}\n"));
        }
        if let Some(v) = &self.conn_opt.pgport {
            out.push_str(&format!("pgport = {v}\n"));
        }
        if let Some(v) = &self.conn_opt.pguser {
            out.push_str(&format!("pguser = {v}\n"));
        }

        if self.remote.is_remote() {
            out.push_str("\n# Remote access parameters\n");
            if let Some(v) = &self.remote.host {
                out.push_str(&format!("remote-host = {v}\n"));
            }
            if let Some(v) = &self.remote.port {
                out.push_str(&format!("remote-port = {v}\n"));
            }
            if let Some(v) = &self.remote.user {
                out.push_str(&format!("remote-user = {v}\n"));
            }
            if let Some(v) = &self.remote.path {
                out.push_str(&format!("remote-path = {v}\n"));
            }
            if let Some(v) = &self.remote.ssh_options {
                out.push_str(&format!("ssh-options = {v}\n"));
            }
        }

        out.push_str("\n# Archive parameters\n");
        out.push_str(&format!("archive-timeout = {}\n", self.archive_timeout));
        if let Some(v) = &self.restore_command {
            out.push_str(&format!("restore-command = {v}\n"));
        }

        out.push_str("\n# Retention parameters\n");
        out.push_str(&format!(
            "retention-redundancy = {}\n",
            self.retention_redundancy
        ));
        out.push_str(&format!("retention-window = {}\n", self.retention_window));
        out.push_str(&format!("wal-depth = {}\n", self.wal_depth));

        out.push_str("\n# Compression parameters\n");
        out.push_str(&format!("compress-algorithm = {}\n", self.compress_alg));
        out.push_str(&format!("compress-level = {}\n", self.compress_level));
        out
    }

    pub fn from_file_contents(content: &str) -> anyhow::Result<InstanceConfig> {
        let kv = parse_kv_file(content)?;
        let mut config = InstanceConfig::default();

        for (key, value) in kv {
            match key.as_str() {
                "pgdata" => config.pgdata = Some(Utf8PathBuf::from(value)),
                "system-identifier" => {
                    config.system_identifier = value
                        .parse()
                        .with_context(|| format!("invalid system-identifier \"{value}\""))?
                }
                "xlog-seg-size" => {
                    config.xlog_seg_size = value
                        .parse()
                        .with_context(|| format!("invalid xlog-seg-size \"{value}\""))?
                }
                "pgdatabase" => config.conn_opt.pgdatabase = Some(value),
                "pghost" => config.conn_opt.pghost = Some(value),
                "pgport" => config.conn_opt.pgport = Some(value),
                "pguser" => config.conn_opt.pguser = Some(value),
                "remote-host" => config.remote.host = Some(value),
                "remote-port" => config.remote.port = Some(value),
                "remote-user" => config.remote.user = Some(value),
                "remote-path" => config.remote.path = Some(value),
                "ssh-options" => config.remote.ssh_options = Some(value),
                "archive-timeout" => {
                    config.archive_timeout = value
                        .parse()
                        .with_context(|| format!("invalid archive-timeout \"{value}\""))?
                }
                "restore-command" => config.restore_command = Some(value),
                "retention-redundancy" => {
                    config.retention_redundancy = value
                        .parse()
                        .with_context(|| format!("invalid retention-redundancy \"{value}\""))?
                }
                "retention-window" => {
                    config.retention_window = value
                        .parse()
                        .with_context(|| format!("invalid retention-window \"{value}\""))?
                }
                "wal-depth" => {
                    config.wal_depth = value
                        .parse()
                        .with_context(|| format!("invalid wal-depth \"{value}\""))?
                }
                "compress-algorithm" => config.compress_alg = value.parse()?,
                "compress-level" => {
                    config.compress_level = value
                        .parse()
                        .with_context(|| format!("invalid compress-level \"{value}\""))?
                }
                // Unknown keys are ignored for forward compatibility.
                _ => {}
            }
        }
        Ok(config)
    }
}

/// Parse an INI-ish `key = value` file. Values may be single-quoted;
/// `#` starts a comment.
pub fn parse_kv_file(content: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut result = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("syntax error on line {}: \"{line}\"", lineno + 1);
        };
        let key = key.trim().to_string();
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value = &value[1..value.len() - 1];
        }
        result.push((key, value.to_string()));
    }
    Ok(result)
}

/// The backup catalog: a `-B` path with `backups/` and `wal/` inside.
#[derive(Debug, Clone)]
pub struct CatalogContext {
    pub backup_path: Utf8PathBuf,
}

impl CatalogContext {
    pub fn new(backup_path: Utf8PathBuf) -> CatalogContext {
        CatalogContext { backup_path }
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.backup_path.join(BACKUPS_DIR)
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.backup_path.join(WAL_SUBDIR)
    }

    pub fn instance_names(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.backups_dir();
        for entry in dir
            .read_dir_utf8()
            .with_context(|| format!("cannot open backup catalog directory \"{dir}\""))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load one instance: its paths and its `pg_probackup.conf`.
    pub fn instance(&self, name: &str) -> anyhow::Result<InstanceContext> {
        let backup_instance_path = self.backups_dir().join(name);
        let wal_instance_path = self.wal_dir().join(name);
        let config_path = backup_instance_path.join(BACKUP_CATALOG_CONF_FILE);

        if !backup_instance_path.is_dir() {
            bail!("instance \"{name}\" does not exist in this backup catalog");
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("cannot read instance config \"{config_path}\""))?;
        let config = InstanceConfig::from_file_contents(&content)
            .with_context(|| format!("cannot parse instance config \"{config_path}\""))?;

        Ok(InstanceContext {
            name: name.to_string(),
            backup_instance_path,
            wal_instance_path,
            config,
        })
    }
}

/// Paths and configuration of one instance within the catalog.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub name: String,
    /// `<catalog>/backups/<instance>`
    pub backup_instance_path: Utf8PathBuf,
    /// `<catalog>/wal/<instance>`
    pub wal_instance_path: Utf8PathBuf,
    pub config: InstanceConfig,
}

impl InstanceContext {
    pub fn config_path(&self) -> Utf8PathBuf {
        self.backup_instance_path.join(BACKUP_CATALOG_CONF_FILE)
    }

    pub fn backup_dir(&self, id: &str) -> Utf8PathBuf {
        self.backup_instance_path.join(id)
    }

    /// Persist the instance config atomically.
    pub fn write_config(&self) -> anyhow::Result<()> {
        let path = self.config_path();
        utils::crashsafe::overwrite_file(&path, self.config.to_file_contents().as_bytes())
            .with_context(|| format!("cannot write instance config \"{path}\""))?;
        Ok(())
    }
}

/// Resolve the catalog path from `-B` or the `BACKUP_PATH` environment
/// variable.
pub fn resolve_backup_path(arg: Option<&Utf8Path>) -> anyhow::Result<CatalogContext> {
    let path = match arg {
        Some(p) => p.to_owned(),
        None => match std::env::var("BACKUP_PATH") {
            Ok(p) => Utf8PathBuf::from(p),
            Err(_) => bail!(
                "required parameter not specified: BACKUP_PATH (-B, --backup-path)"
            ),
        },
    };
    Ok(CatalogContext::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let mut config = InstanceConfig {
            pgdata: Some(Utf8PathBuf::from("/var/lib/pgsql/data")),
            system_identifier: 7113778826914277186,
            retention_redundancy: 2,
            retention_window: 7,
            compress_alg: CompressAlg::Zlib,
            compress_level: 3,
            ..InstanceConfig::default()
        };
        config.conn_opt.pghost = Some("localhost".to_string());
        config.remote.host = Some("db1".to_string());

        let text = config.to_file_contents();
        let parsed = InstanceConfig::from_file_contents(&text).unwrap();
        assert_eq!(parsed.pgdata, config.pgdata);
        assert_eq!(parsed.system_identifier, config.system_identifier);
        assert_eq!(parsed.retention_redundancy, 2);
        assert_eq!(parsed.retention_window, 7);
        assert_eq!(parsed.compress_alg, CompressAlg::Zlib);
        assert_eq!(parsed.compress_level, 3);
        assert_eq!(parsed.conn_opt.pghost.as_deref(), Some("localhost"));
        assert_eq!(parsed.remote.host.as_deref(), Some("db1"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let parsed =
            InstanceConfig::from_file_contents("some-future-knob = 1\nretention-window = 3\n")
                .unwrap();
        assert_eq!(parsed.retention_window, 3);
    }

    #[test]
    fn quoted_values() {
        let kv = parse_kv_file("note = 'hello world'\n# comment\n").unwrap();
        assert_eq!(kv, vec![("note".to_string(), "hello world".to_string())]);
    }

    #[test]
    fn seg_size_validation() {
        let mut config = InstanceConfig::default();
        config.validate().unwrap();
        config.xlog_seg_size = 12345;
        assert!(config.validate().is_err());
        config.xlog_seg_size = 1024 * 1024;
        config.validate().unwrap();
    }
}
