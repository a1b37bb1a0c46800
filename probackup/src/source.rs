//! The connection to the source database: starting and stopping the
//! backup, node compatibility facts, and the ptrack page-map fetch.
//! Everything here is a thin contract over SQL; the backup engine never
//! sees the connection itself.

use anyhow::{bail, Context};
use postgres::{Client, NoTls};
use tracing::info;

use postgres_ffi::TimeLineID;
use utils::lsn::Lsn;

use crate::config::ConnectionOptions;

/// Facts about the source node, collected once per session.
#[derive(Debug, Clone)]
pub struct PgNodeInfo {
    pub server_version: i32,
    pub server_version_str: String,
    /// 0 when data checksums are disabled on the cluster.
    pub checksum_version: u32,
    pub system_identifier: u64,
    pub is_superuser: bool,
    /// Version string of the ptrack extension, when installed.
    pub ptrack_version: Option<String>,
}

pub struct StopBackupResult {
    pub stop_lsn: Lsn,
    pub backup_label: String,
    pub tablespace_map: Option<String>,
}

pub struct PgSession {
    client: Client,
    info: PgNodeInfo,
}

fn conninfo(conn: &ConnectionOptions) -> String {
    let mut parts = vec!["application_name=pg_probackup".to_string()];
    if let Some(host) = &conn.pghost {
        parts.push(format!("host={host}"));
    }
    if let Some(port) = &conn.pgport {
        parts.push(format!("port={port}"));
    }
    if let Some(user) = &conn.pguser {
        parts.push(format!("user={user}"));
    }
    parts.push(format!(
        "dbname={}",
        conn.pgdatabase.as_deref().unwrap_or("postgres")
    ));
    parts.join(" ")
}

impl PgSession {
    pub fn connect(conn: &ConnectionOptions) -> anyhow::Result<PgSession> {
        let conninfo = conninfo(conn);
        let mut client = Client::connect(&conninfo, NoTls)
            .with_context(|| format!("cannot connect to the source database ({conninfo})"))?;

        let row = client
            .query_one(
                "SELECT current_setting('server_version_num')::int, \
                        current_setting('server_version'), \
                        current_setting('data_checksums') = 'on'",
                &[],
            )
            .context("cannot read server version")?;
        let server_version: i32 = row.get(0);
        let server_version_str: String = row.get(1);
        let checksums_on: bool = row.get(2);

        if server_version < 120000 {
            bail!(
                "server version {server_version_str} is not supported, 12 or newer is required"
            );
        }

        let row = client
            .query_one(
                "SELECT system_identifier FROM pg_control_system()",
                &[],
            )
            .context("cannot read the system identifier")?;
        let system_identifier: i64 = row.get(0);

        let row = client
            .query_one("SELECT usesuper FROM pg_user WHERE usename = current_user", &[])
            .context("cannot read role attributes")?;
        let is_superuser: bool = row.get(0);

        let ptrack_version: Option<String> = client
            .query_opt(
                "SELECT extversion FROM pg_extension WHERE extname = 'ptrack'",
                &[],
            )
            .context("cannot probe the ptrack extension")?
            .map(|row| row.get(0));

        let info = PgNodeInfo {
            server_version,
            server_version_str,
            checksum_version: checksums_on as u32,
            system_identifier: system_identifier as u64,
            is_superuser,
            ptrack_version,
        };
        Ok(PgSession { client, info })
    }

    pub fn node_info(&self) -> &PgNodeInfo {
        &self.info
    }

    pub fn current_timeline(&mut self) -> anyhow::Result<TimeLineID> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .context("cannot read the current timeline")?;
        let tli: i32 = row.get(0);
        Ok(tli as TimeLineID)
    }

    /// `pg_start_backup` (non-exclusive); returns the backup start LSN.
    pub fn start_backup(&mut self, label: &str, smooth: bool) -> anyhow::Result<Lsn> {
        let fast = !smooth;
        let query = if self.info.server_version >= 150000 {
            "SELECT pg_backup_start($1, $2)::text"
        } else {
            "SELECT pg_start_backup($1, $2, false)::text"
        };
        let row = self
            .client
            .query_one(query, &[&label, &fast])
            .context("pg_start_backup() failed")?;
        let lsn: String = row.get(0);
        let lsn: Lsn = lsn
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid LSN \"{lsn}\" from pg_start_backup()"))?;
        info!("backup started at {lsn}");
        Ok(lsn)
    }

    /// `pg_stop_backup` (non-exclusive); returns the stop LSN and the
    /// literal backup_label / tablespace_map contents.
    pub fn stop_backup(&mut self) -> anyhow::Result<StopBackupResult> {
        let query = if self.info.server_version >= 150000 {
            "SELECT lsn::text, labelfile, spcmapfile FROM pg_backup_stop(true)"
        } else {
            "SELECT lsn::text, labelfile, spcmapfile FROM pg_stop_backup(false, true)"
        };
        let row = self
            .client
            .query_one(query, &[])
            .context("pg_stop_backup() failed")?;
        let lsn: String = row.get(0);
        let stop_lsn: Lsn = lsn
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid LSN \"{lsn}\" from pg_stop_backup()"))?;
        let backup_label: String = row.get(1);
        let tablespace_map: Option<String> = row.get(2);
        info!("backup stopped at {stop_lsn}");
        Ok(StopBackupResult {
            stop_lsn,
            backup_label,
            tablespace_map: tablespace_map.filter(|map| !map.trim().is_empty()),
        })
    }

    /// ptrack 2.x page maps: `(relative path, bitmap)` per changed
    /// relation segment since `start_lsn`.
    pub fn ptrack_get_pagemapset(
        &mut self,
        start_lsn: Lsn,
    ) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        if self.info.ptrack_version.is_none() {
            bail!("ptrack extension is not installed on the source database");
        }
        let rows = self
            .client
            .query(
                "SELECT path, pagemap FROM ptrack.ptrack_get_pagemapset($1::pg_lsn)",
                &[&start_lsn.to_string()],
            )
            .context("ptrack_get_pagemapset() failed")?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, Vec<u8>>(1)))
            .collect())
    }

    /// The LSN up to which ptrack tracking is intact; a ptrack backup is
    /// only sound if this is at or before the parent's start LSN.
    pub fn ptrack_init_lsn(&mut self) -> anyhow::Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT ptrack.ptrack_init_lsn()::text", &[])
            .context("ptrack_init_lsn() failed")?;
        let lsn: String = row.get(0);
        lsn.parse()
            .map_err(|_| anyhow::anyhow!("invalid LSN \"{lsn}\" from ptrack_init_lsn()"))
    }
}
