//! Command-line entry point.
//!
//! Parsing happens up front; each sub-command is then a function from
//! (parsed options, context) to a result, dispatched from one table-like
//! match. The process exits 0 on success and 1 with a single
//! `ERROR: <message>` line on stderr otherwise.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

use probackup::backup::{do_backup, BackupOptions};
use probackup::catalog::{BackupId, BackupMode, BackupStatus};
use probackup::catchup::{do_catchup, CatchupMode, CatchupOptions};
use probackup::config::{
    resolve_backup_path, CatalogContext, CompressAlg, InstanceConfig, InstanceContext,
    PROGRAM_VERSION,
};
use probackup::delete::{do_delete, DeleteOptions};
use probackup::parsewal::RecoveryTarget;
use probackup::restore::{do_restore, IncrRestoreMode, RestoreOptions};
use probackup::show::{do_show, ShowFormat};
use probackup::workers::CancelToken;

#[derive(Parser)]
#[command(
    name = "pg_probackup",
    version = PROGRAM_VERSION,
    about = "Backup and recovery manager for PostgreSQL",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Default)]
struct CatalogArgs {
    /// Path to the backup catalog (or the BACKUP_PATH environment
    /// variable)
    #[arg(short = 'B', long = "backup-path")]
    backup_path: Option<Utf8PathBuf>,

    /// Name of the instance within the catalog
    #[arg(long = "instance")]
    instance: Option<String>,
}

#[derive(Args, Clone, Default)]
struct ConnectionArgs {
    /// Database name to connect to
    #[arg(short = 'd', long = "pgdatabase")]
    pgdatabase: Option<String>,
    /// Database server host
    #[arg(short = 'h', long = "pghost")]
    pghost: Option<String>,
    /// Database server port
    #[arg(short = 'p', long = "pgport")]
    pgport: Option<String>,
    /// Database user name
    #[arg(short = 'U', long = "pguser")]
    pguser: Option<String>,
}

#[derive(Args, Clone, Default)]
struct RemoteArgs {
    /// Remote host to back up from (agent over ssh)
    #[arg(long = "remote-host")]
    remote_host: Option<String>,
    #[arg(long = "remote-port")]
    remote_port: Option<String>,
    #[arg(long = "remote-user")]
    remote_user: Option<String>,
    /// Path to the pg_probackup binary on the remote host
    #[arg(long = "remote-path")]
    remote_path: Option<String>,
    #[arg(long = "ssh-options")]
    ssh_options: Option<String>,
}

#[derive(Args, Clone, Default)]
struct RecoveryTargetArgs {
    /// Recovery target timestamp, e.g. '2024-01-01 00:00:00'
    #[arg(long = "recovery-target-time")]
    target_time: Option<String>,
    /// Recovery target transaction id
    #[arg(long = "recovery-target-xid")]
    target_xid: Option<u32>,
    /// Recovery target LSN
    #[arg(long = "recovery-target-lsn")]
    target_lsn: Option<String>,
    /// Stop just after (true, default) or just before the target
    #[arg(long = "recovery-target-inclusive")]
    target_inclusive: Option<bool>,
    /// Recovery target timeline
    #[arg(long = "recovery-target-timeline")]
    target_tli: Option<u32>,
}

impl RecoveryTargetArgs {
    fn parse(&self) -> anyhow::Result<RecoveryTarget> {
        Ok(RecoveryTarget {
            time: self
                .target_time
                .as_deref()
                .map(parse_target_time)
                .transpose()?,
            xid: self.target_xid,
            lsn: self
                .target_lsn
                .as_deref()
                .map(|s| {
                    s.parse()
                        .map_err(|_| anyhow::anyhow!("invalid recovery target LSN \"{s}\""))
                })
                .transpose()?,
            inclusive: self.target_inclusive.unwrap_or(true),
            tli: self.target_tli,
        })
    }
}

#[derive(Args, Clone)]
struct SetConfigArgs {
    /// Path to the data directory of the instance
    #[arg(short = 'D', long = "pgdata")]
    pgdata: Option<Utf8PathBuf>,
    /// Number of FULL backups to keep (0 disables)
    #[arg(long = "retention-redundancy")]
    retention_redundancy: Option<u32>,
    /// Number of days of recoverability to keep (0 disables)
    #[arg(long = "retention-window")]
    retention_window: Option<u32>,
    /// Number of backups per timeline whose WAL must stay (0 disables)
    #[arg(long = "wal-depth")]
    wal_depth: Option<u32>,
    /// Compression algorithm: none or zlib
    #[arg(long = "compress-algorithm")]
    compress_algorithm: Option<CompressAlg>,
    /// Compression level 0-9
    #[arg(long = "compress-level")]
    compress_level: Option<i32>,
    /// Seconds to wait for WAL archiving to catch up
    #[arg(long = "archive-timeout")]
    archive_timeout: Option<u32>,
    /// restore_command written into recovery settings
    #[arg(long = "restore-command")]
    restore_command: Option<String>,

    #[command(flatten)]
    connection: ConnectionArgs,
    #[command(flatten)]
    remote: RemoteArgs,
}

impl SetConfigArgs {
    fn apply(&self, config: &mut InstanceConfig) {
        if let Some(v) = &self.pgdata {
            config.pgdata = Some(v.clone());
        }
        if let Some(v) = self.retention_redundancy {
            config.retention_redundancy = v;
        }
        if let Some(v) = self.retention_window {
            config.retention_window = v;
        }
        if let Some(v) = self.wal_depth {
            config.wal_depth = v;
        }
        if let Some(v) = self.compress_algorithm {
            config.compress_alg = v;
        }
        if let Some(v) = self.compress_level {
            config.compress_level = v;
        }
        if let Some(v) = self.archive_timeout {
            config.archive_timeout = v;
        }
        if let Some(v) = &self.restore_command {
            config.restore_command = Some(v.clone());
        }
        if let Some(v) = &self.connection.pgdatabase {
            config.conn_opt.pgdatabase = Some(v.clone());
        }
        if let Some(v) = &self.connection.pghost {
            config.conn_opt.pghost = Some(v.clone());
        }
        if let Some(v) = &self.connection.pgport {
            config.conn_opt.pgport = Some(v.clone());
        }
        if let Some(v) = &self.connection.pguser {
            config.conn_opt.pguser = Some(v.clone());
        }
        if let Some(v) = &self.remote.remote_host {
            config.remote.host = Some(v.clone());
        }
        if let Some(v) = &self.remote.remote_port {
            config.remote.port = Some(v.clone());
        }
        if let Some(v) = &self.remote.remote_user {
            config.remote.user = Some(v.clone());
        }
        if let Some(v) = &self.remote.remote_path {
            config.remote.path = Some(v.clone());
        }
        if let Some(v) = &self.remote.ssh_options {
            config.remote.ssh_options = Some(v.clone());
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Initialize an empty backup catalog
    Init {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
    /// Register a database instance in the catalog
    AddInstance {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[command(flatten)]
        config: SetConfigArgs,
    },
    /// Remove an instance, its backups and its archived WAL
    DelInstance {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
    /// Take a backup
    Backup {
        #[command(flatten)]
        catalog: CatalogArgs,
        /// Backup mode: FULL, PAGE, PTRACK or DELTA
        #[arg(short = 'b', long = "backup-mode")]
        mode: BackupMode,
        /// Number of parallel worker threads
        #[arg(short = 'j', long = "threads", default_value_t = 1)]
        threads: usize,
        /// Put all needed WAL inside the backup itself
        #[arg(long = "stream")]
        stream: bool,
        /// Skip the automatic validation after the backup
        #[arg(long = "no-validate")]
        no_validate: bool,
        /// Include the server log directory
        #[arg(long = "backup-pg-log")]
        backup_logs: bool,
        /// Spread the checkpoint out instead of forcing it
        #[arg(short = 'C', long = "smooth-checkpoint")]
        smooth_checkpoint: bool,
        /// Attach a one-line note to the backup
        #[arg(long = "note")]
        note: Option<String>,
        /// Pin the backup for this long, e.g. '30d'
        #[arg(long = "ttl")]
        ttl: Option<String>,
        /// Pin the backup until this timestamp
        #[arg(long = "expire-time")]
        expire_time: Option<String>,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Restore a backup (optionally to a point in time)
    Restore {
        #[command(flatten)]
        catalog: CatalogArgs,
        /// Backup to restore; the latest suitable one when omitted
        #[arg(short = 'i', long = "backup-id")]
        backup_id: Option<String>,
        /// Restore destination (defaults to the configured pgdata)
        #[arg(short = 'D', long = "pgdata")]
        pgdata: Option<Utf8PathBuf>,
        #[arg(short = 'j', long = "threads", default_value_t = 1)]
        threads: usize,
        #[arg(long = "no-validate")]
        no_validate: bool,
        /// Reuse valid pages of an existing destination: none, checksum
        /// or lsn
        #[arg(short = 'I', long = "incremental-mode", default_value_t = IncrRestoreMode::None)]
        incremental_mode: IncrRestoreMode,
        /// Relocate a tablespace: --tablespace-mapping=OLDDIR=NEWDIR
        #[arg(short = 'T', long = "tablespace-mapping")]
        tablespace_mapping: Vec<String>,
        /// restore_command for the recovery settings
        #[arg(long = "restore-command")]
        restore_command: Option<String>,
        /// Proceed even when the destination looks dangerous
        #[arg(long = "force")]
        force: bool,
        #[command(flatten)]
        target: RecoveryTargetArgs,
    },
    /// Verify backups and the WAL archive
    Validate {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(short = 'i', long = "backup-id")]
        backup_id: Option<String>,
        #[command(flatten)]
        target: RecoveryTargetArgs,
    },
    /// Merge an incremental backup into its FULL ancestor
    Merge {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(short = 'i', long = "backup-id")]
        backup_id: String,
    },
    /// Delete backups (by id, by status, or per retention policy)
    Delete {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(short = 'i', long = "backup-id")]
        backup_id: Option<String>,
        /// Remove backups that fall out of the retention policy
        #[arg(long = "delete-expired")]
        delete_expired: bool,
        /// Merge expired chains into their FULL ancestors first
        #[arg(long = "merge-expired")]
        merge_expired: bool,
        /// Purge archived WAL no remaining backup needs
        #[arg(long = "delete-wal")]
        delete_wal: bool,
        /// Only report what would be done
        #[arg(long = "dry-run")]
        dry_run: bool,
        /// Delete every backup with this status
        #[arg(long = "status")]
        status: Option<String>,
    },
    /// List the catalog (or the WAL archive with --archive)
    Show {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(short = 'i', long = "backup-id")]
        backup_id: Option<String>,
        #[arg(long = "format", default_value = "plain")]
        format: ShowFormat,
        #[arg(long = "archive")]
        archive: bool,
    },
    /// Change the stored instance configuration
    SetConfig {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[command(flatten)]
        config: SetConfigArgs,
    },
    /// Print the stored instance configuration
    ShowConfig {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
    /// Pin a backup or edit its note
    SetBackup {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(short = 'i', long = "backup-id")]
        backup_id: String,
        /// Pin for this long (0 unpins), e.g. '30d'
        #[arg(long = "ttl")]
        ttl: Option<String>,
        /// Pin until this timestamp
        #[arg(long = "expire-time")]
        expire_time: Option<String>,
        /// One-line note; 'none' removes it
        #[arg(long = "note")]
        note: Option<String>,
    },
    /// Copy a completed WAL segment into the archive (archive_command)
    ArchivePush {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(long = "wal-file-path")]
        wal_file_path: Utf8PathBuf,
        #[arg(long = "wal-file-name")]
        wal_file_name: String,
        #[arg(long = "overwrite")]
        overwrite: bool,
    },
    /// Fetch a WAL segment from the archive (restore_command)
    ArchiveGet {
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(long = "wal-file-path")]
        wal_file_path: Utf8PathBuf,
        #[arg(long = "wal-file-name")]
        wal_file_name: String,
    },
    /// Verify every block of a live data directory
    Checkdb {
        /// Path to the data directory
        #[arg(short = 'D', long = "pgdata")]
        pgdata: Utf8PathBuf,
        #[arg(short = 'j', long = "threads", default_value_t = 1)]
        threads: usize,
    },
    /// Clone a running cluster into a data directory
    Catchup {
        /// Catchup mode: FULL, DELTA or PTRACK
        #[arg(short = 'b', long = "backup-mode")]
        mode: CatchupMode,
        #[arg(long = "source-pgdata")]
        source_pgdata: Utf8PathBuf,
        #[arg(long = "destination-pgdata")]
        destination_pgdata: Utf8PathBuf,
        #[arg(short = 'j', long = "threads", default_value_t = 1)]
        threads: usize,
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Serve the remote-agent protocol on stdin/stdout (internal)
    #[command(hide = true)]
    Agent,
}

fn parse_target_time(s: &str) -> anyhow::Result<i64> {
    probackup::catalog::parse_time(s).or_else(|_| {
        use chrono::{NaiveDateTime, TimeZone, Utc};
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .with_context(|| format!("invalid timestamp \"{s}\""))?;
        Ok(Utc.from_utc_datetime(&naive).timestamp())
    })
}

fn parse_ttl(s: &str) -> anyhow::Result<i64> {
    let duration = humantime::parse_duration(s)
        .with_context(|| format!("invalid duration \"{s}\""))?;
    Ok(duration.as_secs() as i64)
}

fn parse_backup_id(s: &str) -> anyhow::Result<BackupId> {
    s.parse()
}

fn catalog_of(args: &CatalogArgs) -> anyhow::Result<CatalogContext> {
    resolve_backup_path(args.backup_path.as_deref())
}

fn instance_of(args: &CatalogArgs) -> anyhow::Result<InstanceContext> {
    let catalog = catalog_of(args)?;
    let name = args
        .instance
        .as_deref()
        .context("required parameter not specified: --instance")?;
    catalog.instance(name)
}

fn apply_connection(config: &mut InstanceConfig, conn: &ConnectionArgs, remote: &RemoteArgs) {
    if let Some(v) = &conn.pgdatabase {
        config.conn_opt.pgdatabase = Some(v.clone());
    }
    if let Some(v) = &conn.pghost {
        config.conn_opt.pghost = Some(v.clone());
    }
    if let Some(v) = &conn.pgport {
        config.conn_opt.pgport = Some(v.clone());
    }
    if let Some(v) = &conn.pguser {
        config.conn_opt.pguser = Some(v.clone());
    }
    if let Some(v) = &remote.remote_host {
        config.remote.host = Some(v.clone());
    }
    if let Some(v) = &remote.remote_port {
        config.remote.port = Some(v.clone());
    }
    if let Some(v) = &remote.remote_user {
        config.remote.user = Some(v.clone());
    }
    if let Some(v) = &remote.remote_path {
        config.remote.path = Some(v.clone());
    }
    if let Some(v) = &remote.ssh_options {
        config.remote.ssh_options = Some(v.clone());
    }
}

fn run(command: Command, cancel: &CancelToken) -> anyhow::Result<()> {
    match command {
        Command::Init { catalog } => probackup::init::do_init(&catalog_of(&catalog)?),
        Command::AddInstance { catalog, config } => {
            let ctx = catalog_of(&catalog)?;
            let name = catalog
                .instance
                .as_deref()
                .context("required parameter not specified: --instance")?;
            let mut instance_config = InstanceConfig::default();
            config.apply(&mut instance_config);
            probackup::init::do_add_instance(&ctx, name, instance_config)
        }
        Command::DelInstance { catalog } => {
            let ctx = catalog_of(&catalog)?;
            let name = catalog
                .instance
                .as_deref()
                .context("required parameter not specified: --instance")?;
            probackup::init::do_del_instance(&ctx, name)
        }
        Command::Backup {
            catalog,
            mode,
            threads,
            stream,
            no_validate,
            backup_logs,
            smooth_checkpoint,
            note,
            ttl,
            expire_time,
            connection,
            remote,
        } => {
            let ctx = catalog_of(&catalog)?;
            let mut instance = instance_of(&catalog)?;
            apply_connection(&mut instance.config, &connection, &remote);
            let opts = BackupOptions {
                mode,
                num_threads: threads,
                stream,
                no_validate,
                backup_logs,
                smooth_checkpoint,
                note,
                ttl: ttl.as_deref().map(parse_ttl).transpose()?,
                expire_time: expire_time.as_deref().map(parse_target_time).transpose()?,
            };
            do_backup(&ctx, &mut instance, &opts, cancel).map(|_| ())
        }
        Command::Restore {
            catalog,
            backup_id,
            pgdata,
            threads,
            no_validate,
            incremental_mode,
            tablespace_mapping,
            restore_command,
            force,
            target,
        } => {
            let instance = instance_of(&catalog)?;
            let opts = RestoreOptions {
                backup_id: backup_id.as_deref().map(parse_backup_id).transpose()?,
                target: target.parse()?,
                num_threads: threads,
                no_validate,
                incremental_mode,
                tablespace_mapping: probackup::dir::TablespaceMapping::parse(
                    &tablespace_mapping,
                )?,
                restore_command,
                pgdata,
                force,
            };
            do_restore(&instance, &opts, cancel)
        }
        Command::Validate {
            catalog,
            backup_id,
            target,
        } => {
            let instance = instance_of(&catalog)?;
            probackup::validate::do_validate(
                &instance,
                backup_id.as_deref().map(parse_backup_id).transpose()?,
                &target.parse()?,
            )
        }
        Command::Merge { catalog, backup_id } => {
            let instance = instance_of(&catalog)?;
            probackup::merge::do_merge(&instance, parse_backup_id(&backup_id)?, cancel)
        }
        Command::Delete {
            catalog,
            backup_id,
            delete_expired,
            merge_expired,
            delete_wal,
            dry_run,
            status,
        } => {
            let instance = instance_of(&catalog)?;
            let opts = DeleteOptions {
                backup_id: backup_id.as_deref().map(parse_backup_id).transpose()?,
                delete_expired,
                merge_expired,
                delete_wal,
                dry_run,
                status: status
                    .as_deref()
                    .map(|s| s.parse::<BackupStatus>())
                    .transpose()?,
            };
            do_delete(&instance, &opts, cancel)
        }
        Command::Show {
            catalog,
            backup_id,
            format,
            archive,
        } => {
            let ctx = catalog_of(&catalog)?;
            do_show(
                &ctx,
                catalog.instance.as_deref(),
                backup_id.as_deref().map(parse_backup_id).transpose()?,
                format,
                archive,
            )
        }
        Command::SetConfig { catalog, config } => {
            let mut instance = instance_of(&catalog)?;
            config.apply(&mut instance.config);
            probackup::init::do_set_config(&instance)
        }
        Command::ShowConfig { catalog } => {
            let instance = instance_of(&catalog)?;
            probackup::init::do_show_config(&instance)
        }
        Command::SetBackup {
            catalog,
            backup_id,
            ttl,
            expire_time,
            note,
        } => {
            let instance = instance_of(&catalog)?;
            let list = probackup::catalog::get_backup_list(&instance)?;
            let id = parse_backup_id(&backup_id)?;
            let mut backup = probackup::catalog::find_backup(&list, id)
                .with_context(|| format!("backup {id} does not exist"))?
                .clone();
            let _lock = probackup::catalog::lock_backup(&backup)?;
            if ttl.is_some() || expire_time.is_some() {
                probackup::catalog::pin_backup(
                    &mut backup,
                    ttl.as_deref().map(parse_ttl).transpose()?,
                    expire_time.as_deref().map(parse_target_time).transpose()?,
                )?;
            }
            if let Some(note) = &note {
                probackup::catalog::add_note(&mut backup, Some(note))?;
            }
            Ok(())
        }
        Command::ArchivePush {
            catalog,
            wal_file_path,
            wal_file_name,
            overwrite,
        } => {
            let instance = instance_of(&catalog)?;
            probackup::archive::do_archive_push(
                &instance,
                &wal_file_path,
                &wal_file_name,
                overwrite,
            )
        }
        Command::ArchiveGet {
            catalog,
            wal_file_path,
            wal_file_name,
        } => {
            let instance = instance_of(&catalog)?;
            probackup::archive::do_archive_get(&instance, &wal_file_name, &wal_file_path)
        }
        Command::Checkdb { pgdata, threads } => {
            probackup::checkdb::do_checkdb(&pgdata, threads, cancel)
        }
        Command::Catchup {
            mode,
            source_pgdata,
            destination_pgdata,
            threads,
            connection,
        } => {
            let opts = CatchupOptions {
                mode,
                source_pgdata,
                dest_pgdata: destination_pgdata,
                conn_opt: probackup::config::ConnectionOptions {
                    pgdatabase: connection.pgdatabase,
                    pghost: connection.pghost,
                    pgport: connection.pgport,
                    pguser: connection.pguser,
                },
                num_threads: threads,
            };
            do_catchup(&opts, cancel)
        }
        Command::Agent => probackup::remote::agent::run_agent(),
    }
}

fn main() {
    let cli = Cli::parse();

    // stdout carries command output (show, show-config); logs go to stderr
    if let Err(e) = utils::logging::init("info", utils::logging::Output::Stderr) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }

    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_signal_handlers() {
        eprintln!("ERROR: cannot install signal handlers: {e:#}");
        std::process::exit(1);
    }

    match run(cli.command, &cancel) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            std::process::exit(1);
        }
    }
}
