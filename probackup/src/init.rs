//! Catalog and instance management: `init`, `add-instance`,
//! `del-instance`, `set-config`, `show-config`.

use anyhow::{bail, Context};
use tracing::info;

use crate::config::{CatalogContext, InstanceConfig, InstanceContext};

/// `init`: lay out an empty backup catalog.
pub fn do_init(catalog: &CatalogContext) -> anyhow::Result<()> {
    let root = &catalog.backup_path;
    if root.is_dir() {
        let occupied = root
            .read_dir_utf8()
            .with_context(|| format!("cannot open \"{root}\""))?
            .next()
            .is_some();
        if occupied {
            bail!("backup catalog already exists and is not empty: \"{root}\"");
        }
    }
    utils::crashsafe::create_dir_all(root)?;
    utils::crashsafe::create_dir(catalog.backups_dir())?;
    utils::crashsafe::create_dir(catalog.wal_dir())?;
    info!("backup catalog \"{root}\" successfully initialized");
    Ok(())
}

/// `add-instance`: register a cluster in the catalog and seed its config.
pub fn do_add_instance(
    catalog: &CatalogContext,
    name: &str,
    config: InstanceConfig,
) -> anyhow::Result<()> {
    if !catalog.backups_dir().is_dir() || !catalog.wal_dir().is_dir() {
        bail!(
            "backup catalog \"{}\" is not initialized, run init first",
            catalog.backup_path
        );
    }
    if config.pgdata.is_none() {
        bail!("required parameter not specified: PGDATA (-D, --pgdata)");
    }
    config.validate()?;

    let instance = InstanceContext {
        name: name.to_string(),
        backup_instance_path: catalog.backups_dir().join(name),
        wal_instance_path: catalog.wal_dir().join(name),
        config,
    };
    if instance.backup_instance_path.exists() {
        bail!("instance \"{name}\" already exists in this backup catalog");
    }
    utils::crashsafe::create_dir(&instance.backup_instance_path)?;
    utils::crashsafe::create_dir(&instance.wal_instance_path)?;
    instance.write_config()?;
    info!("instance \"{name}\" successfully added");
    Ok(())
}

/// `del-instance`: drop the instance's backups and archived WAL.
pub fn do_del_instance(catalog: &CatalogContext, name: &str) -> anyhow::Result<()> {
    let backup_dir = catalog.backups_dir().join(name);
    let wal_dir = catalog.wal_dir().join(name);
    if !backup_dir.is_dir() {
        bail!("instance \"{name}\" does not exist in this backup catalog");
    }
    std::fs::remove_dir_all(backup_dir.as_std_path())
        .with_context(|| format!("cannot remove \"{backup_dir}\""))?;
    if wal_dir.is_dir() {
        std::fs::remove_dir_all(wal_dir.as_std_path())
            .with_context(|| format!("cannot remove \"{wal_dir}\""))?;
    }
    info!("instance \"{name}\" successfully deleted");
    Ok(())
}

/// `set-config`: the caller has already merged the command-line options
/// into the instance config; persist it.
pub fn do_set_config(instance: &InstanceContext) -> anyhow::Result<()> {
    instance.config.validate()?;
    instance.write_config()?;
    info!("instance \"{}\" configuration updated", instance.name);
    Ok(())
}

/// `show-config`: dump the effective configuration.
pub fn do_show_config(instance: &InstanceContext) -> anyhow::Result<()> {
    print!("{}", instance.config.to_file_contents());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn init_and_add_instance() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = CatalogContext::new(dir.path().join("catalog"));
        do_init(&catalog).unwrap();
        assert!(catalog.backups_dir().is_dir());
        assert!(catalog.wal_dir().is_dir());

        // double init is refused
        assert!(do_init(&catalog).is_err());

        let config = InstanceConfig {
            pgdata: Some(Utf8PathBuf::from("/var/lib/pgsql/data")),
            ..InstanceConfig::default()
        };
        do_add_instance(&catalog, "node", config.clone()).unwrap();
        let instance = catalog.instance("node").unwrap();
        assert_eq!(instance.config.pgdata, config.pgdata);

        // duplicate instance is refused
        assert!(do_add_instance(&catalog, "node", config).is_err());

        do_del_instance(&catalog, "node").unwrap();
        assert!(catalog.instance("node").is_err());
    }

    #[test]
    fn add_instance_requires_pgdata() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = CatalogContext::new(dir.path().join("catalog"));
        do_init(&catalog).unwrap();
        let err = do_add_instance(&catalog, "node", InstanceConfig::default()).unwrap_err();
        assert!(err.to_string().contains("PGDATA"));
    }
}
