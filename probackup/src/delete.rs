//! Deletion and retention: `delete -i`, `--delete-expired`,
//! `--merge-expired`, `--status`, and the WAL purge.

use std::collections::HashSet;

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::{info, warn};

use postgres_ffi::xlog_utils::XLogFileName;
use utils::lsn::Lsn;

use crate::catalog::{self, Backup, BackupId, BackupStatus};
use crate::config::InstanceContext;
use crate::merge;
use crate::walarchive;
use crate::workers::CancelToken;

pub struct DeleteOptions {
    pub backup_id: Option<BackupId>,
    pub delete_expired: bool,
    pub merge_expired: bool,
    pub delete_wal: bool,
    pub dry_run: bool,
    pub status: Option<BackupStatus>,
}

pub fn do_delete(
    instance: &InstanceContext,
    opts: &DeleteOptions,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    if let Some(id) = opts.backup_id {
        return delete_backup_and_descendants(instance, id, opts.dry_run);
    }
    if let Some(status) = opts.status {
        return delete_by_status(instance, status, opts.dry_run);
    }
    if opts.delete_expired || opts.merge_expired {
        do_retention(instance, opts, cancel)?;
    }
    if opts.delete_wal {
        do_retention_wal(instance, opts.dry_run)?;
    }
    if !opts.delete_expired && !opts.merge_expired && !opts.delete_wal {
        bail!("nothing to delete: no backup id, status or retention flags given");
    }
    Ok(())
}

/// Remove one backup's directory tree, linearized by its lock.
fn delete_backup_files(backup: &Backup, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        info!("would delete backup {}", backup.id());
        return Ok(());
    }
    let _lock = catalog::lock_backup(backup)?;
    let mut backup = backup.clone();
    catalog::write_backup_status(&mut backup, BackupStatus::Deleting)?;
    info!("deleting backup {}", backup.id());
    std::fs::remove_dir_all(backup.root_dir.as_std_path())
        .with_context(|| format!("cannot remove \"{}\"", backup.root_dir))?;
    Ok(())
}

fn delete_backup_and_descendants(
    instance: &InstanceContext,
    id: BackupId,
    dry_run: bool,
) -> anyhow::Result<()> {
    let list = catalog::get_backup_list(instance)?;
    let target = catalog::find_backup(&list, id)
        .with_context(|| format!("backup {id} does not exist"))?;
    if matches!(
        target.status,
        BackupStatus::Running | BackupStatus::Merging | BackupStatus::Merged
    ) {
        bail!("backup {id} has status {}, cannot delete", target.status);
    }

    // children first: an incremental without its ancestor is garbage
    let mut victims: Vec<&Backup> = list
        .iter()
        .filter(|b| b.id() == id || catalog::is_parent(id, b, &list, false))
        .collect();
    victims.sort_by_key(|b| std::cmp::Reverse(b.start_time));
    if victims.len() > 1 {
        warn!(
            "backup {id} has {} dependent backups, deleting them too",
            victims.len() - 1
        );
    }
    for backup in victims {
        delete_backup_files(backup, dry_run)?;
    }
    Ok(())
}

fn delete_by_status(
    instance: &InstanceContext,
    status: BackupStatus,
    dry_run: bool,
) -> anyhow::Result<()> {
    let list = catalog::get_backup_list(instance)?;
    let victims: Vec<_> = list.iter().filter(|b| b.status == status).collect();
    if victims.is_empty() {
        info!("no backups with status {status}");
        return Ok(());
    }
    for backup in victims {
        delete_backup_files(backup, dry_run)?;
    }
    Ok(())
}

/// The retention verdict over a catalog snapshot.
#[derive(Debug, Default)]
pub struct RetentionPlan {
    pub keep: HashSet<BackupId>,
    pub purge: Vec<BackupId>,
    /// Chains (FULL..child) to merge before purging, newest child per
    /// FULL, set up by `--merge-expired`.
    pub merge_chains: Vec<Vec<BackupId>>,
}

/// Evaluate the two orthogonal retention rules plus pinning.
/// `list` is newest-first, as the catalog loader returns it.
pub fn evaluate_retention(
    list: &[Backup],
    redundancy: u32,
    window_days: u32,
    merge_expired: bool,
    now: i64,
) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    let window_floor = now - window_days as i64 * 86_400;

    // which FULL backups are within the redundancy count
    let mut in_redundancy: HashSet<BackupId> = HashSet::new();
    let mut n_full = 0u32;
    for backup in list {
        if backup.is_full() && backup.is_ok() {
            n_full += 1;
            if redundancy > 0 && n_full <= redundancy {
                in_redundancy.insert(backup.id());
            }
        }
    }

    for backup in list {
        if matches!(
            backup.status,
            BackupStatus::Running | BackupStatus::Merging | BackupStatus::Merged
        ) {
            plan.keep.insert(backup.id());
            continue;
        }

        let full_ancestor = if backup.is_full() {
            Some(backup.id())
        } else {
            catalog::find_parent_full_backup(backup, list).map(|b| b.id())
        };

        let kept_by_redundancy =
            full_ancestor.is_some_and(|full| in_redundancy.contains(&full));
        let kept_by_window = window_days > 0
            && backup
                .recovery_time
                .unwrap_or(backup.start_time)
                .ge(&window_floor);
        let pinned = backup.is_pinned(now);

        if kept_by_redundancy || kept_by_window || pinned {
            plan.keep.insert(backup.id());
        } else {
            plan.purge.push(backup.id());
        }
    }

    // a kept incremental must not lose its ancestry: either merge the
    // chain down into the doomed FULL, or keep the ancestors after all
    let purge_set: HashSet<BackupId> = plan.purge.iter().copied().collect();
    let mut rescued: HashSet<BackupId> = HashSet::new();
    for backup in list {
        if !plan.keep.contains(&backup.id()) || backup.is_full() {
            continue;
        }
        let endangered: Vec<BackupId> = ancestry(backup, list)
            .into_iter()
            .filter(|id| purge_set.contains(id))
            .collect();
        if endangered.is_empty() {
            continue;
        }
        if merge_expired {
            // merge FULL..this backup; the originals go away with the merge
            if let Some(chain_ids) = chain_ids_for(backup, list) {
                plan.merge_chains.push(chain_ids);
            }
        } else {
            rescued.extend(endangered);
        }
    }
    if !rescued.is_empty() {
        plan.purge.retain(|id| !rescued.contains(id));
        plan.keep.extend(rescued);
    }

    // prefer merging the newest kept child of each FULL; drop subsumed
    // shorter chains
    plan.merge_chains
        .sort_by_key(|chain| std::cmp::Reverse(chain.len()));
    let mut seen_roots: HashSet<BackupId> = HashSet::new();
    plan.merge_chains
        .retain(|chain| seen_roots.insert(chain[0]));

    plan
}

fn ancestry(backup: &Backup, list: &[Backup]) -> Vec<BackupId> {
    let mut out = Vec::new();
    let mut current = backup.clone();
    while let Some(parent_id) = current.parent_backup {
        out.push(parent_id);
        match catalog::find_backup(list, parent_id) {
            Some(parent) => current = parent.clone(),
            None => break,
        }
    }
    out
}

fn chain_ids_for(backup: &Backup, list: &[Backup]) -> Option<Vec<BackupId>> {
    match catalog::scan_parent_chain(backup, list) {
        catalog::ParentChain::Ok(chain) => Some(chain.iter().map(|b| b.id()).collect()),
        _ => None,
    }
}

fn do_retention(
    instance: &InstanceContext,
    opts: &DeleteOptions,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let redundancy = instance.config.retention_redundancy;
    let window = instance.config.retention_window;
    if redundancy == 0 && window == 0 {
        warn!(
            "retention policy is not set, no backup is considered expired"
        );
        return Ok(());
    }
    info!("evaluating retention: redundancy {redundancy}, window {window} days");

    let list = catalog::get_backup_list(instance)?;
    let plan = evaluate_retention(
        &list,
        redundancy,
        window,
        opts.merge_expired,
        Utc::now().timestamp(),
    );

    if opts.merge_expired && !opts.dry_run {
        for chain_ids in &plan.merge_chains {
            let chain: Vec<Backup> = chain_ids
                .iter()
                .map(|id| {
                    catalog::find_backup(&list, *id)
                        .cloned()
                        .with_context(|| format!("backup {id} vanished during retention"))
                })
                .collect::<anyhow::Result<_>>()?;
            merge::merge_chain(instance, chain, cancel)?;
        }
    }

    if opts.delete_expired {
        // reload: merges renamed directories
        let list = catalog::get_backup_list(instance)?;
        for id in &plan.purge {
            match catalog::find_backup(&list, *id) {
                Some(backup) => delete_backup_files(backup, opts.dry_run)?,
                None => {
                    // consumed by a merge above
                }
            }
        }
    }
    Ok(())
}

/// Drop archived segments no remaining backup needs.
pub fn do_retention_wal(instance: &InstanceContext, dry_run: bool) -> anyhow::Result<()> {
    let list = catalog::get_backup_list(instance)?;
    let timelines = walarchive::catalog_get_timelines(instance, &list)?;
    let wal_depth = instance.config.wal_depth;
    let seg_size = instance.config.xlog_seg_size;

    for info in &timelines {
        // backups on this timeline, newest first
        let on_tli: Vec<&Backup> = list
            .iter()
            .filter(|b| b.tli == info.tli && b.is_ok())
            .collect();

        let anchor_lsn: Option<Lsn> = if !on_tli.is_empty() {
            if wal_depth > 0 && on_tli.len() >= wal_depth as usize {
                Some(on_tli[wal_depth as usize - 1].start_lsn)
            } else {
                on_tli.iter().map(|b| b.start_lsn).min()
            }
        } else {
            // a child timeline may still replay through this one
            let has_descendants = timelines.iter().any(|t| {
                t.tli != info.tli
                    && !t.backups.is_empty()
                    && t.history.iter().any(|h| h.tli == info.tli)
            });
            if has_descendants {
                continue;
            }
            None
        };

        let keep_from_segno = match anchor_lsn {
            Some(lsn) => lsn.segment_number(seg_size),
            // nothing on this timeline needs any of it
            None => u64::MAX,
        };

        let mut removed = 0usize;
        for &segno in &info.segments {
            if segno >= keep_from_segno {
                continue;
            }
            let name = XLogFileName(info.tli, segno, seg_size);
            let path = instance.wal_instance_path.join(&name);
            if dry_run {
                info!("would remove WAL segment \"{name}\"");
            } else {
                std::fs::remove_file(path.as_std_path())
                    .with_context(|| format!("cannot remove WAL segment \"{path}\""))?;
            }
            removed += 1;
        }
        if removed > 0 {
            info!(
                "purged {removed} WAL segments on timeline {} up to {}",
                info.tli,
                anchor_lsn.unwrap_or(Lsn::MAX)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupMode;

    fn backup(mode: BackupMode, start_time: i64, parent: Option<BackupId>) -> Backup {
        let mut b = Backup::new(mode, start_time);
        b.status = BackupStatus::Ok;
        b.tli = 1;
        b.recovery_time = Some(start_time);
        b.parent_backup = parent;
        b
    }

    #[test]
    fn redundancy_keeps_newest_fulls() {
        // E3: R=1, W=0, two FULLs -> only the newest survives
        let old_full = backup(BackupMode::Full, 100, None);
        let new_full = backup(BackupMode::Full, 200, None);
        let list = vec![new_full.clone(), old_full.clone()];

        let plan = evaluate_retention(&list, 1, 0, false, 1_000);
        assert!(plan.keep.contains(&new_full.id()));
        assert_eq!(plan.purge, vec![old_full.id()]);
    }

    #[test]
    fn window_keeps_recent_backups() {
        let now = 10 * 86_400;
        let old_full = backup(BackupMode::Full, 86_400, None); // 9 days old
        let recent_full = backup(BackupMode::Full, 9 * 86_400, None); // 1 day old
        let list = vec![recent_full.clone(), old_full.clone()];

        let plan = evaluate_retention(&list, 0, 3, false, now);
        assert!(plan.keep.contains(&recent_full.id()));
        assert_eq!(plan.purge, vec![old_full.id()]);
    }

    #[test]
    fn pin_overrides_retention() {
        let mut old_full = backup(BackupMode::Full, 100, None);
        old_full.expire_time = Some(2_000);
        let new_full = backup(BackupMode::Full, 200, None);
        let list = vec![new_full.clone(), old_full.clone()];

        let plan = evaluate_retention(&list, 1, 0, false, 1_000);
        assert!(plan.keep.contains(&old_full.id()));
        assert!(plan.purge.is_empty());

        // expired pin no longer protects
        let plan = evaluate_retention(&list, 1, 0, false, 3_000);
        assert_eq!(plan.purge, vec![old_full.id()]);
    }

    #[test]
    fn children_keep_their_ancestry_alive() {
        let now = 10 * 86_400;
        let full = backup(BackupMode::Full, 86_400, None);
        let delta = backup(BackupMode::Delta, 9 * 86_400 + 3600, Some(full.id()));
        let list = vec![delta.clone(), full.clone()];

        // window keeps the delta but would purge its FULL
        let plan = evaluate_retention(&list, 0, 3, false, now);
        assert!(plan.keep.contains(&delta.id()));
        // without merge-expired the ancestor is rescued
        assert!(plan.keep.contains(&full.id()));
        assert!(plan.purge.is_empty());

        // with merge-expired the chain goes to the merge list instead
        let plan = evaluate_retention(&list, 0, 3, true, now);
        assert_eq!(plan.merge_chains, vec![vec![full.id(), delta.id()]]);
        assert_eq!(plan.purge, vec![full.id()]);
    }

    #[test]
    fn incremental_follows_its_full_in_redundancy() {
        let full_old = backup(BackupMode::Full, 100, None);
        let delta_old = backup(BackupMode::Delta, 150, Some(full_old.id()));
        let full_new = backup(BackupMode::Full, 200, None);
        let delta_new = backup(BackupMode::Delta, 250, Some(full_new.id()));
        let list = vec![
            delta_new.clone(),
            full_new.clone(),
            delta_old.clone(),
            full_old.clone(),
        ];

        let plan = evaluate_retention(&list, 1, 0, false, 1_000);
        assert!(plan.keep.contains(&full_new.id()));
        assert!(plan.keep.contains(&delta_new.id()));
        let purged: HashSet<_> = plan.purge.iter().copied().collect();
        assert!(purged.contains(&full_old.id()));
        assert!(purged.contains(&delta_old.id()));
    }
}
