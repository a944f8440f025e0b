//  Zmirror: ZFS snapshot replication with bookmark-aware planning
//  Copyright (C) 2026  The zmirror authors

//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.

//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//  GNU General Public License for more details.

//  You should have received a copy of the GNU General Public License
//  along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Walks the configured root pairs and their (possibly recursive) dataset
//! trees, applies the filters, dispatches admitted datasets to the driver
//! in parents-before-children order, then runs the deletion modes. Errors
//! escalate per --skip-on-error, and the final exit code is the maximum
//! severity seen.

use crate::repl::args::SkipOnError;
use crate::repl::catalog::Catalog;
use crate::repl::driver::{Driver, RetryPolicy, run_with_retries};
use crate::repl::error::{EXIT_OK, Error, Result, is_dataset_gone};
use crate::repl::filter::property_excludes;
use crate::repl::reconcile::Reconciler;
use crate::repl::{Context, Pair};
use log::{debug, error, info, warn};
use std::collections::HashSet;

pub const SITE_LIST_EXCLUDE_PROPERTY: &str = "zfs_list_exclude_property";

/// True when `rel` equals one of the prefixes or lies in its subtree.
fn under_any(rel: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| {
        rel == p || (p.is_empty() && !rel.is_empty()) || rel.strip_prefix(p.as_str()).is_some_and(|r| r.starts_with('/'))
    })
}

pub fn run(ctx: &Context) -> i32 {
    let mut sched = Scheduler {
        ctx,
        policy: RetryPolicy::new(ctx.args.retries),
        severity: EXIT_OK,
        aborted: false,
    };
    match sched.run_all() {
        Ok(()) => sched.severity,
        Err(e) => {
            error!("{e}");
            sched.severity.max(e.exit_code())
        }
    }
}

struct Scheduler<'c> {
    ctx: &'c Context,
    policy: RetryPolicy,
    severity: i32,
    aborted: bool,
}

impl<'c> Scheduler<'c> {
    fn run_all(&mut self) -> Result<()> {
        let pairs = self.ctx.args.dataset_pairs()?;
        if pairs.is_empty() {
            return Err(Error::usage("no dataset pairs given"));
        }
        for (src_word, dst_word) in pairs {
            if self.aborted {
                break;
            }
            let pair = Pair::new(self.ctx, &src_word, &dst_word)?;
            self.preflight(&pair)?;
            self.run_pair(&pair)?;
        }
        Ok(())
    }

    /// Mandatory-program checks for one pair; failures are fatal.
    fn preflight(&self, pair: &Pair) -> Result<()> {
        let ctx = self.ctx;
        if (pair.src.is_remote() || pair.dst.is_remote())
            && !ctx.program_available(&ctx.local, &ctx.args.ssh_program)?
        {
            return Err(Error::precondition(format!(
                "{} not found on the local host but a remote dataset is in play",
                ctx.args.ssh_program
            )));
        }
        for target in [&pair.src, &pair.dst] {
            if !ctx.program_available(target, &ctx.args.zfs_program)? {
                return Err(Error::precondition(format!(
                    "{} not found on {}",
                    ctx.args.zfs_program,
                    target.pretty()
                )));
            }
        }
        Ok(())
    }

    /// Records a dataset failure and decides whether to keep going.
    /// Returns the subtree prefix to skip, if any.
    fn note_failure(&mut self, rel: &str, what: &str, e: &Error) -> Option<String> {
        error!("{what} failed for {rel:?}: {e}");
        self.severity = self.severity.max(e.exit_code());
        match self.ctx.args.skip_on_error {
            SkipOnError::Fail => {
                self.aborted = true;
                None
            }
            SkipOnError::Dataset => None,
            SkipOnError::Tree => Some(rel.to_string()),
        }
    }

    fn run_pair(&mut self, pair: &Pair) -> Result<()> {
        if !self.ctx.args.skip_replication {
            self.replicate_tree(pair)?;
        }
        if self.aborted {
            return Ok(());
        }
        if self.ctx.args.delete_missing_snapshots {
            self.delete_missing_snapshots(pair)?;
        }
        if self.aborted {
            return Ok(());
        }
        if self.ctx.args.delete_missing_datasets {
            self.delete_missing_datasets(pair)?;
        }
        Ok(())
    }

    /// The admitted source-relative dataset paths for this pair, parents
    /// before children, with filters and --skip-parent applied. `None`
    /// when the source root does not exist.
    fn admitted_rels(&mut self, pair: &Pair) -> Result<Option<Vec<String>>> {
        let catalog = Catalog::new(self.ctx);
        let names = if self.ctx.args.recursive {
            catalog.list_datasets(&pair.src, &pair.src_root.path, true)?
        } else {
            catalog.list_datasets(&pair.src, &pair.src_root.path, false)?
        };
        let Some(names) = names else {
            return Ok(None);
        };
        let mut rels = Vec::new();
        let mut pruned: Vec<String> = Vec::new();
        for name in &names {
            let Some(rel) = pair.src_root.relative_of(name) else {
                continue;
            };
            if under_any(rel, &pruned) {
                continue;
            }
            if !self.ctx.ds_filter.admits(rel) {
                debug!("dataset {name} excluded by the dataset filters");
                continue;
            }
            if self.property_excluded(&catalog, pair, name)? {
                info!("dataset {name} excluded by property");
                pruned.push(rel.to_string());
                continue;
            }
            if rel.is_empty() && self.ctx.args.skip_parent {
                continue;
            }
            rels.push(rel.to_string());
        }
        Ok(Some(rels))
    }

    fn property_excluded(&self, catalog: &Catalog<'_>, pair: &Pair, name: &str) -> Result<bool> {
        let Some(prop) = &self.ctx.args.exclude_dataset_property else {
            return Ok(false);
        };
        self.ctx.faults.check(SITE_LIST_EXCLUDE_PROPERTY)?;
        if self.ctx.faults.fire_delete(SITE_LIST_EXCLUDE_PROPERTY) {
            catalog.destroy_dataset(&pair.src, name, true)?;
        }
        match catalog.get_property(&pair.src, name, prop) {
            Ok(value) => Ok(property_excludes(value.as_deref(), &self.ctx.localhost)),
            Err(Error::CommandFailed { stderr_tail, .. }) if is_dataset_gone(&stderr_tail) => {
                warn!("dataset {name} disappeared while probing {prop}; excluding it");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn replicate_tree(&mut self, pair: &Pair) -> Result<()> {
        let Some(rels) = self.admitted_rels(pair)? else {
            return Err(Error::precondition(format!(
                "source dataset {} does not exist",
                pair.src_root
            )));
        };
        let driver = Driver::new(self.ctx, pair);
        let mut skipped: Vec<String> = Vec::new();
        for rel in &rels {
            if self.aborted {
                break;
            }
            if under_any(rel, &skipped) {
                info!("skipping {rel:?}: an ancestor failed");
                continue;
            }
            let what = pair.src_root.join(rel);
            let result = run_with_retries(&self.policy, &what, || driver.replicate(rel));
            match result {
                Ok(outcome) => debug!("{what}: {outcome:?}"),
                Err(e) => {
                    if let Some(prefix) = self.note_failure(rel, "replication", &e) {
                        skipped.push(prefix);
                    }
                }
            }
        }
        Ok(())
    }

    fn delete_missing_snapshots(&mut self, pair: &Pair) -> Result<()> {
        let Some(rels) = self.admitted_rels(pair)? else {
            debug!("source root {} is gone; nothing to reconcile", pair.src_root);
            return Ok(());
        };
        let recon = Reconciler::new(self.ctx, pair);
        let catalog = Catalog::new(self.ctx);
        // only datasets that exist on both sides are reconciled
        let dst_names = catalog
            .list_datasets(&pair.dst, &pair.dst_root.path, true)?
            .unwrap_or_default();
        let dst_rels: HashSet<String> = dst_names
            .iter()
            .filter_map(|n| pair.dst_root.relative_of(n))
            .map(str::to_string)
            .collect();
        let mut skipped: Vec<String> = Vec::new();
        for rel in &rels {
            if self.aborted {
                break;
            }
            if !dst_rels.contains(rel) || under_any(rel, &skipped) {
                continue;
            }
            let what = pair.dst_root.join(rel);
            let result =
                run_with_retries(&self.policy, &what, || recon.reconcile_snapshots(rel));
            if let Err(e) = result {
                if let Some(prefix) = self.note_failure(rel, "snapshot reconciliation", &e) {
                    skipped.push(prefix);
                }
            }
        }
        Ok(())
    }

    fn delete_missing_datasets(&mut self, pair: &Pair) -> Result<()> {
        let recon = Reconciler::new(self.ctx, pair);
        let doomed = recon.missing_datasets()?;
        let mut skipped: Vec<String> = Vec::new();
        for rel in &doomed {
            if self.aborted {
                break;
            }
            if under_any(rel, &skipped) {
                continue;
            }
            let result =
                run_with_retries(&self.policy, rel, || recon.destroy_missing_dataset(rel));
            if let Err(e) = result {
                if let Some(prefix) = self.note_failure(rel, "dataset deletion", &e) {
                    skipped.push(prefix);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::args::Args;
    use clap::Parser;

    #[test]
    fn subtree_prefixes() {
        let prefixes = vec!["foo".to_string()];
        assert!(under_any("foo", &prefixes));
        assert!(under_any("foo/a", &prefixes));
        assert!(!under_any("foobar", &prefixes));
        assert!(!under_any("bar", &prefixes));
        // the empty prefix is the root: everything below it is covered
        let root = vec!["".to_string()];
        assert!(under_any("a", &root));
        assert!(under_any("", &root));
        assert!(under_any("a/b", &root));
    }

    #[test]
    fn force_once_is_consumed_but_force_is_not() {
        let args = Args::parse_from(["zmirror", "--force-once", "tank/a", "backup/a"]);
        let ctx = Context::new(args).unwrap();
        assert!(ctx.force_allowed());
        ctx.consume_force();
        assert!(!ctx.force_allowed());

        let args = Args::parse_from(["zmirror", "--force", "tank/a", "backup/a"]);
        let ctx = Context::new(args).unwrap();
        ctx.consume_force();
        assert!(ctx.force_allowed());
    }

    #[test]
    fn program_names_with_whitespace_are_fatal() {
        let args = Args::parse_from([
            "zmirror",
            "--zfs-program",
            "zfs zfs",
            "tank/a",
            "backup/a",
        ]);
        let err = Context::new(args).unwrap_err();
        assert_eq!(err.exit_code(), crate::repl::error::EXIT_FATAL);
    }

    #[test]
    fn disabled_zfs_program_is_fatal() {
        let args = Args::parse_from(["zmirror", "--zfs-program", "-", "tank/a", "backup/a"]);
        let err = Context::new(args).unwrap_err();
        assert_eq!(err.exit_code(), crate::repl::error::EXIT_FATAL);
    }

    #[test]
    fn overlapping_pairs_are_fatal() {
        let args = Args::parse_from(["zmirror", "tank/a", "tank/a/backup"]);
        let ctx = Context::new(args).unwrap();
        let err = Pair::new(&ctx, "tank/a", "tank/a/backup").unwrap_err();
        assert_eq!(err.exit_code(), crate::repl::error::EXIT_FATAL);
    }

    #[test]
    fn remote_pairs_build_distinct_targets() {
        let args = Args::parse_from([
            "zmirror",
            "--ssh-dst-user",
            "backup",
            "tank/a",
            "nas:pool/a",
        ]);
        let ctx = Context::new(args).unwrap();
        let pair = Pair::new(&ctx, "tank/a", "nas:pool/a").unwrap();
        assert!(!pair.src.is_remote());
        assert!(pair.dst.is_remote());
        assert_eq!(pair.dst_root.ssh_dest().as_deref(), Some("backup@nas"));
    }
}
