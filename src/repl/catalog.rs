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

//! Observation and mutation of datasets, snapshots and bookmarks on either
//! side. Every listing is an observation point: a third party may mutate
//! state between two observations, so "dataset does not exist" answers are
//! surfaced as `None` rather than failures, and the driver re-probes after
//! conflicts and retries.

use crate::repl::cmd::{self, Cmd, CmdTarget};
use crate::repl::error::{Error, Result, is_dataset_gone};
use crate::repl::props::Property;
use crate::repl::zfs::{Bookmark, Creation, Snapshot, snapshot_order};
use crate::repl::{Context, args::DISABLED_PROGRAM};
use log::{debug, info, warn};

pub struct Catalog<'c> {
    pub ctx: &'c Context,
}

impl<'c> Catalog<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self { ctx }
    }

    fn zfs<'t>(&self, target: &'t CmdTarget, privileged: bool) -> Cmd<'t> {
        Cmd::new(target, privileged, self.ctx.args.zfs_program.clone())
    }

    /// Ordered snapshots of one dataset; None when the dataset is gone.
    /// `site` names the fault-injection trigger for this observation.
    pub fn list_snapshots(
        &self,
        target: &CmdTarget,
        dataset: &str,
        site: &str,
    ) -> Result<Option<Vec<Snapshot>>> {
        self.ctx.faults.check(site)?;
        if self.ctx.faults.fire_delete(site) {
            // simulate a third party destroying the dataset between probes
            self.destroy_dataset(target, dataset, true)?;
        }
        let mut cmd = self.zfs(target, false);
        cmd.args([
            "list", "-t", "snapshot", "-d", "1", "-Hp", "-s", "createtxg", "-o",
            "guid,creation,createtxg,name",
        ]);
        cmd.arg(dataset);
        let out = cmd.run()?;
        if !out.success {
            if is_dataset_gone(&out.stderr) {
                return Ok(None);
            }
            return Err(cmd.failure(&out));
        }
        let mut snaps = parse_snapshot_lines(&out.stdout, dataset);
        snaps.sort_by(snapshot_order);
        Ok(Some(snaps))
    }

    /// Ordered bookmarks of one dataset; None when the dataset is gone.
    pub fn list_bookmarks(&self, target: &CmdTarget, dataset: &str) -> Result<Option<Vec<Bookmark>>> {
        let mut cmd = self.zfs(target, false);
        cmd.args([
            "list", "-t", "bookmark", "-d", "1", "-Hp", "-s", "createtxg", "-o",
            "guid,creation,createtxg,name",
        ]);
        cmd.arg(dataset);
        let out = cmd.run()?;
        if !out.success {
            if is_dataset_gone(&out.stderr) {
                return Ok(None);
            }
            return Err(cmd.failure(&out));
        }
        Ok(Some(parse_bookmark_lines(&out.stdout, dataset)))
    }

    /// Datasets under `root`, ordered by name (parents before children);
    /// None when the root is gone.
    pub fn list_datasets(
        &self,
        target: &CmdTarget,
        root: &str,
        recursive: bool,
    ) -> Result<Option<Vec<String>>> {
        let mut cmd = self.zfs(target, false);
        cmd.args(["list", "-t", "filesystem,volume", "-Hp", "-s", "name", "-o", "name"]);
        if recursive {
            cmd.arg("-r");
        } else {
            cmd.args(["-d", "0"]);
        }
        cmd.arg(root);
        let out = cmd.run()?;
        if !out.success {
            if is_dataset_gone(&out.stderr) {
                return Ok(None);
            }
            return Err(cmd.failure(&out));
        }
        Ok(Some(out.stdout.lines().map(str::to_string).collect()))
    }

    pub fn dataset_exists(&self, target: &CmdTarget, dataset: &str) -> Result<bool> {
        Ok(self.list_datasets(target, dataset, false)?.is_some())
    }

    /// Properties of one dataset. `which` is `all` or a comma-separated
    /// name list, as `zfs get` takes it.
    pub fn get_properties(
        &self,
        target: &CmdTarget,
        dataset: &str,
        which: &str,
    ) -> Result<Vec<Property>> {
        let mut cmd = self.zfs(target, false);
        cmd.args(["get", "-Hp", "-o", "property,value,source", which]);
        cmd.arg(dataset);
        let out = cmd.run_ok()?;
        Ok(parse_property_lines(&out.stdout))
    }

    pub fn get_property(
        &self,
        target: &CmdTarget,
        dataset: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let props = self.get_properties(target, dataset, name)?;
        Ok(props.into_iter().next().map(|p| p.value))
    }

    pub fn set_properties(
        &self,
        target: &CmdTarget,
        dataset: &str,
        assignments: &[String],
    ) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        if self.ctx.dry_run() {
            info!("dry-run: would zfs set {} on {dataset}", assignments.join(" "));
            return Ok(());
        }
        let mut cmd = self.zfs(target, true);
        cmd.arg("set");
        cmd.args(assignments.iter().cloned());
        cmd.arg(dataset);
        cmd.run_ok()?;
        Ok(())
    }

    /// Creates `dataset#tag` from `dataset@tag`. Idempotent: an existing
    /// bookmark with the same GUID is success.
    pub fn create_bookmark(
        &self,
        target: &CmdTarget,
        dataset: &str,
        tag: &str,
        guid: u64,
    ) -> Result<()> {
        let mut cmd = self.zfs(target, true);
        cmd.arg("bookmark");
        cmd.arg(format!("{dataset}@{tag}"));
        cmd.arg(format!("{dataset}#{tag}"));
        let out = cmd.run()?;
        if out.success {
            return Ok(());
        }
        if out.stderr.contains("already exists") {
            let bookmarks = self.list_bookmarks(target, dataset)?.unwrap_or_default();
            if bookmarks.iter().any(|b| b.tag == tag && b.guid == guid) {
                debug!("bookmark {dataset}#{tag} already exists");
                return Ok(());
            }
            return Err(Error::precondition(format!(
                "bookmark {dataset}#{tag} exists but does not match snapshot @{tag}"
            )));
        }
        Err(cmd.failure(&out))
    }

    /// Destroys the named snapshots, batched so each invocation stays
    /// within the command-line byte budget.
    pub fn destroy_snapshots(
        &self,
        target: &CmdTarget,
        dataset: &str,
        tags: &[String],
    ) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        if self.ctx.dry_run() {
            info!("dry-run: would destroy {} snapshot(s) of {dataset}", tags.len());
            return Ok(());
        }
        let fixed = self.ctx.args.zfs_program.len() + "destroy".len() + dataset.len() + 16;
        for chunk in cmd::batch_csv(tags, fixed, cmd::MAX_CMDLINE_BYTES) {
            let mut cmd = self.zfs(target, true);
            cmd.arg("destroy");
            cmd.arg(format!("{dataset}@{chunk}"));
            let out = cmd.run()?;
            if !out.success {
                return Err(destructive_failure(&cmd, dataset, &out));
            }
        }
        Ok(())
    }

    pub fn destroy_dataset(&self, target: &CmdTarget, dataset: &str, recursive: bool) -> Result<()> {
        if self.ctx.dry_run() {
            info!("dry-run: would destroy dataset {dataset}");
            return Ok(());
        }
        let mut cmd = self.zfs(target, true);
        cmd.arg("destroy");
        if recursive {
            cmd.arg("-r");
        }
        if self.ctx.args.force_unmount {
            cmd.arg("-f");
        }
        cmd.arg(dataset);
        let out = cmd.run()?;
        if !out.success && !is_dataset_gone(&out.stderr) {
            return Err(destructive_failure(&cmd, dataset, &out));
        }
        Ok(())
    }

    /// Rolls the destination back to `dataset@tag`, destroying every newer
    /// snapshot.
    pub fn rollback(&self, target: &CmdTarget, dataset: &str, tag: &str) -> Result<()> {
        if self.ctx.dry_run() {
            info!("dry-run: would roll back {dataset} to @{tag}");
            return Ok(());
        }
        let mut cmd = self.zfs(target, true);
        cmd.args(["rollback", "-r"]);
        if self.ctx.args.force_unmount {
            cmd.arg("-f");
        }
        cmd.arg(format!("{dataset}@{tag}"));
        let out = cmd.run()?;
        if !out.success {
            return Err(destructive_failure(&cmd, dataset, &out));
        }
        Ok(())
    }

    /// Ensures the ancestors of `dataset` exist (zfs create -p of the
    /// parent). The pool itself must already exist.
    pub fn create_ancestors(&self, target: &CmdTarget, dataset: &str) -> Result<()> {
        let Some((parent, _)) = dataset.rsplit_once('/') else {
            return Ok(());
        };
        if self.ctx.dry_run() {
            info!("dry-run: would create ancestors of {dataset}");
            return Ok(());
        }
        let mut cmd = self.zfs(target, true);
        cmd.args(["create", "-p"]);
        cmd.arg(parent);
        cmd.run_ok()?;
        Ok(())
    }

    /// Whether a pool feature is enabled or active, memoised per
    /// (host, pool). With the zpool program disabled the answer is false.
    pub fn feature_enabled(&self, target: &CmdTarget, pool: &str, feature: &str) -> Result<bool> {
        if self.ctx.args.zpool_program == DISABLED_PROGRAM {
            return Ok(false);
        }
        let key = (
            format!("{}/{pool}", target.host_key()),
            feature.to_string(),
        );
        if let Some(hit) = self.ctx.features.borrow().get(&key) {
            return Ok(*hit);
        }
        let mut cmd = Cmd::new(target, false, self.ctx.args.zpool_program.clone());
        cmd.args(["get", "-Hp", "-o", "value"]);
        cmd.arg(format!("feature@{feature}"));
        cmd.arg(pool);
        let out = cmd.run()?;
        if !out.success {
            if out.stderr.contains("no such pool") {
                return Err(Error::precondition(format!(
                    "pool {pool} does not exist on {}",
                    target.pretty()
                )));
            }
            return Err(cmd.failure(&out));
        }
        let value = out.stdout.trim();
        let enabled = value == "enabled" || value == "active";
        self.ctx.features.borrow_mut().insert(key, enabled);
        Ok(enabled)
    }

    /// Estimated stream size of one send, via a dry-run send. Estimation
    /// failures degrade to 0 (the pipeline then skips optional stages).
    pub fn estimate_send_size(&self, target: &CmdTarget, send_args: &[String]) -> Result<u64> {
        let mut cmd = self.zfs(target, true);
        cmd.args(["send", "-n", "-v", "-P"]);
        cmd.args(send_args.iter().cloned());
        let out = cmd.run()?;
        if !out.success {
            debug!("send size estimation failed: {}", out.stderr.trim());
            return Ok(0);
        }
        Ok(parse_send_size(&out.stdout))
    }
}

fn destructive_failure(cmd: &Cmd<'_>, dataset: &str, out: &cmd::CmdOutput) -> Error {
    if out.stderr.contains("key not loaded") || out.stderr.contains("encryption") {
        Error::EncryptedDataset {
            dataset: dataset.to_string(),
            detail: out.stderr.trim().to_string(),
        }
    } else {
        cmd.failure(out)
    }
}

fn parse_snapshot_lines(stdout: &str, dataset: &str) -> Vec<Snapshot> {
    parse_mark_lines(stdout, dataset, '@')
        .map(|(guid, creation, tag)| Snapshot { guid, tag, creation })
        .collect()
}

fn parse_bookmark_lines(stdout: &str, dataset: &str) -> Vec<Bookmark> {
    parse_mark_lines(stdout, dataset, '#')
        .map(|(guid, creation, tag)| Bookmark { guid, tag, creation })
        .collect()
}

/// Parses `guid \t creation \t createtxg \t dataset@tag` listing lines.
/// Lines for other datasets or with malformed fields are skipped with a
/// warning; a concurrent rename must not kill the whole run.
fn parse_mark_lines<'a>(
    stdout: &'a str,
    dataset: &'a str,
    sep: char,
) -> impl Iterator<Item = (u64, Creation, String)> + 'a {
    let prefix = format!("{dataset}{sep}");
    stdout.lines().filter_map(move |line| {
        let mut fields = line.split('\t');
        let (Some(guid), Some(when), Some(txg), Some(name)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            warn!("skipping malformed listing line {line:?}");
            return None;
        };
        let Some(tag) = name.strip_prefix(&prefix) else {
            warn!("skipping listing line for foreign dataset {name:?}");
            return None;
        };
        let (Ok(guid), Ok(when), Ok(txg)) =
            (guid.parse::<u64>(), when.parse::<i64>(), txg.parse::<u64>())
        else {
            warn!("skipping listing line with unparsable numbers {line:?}");
            return None;
        };
        Some((guid, Creation::new(when, txg), tag.to_string()))
    })
}

fn parse_property_lines(stdout: &str) -> Vec<Property> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let (Some(name), Some(value), Some(source)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!("skipping malformed property line {line:?}");
                return None;
            };
            Some(Property {
                name: name.to_string(),
                value: value.to_string(),
                source: source.to_string(),
            })
        })
        .collect()
}

/// Finds the `size \t N` line of `zfs send -n -v -P` output.
fn parse_send_size(stdout: &str) -> u64 {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("size") {
                fields.next().and_then(|v| v.parse().ok())
            } else {
                None
            }
        })
        .next_back()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lines_are_parsed_and_foreign_lines_skipped() {
        let stdout = "\
111\t1700000000\t50\ttank/a@s1\n\
222\t1700000100\t51\ttank/a@s2\n\
333\t1700000200\t52\ttank/a/child@s1\n\
garbage line\n";
        let snaps = parse_snapshot_lines(stdout, "tank/a");
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].guid, 111);
        assert_eq!(snaps[0].tag, "s1");
        assert_eq!(snaps[1].creation, Creation::new(1700000100, 51));
    }

    #[test]
    fn bookmark_lines_use_the_hash_separator() {
        let stdout = "999\t1700000000\t50\ttank/a#d1\n";
        let bms = parse_bookmark_lines(stdout, "tank/a");
        assert_eq!(bms.len(), 1);
        assert_eq!(bms[0].tag, "d1");
        assert_eq!(bms[0].guid, 999);
    }

    #[test]
    fn property_lines() {
        let stdout = "compression\tzstd\tlocal\nsite:p1\tv1\tinherited from tank\n";
        let props = parse_property_lines(stdout);
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "compression");
        assert_eq!(props[1].source, "inherited from tank");
    }

    #[test]
    fn send_size_parsing() {
        let stdout = "\
incremental\ts1\ttank/a@s2\t12345\n\
size\t4503599\n";
        assert_eq!(parse_send_size(stdout), 4503599);
        assert_eq!(parse_send_size("no size here\n"), 0);
    }
}
