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

//! The deletion reconciler: after replication the destination should
//! mirror the filtered source. Two independent modes destroy destination
//! snapshots whose GUID the source no longer knows, and destination
//! datasets with no source counterpart. Both are idempotent and honour
//! dry-run, the filters, and skip-on-error.

use crate::repl::catalog::Catalog;
use crate::repl::driver::SITE_LIST_DST;
use crate::repl::error::Result;
use crate::repl::filter::{DatasetFilter, SnapshotFilter};
use crate::repl::zfs::Snapshot;
use crate::repl::{Context, Pair};
use log::{info, warn};
use std::collections::HashSet;

pub const SITE_LIST_SRC_FOR_DELETE: &str = "zfs_list_snapshot_src_for_delete_missing_snapshots";

/// Destination snapshot tags to destroy: admitted by the snapshot filter
/// but carrying a GUID the source's snapshots and bookmarks no longer
/// have. A same-named snapshot with a different GUID is missing.
pub fn snapshot_tags_to_delete(
    src_mark_guids: &HashSet<u64>,
    dst: &[Snapshot],
    filter: &SnapshotFilter,
) -> Vec<String> {
    dst.iter()
        .filter(|s| filter.admits(&s.tag) && !src_mark_guids.contains(&s.guid))
        .map(|s| s.tag.clone())
        .collect()
}

/// Destination-relative paths to destroy: present below the destination
/// root, admitted by the dataset filter, but absent below the source root.
/// Deepest first, so children fall before their parents.
pub fn datasets_to_delete(
    src_rels: &HashSet<String>,
    dst_rels: &[String],
    filter: &DatasetFilter,
) -> Vec<String> {
    let mut missing: Vec<String> = dst_rels
        .iter()
        .filter(|rel| filter.admits(rel) && !src_rels.contains(*rel))
        .cloned()
        .collect();
    missing.sort_by(|a, b| {
        let depth = |s: &str| s.split('/').count();
        depth(b).cmp(&depth(a)).then_with(|| b.cmp(a))
    });
    missing
}

pub struct Reconciler<'c> {
    pub ctx: &'c Context,
    pub catalog: Catalog<'c>,
    pub pair: &'c Pair,
}

impl<'c> Reconciler<'c> {
    pub fn new(ctx: &'c Context, pair: &'c Pair) -> Self {
        Self {
            ctx,
            catalog: Catalog::new(ctx),
            pair,
        }
    }

    /// One dataset's worth of --delete-missing-snapshots. Returns how many
    /// snapshots were destroyed (or would be, under dry-run).
    pub fn reconcile_snapshots(&self, rel: &str) -> Result<usize> {
        let src_ds = self.pair.src_root.join(rel);
        let dst_ds = self.pair.dst_root.join(rel);
        let Some(src_snaps) =
            self.catalog
                .list_snapshots(&self.pair.src, &src_ds, SITE_LIST_SRC_FOR_DELETE)?
        else {
            warn!("skipping snapshot reconciliation for {src_ds}: dataset no longer exists");
            return Ok(0);
        };
        let src_bookmarks = self
            .catalog
            .list_bookmarks(&self.pair.src, &src_ds)?
            .unwrap_or_default();
        let Some(dst_snaps) = self
            .catalog
            .list_snapshots(&self.pair.dst, &dst_ds, SITE_LIST_DST)?
        else {
            return Ok(0);
        };
        let src_mark_guids: HashSet<u64> = src_snaps
            .iter()
            .map(|s| s.guid)
            .chain(src_bookmarks.iter().map(|b| b.guid))
            .collect();
        let doomed = snapshot_tags_to_delete(&src_mark_guids, &dst_snaps, &self.ctx.snap_filter);
        if doomed.is_empty() {
            return Ok(0);
        }
        info!(
            "destroying {} destination snapshot(s) of {dst_ds} missing on the source",
            doomed.len()
        );
        self.catalog
            .destroy_snapshots(&self.pair.dst, &dst_ds, &doomed)?;
        Ok(doomed.len())
    }

    /// The relative paths --delete-missing-datasets would destroy, deepest
    /// first. When the source root itself is gone everything below (and
    /// including) the destination root is missing.
    pub fn missing_datasets(&self) -> Result<Vec<String>> {
        let Some(dst_names) =
            self.catalog
                .list_datasets(&self.pair.dst, &self.pair.dst_root.path, true)?
        else {
            return Ok(Vec::new());
        };
        let dst_rels: Vec<String> = dst_names
            .iter()
            .filter_map(|name| self.pair.dst_root.relative_of(name))
            .map(str::to_string)
            .collect();
        let src_rels: HashSet<String> = match self.catalog.list_datasets(
            &self.pair.src,
            &self.pair.src_root.path,
            true,
        )? {
            Some(names) => names
                .iter()
                .filter_map(|name| self.pair.src_root.relative_of(name))
                .map(str::to_string)
                .collect(),
            None => HashSet::new(),
        };
        Ok(datasets_to_delete(
            &src_rels,
            &dst_rels,
            &self.ctx.ds_filter,
        ))
    }

    pub fn destroy_missing_dataset(&self, rel: &str) -> Result<()> {
        let dst_ds = self.pair.dst_root.join(rel);
        info!("destroying destination dataset {dst_ds}: no counterpart on the source");
        self.catalog.destroy_dataset(&self.pair.dst, &dst_ds, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::zfs::Creation;

    fn snaps(specs: &[(&str, u64)]) -> Vec<Snapshot> {
        specs
            .iter()
            .enumerate()
            .map(|(i, (tag, guid))| Snapshot {
                guid: *guid,
                tag: tag.to_string(),
                creation: Creation::new(1000 + i as i64, 10 + i as u64),
            })
            .collect()
    }

    fn no_snap_filter() -> SnapshotFilter {
        SnapshotFilter::compile(&[], &[]).unwrap()
    }

    fn no_ds_filter() -> DatasetFilter {
        DatasetFilter::compile(&[], &[], &[], &[]).unwrap()
    }

    #[test]
    fn same_name_different_guid_is_missing() {
        // source s1 and s3 were recreated with fresh guids; only s2 is a
        // true replica and survives
        let dst = snaps(&[("s1", 1), ("s2", 2), ("s3", 3)]);
        let src_guids: HashSet<u64> = [101, 2, 103].into();
        let doomed = snapshot_tags_to_delete(&src_guids, &dst, &no_snap_filter());
        assert_eq!(doomed, vec!["s1", "s3"]);
    }

    #[test]
    fn bookmarked_guids_count_as_present() {
        let dst = snaps(&[("s1", 1), ("s2", 2)]);
        // s1's guid survives only as a bookmark on the source
        let src_guids: HashSet<u64> = [1, 2].into();
        assert!(snapshot_tags_to_delete(&src_guids, &dst, &no_snap_filter()).is_empty());
    }

    #[test]
    fn excluded_snapshots_are_preserved() {
        let dst = snaps(&[("s1", 1), ("s2", 2), ("s3", 3)]);
        let src_guids: HashSet<u64> = HashSet::new();
        let filter =
            SnapshotFilter::compile(&[], &[r"s[1-2]".to_string()]).unwrap();
        let doomed = snapshot_tags_to_delete(&src_guids, &dst, &filter);
        assert_eq!(doomed, vec!["s3"]);
    }

    #[test]
    fn missing_datasets_deepest_first() {
        let src: HashSet<String> = ["".to_string(), "foo".to_string()].into();
        let dst = vec![
            "".to_string(),
            "foo".to_string(),
            "zoo".to_string(),
            "zoo/a".to_string(),
            "zoo/a/b".to_string(),
        ];
        let doomed = datasets_to_delete(&src, &dst, &no_ds_filter());
        assert_eq!(doomed, vec!["zoo/a/b", "zoo/a", "zoo"]);
    }

    #[test]
    fn excluded_datasets_are_preserved() {
        // spec scenario: destination has extra bar and zoo; bar is excluded
        let src: HashSet<String> = ["".to_string()].into();
        let dst = vec!["".to_string(), "bar".to_string(), "zoo".to_string()];
        let filter = DatasetFilter::compile(&[], &["bar".to_string()], &[], &[]).unwrap();
        let doomed = datasets_to_delete(&src, &dst, &filter);
        assert_eq!(doomed, vec!["zoo"]);
    }

    #[test]
    fn missing_source_root_dooms_the_destination_root() {
        let src: HashSet<String> = HashSet::new();
        let dst = vec!["".to_string(), "foo".to_string()];
        let doomed = datasets_to_delete(&src, &dst, &no_ds_filter());
        assert_eq!(doomed, vec!["foo", ""]);
    }

    #[test]
    fn reconciliation_is_idempotent_at_the_set_level() {
        let dst = snaps(&[("s1", 1), ("s2", 2)]);
        let src_guids: HashSet<u64> = [2].into();
        let first = snapshot_tags_to_delete(&src_guids, &dst, &no_snap_filter());
        // after deleting, the survivors are exactly the common ones
        let survivors: Vec<Snapshot> = dst
            .into_iter()
            .filter(|s| !first.contains(&s.tag))
            .collect();
        let second = snapshot_tags_to_delete(&src_guids, &survivors, &no_snap_filter());
        assert!(second.is_empty());
    }
}
