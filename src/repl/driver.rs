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

//! Per-dataset replication: probe, conflict assessment, rollback, step
//! execution, bookmark creation. The whole flow is wrapped in
//! `run_with_retries`, so every attempt re-observes both sides; state
//! machine per dataset:
//! PROBE → (PLAN | CONFLICT) → (ROLLBACK?) → EXECUTE* → POST → done.

use crate::repl::args::{DryRunMode, SkipMissing};
use crate::repl::catalog::Catalog;
use crate::repl::cmd::Cmd;
use crate::repl::error::{Error, Result};
use crate::repl::pipeline::Pipeline;
use crate::repl::plan::{Plan, PlanError, PlanOptions, SendStep, StepKind, plan_steps};
use crate::repl::props::{Property, PropertyPolicy};
use crate::repl::util::ReadableBytes;
use crate::repl::zfs::Snapshot;
use crate::repl::{Context, Pair};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::Duration;

// Fault-injection trigger sites.
pub const SITE_LIST_SRC: &str = "zfs_list_snapshot_src";
pub const SITE_LIST_DST: &str = "zfs_list_snapshot_dst";
pub const SITE_FULL_SEND: &str = "full_zfs_send";
pub const SITE_INCR_SEND: &str = "incr_zfs_send";

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Replicated { steps: usize },
    UpToDate,
    Skipped(String),
}

/// Bounded exponential backoff between retries of the per-dataset flow.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub min_sleep: Duration,
    pub max_sleep: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            min_sleep: Duration::from_millis(125),
            max_sleep: Duration::from_secs(10),
        }
    }
}

/// Runs `attempt` up to `retries + 1` times, sleeping a jittered,
/// exponentially growing interval between transient failures. Permanent
/// failures return immediately.
pub fn run_with_retries<T>(
    policy: &RetryPolicy,
    what: &str,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut rng = SmallRng::from_os_rng();
    let mut sleep = policy.min_sleep;
    let mut tries_left = policy.retries;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tries_left > 0 => {
                tries_left -= 1;
                let jittered = sleep.mul_f64(0.5 + rng.random::<f64>() * 0.5);
                warn!(
                    "transient failure on {what} ({e}); retrying in {:.2}s, {tries_left} retries left",
                    jittered.as_secs_f64()
                );
                std::thread::sleep(jittered);
                sleep = (sleep * 2).min(policy.max_sleep);
            }
            Err(e) => return Err(e),
        }
    }
}

/// How to reconcile an existing destination with the source's mark set
/// before planning.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The latest destination snapshot is a common mark.
    Proceed,
    /// Newer-than-common destination snapshots must be destroyed by rolling
    /// back to the named tag.
    RollbackTo { tag: String },
    /// No common mark at all; only a wipe and full resync can reconcile.
    WipeRequired,
}

/// Pure conflict assessment: `src_mark_guids` is the GUID set of the
/// source's snapshots and bookmarks.
pub fn assess_destination(src_mark_guids: &HashSet<u64>, dst: &[Snapshot]) -> Resolution {
    let Some(latest) = dst.last() else {
        return Resolution::Proceed;
    };
    if src_mark_guids.contains(&latest.guid) {
        return Resolution::Proceed;
    }
    match dst.iter().rev().find(|s| src_mark_guids.contains(&s.guid)) {
        Some(common) => Resolution::RollbackTo {
            tag: common.tag.clone(),
        },
        None => Resolution::WipeRequired,
    }
}

pub struct Driver<'c> {
    pub ctx: &'c Context,
    pub catalog: Catalog<'c>,
    pub pair: &'c Pair,
}

impl<'c> Driver<'c> {
    pub fn new(ctx: &'c Context, pair: &'c Pair) -> Self {
        Self {
            ctx,
            catalog: Catalog::new(ctx),
            pair,
        }
    }

    /// One replication attempt for the dataset at `rel` below the pair
    /// roots. The caller wraps this in `run_with_retries`.
    pub fn replicate(&self, rel: &str) -> Result<Outcome> {
        let ctx = self.ctx;
        let src_ds = self.pair.src_root.join(rel);
        let dst_ds = self.pair.dst_root.join(rel);
        debug!("replicating {src_ds} -> {dst_ds}");

        let Some(src_snaps) = self
            .catalog
            .list_snapshots(&self.pair.src, &src_ds, SITE_LIST_SRC)?
        else {
            warn!("skipping {src_ds}: dataset no longer exists on the source");
            return Ok(Outcome::Skipped("source dataset no longer exists".into()));
        };
        let included: Vec<bool> = src_snaps
            .iter()
            .map(|s| ctx.snap_filter.admits(&s.tag))
            .collect();

        if !included.contains(&true) {
            match ctx.args.skip_missing_snapshots {
                SkipMissing::Fail => {
                    return Err(Error::MissingSnapshots { dataset: src_ds });
                }
                SkipMissing::Dataset => {
                    info!("skipping {src_ds}: no snapshot matches the snapshot filters");
                    return Ok(Outcome::Skipped(
                        "no snapshot matches the snapshot filters".into(),
                    ));
                }
                SkipMissing::Continue => {
                    debug!("{src_ds} has no included snapshot; nothing to replicate");
                    return Ok(Outcome::UpToDate);
                }
            }
        }

        let use_bookmark = !ctx.args.no_use_bookmark;
        let bookmarks = if use_bookmark {
            self.catalog
                .list_bookmarks(&self.pair.src, &src_ds)?
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let probed = self
            .catalog
            .list_snapshots(&self.pair.dst, &dst_ds, SITE_LIST_DST)?;
        let dst_exists = probed.is_some();
        let mut dst_snaps = probed.unwrap_or_default();

        // conflict assessment against everything the source can anchor on
        let mut simulated_resolution = false;
        if !dst_snaps.is_empty() {
            let src_mark_guids: HashSet<u64> = src_snaps
                .iter()
                .map(|s| s.guid)
                .chain(bookmarks.iter().map(|b| b.guid))
                .collect();
            match assess_destination(&src_mark_guids, &dst_snaps) {
                Resolution::Proceed => {}
                Resolution::RollbackTo { tag } => {
                    let latest = dst_snaps.last().expect("non-empty").tag.clone();
                    if !ctx.force_allowed() {
                        return Err(Error::Divergence {
                            dataset: dst_ds,
                            latest,
                        });
                    }
                    ctx.consume_force();
                    let common = dst_snaps.iter().find(|s| s.tag == tag).expect("common is on dst");
                    info!(
                        "rolling back {dst_ds} to @{tag} of {} (destroys snapshots after it)",
                        common.creation
                    );
                    self.catalog.rollback(&self.pair.dst, &dst_ds, &tag)?;
                    simulated_resolution = ctx.dry_run();
                    let keep = dst_snaps.iter().position(|s| s.tag == tag).map(|i| i + 1);
                    dst_snaps.truncate(keep.unwrap_or(0));
                }
                Resolution::WipeRequired => {
                    let latest = dst_snaps.last().expect("non-empty").tag.clone();
                    if !ctx.force_allowed() {
                        return Err(Error::Divergence {
                            dataset: dst_ds,
                            latest,
                        });
                    }
                    ctx.consume_force();
                    info!("wiping {dst_ds}: no common snapshot or bookmark with the source");
                    self.catalog.destroy_dataset(&self.pair.dst, &dst_ds, true)?;
                    simulated_resolution = ctx.dry_run();
                    dst_snaps.clear();
                }
            }
        }

        let plan = plan_steps(
            &src_snaps,
            &included,
            &bookmarks,
            &dst_snaps,
            PlanOptions {
                use_bookmark,
                force_exclusive: false,
            },
        )
        .map_err(|PlanError::NoCommonAncestor| Error::Divergence {
            dataset: dst_ds.clone(),
            latest: dst_snaps
                .last()
                .map(|s| s.tag.clone())
                .unwrap_or_default(),
        })?;

        if plan.is_empty() {
            debug!("{dst_ds} is up to date");
            return Ok(Outcome::UpToDate);
        }

        let make_bookmarks = !ctx.args.no_create_bookmark && !ctx.dry_run();
        if make_bookmarks {
            let pool = src_ds.split('/').next().unwrap_or(&src_ds);
            if !self
                .catalog
                .feature_enabled(&self.pair.src, pool, "bookmarks")?
            {
                return Err(Error::precondition(format!(
                    "pool {pool} does not support bookmarks; pass --no-create-bookmark to proceed without them"
                )));
            }
        }

        if !dst_exists {
            self.catalog.create_ancestors(&self.pair.dst, &dst_ds)?;
        }

        let src_props = if ctx.prop_policy.wants_source_properties() {
            self.catalog.get_properties(&self.pair.src, &src_ds, "all")?
        } else {
            Vec::new()
        };

        self.execute_plan(
            &plan,
            &src_snaps,
            &dst_snaps,
            dst_exists,
            simulated_resolution,
            &src_ds,
            &dst_ds,
            &src_props,
        )?;

        if !ctx.dry_run() {
            let assignments = ctx.prop_policy.set_args(&src_props);
            self.catalog
                .set_properties(&self.pair.dst, &dst_ds, &assignments)?;
        }
        Ok(Outcome::Replicated {
            steps: plan.steps.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_plan(
        &self,
        plan: &Plan,
        src_snaps: &[Snapshot],
        dst_snaps: &[Snapshot],
        dst_exists: bool,
        simulated_resolution: bool,
        src_ds: &str,
        dst_ds: &str,
        src_props: &[Property],
    ) -> Result<()> {
        let ctx = self.ctx;
        let taken = PropertyPolicy::names_in_raw_opts(&ctx.args.recv_opts());
        // what is really on the destination vs what the plan materialises
        let on_dst: HashSet<u64> = dst_snaps.iter().map(|s| s.guid).collect();
        let mut materialised = on_dst.clone();
        let dst_had_snapshots = !dst_snaps.is_empty();

        for step in &plan.steps {
            let site = match step.kind {
                StepKind::Full => SITE_FULL_SEND,
                _ => SITE_INCR_SEND,
            };
            ctx.faults.check(site)?;

            if let Some(from) = &step.from {
                if !materialised.contains(&from.guid()) {
                    return Err(Error::Invariant(format!(
                        "step {step} for {dst_ds} starts from {} which is not on the destination",
                        from.suffix()
                    )));
                }
            }

            // a dry-run rollback or wipe never happened, so no step after
            // it can be exercised against the real destination
            let runnable = !simulated_resolution
                && match ctx.args.dryrun {
                    Some(DryRunMode::Send) => false,
                    // without finalised receives, later steps have no base
                    // to land on; exercise only those grounded in real state
                    Some(DryRunMode::Recv) => match &step.from {
                        None => !dst_had_snapshots,
                        Some(from) => on_dst.contains(&from.guid()),
                    },
                    None => true,
                };
            if runnable {
                self.execute_step(step, dst_exists, dst_had_snapshots, src_ds, dst_ds, src_props, &taken)?;
            } else {
                info!("dry-run: would run {step} for {src_ds} -> {dst_ds}");
            }

            // track materialised GUIDs for the from-presence invariant
            match step.kind {
                StepKind::IncrementalInclusive => {
                    let from = step.from.as_ref().expect("inclusive steps have a base");
                    let from_pos = src_snaps
                        .iter()
                        .position(|s| s.guid == from.guid())
                        .expect("inclusive base is a source snapshot");
                    let to_pos = src_snaps
                        .iter()
                        .position(|s| s.guid == step.to_guid)
                        .expect("step target is a source snapshot");
                    for s in &src_snaps[from_pos + 1..=to_pos] {
                        materialised.insert(s.guid);
                    }
                }
                _ => {
                    materialised.insert(step.to_guid);
                }
            }

            if !ctx.args.no_create_bookmark && !ctx.dry_run() {
                self.catalog
                    .create_bookmark(&self.pair.src, src_ds, &step.to_tag, step.to_guid)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_step(
        &self,
        step: &SendStep,
        dst_exists: bool,
        dst_had_snapshots: bool,
        src_ds: &str,
        dst_ds: &str,
        src_props: &[Property],
        taken: &HashSet<String>,
    ) -> Result<()> {
        let ctx = self.ctx;
        let is_full = step.kind == StepKind::Full;

        let mut send_args: Vec<String> = ctx.args.send_opts();
        match (&step.kind, &step.from) {
            (StepKind::Full, _) => {}
            (StepKind::IncrementalInclusive, Some(from)) => {
                send_args.push("-I".to_string());
                send_args.push(from.suffix());
            }
            (_, Some(from)) => {
                send_args.push("-i".to_string());
                send_args.push(from.suffix());
            }
            (_, None) => {
                return Err(Error::Invariant(format!(
                    "incremental step {step} has no base mark"
                )));
            }
        }
        send_args.push(format!("{src_ds}@{}", step.to_tag));

        let est_size = self
            .catalog
            .estimate_send_size(&self.pair.src, &send_args)?;

        let mut send = Cmd::new(&self.pair.src, true, ctx.args.zfs_program.clone());
        send.arg("send");
        send.args(send_args);

        let mut recv_args = ctx.args.recv_opts();
        if ctx.args.dryrun == Some(DryRunMode::Recv) {
            recv_args.push("-n".to_string());
        }
        // a full stream may land on a pre-created dataset as long as no
        // snapshot is lost in the rollback
        if is_full && dst_exists && !dst_had_snapshots {
            recv_args.push("-F".to_string());
        }
        recv_args.extend(ctx.prop_policy.recv_flags(src_props, is_full, taken));
        let mut recv = Cmd::new(&self.pair.dst, true, ctx.args.zfs_program.clone());
        recv.arg("receive");
        recv.args(recv_args);
        recv.arg(dst_ds);

        info!(
            "{step}: {src_ds} -> {dst_ds} (~{})",
            ReadableBytes(est_size)
        );
        Pipeline::build(ctx, self.pair, send, recv, dst_ds, est_size)?.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::faults::FaultRegistry;
    use crate::repl::zfs::Creation;
    use std::cell::Cell;

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

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            min_sleep: Duration::ZERO,
            max_sleep: Duration::ZERO,
        }
    }

    #[test]
    fn destination_in_sync_proceeds() {
        let dst = snaps(&[("t1", 1), ("t2", 2)]);
        let marks: HashSet<u64> = [1, 2, 3].into();
        assert_eq!(assess_destination(&marks, &dst), Resolution::Proceed);
        assert_eq!(assess_destination(&marks, &[]), Resolution::Proceed);
    }

    #[test]
    fn destination_ahead_rolls_back_to_last_common() {
        // destination has t1..t8, but its t7 is a different guid than the
        // source's; the last common snapshot is t6
        let mut dst = snaps(&[
            ("t1", 1),
            ("t2", 2),
            ("t3", 3),
            ("t4", 4),
            ("t5", 5),
            ("t6", 6),
            ("t7", 907),
            ("t8", 908),
        ]);
        let marks: HashSet<u64> = (1..=7).collect();
        assert_eq!(
            assess_destination(&marks, &dst),
            Resolution::RollbackTo { tag: "t6".into() }
        );
        // same names, all-foreign guids: only a wipe reconciles
        for s in &mut dst {
            s.guid += 1000;
        }
        assert_eq!(assess_destination(&marks, &dst), Resolution::WipeRequired);
    }

    #[test]
    fn retries_stop_on_permanent_failures() {
        let calls = Cell::new(0u32);
        let result: Result<()> = run_with_retries(&fast_policy(5), "test", || {
            calls.set(calls.get() + 1);
            Err(Error::usage("nope"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_cover_exactly_the_injected_failures() {
        // two injected failures at each of three sites need six retries
        for (retries, expect_ok) in [(6, true), (5, false)] {
            let faults = FaultRegistry::new();
            faults.inject_error(SITE_LIST_DST, 2);
            faults.inject_error(SITE_FULL_SEND, 2);
            faults.inject_error(SITE_INCR_SEND, 2);
            let result = run_with_retries(&fast_policy(retries), "test", || {
                faults.check(SITE_LIST_DST)?;
                faults.check(SITE_FULL_SEND)?;
                faults.check(SITE_INCR_SEND)?;
                Ok(())
            });
            assert_eq!(result.is_ok(), expect_ok, "retries={retries}");
        }
    }

    #[test]
    fn successful_attempt_needs_no_retry_budget() {
        let result = run_with_retries(&fast_policy(0), "test", || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }
}
