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

//! The step planner. Pure: given both sides' marks and the snapshot filter
//! verdicts, produce the minimal ordered list of send steps whose execution
//! makes the destination's included snapshot set equal the source's.

use crate::repl::zfs::{Bookmark, Mark, Snapshot};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// Recreates the dataset from empty up to `to`. Only legal on an absent
    /// destination.
    Full,
    /// `zfs send -I`: materialises every source snapshot strictly between
    /// `from` and `to`, plus `to`. Requires every one of them to be
    /// included, and a snapshot anchor.
    IncrementalInclusive,
    /// `zfs send -i`: materialises only `to`.
    IncrementalExclusive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendStep {
    pub kind: StepKind,
    /// Absent exactly for Full steps.
    pub from: Option<Mark>,
    pub to_tag: String,
    pub to_guid: u64,
}

impl SendStep {
    fn full(to: &Snapshot) -> Self {
        SendStep {
            kind: StepKind::Full,
            from: None,
            to_tag: to.tag.clone(),
            to_guid: to.guid,
        }
    }

    fn incremental(kind: StepKind, from: Mark, to: &Snapshot) -> Self {
        SendStep {
            kind,
            from: Some(from),
            to_tag: to.tag.clone(),
            to_guid: to.guid,
        }
    }
}

impl std::fmt::Display for SendStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.from) {
            (StepKind::Full, _) => write!(f, "full send of @{}", self.to_tag),
            (StepKind::IncrementalInclusive, Some(from)) => {
                write!(f, "incremental send -I {} @{}", from.suffix(), self.to_tag)
            }
            (_, Some(from)) => {
                write!(f, "incremental send -i {} @{}", from.suffix(), self.to_tag)
            }
            (_, None) => write!(f, "incremental send to @{}", self.to_tag),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<SendStep>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlanOptions {
    /// Consult source bookmarks when no common snapshot exists
    /// (--no-use-bookmark clears this).
    pub use_bookmark: bool,
    /// Forbid the inclusive form even where available; one exclusive step
    /// per included snapshot instead.
    pub force_exclusive: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            use_bookmark: true,
            force_exclusive: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The destination has snapshots but shares no mark with the source.
    #[error("no common snapshot or bookmark between source and destination")]
    NoCommonAncestor,
}

/// Computes the plan for one dataset pair.
///
/// `src` is the full ordered source snapshot list; `included[i]` is the
/// snapshot filter's verdict for `src[i]`. `dst` is the ordered destination
/// snapshot list. The caller has already resolved destination-ahead
/// conflicts; destination snapshots newer than the latest common mark make
/// the affected incremental receives fail rather than silently diverge.
pub fn plan_steps(
    src: &[Snapshot],
    included: &[bool],
    bookmarks: &[Bookmark],
    dst: &[Snapshot],
    opts: PlanOptions,
) -> Result<Plan, PlanError> {
    assert_eq!(src.len(), included.len());
    let mut steps = Vec::new();
    if !included.contains(&true) {
        // nothing to replicate; destination cleanup is the reconciler's job
        return Ok(Plan { steps });
    }
    let dst_guids: HashSet<u64> = dst.iter().map(|s| s.guid).collect();

    // Anchor state while walking the source tail: the mark the next
    // incremental step starts from, and its position in `src` when the
    // anchor is itself a source snapshot.
    let anchor: Mark;
    let mut anchor_pos: Option<usize>;
    let start: usize;

    if let Some(idx) = src.iter().rposition(|s| dst_guids.contains(&s.guid)) {
        anchor = Mark::from(&src[idx]);
        anchor_pos = Some(idx);
        start = idx + 1;
    } else if let Some(bm) = latest_common_bookmark(bookmarks, &dst_guids, opts.use_bookmark) {
        // resume after the bookmarked point in history
        start = src.partition_point(|s| s.creation <= bm.creation);
        anchor = Mark::from(bm);
        anchor_pos = None;
    } else if dst.is_empty() {
        let first = included.iter().position(|i| *i).expect("included is non-empty");
        steps.push(SendStep::full(&src[first]));
        anchor = Mark::from(&src[first]);
        anchor_pos = Some(first);
        start = first + 1;
    } else {
        return Err(PlanError::NoCommonAncestor);
    }

    let mut anchor = anchor;
    let mut i = start;
    while i < src.len() {
        if !included[i] {
            i += 1;
            continue;
        }
        // maximal contiguous included run src[i..=j]
        let mut j = i;
        while j + 1 < src.len() && included[j + 1] {
            j += 1;
        }
        // A gap of excluded snapshots (or a bookmark anchor, which cannot
        // carry intermediates forward) forces an exclusive hop onto the
        // run's first snapshot.
        let contiguous = anchor_pos.is_some_and(|p| i == p + 1);
        let run_start = if !contiguous || opts.force_exclusive {
            steps.push(SendStep::incremental(
                StepKind::IncrementalExclusive,
                anchor.clone(),
                &src[i],
            ));
            anchor = Mark::from(&src[i]);
            i + 1
        } else {
            i
        };
        if run_start <= j {
            if opts.force_exclusive {
                for k in run_start..=j {
                    steps.push(SendStep::incremental(
                        StepKind::IncrementalExclusive,
                        anchor.clone(),
                        &src[k],
                    ));
                    anchor = Mark::from(&src[k]);
                }
            } else {
                steps.push(SendStep::incremental(
                    StepKind::IncrementalInclusive,
                    anchor.clone(),
                    &src[j],
                ));
                anchor = Mark::from(&src[j]);
            }
        }
        anchor_pos = Some(j);
        i = j + 1;
    }
    Ok(Plan { steps })
}

fn latest_common_bookmark<'a>(
    bookmarks: &'a [Bookmark],
    dst_guids: &HashSet<u64>,
    use_bookmark: bool,
) -> Option<&'a Bookmark> {
    if !use_bookmark {
        return None;
    }
    bookmarks
        .iter()
        .filter(|b| dst_guids.contains(&b.guid))
        .max_by_key(|b| b.creation)
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

    fn bookmark(src: &[Snapshot], tag: &str) -> Bookmark {
        let s = src.iter().find(|s| s.tag == tag).unwrap();
        Bookmark {
            guid: s.guid,
            tag: s.tag.clone(),
            creation: s.creation,
        }
    }

    /// Applies the plan to a simulated destination and returns the
    /// materialised GUIDs in arrival order. Panics where a real receive
    /// would fail, e.g. an incremental step whose `from` is absent.
    fn replay(src: &[Snapshot], plan: &Plan, dst: &[Snapshot]) -> Vec<u64> {
        let mut have: Vec<u64> = dst.iter().map(|s| s.guid).collect();
        let pos = |guid: u64| src.iter().position(|s| s.guid == guid);
        for step in &plan.steps {
            match step.kind {
                StepKind::Full => {
                    assert!(have.is_empty(), "full send onto non-empty destination");
                    have.push(step.to_guid);
                }
                StepKind::IncrementalExclusive => {
                    let from = step.from.as_ref().unwrap();
                    assert!(have.contains(&from.guid()), "missing incremental base");
                    have.push(step.to_guid);
                }
                StepKind::IncrementalInclusive => {
                    let from = step.from.as_ref().unwrap();
                    assert!(!from.is_bookmark(), "bookmarks cannot head -I sends");
                    assert!(have.contains(&from.guid()), "missing incremental base");
                    let from_pos = pos(from.guid()).unwrap();
                    let to_pos = pos(step.to_guid).unwrap();
                    for s in &src[from_pos + 1..=to_pos] {
                        have.push(s.guid);
                    }
                }
            }
        }
        have
    }

    fn included_guids(src: &[Snapshot], included: &[bool]) -> Vec<u64> {
        src.iter()
            .zip(included)
            .filter(|(_, inc)| **inc)
            .map(|(s, _)| s.guid)
            .collect()
    }

    #[test]
    fn full_then_inclusive_tail_on_empty_destination() {
        let src = snaps(&[("s1", 1), ("s2", 2), ("s3", 3)]);
        let plan = plan_steps(&src, &[true; 3], &[], &[], PlanOptions::default()).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].kind, StepKind::Full);
        assert_eq!(plan.steps[0].to_tag, "s1");
        assert_eq!(plan.steps[1].kind, StepKind::IncrementalInclusive);
        assert_eq!(plan.steps[1].from.as_ref().unwrap().suffix(), "@s1");
        assert_eq!(plan.steps[1].to_tag, "s3");
        assert_eq!(replay(&src, &plan, &[]), vec![1, 2, 3]);
    }

    #[test]
    fn excluded_gap_forces_exclusive_hops() {
        // spec scenario: [d1, h1, d2, d3, d4] with hourlies excluded
        let src = snaps(&[("d1", 1), ("h1", 2), ("d2", 3), ("d3", 4), ("d4", 5)]);
        let included = [true, false, true, true, true];
        let plan = plan_steps(&src, &included, &[], &[], PlanOptions::default()).unwrap();
        assert_eq!(plan.steps[0].kind, StepKind::Full);
        assert_eq!(plan.steps[0].to_tag, "d1");
        assert_eq!(plan.steps[1].kind, StepKind::IncrementalExclusive);
        assert_eq!(plan.steps[1].to_tag, "d2");
        assert_eq!(plan.steps[2].kind, StepKind::IncrementalInclusive);
        assert_eq!(plan.steps[2].to_tag, "d4");
        assert_eq!(plan.steps.len(), 3);
        // h1 never reaches the destination
        assert_eq!(replay(&src, &plan, &[]), included_guids(&src, &included));
    }

    #[test]
    fn resumes_from_latest_common_snapshot() {
        let src = snaps(&[("s1", 1), ("s2", 2), ("s3", 3), ("s4", 4)]);
        let dst = snaps(&[("s1", 1), ("s2", 2)]);
        let plan = plan_steps(&src, &[true; 4], &[], &dst, PlanOptions::default()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].kind, StepKind::IncrementalInclusive);
        assert_eq!(plan.steps[0].from.as_ref().unwrap().suffix(), "@s2");
        assert_eq!(plan.steps[0].to_tag, "s4");
    }

    #[test]
    fn common_identity_is_guid_not_name() {
        let src = snaps(&[("s1", 1), ("s2", 2)]);
        // same names, different history
        let dst = snaps(&[("s1", 91), ("s2", 92)]);
        let err = plan_steps(&src, &[true; 2], &[], &dst, PlanOptions::default()).unwrap_err();
        assert_eq!(err, PlanError::NoCommonAncestor);
    }

    #[test]
    fn bookmark_covers_deleted_history() {
        // spec scenario: source snapshots gone, bookmark d1 remains,
        // destination still has d1; a new d2 appears on the source
        let history = snaps(&[("d1", 1), ("d2", 2)]);
        let src = vec![history[1].clone()];
        let dst = vec![history[0].clone()];
        let bm = bookmark(&history, "d1");
        let plan =
            plan_steps(&src, &[true], &[bm], &dst, PlanOptions::default()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].kind, StepKind::IncrementalExclusive);
        assert_eq!(plan.steps[0].from.as_ref().unwrap().suffix(), "#d1");
        assert_eq!(plan.steps[0].to_tag, "d2");
    }

    #[test]
    fn bookmark_anchor_never_heads_an_inclusive_step() {
        let history = snaps(&[("s1", 1), ("s2", 2), ("s3", 3), ("s4", 4)]);
        let src = history[1..].to_vec();
        let dst = vec![history[0].clone()];
        let bm = bookmark(&history, "s1");
        let plan =
            plan_steps(&src, &[true; 3], &[bm], &dst, PlanOptions::default()).unwrap();
        // first hop -i #s1 s2, then -I s2 s4
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].kind, StepKind::IncrementalExclusive);
        assert_eq!(plan.steps[0].from.as_ref().unwrap().suffix(), "#s1");
        assert_eq!(plan.steps[0].to_tag, "s2");
        assert_eq!(plan.steps[1].kind, StepKind::IncrementalInclusive);
        assert_eq!(plan.steps[1].from.as_ref().unwrap().suffix(), "@s2");
        assert_eq!(plan.steps[1].to_tag, "s4");
        assert_eq!(replay(&src, &plan, &dst), vec![1, 2, 3, 4]);
    }

    #[test]
    fn ignoring_bookmarks_makes_the_gap_a_divergence() {
        let history = snaps(&[("s1", 1), ("s2", 2)]);
        let src = vec![history[1].clone()];
        let dst = vec![history[0].clone()];
        let bm = bookmark(&history, "s1");
        let opts = PlanOptions {
            use_bookmark: false,
            ..PlanOptions::default()
        };
        let err = plan_steps(&src, &[true], &[bm], &dst, opts).unwrap_err();
        assert_eq!(err, PlanError::NoCommonAncestor);
    }

    #[test]
    fn up_to_date_is_an_empty_plan() {
        let src = snaps(&[("s1", 1), ("s2", 2)]);
        let plan = plan_steps(&src, &[true; 2], &[], &src.clone(), PlanOptions::default()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn empty_included_set_is_an_empty_plan() {
        let src = snaps(&[("h1", 1), ("h2", 2)]);
        let plan = plan_steps(&src, &[false; 2], &[], &[], PlanOptions::default()).unwrap();
        assert!(plan.is_empty());
        // also with a non-empty, even unrelated, destination
        let dst = snaps(&[("x", 9)]);
        let plan = plan_steps(&src, &[false; 2], &[], &dst, PlanOptions::default()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn trailing_excluded_snapshots_emit_no_steps() {
        let src = snaps(&[("s1", 1), ("s2", 2), ("h9", 3)]);
        let included = [true, true, false];
        let dst = snaps(&[("s1", 1)]);
        let plan = plan_steps(&src, &included, &[], &dst, PlanOptions::default()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].to_tag, "s2");
    }

    #[test]
    fn force_exclusive_splits_runs() {
        let src = snaps(&[("s1", 1), ("s2", 2), ("s3", 3)]);
        let dst = snaps(&[("s1", 1)]);
        let opts = PlanOptions {
            force_exclusive: true,
            ..PlanOptions::default()
        };
        let plan = plan_steps(&src, &[true; 3], &[], &dst, opts).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.kind == StepKind::IncrementalExclusive));
        assert_eq!(plan.steps[0].to_tag, "s2");
        assert_eq!(plan.steps[1].to_tag, "s3");
        assert_eq!(replay(&src, &plan, &dst), vec![1, 2, 3]);
    }

    #[test]
    fn plans_are_deterministic() {
        let src = snaps(&[("a1", 1), ("b1", 2), ("a2", 3), ("b2", 4), ("a3", 5)]);
        let included = [true, false, true, false, true];
        let dst = snaps(&[("a1", 1)]);
        let p1 = plan_steps(&src, &included, &[], &dst, PlanOptions::default()).unwrap();
        let p2 = plan_steps(&src, &included, &[], &dst, PlanOptions::default()).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(replay(&src, &p1, &dst), included_guids(&src, &included));
    }

    #[test]
    fn replay_matches_included_set_on_a_mixed_history() {
        let src = snaps(&[
            ("d1", 1),
            ("h1", 2),
            ("h2", 3),
            ("d2", 4),
            ("d3", 5),
            ("h3", 6),
            ("d4", 7),
        ]);
        let included = [true, false, false, true, true, false, true];
        let plan = plan_steps(&src, &included, &[], &[], PlanOptions::default()).unwrap();
        assert_eq!(replay(&src, &plan, &[]), included_guids(&src, &included));
        // and the step count is minimal for this shape: full + hop + run + hop
        assert_eq!(plan.steps.len(), 4);
    }
}
