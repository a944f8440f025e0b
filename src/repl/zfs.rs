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

use std::cmp::Ordering;

/// Creation order of a snapshot or bookmark: the creation property is only
/// accurate to a second and snapshots within the same second are common, so
/// the pool's transaction group number breaks ties. Bookmarks inherit the
/// creation and txg of the snapshot they were made from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Creation {
    pub when: i64,
    pub txg: u64,
}

impl Creation {
    pub fn new(when: i64, txg: u64) -> Self {
        Self { when, txg }
    }
}

impl std::fmt::Display for Creation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match chrono::DateTime::from_timestamp(self.when, 0) {
            Some(when) => write!(f, "{}", when.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "epoch {}", self.when),
        }
    }
}

/// A snapshot as observed by the catalog. The GUID is the only trusted
/// identity: names may collide across sides without implying the snapshots
/// are replicas of each other.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub guid: u64,
    pub tag: String,
    pub creation: Creation,
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl Eq for Snapshot {}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.tag)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bookmark {
    pub guid: u64,
    pub tag: String,
    pub creation: Creation,
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.tag)
    }
}

/// Either a snapshot or a bookmark; the `from` side of an incremental send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mark {
    Snapshot { guid: u64, tag: String },
    Bookmark { guid: u64, tag: String },
}

impl Mark {
    pub fn guid(&self) -> u64 {
        match self {
            Mark::Snapshot { guid, .. } | Mark::Bookmark { guid, .. } => *guid,
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Mark::Snapshot { tag, .. } | Mark::Bookmark { tag, .. } => tag,
        }
    }

    pub fn is_bookmark(&self) -> bool {
        matches!(self, Mark::Bookmark { .. })
    }

    /// The `@tag` / `#tag` suffix appended to the dataset name on a zfs
    /// send command line.
    pub fn suffix(&self) -> String {
        match self {
            Mark::Snapshot { tag, .. } => format!("@{tag}"),
            Mark::Bookmark { tag, .. } => format!("#{tag}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mark::Snapshot { .. } => "snapshot",
            Mark::Bookmark { .. } => "bookmark",
        }
    }
}

impl From<&Snapshot> for Mark {
    fn from(s: &Snapshot) -> Self {
        Mark::Snapshot {
            guid: s.guid,
            tag: s.tag.clone(),
        }
    }
}

impl From<&Bookmark> for Mark {
    fn from(b: &Bookmark) -> Self {
        Mark::Bookmark {
            guid: b.guid,
            tag: b.tag.clone(),
        }
    }
}

/// Natural-order comparison of snapshot tags: the name is split at its first
/// run of decimal digits and that run compares numerically, so `s10` sorts
/// after `s2` and `d1.old` after `d1`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a_pre, a_num, a_rest) = natural_key(a);
    let (b_pre, b_num, b_rest) = natural_key(b);
    a_pre
        .cmp(b_pre)
        .then_with(|| match (a_num, b_num) {
            (Some(x), Some(y)) => x.cmp(&y),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        })
        .then_with(|| a_rest.cmp(b_rest))
}

fn natural_key(s: &str) -> (&str, Option<u128>, &str) {
    let Some(start) = s.find(|c: char| c.is_ascii_digit()) else {
        return (s, None, "");
    };
    let digits_len = s[start..]
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len() - start);
    let end = start + digits_len;
    // leading zeros are fine, overflow on absurd runs falls back to text order
    let num = s[start..end].parse::<u128>().ok();
    (&s[..start], num, &s[end..])
}

/// Sort order used for snapshot lists: creation time, then listing index,
/// ties broken by natural name order.
pub fn snapshot_order(a: &Snapshot, b: &Snapshot) -> Ordering {
    a.creation
        .cmp(&b.creation)
        .then_with(|| natural_cmp(&a.tag, &b.tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(guid: u64, tag: &str, when: i64, txg: u64) -> Snapshot {
        Snapshot {
            guid,
            tag: tag.to_string(),
            creation: Creation::new(when, txg),
        }
    }

    #[test]
    fn guid_is_the_identity() {
        let a = snap(42, "nightly", 100, 0);
        let b = snap(42, "renamed", 200, 7);
        let c = snap(43, "nightly", 100, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn natural_order_digits_compare_numerically() {
        assert_eq!(natural_cmp("s2", "s10"), Ordering::Less);
        assert_eq!(natural_cmp("s10", "s2"), Ordering::Greater);
        assert_eq!(natural_cmp("s2", "s2"), Ordering::Equal);
        assert_eq!(natural_cmp("s2b", "s2a"), Ordering::Greater);
        assert_eq!(natural_cmp("alpha", "beta"), Ordering::Less);
        // a bare prefix sorts before the same prefix with digits
        assert_eq!(natural_cmp("s", "s1"), Ordering::Less);
        assert_eq!(natural_cmp("s02", "s2"), Ordering::Equal);
    }

    #[test]
    fn creation_breaks_same_second_by_txg() {
        let a = snap(1, "b", 100, 40);
        let b = snap(2, "a", 100, 41);
        assert_eq!(snapshot_order(&a, &b), Ordering::Less);
    }

    #[test]
    fn creation_displays_as_utc() {
        let c = Creation::new(1700000000, 1);
        assert_eq!(c.to_string(), "2023-11-14 22:13:20");
    }

    #[test]
    fn same_creation_falls_back_to_natural_name() {
        let a = snap(1, "s10", 100, 0);
        let b = snap(2, "s9", 100, 0);
        assert_eq!(snapshot_order(&a, &b), Ordering::Greater);
    }

    #[test]
    fn mark_suffixes() {
        let s = snap(7, "d1", 1, 0);
        let m = Mark::from(&s);
        assert_eq!(m.suffix(), "@d1");
        assert!(!m.is_bookmark());
        let b = Bookmark {
            guid: 7,
            tag: "d1".into(),
            creation: Creation::new(1, 0),
        };
        let m = Mark::from(&b);
        assert_eq!(m.suffix(), "#d1");
        assert_eq!(m.kind(), "bookmark");
        assert_eq!(m.guid(), 7);
    }
}
