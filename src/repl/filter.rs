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

use crate::repl::error::{Error, Result};
use regex_lite::Regex;

/// Rewrites a user-supplied pattern so capturing groups become
/// non-capturing. Single forward scan: backslash escapes are honoured and
/// `(?…` constructs (named groups, lookaround, flags) are left untouched.
pub fn uncapture(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '(' if chars.peek() != Some(&'?') => out.push_str("(?:"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug)]
enum Matcher {
    /// The empty pattern matches nothing.
    Never,
    /// Full-match regex over the tag or relative path.
    Regex { re: Regex, invert: bool },
    /// Literal dataset name, matching the named dataset and its subtree.
    Subtree { name: String, invert: bool },
}

impl Matcher {
    fn regex(pattern: &str) -> Result<Self> {
        let (pattern, invert) = match pattern.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (pattern, false),
        };
        if pattern.is_empty() {
            return Ok(Matcher::Never);
        }
        let anchored = format!("^(?:{})$", uncapture(pattern));
        let re = Regex::new(&anchored)
            .map_err(|e| Error::usage(format!("invalid regex {pattern:?}: {e}")))?;
        Ok(Matcher::Regex { re, invert })
    }

    fn subtree(name: &str) -> Self {
        let (name, invert) = match name.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        if name.is_empty() {
            Matcher::Never
        } else {
            Matcher::Subtree {
                name: name.to_string(),
                invert,
            }
        }
    }

    fn matches(&self, s: &str) -> bool {
        match self {
            Matcher::Never => false,
            Matcher::Regex { re, invert } => re.is_match(s) != *invert,
            Matcher::Subtree { name, invert } => {
                let hit = s == name || s.strip_prefix(name.as_str()).is_some_and(|r| r.starts_with('/'));
                hit != *invert
            }
        }
    }
}

#[derive(Debug)]
enum Verdict {
    Include,
    Exclude,
}

/// An ordered include/exclude rule list: the last matching rule wins. When
/// no rule matches, the default is exclude if any include rule exists and
/// include otherwise.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<(Verdict, Matcher)>,
    has_include: bool,
}

impl RuleSet {
    fn admits(&self, s: &str) -> bool {
        let mut verdict = !self.has_include;
        for (kind, matcher) in &self.rules {
            if matcher.matches(s) {
                verdict = matches!(kind, Verdict::Include);
            }
        }
        verdict
    }
}

/// Compiled --include/--exclude-snapshot-regex rules, applied to snapshot
/// tags only.
#[derive(Debug)]
pub struct SnapshotFilter {
    rules: RuleSet,
}

impl SnapshotFilter {
    pub fn compile(includes: &[String], excludes: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(includes.len() + excludes.len());
        for p in includes {
            rules.push((Verdict::Include, Matcher::regex(p)?));
        }
        for p in excludes {
            rules.push((Verdict::Exclude, Matcher::regex(p)?));
        }
        Ok(Self {
            rules: RuleSet {
                has_include: !includes.is_empty(),
                rules,
            },
        })
    }

    pub fn admits(&self, tag: &str) -> bool {
        self.rules.admits(tag)
    }
}

/// Compiled dataset rules, applied to paths relative to the pair's root.
/// Literal rules admit or prune whole subtrees; regex rules match single
/// relative paths.
#[derive(Debug)]
pub struct DatasetFilter {
    rules: RuleSet,
}

impl DatasetFilter {
    pub fn compile(
        include_names: &[String],
        exclude_names: &[String],
        include_regexes: &[String],
        exclude_regexes: &[String],
    ) -> Result<Self> {
        let mut rules = Vec::new();
        for name in include_names {
            rules.push((Verdict::Include, Matcher::subtree(name)));
        }
        for p in include_regexes {
            rules.push((Verdict::Include, Matcher::regex(p)?));
        }
        for name in exclude_names {
            rules.push((Verdict::Exclude, Matcher::subtree(name)));
        }
        for p in exclude_regexes {
            rules.push((Verdict::Exclude, Matcher::regex(p)?));
        }
        let has_include = !include_names.is_empty() || !include_regexes.is_empty();
        Ok(Self {
            rules: RuleSet { rules, has_include },
        })
    }

    pub fn admits(&self, rel: &str) -> bool {
        self.rules.admits(rel)
    }
}

/// Decision for --exclude-dataset-property. The property value may be
/// unset, a boolean, or a comma-separated list of hosts on which the
/// dataset should still be replicated.
pub fn property_excludes(value: Option<&str>, localhost: &str) -> bool {
    match value {
        None | Some("-") | Some("") | Some("true") => false,
        Some("false") => true,
        Some(hosts) => !hosts
            .split(',')
            .any(|h| h.trim() == localhost),
    }
}
