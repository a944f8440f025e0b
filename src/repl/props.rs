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
use crate::repl::filter::uncapture;
use regex_lite::Regex;
use std::collections::HashSet;

/// One property observed on the source dataset.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub source: String,
}

/// Which receive kinds a property rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub full: bool,
    pub incremental: bool,
}

impl Targets {
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let mut t = Targets {
            full: false,
            incremental: false,
        };
        for word in s.split(',') {
            match word.trim() {
                "full" => t.full = true,
                "incremental" => t.incremental = true,
                other => return Err(format!("unknown receive target {other:?}")),
            }
        }
        Ok(t)
    }

    fn applies(&self, is_full: bool) -> bool {
        if is_full { self.full } else { self.incremental }
    }
}

impl Default for Targets {
    fn default() -> Self {
        // -o rules default to full receives only; -x rules to both
        Targets {
            full: true,
            incremental: false,
        }
    }
}

/// Include/exclude regex pair over property names, with the property
/// sources it honours. Inactive until an include regex is configured.
#[derive(Debug, Default)]
pub struct PropertyRuleSet {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    pub targets: Targets,
    pub sources: Vec<String>,
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{})$", uncapture(p)))
                .map_err(|e| Error::usage(format!("invalid property regex {p:?}: {e}")))
        })
        .collect()
}

impl PropertyRuleSet {
    pub fn compile(
        include: &[String],
        exclude: &[String],
        targets: Targets,
        sources: Vec<String>,
    ) -> Result<Self> {
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
            targets,
            sources,
        })
    }

    fn active(&self) -> bool {
        !self.include.is_empty()
    }

    fn admits(&self, prop: &Property) -> bool {
        self.source_matches(&prop.source)
            && self.include.iter().any(|re| re.is_match(&prop.name))
            && !self.exclude.iter().any(|re| re.is_match(&prop.name))
    }

    /// `zfs get` reports sources like `local`, `default`, `received` or
    /// `inherited from tank/a`.
    fn source_matches(&self, source: &str) -> bool {
        self.sources.iter().any(|s| {
            source == s || source.starts_with(&format!("{s} "))
        })
    }
}

/// The complete received-property policy: synthesized `-o`/`-x` receive
/// flags plus properties applied with `zfs set` after the receive.
#[derive(Debug, Default)]
pub struct PropertyPolicy {
    pub recv_o: PropertyRuleSet,
    pub recv_x: PropertyRuleSet,
    set_include: Vec<Regex>,
}

impl PropertyPolicy {
    pub fn new(recv_o: PropertyRuleSet, recv_x: PropertyRuleSet, set_include: &[String]) -> Result<Self> {
        Ok(Self {
            recv_o,
            recv_x,
            set_include: compile_all(set_include)?,
        })
    }

    pub fn wants_source_properties(&self) -> bool {
        self.recv_o.active() || self.recv_x.active() || !self.set_include.is_empty()
    }

    /// Synthesizes `-o name=value` and `-x name` receive flags for one step.
    /// `taken` carries property names already pinned by the raw
    /// --zfs-recv-program-opts; the first occurrence of a name wins and
    /// later rules never append a duplicate.
    pub fn recv_flags(
        &self,
        props: &[Property],
        is_full: bool,
        taken: &HashSet<String>,
    ) -> Vec<String> {
        let mut seen = taken.clone();
        let mut flags = Vec::new();
        if self.recv_o.active() && self.recv_o.targets.applies(is_full) {
            for prop in props {
                if self.recv_o.admits(prop) && seen.insert(prop.name.clone()) {
                    flags.push("-o".to_string());
                    flags.push(format!("{}={}", prop.name, prop.value));
                }
            }
        }
        if self.recv_x.active() && self.recv_x.targets.applies(is_full) {
            for prop in props {
                if self.recv_x.admits(prop) && seen.insert(prop.name.clone()) {
                    flags.push("-x".to_string());
                    flags.push(prop.name.clone());
                }
            }
        }
        flags
    }

    /// `name=value` arguments for a `zfs set` after the receive.
    pub fn set_args(&self, props: &[Property]) -> Vec<String> {
        props
            .iter()
            .filter(|p| self.set_include.iter().any(|re| re.is_match(&p.name)))
            .map(|p| format!("{}={}", p.name, p.value))
            .collect()
    }

    /// Property names pinned by `-o`/`-x` flags inside the raw receive
    /// options, so synthesized flags never collide with them.
    pub fn names_in_raw_opts(opts: &[String]) -> HashSet<String> {
        let mut names = HashSet::new();
        let mut iter = opts.iter().peekable();
        while let Some(opt) = iter.next() {
            if opt == "-o" || opt == "-x" {
                if let Some(value) = iter.next() {
                    let name = value.split('=').next().unwrap_or(value);
                    names.insert(name.to_string());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(name: &str, value: &str, source: &str) -> Property {
        Property {
            name: name.to_string(),
            value: value.to_string(),
            source: source.to_string(),
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn policy(
        o_include: &[&str],
        o_exclude: &[&str],
        x_include: &[&str],
        x_exclude: &[&str],
    ) -> PropertyPolicy {
        let recv_o = PropertyRuleSet::compile(
            &strings(o_include),
            &strings(o_exclude),
            Targets { full: true, incremental: true },
            vec!["local".to_string(), "inherited".to_string()],
        )
        .unwrap();
        let recv_x = PropertyRuleSet::compile(
            &strings(x_include),
            &strings(x_exclude),
            Targets { full: true, incremental: true },
            vec!["local".to_string()],
        )
        .unwrap();
        PropertyPolicy::new(recv_o, recv_x, &[]).unwrap()
    }

    #[test]
    fn inactive_without_include_rules() {
        let p = policy(&[], &[], &[], &[]);
        assert!(!p.wants_source_properties());
        let props = [prop("compression", "lz4", "local")];
        assert!(p.recv_flags(&props, true, &HashSet::new()).is_empty());
    }

    #[test]
    fn o_flags_follow_include_exclude_and_source() {
        let p = policy(&["site:.*"], &["site:secret"], &[], &[]);
        let props = [
            prop("site:p1", "v1", "local"),
            prop("site:p2", "v2", "inherited from tank"),
            prop("site:secret", "v3", "local"),
            prop("site:p4", "v4", "received"),
            prop("other", "v5", "local"),
        ];
        let flags = p.recv_flags(&props, true, &HashSet::new());
        assert_eq!(flags, vec!["-o", "site:p1=v1", "-o", "site:p2=v2"]);
    }

    #[test]
    fn duplicate_names_keep_the_first_occurrence() {
        let p = policy(&["site:.*"], &[], &[".*"], &[]);
        let props = [prop("site:p1", "v1", "local"), prop("mountpoint", "/x", "local")];
        // site:p1 is pinned by the raw recv opts and mountpoint by -o before
        // the -x pass sees it
        let taken = PropertyPolicy::names_in_raw_opts(&strings(&["-u", "-o", "site:p1=v0"]));
        let flags = p.recv_flags(&props, true, &taken);
        assert_eq!(flags, vec!["-o", "mountpoint=/x"]);
    }

    #[test]
    fn targets_gate_per_step_kind() {
        let recv_o = PropertyRuleSet::compile(
            &strings(&[".*"]),
            &[],
            Targets { full: true, incremental: false },
            vec!["local".to_string()],
        )
        .unwrap();
        let p = PropertyPolicy::new(recv_o, PropertyRuleSet::default(), &[]).unwrap();
        let props = [prop("a", "1", "local")];
        assert_eq!(p.recv_flags(&props, true, &HashSet::new()), vec!["-o", "a=1"]);
        assert!(p.recv_flags(&props, false, &HashSet::new()).is_empty());
    }

    #[test]
    fn set_args_are_independent_of_recv_rules() {
        let p = PropertyPolicy::new(
            PropertyRuleSet::default(),
            PropertyRuleSet::default(),
            &strings(&["site:.*"]),
        )
        .unwrap();
        assert!(p.wants_source_properties());
        let props = [prop("site:p1", "v1", "local"), prop("other", "v", "local")];
        assert_eq!(p.set_args(&props), vec!["site:p1=v1"]);
    }

    #[test]
    fn targets_parsing() {
        let t = Targets::parse("full").unwrap();
        assert!(t.full && !t.incremental);
        let t = Targets::parse("full,incremental").unwrap();
        assert!(t.full && t.incremental);
        assert!(Targets::parse("both").is_err());
    }
}
