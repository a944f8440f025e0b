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
use std::fmt::Display;

/// A validated (user, host, dataset path) triple. Empty user/host mean the
/// dataset lives on the local machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub user: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

/// Finds a `:` host separator before the first `/`. A colon after a slash
/// is part of the dataset name, not a host separator.
fn split_host_at_colon(word: &str) -> Option<(&str, &str)> {
    let first_component = word.split('/').next().unwrap_or(word);
    let colon = first_component.find(':')?;
    Some((&word[..colon], &word[colon + 1..]))
}

/// ZFS dataset name components: alphanumerics plus `_ - . : %` and space.
fn invalid_dataset_char(c: char) -> bool {
    !(c.is_ascii_alphanumeric()
        || c == '-'
        || c == '_'
        || c == '.'
        || c == ':'
        || c == '%'
        || c == ' '
        || c == '/')
}

fn invalid_host_char(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '@')
}

impl Locator {
    /// Parses `[user@host:]pool/dataset`. Explicit `user_override` and
    /// `host_override` (from --ssh-*-user/--ssh-*-host) win over anything
    /// embedded in the word; an empty override forces "local".
    pub fn parse(
        word: &str,
        user_override: Option<&str>,
        host_override: Option<&str>,
    ) -> Result<Self> {
        // a non-empty override claims the whole word as the path; an empty
        // override still strips an embedded host but pins the side local
        let (embedded_host, path) = match host_override {
            Some("") | None => match split_host_at_colon(word) {
                Some((host, path)) => (Some(host), path),
                None => (None, word),
            },
            Some(_) => (None, word),
        };

        let host_spec = match host_override {
            Some("") => None,
            Some(h) => Some(h),
            None => embedded_host,
        };
        let (mut user, host) = match host_spec {
            None => (None, None),
            Some(spec) => match spec.split_once('@') {
                Some((user, host)) => (Some(user.to_string()), Some(host.to_string())),
                None => (None, Some(spec.to_string())),
            },
        };
        if let Some(u) = user_override {
            user = if u.is_empty() { None } else { Some(u.to_string()) };
        }

        if let Some(h) = host.as_deref() {
            if h.is_empty() || h.contains(invalid_host_char) {
                return Err(Error::usage(format!("invalid host name in {word:?}")));
            }
        }
        if let Some(u) = user.as_deref() {
            if u.contains(invalid_host_char) || u.contains('@') {
                return Err(Error::usage(format!("invalid user name in {word:?}")));
            }
        }
        Self::validate_path(path)?;

        Ok(Self {
            user,
            host,
            path: path.to_string(),
        })
    }

    pub fn validate_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::usage("dataset name must not be empty"));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(Error::usage(format!(
                "dataset name {path:?} must not begin or end with a slash"
            )));
        }
        if path.contains("//") {
            return Err(Error::usage(format!(
                "dataset name {path:?} contains an empty component"
            )));
        }
        if let Some(c) = path.chars().find(|c| invalid_dataset_char(*c)) {
            return Err(Error::usage(format!(
                "dataset name {path:?} contains forbidden character {c:?}"
            )));
        }
        Ok(())
    }

    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    /// The `user@host` ssh destination, or None for a local dataset.
    pub fn ssh_dest(&self) -> Option<String> {
        self.host.as_deref().map(|host| match self.user.as_deref() {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        })
    }

    /// Key identifying the executing side for caches and connection reuse.
    pub fn host_key(&self) -> String {
        self.ssh_dest().unwrap_or_default()
    }

    pub fn pool(&self) -> &str {
        self.path.split('/').next().unwrap_or(&self.path)
    }

    /// Path of `descendant` relative to this locator's path: `Some("")` for
    /// the root itself, `Some("a/b")` for a descendant, None for anything
    /// outside the tree.
    pub fn relative_of<'a>(&self, descendant: &'a str) -> Option<&'a str> {
        if descendant == self.path {
            Some("")
        } else {
            descendant
                .strip_prefix(&self.path)
                .and_then(|rest| rest.strip_prefix('/'))
        }
    }

    /// The counterpart of a source-relative path under this (destination)
    /// root.
    pub fn join(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.path.clone()
        } else {
            format!("{}/{rel}", self.path)
        }
    }

    pub fn with_path(&self, path: String) -> Self {
        Self {
            user: self.user.clone(),
            host: self.host.clone(),
            path,
        }
    }

    /// Two locators overlap when they are on the same host and one path is
    /// the other or an ancestor of the other. Replicating between
    /// overlapping trees would read and write the same datasets.
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.host_key() != other.host_key() {
            return false;
        }
        self.path == other.path
            || self.path.starts_with(&format!("{}/", other.path))
            || other.path.starts_with(&format!("{}/", self.path))
    }
}

impl Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(dest) = self.ssh_dest() {
            write!(f, "{dest}:")?;
        }
        write!(f, "{}", self.path)
    }
}
