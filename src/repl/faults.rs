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
use std::cell::RefCell;
use std::collections::HashMap;

/// Deterministic fault injection, keyed by named trigger sites
/// (`zfs_list_snapshot_src`, `full_zfs_send`, …). Production code calls the
/// hooks unconditionally; with an empty registry they are no-ops. Tests
/// preload counters: each firing decrements its counter until exhausted.
///
/// Two trigger families: `error` sites raise a transient `Error::Injected`,
/// `delete` sites ask the caller to simulate a third-party dataset deletion
/// between two catalog observations.
#[derive(Debug, Default)]
pub struct FaultRegistry {
    error_before: RefCell<HashMap<String, u32>>,
    delete_before: RefCell<HashMap<String, u32>>,
}

impl FaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_error(&self, site: &str, count: u32) {
        self.error_before
            .borrow_mut()
            .insert(site.to_string(), count);
    }

    pub fn inject_delete(&self, site: &str, count: u32) {
        self.delete_before
            .borrow_mut()
            .insert(site.to_string(), count);
    }

    /// Called at the top of an instrumented operation. Raises while the
    /// site's counter is positive.
    pub fn check(&self, site: &str) -> Result<()> {
        let mut map = self.error_before.borrow_mut();
        if let Some(count) = map.get_mut(site) {
            if *count > 0 {
                *count -= 1;
                return Err(Error::Injected {
                    site: site.to_string(),
                });
            }
        }
        Ok(())
    }

    /// True when the caller should act as if a third party deleted the
    /// entity it is about to observe.
    pub fn fire_delete(&self, site: &str) -> bool {
        let mut map = self.delete_before.borrow_mut();
        if let Some(count) = map.get_mut(site) {
            if *count > 0 {
                *count -= 1;
                return true;
            }
        }
        false
    }

    /// Remaining error count for a site; lets tests assert how many
    /// injections were consumed.
    pub fn remaining(&self, site: &str) -> u32 {
        *self.error_before.borrow().get(site).unwrap_or(&0)
    }
}
