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

use regex_lite::Regex;
use std::io;

/// The local hostname, as consulted by host-list property values. Errors
/// on names the kernel could not fit or that are not UTF-8.
pub fn hostname() -> io::Result<String> {
    // one past _POSIX_HOST_NAME_MAX, enough on Linux and the BSDs
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // a missing terminator means the name was truncated, which the libc is
    // not required to report
    let len = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| io::Error::other("gethostname returned an unterminated name"))?;
    buf.truncate(len);
    String::from_utf8(buf).map_err(|e| io::Error::other(format!("hostname is not utf-8: {e}")))
}

pub fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

/// Environment variables that never survive into child invocations, on top
/// of whatever --exclude-envvar-regex names.
const BASELINE_ENV_EXCLUDES: [&str; 2] = ["LD_.*", "IFS"];

/// The (name, value) pairs that remain after applying the baseline and
/// user-supplied exclusion regexes. Non-UTF-8 entries are dropped.
pub fn retained_env(exclude: &[Regex]) -> Vec<(String, String)> {
    let baseline: Vec<Regex> = BASELINE_ENV_EXCLUDES
        .iter()
        .map(|p| Regex::new(&format!("^(?:{p})$")).expect("baseline env patterns are valid"))
        .collect();
    std::env::vars()
        .filter(|(name, _)| {
            !baseline.iter().any(|re| re.is_match(name))
                && !exclude.iter().any(|re| re.is_match(name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_nonempty() {
        let h = hostname().unwrap();
        assert!(!h.is_empty());
    }

    #[test]
    fn env_exclusion() {
        // SAFETY: test-only env mutation, no concurrent readers of these keys
        unsafe {
            std::env::set_var("ZMIRROR_TEST_KEEP", "1");
            std::env::set_var("ZMIRROR_TEST_DROP", "1");
        }
        let re = Regex::new("^ZMIRROR_TEST_DROP$").unwrap();
        let kept = retained_env(&[re]);
        assert!(kept.iter().any(|(n, _)| n == "ZMIRROR_TEST_KEEP"));
        assert!(!kept.iter().any(|(n, _)| n == "ZMIRROR_TEST_DROP"));
    }
}
