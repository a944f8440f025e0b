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

use std::fmt::Display;

pub struct ReadableBytes(pub u64);

impl From<u64> for ReadableBytes {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for ReadableBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const KB: u64 = 1024;
        const MB: u64 = 1024 * KB;
        const GB: u64 = 1024 * MB;

        if self.0 == 0 {
            write!(f, "UNKNOWN")?;
        } else if self.0 >= GB {
            let gb = self.0 as f64 / GB as f64;
            write!(f, "{gb:.1} GiB")?;
        } else if self.0 >= MB {
            let mb = self.0 as f64 / MB as f64;
            write!(f, "{mb:.1} MiB")?;
        } else {
            let kb = self.0 / KB;
            write!(f, "{} KiB", kb)?;
        }
        Ok(())
    }
}

/// Keeps the last `limit` bytes of a stderr capture, on a char boundary, so
/// error reports stay bounded no matter how chatty the child was.
pub fn tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_bytes() {
        assert_eq!(ReadableBytes(0).to_string(), "UNKNOWN");
        assert_eq!(ReadableBytes(512).to_string(), "0 KiB");
        assert_eq!(ReadableBytes(4096).to_string(), "4 KiB");
        assert_eq!(ReadableBytes(3 * 1024 * 1024).to_string(), "3.0 MiB");
        assert_eq!(ReadableBytes(5 * 1024 * 1024 * 1024).to_string(), "5.0 GiB");
    }

    #[test]
    fn tail_is_bounded_and_boundary_safe() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello world", 5), "world");
        // multi-byte char straddling the cut is dropped, not split
        let s = "aé";
        assert_eq!(tail(s, 1), "");
        assert_eq!(tail(s, 2), "é");
    }
}
