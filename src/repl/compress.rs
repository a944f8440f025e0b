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

/// Compress/decompress command pair for one pipeline stage.
#[derive(Clone, Copy, Debug)]
pub struct CompressSpec {
    pub name: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
    pub decompress_program: &'static str,
    pub decompress_args: &'static [&'static str],
}

const TABLE: [CompressSpec; 6] = [
    CompressSpec {
        name: "zstd",
        program: "zstd",
        args: &["-3", "-c"],
        decompress_program: "zstd",
        decompress_args: &["-dc"],
    },
    CompressSpec {
        name: "gzip",
        program: "gzip",
        args: &["-3", "-c"],
        decompress_program: "zcat",
        decompress_args: &[],
    },
    CompressSpec {
        name: "pigz",
        program: "pigz",
        args: &["-3", "-c"],
        decompress_program: "pigz",
        decompress_args: &["-dc"],
    },
    CompressSpec {
        name: "lz4",
        program: "lz4",
        args: &["-c"],
        decompress_program: "lz4",
        decompress_args: &["-dc"],
    },
    CompressSpec {
        name: "lzop",
        program: "lzop",
        args: &["-c"],
        decompress_program: "lzop",
        decompress_args: &["-dfc"],
    },
    CompressSpec {
        name: "xz",
        program: "xz",
        args: &["-c"],
        decompress_program: "xz",
        decompress_args: &["-dc"],
    },
];

/// Looks up the --compression-program value. `-` and `none` disable the
/// compression stage; an unknown name is reported to the caller.
pub fn lookup(name: &str) -> Result<Option<CompressSpec>, String> {
    if name == "-" || name == "none" {
        return Ok(None);
    }
    TABLE
        .iter()
        .find(|spec| spec.name == name)
        .copied()
        .map(Some)
        .ok_or_else(|| format!("unsupported compression program {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_formats_resolve() {
        let zstd = lookup("zstd").unwrap().unwrap();
        assert_eq!(zstd.program, "zstd");
        assert_eq!(zstd.decompress_args, &["-dc"]);
        assert!(lookup("gzip").unwrap().is_some());
    }

    #[test]
    fn disabled_and_unknown() {
        assert!(lookup("-").unwrap().is_none());
        assert!(lookup("none").unwrap().is_none());
        assert!(lookup("brotli").is_err());
    }
}
