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
use crate::repl::logcfg;
use bw::Bytes;
use clap::{Parser, ValueEnum};

pub mod bw;

/// The value that disables an external program override.
pub const DISABLED_PROGRAM: &str = "-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SkipMissing {
    /// Abort the run when a source dataset has no included snapshot.
    Fail,
    /// Skip the dataset and continue with its siblings.
    Dataset,
    /// Proceed without replicating; deletion modes still run.
    Continue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SkipOnError {
    /// Abort the whole run on the first dataset failure.
    Fail,
    /// Skip the failed dataset and continue.
    Dataset,
    /// Skip the failed dataset and all of its descendants.
    Tree,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DryRunMode {
    /// Report planned actions without running any send.
    Send,
    /// Run the pipeline into `zfs receive -n` so nothing is finalised.
    Recv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SyslogSockType {
    Udp,
    Tcp,
}

/// Replicates ZFS snapshots from a source dataset tree to a destination
/// tree, locally or over ssh, with filtering, bookmark-aware incremental
/// planning and optional destination pruning.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// SRC_DATASET DST_DATASET pairs (both may carry a user@host: prefix).
    /// A word starting with '+' names a file of TAB-separated pairs; '#'
    /// comment lines and blank lines are skipped.
    #[arg(value_name = "SRC_DATASET DST_DATASET", required = true, num_args = 1..)]
    pub datasets: Vec<String>,

    /// Also replicates descendant datasets
    #[arg(short, long)]
    pub recursive: bool,

    /// Skips the root of each pair, processing only descendants. Does
    /// nothing without --recursive.
    #[arg(long, requires = "recursive")]
    pub skip_parent: bool,

    /// Includes the named dataset (relative to the pair root) and its
    /// subtree. A '+FILE' value names a file of dataset names. Last
    /// matching rule wins.
    #[arg(long, value_name = "DATASET")]
    pub include_dataset: Vec<String>,

    /// Excludes the named dataset and its subtree. A '+FILE' value names a
    /// file of dataset names.
    #[arg(long, value_name = "DATASET")]
    pub exclude_dataset: Vec<String>,

    /// Includes datasets whose relative path matches the regex
    #[arg(long, value_name = "REGEX")]
    pub include_dataset_regex: Vec<String>,

    /// Excludes datasets whose relative path matches the regex
    #[arg(long, value_name = "REGEX")]
    pub exclude_dataset_regex: Vec<String>,

    /// Excludes datasets whose named property is "false", or names hosts
    /// the dataset should be replicated from
    #[arg(long, value_name = "PROPERTY")]
    pub exclude_dataset_property: Option<String>,

    /// Includes snapshots whose tag matches the regex. Last matching rule
    /// wins; with no include rule everything not excluded is included.
    #[arg(long, value_name = "REGEX")]
    pub include_snapshot_regex: Vec<String>,

    /// Excludes snapshots whose tag matches the regex
    #[arg(long, value_name = "REGEX")]
    pub exclude_snapshot_regex: Vec<String>,

    /// What to do when a source dataset has no snapshot matching the
    /// snapshot filters
    #[arg(long, value_enum, default_value_t = SkipMissing::Dataset, value_name = "MODE")]
    pub skip_missing_snapshots: SkipMissing,

    /// How dataset failures propagate
    #[arg(long, value_enum, default_value_t = SkipOnError::Dataset, value_name = "MODE")]
    pub skip_on_error: SkipOnError,

    /// Rolls back or wipes a diverged destination for every conflict in
    /// this run
    #[arg(long)]
    pub force: bool,

    /// Like --force, but consumed by the first conflict it resolves
    #[arg(long)]
    pub force_once: bool,

    /// Shorthand for --force-once
    #[arg(long = "f1")]
    pub f1: bool,

    /// Forcibly unmounts the destination when rolling back or destroying
    #[arg(long)]
    pub force_unmount: bool,

    /// Does not create a bookmark on the source after each transferred
    /// snapshot
    #[arg(long)]
    pub no_create_bookmark: bool,

    /// Does not consult source bookmarks when looking for a common ancestor
    #[arg(long)]
    pub no_use_bookmark: bool,

    /// Destroys destination snapshots whose GUID no longer exists on the
    /// source
    #[arg(long)]
    pub delete_missing_snapshots: bool,

    /// Destroys destination datasets with no counterpart under the source
    /// root
    #[arg(long)]
    pub delete_missing_datasets: bool,

    /// Runs only the deletion modes, skipping replication
    #[arg(long)]
    pub skip_replication: bool,

    /// Dry run: 'send' plans without touching anything, 'recv' runs the
    /// pipeline without finalising the receive
    #[arg(
        short = 'n',
        long,
        value_enum,
        value_name = "MODE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "recv"
    )]
    pub dryrun: Option<DryRunMode>,

    /// Retries the per-dataset flow this many times on transient failures
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub retries: u32,

    /// Source host (overrides any host embedded in the source dataset)
    #[arg(long, value_name = "HOST")]
    pub ssh_src_host: Option<String>,

    /// Destination host
    #[arg(long, value_name = "HOST")]
    pub ssh_dst_host: Option<String>,

    /// Source ssh port
    #[arg(long, value_name = "PORT")]
    pub ssh_src_port: Option<u16>,

    /// Destination ssh port
    #[arg(long, value_name = "PORT")]
    pub ssh_dst_port: Option<u16>,

    /// Source ssh user
    #[arg(long, value_name = "USER")]
    pub ssh_src_user: Option<String>,

    /// Destination ssh user
    #[arg(long, value_name = "USER")]
    pub ssh_dst_user: Option<String>,

    /// Identity file for the source connection. Can be given multiple times
    #[arg(long, value_name = "FILE")]
    pub ssh_src_private_key: Vec<String>,

    /// Identity file for the destination connection. Can be given multiple
    /// times
    #[arg(long, value_name = "FILE")]
    pub ssh_dst_private_key: Vec<String>,

    /// ssh config file for the source connection
    #[arg(long, value_name = "FILE")]
    pub ssh_src_config_file: Option<String>,

    /// ssh config file for the destination connection
    #[arg(long, value_name = "FILE")]
    pub ssh_dst_config_file: Option<String>,

    /// Extra ssh options for the source side, split on whitespace
    #[arg(long, value_name = "OPTS")]
    pub ssh_src_extra_opts: Option<String>,

    /// One extra ssh option for the source side, taken verbatim. Can be
    /// given multiple times
    #[arg(long, value_name = "OPT")]
    pub ssh_src_extra_opt: Vec<String>,

    /// Extra ssh options for the destination side, split on whitespace
    #[arg(long, value_name = "OPTS")]
    pub ssh_dst_extra_opts: Option<String>,

    /// One extra ssh option for the destination side, taken verbatim. Can
    /// be given multiple times
    #[arg(long, value_name = "OPT")]
    pub ssh_dst_extra_opt: Vec<String>,

    /// ssh cipher specification, passed through as `ssh -c`
    #[arg(long, value_name = "CIPHER")]
    pub ssh_cipher: Option<String>,

    /// ssh program name; '-' disables remote operation
    #[arg(long, value_name = "PROGRAM", default_value = "ssh")]
    pub ssh_program: String,

    /// zfs program name
    #[arg(long, value_name = "PROGRAM", default_value = "zfs")]
    pub zfs_program: String,

    /// zpool program name; '-' disables pool feature probing
    #[arg(long, value_name = "PROGRAM", default_value = "zpool")]
    pub zpool_program: String,

    /// Compression format for the transfer pipeline (zstd, gzip, pigz,
    /// lz4, lzop, xz); '-' disables the stage
    #[arg(long, value_name = "FORMAT", default_value = "zstd")]
    pub compression_program: String,

    /// mbuffer program name; '-' disables the buffering stage
    #[arg(long, value_name = "PROGRAM", default_value = "mbuffer")]
    pub mbuffer_program: String,

    /// Options passed to every mbuffer stage
    #[arg(long, value_name = "OPTS", default_value = "-q -m 128M")]
    pub mbuffer_program_opts: String,

    /// pv program name; '-' disables the progress meter
    #[arg(long, value_name = "PROGRAM", default_value = "pv")]
    pub pv_program: String,

    /// Options passed to the pv progress meter
    #[arg(long, value_name = "OPTS", default_value = "--progress --timer --eta --rate --bytes")]
    pub pv_program_opts: String,

    /// Shell used for local program availability probes
    #[arg(long, value_name = "PROGRAM", default_value = "sh")]
    pub shell_program: String,

    /// Privilege elevation program; '-' disables elevation
    #[arg(long, value_name = "PROGRAM", default_value = "sudo")]
    pub sudo_program: String,

    /// Raw options appended to every zfs send, split on whitespace
    #[arg(long, value_name = "OPTS", default_value = "")]
    pub zfs_send_program_opts: String,

    /// Raw options appended to every zfs receive, split on whitespace
    #[arg(long, value_name = "OPTS", default_value = "-u")]
    pub zfs_recv_program_opts: String,

    /// One raw option appended to every zfs receive, taken verbatim. Can be
    /// given multiple times
    #[arg(long, value_name = "OPT")]
    pub zfs_recv_program_opt: Vec<String>,

    /// Source properties whose name matches are applied with `zfs receive
    /// -o name=value`
    #[arg(long, value_name = "REGEX")]
    pub zfs_recv_o_include_regex: Vec<String>,

    /// Excludes property names from the -o rule
    #[arg(long, value_name = "REGEX")]
    pub zfs_recv_o_exclude_regex: Vec<String>,

    /// Source properties whose name matches are masked with `zfs receive
    /// -x name`
    #[arg(long, value_name = "REGEX")]
    pub zfs_recv_x_include_regex: Vec<String>,

    /// Excludes property names from the -x rule
    #[arg(long, value_name = "REGEX")]
    pub zfs_recv_x_exclude_regex: Vec<String>,

    /// Which receives the -o rule applies to: full, incremental or both
    #[arg(long, value_name = "TARGETS", default_value = "full")]
    pub zfs_recv_o_targets: String,

    /// Which receives the -x rule applies to
    #[arg(long, value_name = "TARGETS", default_value = "full,incremental")]
    pub zfs_recv_x_targets: String,

    /// Property sources the -o rule honours (local, inherited, received,
    /// default), comma-separated
    #[arg(long, value_name = "SOURCES", default_value = "local")]
    pub zfs_recv_o_sources: String,

    /// Property sources the -x rule honours
    #[arg(long, value_name = "SOURCES", default_value = "local")]
    pub zfs_recv_x_sources: String,

    /// Source properties whose name matches are applied with `zfs set`
    /// after each receive
    #[arg(long, value_name = "REGEX")]
    pub zfs_set_include_regex: Vec<String>,

    /// Bandwidth cap for the transfer, e.g. 10M (bytes per second)
    #[arg(long, value_name = "RATE", value_parser = Bytes::try_from_str)]
    pub bwlimit: Option<Bytes>,

    /// Never prefixes commands with the elevation program
    #[arg(long)]
    pub no_privilege_elevation: bool,

    /// Syslog server address, host:port
    #[arg(long, value_name = "ADDRESS")]
    pub log_syslog_address: Option<String>,

    /// Syslog transport
    #[arg(long, value_enum, default_value_t = SyslogSockType::Udp, value_name = "TYPE")]
    pub log_syslog_socktype: SyslogSockType,

    /// Syslog facility number
    #[arg(long, value_name = "N", default_value_t = 1, value_parser = clap::value_parser!(i32).range(0..=23))]
    pub log_syslog_facility: i32,

    /// Minimum level forwarded to syslog
    #[arg(long, value_name = "LEVEL")]
    pub log_syslog_level: Option<String>,

    /// Prefix prepended to syslog messages
    #[arg(long, value_name = "PREFIX", default_value = "zmirror")]
    pub log_syslog_prefix: String,

    /// Logging sink configuration; a value starting with '+' names a file
    #[arg(long, value_name = "CONFIG")]
    pub log_config_file: Option<String>,

    /// NAME:VALUE interpolated into the log config file. Can be given
    /// multiple times
    #[arg(long, value_name = "NAME:VALUE", value_parser = logcfg::parse_var)]
    pub log_config_var: Vec<(String, String)>,

    /// Increases verbosity; repeatable
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppresses everything but errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Environment variables matching are removed before child
    /// invocations. Can be given multiple times
    #[arg(long, value_name = "REGEX")]
    pub exclude_envvar_regex: Vec<String>,
}

impl Args {
    pub fn force_once(&self) -> bool {
        self.force_once || self.f1
    }

    pub fn any_force(&self) -> bool {
        self.force || self.force_once()
    }

    pub fn send_opts(&self) -> Vec<String> {
        split_opts(&self.zfs_send_program_opts)
    }

    pub fn recv_opts(&self) -> Vec<String> {
        let mut opts = split_opts(&self.zfs_recv_program_opts);
        opts.extend(self.zfs_recv_program_opt.iter().cloned());
        opts
    }

    pub fn mbuffer_opts(&self) -> Vec<String> {
        split_opts(&self.mbuffer_program_opts)
    }

    pub fn pv_opts(&self) -> Vec<String> {
        split_opts(&self.pv_program_opts)
    }

    /// The (src, dst) root pairs, with `+FILE` words expanded in place.
    pub fn dataset_pairs(&self) -> Result<Vec<(String, String)>> {
        let mut pending: Option<String> = None;
        let mut pairs = Vec::new();
        for word in &self.datasets {
            match word.strip_prefix('+') {
                Some(path) => {
                    if pending.is_some() {
                        return Err(Error::usage(
                            "a +FILE pair list cannot follow an unpaired dataset name",
                        ));
                    }
                    let text = std::fs::read_to_string(path).map_err(|e| {
                        Error::usage(format!("cannot read dataset pair file {path:?}: {e}"))
                    })?;
                    pairs.extend(parse_pairs_text(&text)?);
                }
                None => match pending.take() {
                    Some(src) => pairs.push((src, word.clone())),
                    None => pending = Some(word.clone()),
                },
            }
        }
        if pending.is_some() {
            return Err(Error::usage(
                "dataset arguments must come in SRC_DATASET DST_DATASET pairs",
            ));
        }
        Ok(pairs)
    }
}

pub fn split_opts(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Expands `+FILE` entries in a dataset-name list (one name per line, `#`
/// comments and blank lines skipped).
pub fn expand_name_files(values: &[String]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for value in values {
        match value.strip_prefix('+') {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::usage(format!("cannot read dataset list file {path:?}: {e}"))
                })?;
                names.extend(parse_names_text(&text));
            }
            None => names.push(value.clone()),
        }
    }
    Ok(names)
}

fn interesting_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn parse_names_text(text: &str) -> Vec<String> {
    interesting_lines(text).map(str::to_string).collect()
}

fn parse_pairs_text(text: &str) -> Result<Vec<(String, String)>> {
    interesting_lines(text)
        .map(|line| {
            line.split_once('\t')
                .map(|(src, dst)| (src.trim().to_string(), dst.trim().to_string()))
                .ok_or_else(|| {
                    Error::usage(format!("expected TAB-separated dataset pair, got {line:?}"))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_text_parsing() {
        let text = "# comment\ntank/a\tbackup/a\n\n  \ntank/b\tbackup/b\n";
        let pairs = parse_pairs_text(text).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("tank/a".to_string(), "backup/a".to_string()),
                ("tank/b".to_string(), "backup/b".to_string()),
            ]
        );
        assert!(parse_pairs_text("tank/a backup/a").is_err());
    }

    #[test]
    fn names_text_parsing() {
        let text = "# excluded datasets\nfoo\nbar/baz\n";
        assert_eq!(parse_names_text(text), vec!["foo", "bar/baz"]);
    }

    #[test]
    fn opts_splitting() {
        assert_eq!(split_opts(" -u  -F "), vec!["-u", "-F"]);
        assert!(split_opts("").is_empty());
    }

    #[test]
    fn parses_a_full_command_line() {
        let args = Args::parse_from([
            "zmirror",
            "--recursive",
            "--skip-parent",
            "--exclude-snapshot-regex",
            "h.*",
            "--skip-missing-snapshots=continue",
            "--force-once",
            "--retries=3",
            "--ssh-dst-host",
            "nas",
            "--ssh-dst-port",
            "2222",
            "-n=send",
            "tank/src",
            "backup/dst",
        ]);
        assert!(args.recursive);
        assert!(args.skip_parent);
        assert_eq!(args.skip_missing_snapshots, SkipMissing::Continue);
        assert!(args.force_once());
        assert!(args.any_force());
        assert!(!args.force);
        assert_eq!(args.retries, 3);
        assert_eq!(args.ssh_dst_port, Some(2222));
        assert_eq!(args.dryrun, Some(DryRunMode::Send));
        assert_eq!(
            args.dataset_pairs().unwrap(),
            vec![("tank/src".to_string(), "backup/dst".to_string())]
        );
    }

    #[test]
    fn dryrun_defaults_to_recv() {
        let args = Args::parse_from(["zmirror", "--dryrun", "tank/a", "backup/a"]);
        assert_eq!(args.dryrun, Some(DryRunMode::Recv));
        let args = Args::parse_from(["zmirror", "tank/a", "backup/a"]);
        assert_eq!(args.dryrun, None);
    }

    #[test]
    fn f1_is_an_alias_for_force_once() {
        let args = Args::parse_from(["zmirror", "--f1", "tank/a", "backup/a"]);
        assert!(args.force_once());
        assert!(!args.force_once);
    }

    #[test]
    fn odd_dataset_words_are_rejected() {
        let args = Args::parse_from(["zmirror", "tank/a", "backup/a", "tank/b"]);
        assert!(args.dataset_pairs().is_err());
    }

    #[test]
    fn recv_opts_merge_raw_and_repeatable() {
        let args = Args::parse_from([
            "zmirror",
            "--zfs-recv-program-opts=-u -F",
            "--zfs-recv-program-opt=-o",
            "--zfs-recv-program-opt=canmount=off",
            "tank/a",
            "backup/a",
        ]);
        assert_eq!(args.recv_opts(), vec!["-u", "-F", "-o", "canmount=off"]);
    }
}
