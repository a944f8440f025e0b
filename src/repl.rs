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

pub mod args;
pub mod catalog;
pub mod cmd;
pub mod compress;
pub mod driver;
pub mod error;
pub mod faults;
pub mod filter;
pub mod fs;
pub mod logcfg;
pub mod pipeline;
pub mod plan;
pub mod props;
pub mod reconcile;
pub mod sched;
pub mod sys;
pub mod util;
pub mod zfs;

pub use cmd::Endpoint;

use crate::repl::args::{Args, DISABLED_PROGRAM, expand_name_files};
use crate::repl::cmd::{Cmd, CmdTarget, Ssh};
use crate::repl::compress::CompressSpec;
use crate::repl::error::{Error, Result};
use crate::repl::faults::FaultRegistry;
use crate::repl::filter::{DatasetFilter, SnapshotFilter};
use crate::repl::fs::Locator;
use crate::repl::props::{PropertyPolicy, PropertyRuleSet, Targets};
use regex_lite::Regex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// All recognised environment variables carry this prefix.
pub const ENV_PREFIX: &str = "ZMIRROR_";

/// Optional stages are skipped for streams smaller than this many bytes
/// (override with ZMIRROR_MIN_PIPE_TRANSFER_SIZE).
pub const DEFAULT_MIN_PIPE_TRANSFER_SIZE: u64 = 1024 * 1024;

fn env_knob(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

/// Everything a run needs, threaded into every operation: the validated
/// configuration, compiled filters and policies, the fault-injection
/// registry, and per-host caches. There is no module-level state.
#[derive(Debug)]
pub struct Context {
    pub args: Args,
    pub snap_filter: SnapshotFilter,
    pub ds_filter: DatasetFilter,
    pub prop_policy: PropertyPolicy,
    pub compression: Option<CompressSpec>,
    pub faults: FaultRegistry,
    pub localhost: String,
    pub min_pipe_transfer_size: u64,
    pub local: CmdTarget,
    /// Validated log sink configuration, handed to the external sink layer.
    pub log_config: Option<serde_json::Value>,
    env: Vec<(String, String)>,
    force_once_spent: Cell<bool>,
    avail: RefCell<HashMap<(String, String), bool>>,
    pub(crate) features: RefCell<HashMap<(String, String), bool>>,
}

fn validate_program_name(option: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::precondition(format!("{option} must not be empty")));
    }
    if value.contains(char::is_whitespace) {
        return Err(Error::precondition(format!(
            "{option} value {value:?} must not contain whitespace"
        )));
    }
    Ok(())
}

fn compile_anchored(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{})$", filter::uncapture(p)))
                .map_err(|e| Error::usage(format!("invalid regex {p:?}: {e}")))
        })
        .collect()
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Context {
    pub fn new(args: Args) -> Result<Self> {
        for (option, value) in [
            ("--zfs-program", &args.zfs_program),
            ("--zpool-program", &args.zpool_program),
            ("--ssh-program", &args.ssh_program),
            ("--shell-program", &args.shell_program),
            ("--sudo-program", &args.sudo_program),
            ("--mbuffer-program", &args.mbuffer_program),
            ("--pv-program", &args.pv_program),
            ("--compression-program", &args.compression_program),
        ] {
            validate_program_name(option, value)?;
        }
        for program in [&args.zfs_program, &args.shell_program] {
            if program == DISABLED_PROGRAM {
                return Err(Error::precondition(
                    "the zfs and shell programs cannot be disabled",
                ));
            }
        }
        for opt in args
            .send_opts()
            .iter()
            .chain(args.recv_opts().iter())
        {
            cmd::validate_word(opt)?;
        }

        let include_dataset = expand_name_files(&args.include_dataset)?;
        let exclude_dataset = expand_name_files(&args.exclude_dataset)?;
        let ds_filter = DatasetFilter::compile(
            &include_dataset,
            &exclude_dataset,
            &args.include_dataset_regex,
            &args.exclude_dataset_regex,
        )?;
        let snap_filter =
            SnapshotFilter::compile(&args.include_snapshot_regex, &args.exclude_snapshot_regex)?;

        let recv_o = PropertyRuleSet::compile(
            &args.zfs_recv_o_include_regex,
            &args.zfs_recv_o_exclude_regex,
            Targets::parse(&args.zfs_recv_o_targets).map_err(Error::Usage)?,
            comma_list(&args.zfs_recv_o_sources),
        )?;
        let recv_x = PropertyRuleSet::compile(
            &args.zfs_recv_x_include_regex,
            &args.zfs_recv_x_exclude_regex,
            Targets::parse(&args.zfs_recv_x_targets).map_err(Error::Usage)?,
            comma_list(&args.zfs_recv_x_sources),
        )?;
        let prop_policy = PropertyPolicy::new(recv_o, recv_x, &args.zfs_set_include_regex)?;

        let compression = compress::lookup(&args.compression_program).map_err(Error::Usage)?;

        let env_excludes = compile_anchored(&args.exclude_envvar_regex)?;
        let env = sys::retained_env(&env_excludes);
        let localhost = sys::hostname()?;

        let log_config = match &args.log_config_file {
            None => None,
            Some(value) => {
                let text = match value.strip_prefix('+') {
                    Some(path) => std::fs::read_to_string(path).map_err(|e| {
                        Error::usage(format!("cannot read log config file {path:?}: {e}"))
                    })?,
                    None => value.clone(),
                };
                let vars: HashMap<String, String> = args.log_config_var.iter().cloned().collect();
                Some(logcfg::parse(&text, &vars)?)
            }
        };

        let min_pipe_transfer_size = env_knob("MIN_PIPE_TRANSFER_SIZE")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_MIN_PIPE_TRANSFER_SIZE);

        let local_sudo = Self::sudo_for(&args, sys::is_root());
        let local = CmdTarget::local(
            Endpoint::Local,
            local_sudo,
            args.shell_program.clone(),
            env.clone(),
        );

        let socket_dir = cmd::control_socket_dir();
        let _ = std::fs::create_dir_all(&socket_dir);
        if let Err(e) = cmd::cleanup_stale_sockets(&socket_dir, cmd::STALE_SOCKET_MAX_AGE) {
            log::warn!("could not clean up stale ssh sockets in {socket_dir:?}: {e}");
        }

        Ok(Self {
            args,
            snap_filter,
            ds_filter,
            prop_policy,
            compression,
            faults: FaultRegistry::new(),
            localhost,
            min_pipe_transfer_size,
            local,
            log_config,
            env,
            force_once_spent: Cell::new(false),
            avail: RefCell::new(HashMap::new()),
            features: RefCell::new(HashMap::new()),
        })
    }

    fn sudo_for(args: &Args, side_is_root: bool) -> Option<String> {
        if args.no_privilege_elevation
            || side_is_root
            || args.sudo_program == DISABLED_PROGRAM
        {
            None
        } else {
            Some(args.sudo_program.clone())
        }
    }

    /// Builds the executor for one side of a pair.
    pub fn target_for(&self, endpoint: Endpoint, loc: &Locator) -> Result<CmdTarget> {
        let args = &self.args;
        let sudo = Self::sudo_for(args, match loc.ssh_dest() {
            Some(_) => loc.user.as_deref() == Some("root"),
            None => sys::is_root(),
        });
        let Some(dest) = loc.ssh_dest() else {
            return Ok(CmdTarget::local(
                endpoint,
                sudo,
                args.shell_program.clone(),
                self.env.clone(),
            ));
        };
        if args.ssh_program == DISABLED_PROGRAM {
            return Err(Error::precondition(
                "the ssh program must not be disabled when a remote dataset is in play",
            ));
        }
        let (port, keys, config_file, extra_opts, extra_opt) = match endpoint {
            Endpoint::Src => (
                args.ssh_src_port,
                &args.ssh_src_private_key,
                &args.ssh_src_config_file,
                &args.ssh_src_extra_opts,
                &args.ssh_src_extra_opt,
            ),
            Endpoint::Dst => (
                args.ssh_dst_port,
                &args.ssh_dst_private_key,
                &args.ssh_dst_config_file,
                &args.ssh_dst_extra_opts,
                &args.ssh_dst_extra_opt,
            ),
            Endpoint::Local => unreachable!("local endpoints have no ssh destination"),
        };
        let mut opts = Vec::new();
        if let Some(config) = config_file {
            opts.push("-F".to_string());
            opts.push(config.clone());
        }
        for key in keys {
            opts.push("-i".to_string());
            opts.push(key.clone());
        }
        if let Some(port) = port {
            opts.push("-p".to_string());
            opts.push(port.to_string());
        }
        if let Some(cipher) = &args.ssh_cipher {
            opts.push("-c".to_string());
            opts.push(cipher.clone());
        }
        if let Some(extra) = extra_opts {
            opts.extend(args::split_opts(extra));
        }
        opts.extend(extra_opt.iter().cloned());
        let ssh = Ssh::new(dest, args.ssh_program.clone(), opts)
            .with_control_socket(&cmd::control_socket_dir(), port);
        Ok(CmdTarget::remote(
            endpoint,
            ssh,
            sudo,
            args.shell_program.clone(),
            self.env.clone(),
        ))
    }

    /// Cached `command -v` probe. A program configured as `-` is never
    /// available.
    pub fn program_available(&self, target: &CmdTarget, program: &str) -> Result<bool> {
        if program == DISABLED_PROGRAM {
            return Ok(false);
        }
        let key = (target.host_key().to_string(), program.to_string());
        if let Some(hit) = self.avail.borrow().get(&key) {
            return Ok(*hit);
        }
        let exists = Cmd::new(target, false, program).exists()?;
        self.avail.borrow_mut().insert(key, exists);
        Ok(exists)
    }

    /// Whether a conflict may be resolved destructively right now.
    pub fn force_allowed(&self) -> bool {
        self.args.force || (self.args.force_once() && !self.force_once_spent.get())
    }

    /// Consumes --force-once. A plain --force is never spent.
    pub fn consume_force(&self) {
        if !self.args.force {
            self.force_once_spent.set(true);
        }
    }

    pub fn dry_run(&self) -> bool {
        self.args.dryrun.is_some()
    }
}

/// One (source, destination) root pair with its executors.
#[derive(Debug)]
pub struct Pair {
    pub src_root: Locator,
    pub dst_root: Locator,
    pub src: CmdTarget,
    pub dst: CmdTarget,
}

impl Pair {
    pub fn new(ctx: &Context, src_word: &str, dst_word: &str) -> Result<Self> {
        let args = &ctx.args;
        let src_root = Locator::parse(
            src_word,
            args.ssh_src_user.as_deref(),
            args.ssh_src_host.as_deref(),
        )?;
        let dst_root = Locator::parse(
            dst_word,
            args.ssh_dst_user.as_deref(),
            args.ssh_dst_host.as_deref(),
        )?;
        if src_root.overlaps(&dst_root) {
            return Err(Error::precondition(format!(
                "source {src_root} and destination {dst_root} overlap"
            )));
        }
        let src = ctx.target_for(Endpoint::Src, &src_root)?;
        let dst = ctx.target_for(Endpoint::Dst, &dst_root)?;
        Ok(Self {
            src_root,
            dst_root,
            src,
            dst,
        })
    }
}
