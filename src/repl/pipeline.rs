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

//! Composes the byte pipeline between `zfs send` and `zfs receive`:
//!
//!   send | [compress] | [buffer] | [meter] | transport | [decompress] | [buffer] | receive
//!
//! Optional stages run only when their program exists on the side that
//! needs it, the stage is not administratively disabled, and the estimated
//! payload is worth the overhead. Remote legs collapse into a single ssh
//! command line; local stages are spawned individually and wired with
//! pipes, each held by a `StageGuard` so teardown happens on every exit
//! path.

use crate::repl::cmd::{Cmd, CmdTarget, StageGuard};
use crate::repl::error::{Error, Result};
use crate::repl::util::{ReadableBytes, tail};
use crate::repl::{Context, Pair, args::DISABLED_PROGRAM};
use log::{debug, warn};
use std::io::{IsTerminal, Read, Write};
use std::process::{Command, Stdio};

/// One spawnable element of the pipeline: either a whole remote leg behind
/// ssh, or a single local stage.
struct Element {
    name: String,
    command: Command,
    dataset: String,
}

pub struct Pipeline {
    elements: Vec<Element>,
}

struct StagePick<'c> {
    ctx: &'c Context,
    est_size: u64,
}

impl<'c> StagePick<'c> {
    fn worthwhile(&self) -> bool {
        self.est_size >= self.ctx.min_pipe_transfer_size
    }

    fn available(&self, target: &CmdTarget, program: &str) -> bool {
        if program == DISABLED_PROGRAM {
            return false;
        }
        match self.ctx.program_available(target, program) {
            Ok(found) => {
                if !found {
                    warn!(
                        "{program} not available on {}; continuing without it",
                        target.pretty()
                    );
                }
                found
            }
            Err(e) => {
                warn!("could not probe for {program} on {}: {e}", target.pretty());
                false
            }
        }
    }

    /// Compression spans both transport ends; both programs must exist.
    fn compression(&self, src: &'c CmdTarget, dst: &'c CmdTarget) -> Option<(Cmd<'c>, Cmd<'c>)> {
        let spec = self.ctx.compression?;
        if !self.worthwhile() {
            return None;
        }
        if !self.available(src, spec.program) || !self.available(dst, spec.decompress_program) {
            return None;
        }
        let mut compress = Cmd::new(src, false, spec.program);
        compress.args(spec.args.iter().copied());
        let mut decompress = Cmd::new(dst, false, spec.decompress_program);
        decompress.args(spec.decompress_args.iter().copied());
        Some((compress, decompress))
    }

    /// Buffer stage for one leg; carries the bandwidth cap when this leg is
    /// the rate-limited one.
    fn mbuffer(&self, target: &'c CmdTarget, rate_limited: bool) -> Option<Cmd<'c>> {
        let args = &self.ctx.args;
        let wanted = self.worthwhile() || (rate_limited && args.bwlimit.is_some());
        if !wanted || !self.available(target, &args.mbuffer_program) {
            return None;
        }
        let mut cmd = Cmd::new(target, false, args.mbuffer_program.clone());
        cmd.args(args.mbuffer_opts());
        if rate_limited {
            if let Some(limit) = &args.bwlimit {
                cmd.arg("-r");
                cmd.arg(limit.to_string());
            }
        }
        Some(cmd)
    }

    /// Progress meter on the local leg, when stderr is a terminal.
    fn meter(&self, target: &'c CmdTarget) -> Option<Cmd<'c>> {
        let args = &self.ctx.args;
        if args.quiet || !std::io::stderr().is_terminal() {
            return None;
        }
        if !self.worthwhile() || !self.available(target, &args.pv_program) {
            return None;
        }
        let mut cmd = Cmd::new(target, false, args.pv_program.clone());
        cmd.args(args.pv_opts());
        if self.est_size > 0 {
            cmd.arg("--size");
            cmd.arg(self.est_size.to_string());
        }
        Some(cmd)
    }
}

impl Pipeline {
    /// Lays out the legs for this pair's hop shape and turns each into
    /// spawnable elements. `send` runs on the source side, `recv` on the
    /// destination side; `dst_dataset` is only used for error reports.
    pub fn build<'c>(
        ctx: &'c Context,
        pair: &'c Pair,
        send: Cmd<'c>,
        recv: Cmd<'c>,
        dst_dataset: &str,
        est_size: u64,
    ) -> Result<Self> {
        debug!(
            "building pipeline for an estimated {}",
            ReadableBytes(est_size)
        );
        let pick = StagePick { ctx, est_size };
        let local = &ctx.local;
        let mut elements = Vec::new();

        match (pair.src.is_remote(), pair.dst.is_remote()) {
            (false, false) => {
                // single machine: compression would only burn cpu
                let stages = [
                    Some(("zfs send", send)),
                    pick.mbuffer(local, true).map(|c| ("buffer", c)),
                    pick.meter(local).map(|c| ("meter", c)),
                    Some(("zfs receive", recv)),
                ];
                for (name, cmd) in stages.into_iter().flatten() {
                    elements.push(element(name, cmd, dst_dataset)?);
                }
            }
            (false, true) => {
                // push
                let (compress, decompress) = match pick.compression(local, &pair.dst) {
                    Some((c, d)) => (Some(c), Some(d)),
                    None => (None, None),
                };
                let local_stages = [
                    Some(("zfs send", send)),
                    pick.meter(local).map(|c| ("meter", c)),
                    compress.map(|c| ("compress", c)),
                    pick.mbuffer(local, true).map(|c| ("buffer", c)),
                ];
                for (name, cmd) in local_stages.into_iter().flatten() {
                    elements.push(element(name, cmd, dst_dataset)?);
                }
                let remote_stages = [
                    decompress.map(|c| ("decompress", c)),
                    pick.mbuffer(&pair.dst, false).map(|c| ("buffer", c)),
                    Some(("zfs receive", recv)),
                ];
                elements.push(remote_leg(remote_stages.into_iter().flatten(), dst_dataset)?);
            }
            (true, false) => {
                // pull
                let (compress, decompress) = match pick.compression(&pair.src, local) {
                    Some((c, d)) => (Some(c), Some(d)),
                    None => (None, None),
                };
                let remote_stages = [
                    Some(("zfs send", send)),
                    compress.map(|c| ("compress", c)),
                    pick.mbuffer(&pair.src, false).map(|c| ("buffer", c)),
                ];
                elements.push(remote_leg(remote_stages.into_iter().flatten(), dst_dataset)?);
                let local_stages = [
                    decompress.map(|c| ("decompress", c)),
                    pick.mbuffer(local, true).map(|c| ("buffer", c)),
                    pick.meter(local).map(|c| ("meter", c)),
                    Some(("zfs receive", recv)),
                ];
                for (name, cmd) in local_stages.into_iter().flatten() {
                    elements.push(element(name, cmd, dst_dataset)?);
                }
            }
            (true, true) => {
                // pull-then-push: the stream tunnels through this host and
                // stays compressed across both hops
                let (compress, decompress) = match pick.compression(&pair.src, &pair.dst) {
                    Some((c, d)) => (Some(c), Some(d)),
                    None => (None, None),
                };
                let src_stages = [
                    Some(("zfs send", send)),
                    compress.map(|c| ("compress", c)),
                    pick.mbuffer(&pair.src, false).map(|c| ("buffer", c)),
                ];
                elements.push(remote_leg(src_stages.into_iter().flatten(), dst_dataset)?);
                let tunnel_stages = [
                    pick.mbuffer(local, true).map(|c| ("buffer", c)),
                    pick.meter(local).map(|c| ("meter", c)),
                ];
                for (name, cmd) in tunnel_stages.into_iter().flatten() {
                    elements.push(element(name, cmd, dst_dataset)?);
                }
                let dst_stages = [
                    decompress.map(|c| ("decompress", c)),
                    pick.mbuffer(&pair.dst, false).map(|c| ("buffer", c)),
                    Some(("zfs receive", recv)),
                ];
                elements.push(remote_leg(dst_stages.into_iter().flatten(), dst_dataset)?);
            }
        }

        Ok(Self { elements })
    }

    /// Spawns the chain, wires the pipes, waits for completion and tears
    /// everything down. The receive's stderr is both shown and kept for
    /// error classification.
    pub fn run(self) -> Result<()> {
        let mut children: Vec<StageGuard> = Vec::new();
        let mut prev_stdout = None;
        let last = self.elements.len() - 1;
        let mut recv_dataset = String::new();
        let mut recv_stderr_handle = None;

        for (i, mut element) in self.elements.into_iter().enumerate() {
            debug!("pipeline stage {}: {}", i, element.name);
            match prev_stdout.take() {
                Some(stdout) => {
                    element.command.stdin(Stdio::from(stdout));
                }
                None => {
                    // ssh misbehaves when its stdin is closed outright
                    element.command.stdin(Stdio::inherit());
                }
            }
            if i < last {
                element.command.stdout(Stdio::piped());
                element.command.stderr(Stdio::inherit());
            } else {
                element.command.stdout(Stdio::inherit());
                element.command.stderr(Stdio::piped());
                recv_dataset = element.dataset.clone();
            }
            let mut child = element.command.spawn().map_err(|e| Error::Pipeline {
                stage: element.name.clone(),
                detail: format!("failed to spawn: {e}"),
            })?;
            if i < last {
                prev_stdout = child.stdout.take();
            } else if let Some(mut stderr) = child.stderr.take() {
                // tee the receive's stderr so the operator sees it live
                recv_stderr_handle = Some(std::thread::spawn(move || {
                    let mut buffer = Vec::new();
                    let mut chunk = [0u8; 4096];
                    while let Ok(n) = stderr.read(&mut chunk) {
                        if n == 0 {
                            break;
                        }
                        buffer.extend_from_slice(&chunk[..n]);
                        let _ = std::io::stderr().write_all(&chunk[..n]);
                    }
                    buffer
                }));
            }
            children.push(StageGuard::new(element.name, child));
        }

        // wait for the receive first; upstream failures surface through it
        let recv_guard = children.pop().expect("pipeline has stages");
        let recv_name = recv_guard.name().to_string();
        let recv_status = recv_guard.join()?;
        let recv_stderr = recv_stderr_handle
            .and_then(|h| h.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let mut upstream_failure = None;
        for guard in children {
            let name = guard.name().to_string();
            let status = guard.join()?;
            if !status.success() && upstream_failure.is_none() {
                upstream_failure = Some((name, status));
            }
        }

        if !recv_status.success() {
            let stderr_tail = tail(&recv_stderr, 4096);
            if stderr_tail.contains("key not loaded") || stderr_tail.contains("encryption") {
                return Err(Error::EncryptedDataset {
                    dataset: recv_dataset,
                    detail: stderr_tail.to_string(),
                });
            }
            if stderr_tail.contains("cannot receive") && !stderr_tail.contains("interrupted") {
                return Err(Error::ReceiveRejected {
                    dataset: recv_dataset,
                    detail: stderr_tail.to_string(),
                });
            }
            return Err(Error::Pipeline {
                stage: recv_name,
                detail: format!("exit status {recv_status}: {stderr_tail}"),
            });
        }
        if let Some((name, status)) = upstream_failure {
            return Err(Error::Pipeline {
                stage: name,
                detail: format!("exit status {status}"),
            });
        }
        Ok(())
    }
}

fn element(name: &str, cmd: Cmd<'_>, dataset: &str) -> Result<Element> {
    Ok(Element {
        name: name.to_string(),
        command: cmd.to_command()?,
        dataset: dataset.to_string(),
    })
}

/// Joins a remote leg's stages into one `ssh dest 'a | b | c'` element.
fn remote_leg<'c>(
    stages: impl Iterator<Item = (&'static str, Cmd<'c>)>,
    dataset: &str,
) -> Result<Element> {
    let mut names = Vec::new();
    let mut shell_parts = Vec::new();
    let mut ssh_carrier = None;
    for (name, cmd) in stages {
        names.push(name);
        shell_parts.push(cmd.shell_string()?);
        ssh_carrier.get_or_insert(cmd);
    }
    let carrier = ssh_carrier.expect("remote legs are never empty");
    let command = carrier.to_remote_pipeline(&shell_parts.join(" | "))?;
    Ok(Element {
        name: format!("remote leg [{}]", names.join(" | ")),
        command,
        dataset: dataset.to_string(),
    })
}
