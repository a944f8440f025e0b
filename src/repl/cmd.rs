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

use crate::repl::error::{Error, Result, permanent_failure_marker};
use crate::repl::util;
use log::{debug, warn};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

/// Where a command executes. The executor reports this in failures so a
/// `zfs list` that died on the destination reads differently from one that
/// died locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Local,
    Src,
    Dst,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local => write!(f, "local host"),
            Endpoint::Src => write!(f, "source"),
            Endpoint::Dst => write!(f, "destination"),
        }
    }
}

/// Conservative budget for one command line, local or behind ssh. Linux
/// ARG_MAX is far larger, but the remote side's limit is not observable, so
/// both sides use the sshd-safe bound.
pub const MAX_CMDLINE_BYTES: usize = 128 * 1024;

/// Multiplex sockets older than this are considered leftovers of a dead run
/// and removed at process start.
pub const STALE_SOCKET_MAX_AGE: Duration = Duration::from_secs(2 * 24 * 3600);

/// Characters that never need quoting on any shell in the pipeline.
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_-./:%@=+,".contains(c)
}

/// Rejects words that could alter a remote shell command no matter how we
/// quote them. Spaces are fine (dataset names may contain them); quotes,
/// expansions and separators are not.
pub fn validate_word(word: &str) -> Result<()> {
    let forbidden = |c: char| {
        c.is_ascii_control() || "'\"`$\\;&<>|(){}[]*?~!".contains(c)
    };
    if let Some(c) = word.chars().find(|c| forbidden(*c)) {
        return Err(Error::usage(format!(
            "argument {word:?} contains forbidden character {c:?}"
        )));
    }
    Ok(())
}

/// Quotes one validated word for a remote shell command line.
fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_plain) {
        word.to_string()
    } else {
        format!("'{word}'")
    }
}

/// Splits a flat argument list into chunks whose joined byte length stays
/// under `budget` (after accounting for `fixed` bytes of invariant prefix).
/// Each chunk is a semantically equivalent sub-invocation.
pub fn batch_by_bytes<'a>(items: &'a [String], fixed: usize, budget: usize) -> Vec<&'a [String]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut used = fixed;
    for (i, item) in items.iter().enumerate() {
        let cost = item.len() + 1;
        if i > start && used + cost > budget {
            batches.push(&items[start..i]);
            start = i;
            used = fixed;
        }
        used += cost;
    }
    if start < items.len() {
        batches.push(&items[start..]);
    }
    batches
}

/// Joins snapshot tags into `tag1,tag2,…` chunks (the argument form of
/// `zfs destroy ds@tag1,tag2`), each chunk within the byte budget.
pub fn batch_csv(tags: &[String], fixed: usize, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for tag in tags {
        if !current.is_empty() && fixed + current.len() + 1 + tag.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(tag);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// ssh invocation settings for one remote side, including the shared
/// ControlMaster socket for connection reuse.
#[derive(Debug, Clone)]
pub struct Ssh {
    pub dest: String,
    program: String,
    opts: Vec<String>,
    control_path: Option<PathBuf>,
}

impl Ssh {
    pub fn new(dest: String, program: String, opts: Vec<String>) -> Self {
        Self {
            dest,
            program,
            opts,
            control_path: None,
        }
    }

    /// Enables connection multiplexing through a per-(destination, port)
    /// socket in `dir`. Commands after the first reuse the master
    /// connection.
    pub fn with_control_socket(mut self, dir: &Path, port: Option<u16>) -> Self {
        let mut name: String = self
            .dest
            .chars()
            .map(|c| if is_plain(c) && c != '/' { c } else { '_' })
            .collect();
        name.push_str(&format!("-{}", port.unwrap_or(22)));
        self.control_path = Some(dir.join(name));
        self
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = self.opts.clone();
        if let Some(path) = &self.control_path {
            argv.push("-S".to_string());
            argv.push(path.display().to_string());
            argv.push("-o".to_string());
            argv.push("ControlMaster=auto".to_string());
            argv.push("-o".to_string());
            argv.push("ControlPersist=90s".to_string());
        }
        argv.push(self.dest.clone());
        argv
    }
}

#[derive(Debug)]
enum TargetKind {
    Local,
    Remote(Ssh),
}

/// One executing side: the local machine or an ssh destination, plus the
/// privilege-elevation and environment policy for commands run there.
#[derive(Debug)]
pub struct CmdTarget {
    pub endpoint: Endpoint,
    kind: TargetKind,
    /// Elevation program to prefix privileged commands with, when the
    /// executing user on this side is not root and elevation is enabled.
    sudo: Option<String>,
    shell: String,
    env: Vec<(String, String)>,
}

impl CmdTarget {
    pub fn local(endpoint: Endpoint, sudo: Option<String>, shell: String, env: Vec<(String, String)>) -> Self {
        Self {
            endpoint,
            kind: TargetKind::Local,
            sudo,
            shell,
            env,
        }
    }

    pub fn remote(
        endpoint: Endpoint,
        ssh: Ssh,
        sudo: Option<String>,
        shell: String,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            endpoint,
            kind: TargetKind::Remote(ssh),
            sudo,
            shell,
            env,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, TargetKind::Remote(_))
    }

    /// Cache key for program-availability and feature probes on this side.
    pub fn host_key(&self) -> &str {
        match &self.kind {
            TargetKind::Local => "",
            TargetKind::Remote(ssh) => &ssh.dest,
        }
    }

    pub fn pretty(&self) -> &str {
        match &self.kind {
            TargetKind::Local => "local host",
            TargetKind::Remote(ssh) => &ssh.dest,
        }
    }
}

/// Captured result of one command. Callers that probe for conditions like
/// "dataset does not exist" inspect stderr before deciding success.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A command vector bound to a target. Building the actual `Command` (or
/// the quoted string for a pipeline leg) validates every word.
pub struct Cmd<'t> {
    target: &'t CmdTarget,
    privileged: bool,
    base: String,
    args: Vec<String>,
}

impl<'t> Cmd<'t> {
    pub fn new(target: &'t CmdTarget, privileged: bool, base: impl Into<String>) -> Self {
        Self {
            target,
            privileged,
            base: base.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, a: impl Into<String>) -> &mut Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(&mut self, items: I) -> &mut Self {
        self.args.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn target(&self) -> &CmdTarget {
        self.target
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn elevation(&self) -> Option<&str> {
        if self.privileged {
            self.target.sudo.as_deref()
        } else {
            None
        }
    }

    /// The words actually executed, elevation prefix included.
    fn words(&self) -> Vec<&str> {
        let mut words = Vec::with_capacity(self.args.len() + 3);
        if let Some(sudo) = self.elevation() {
            words.push(sudo);
            words.push("-n");
        }
        words.push(&self.base);
        words.extend(self.args.iter().map(String::as_str));
        words
    }

    /// The quoted single-string form, as embedded in an ssh command line or
    /// a remote pipeline leg.
    pub fn shell_string(&self) -> Result<String> {
        let words = self.words();
        let mut out = String::new();
        for word in &words {
            validate_word(word)?;
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&quote(word));
        }
        Ok(out)
    }

    /// Builds the spawnable `Command`, wrapping in ssh for remote targets
    /// and applying the sanitised environment.
    pub fn to_command(&self) -> Result<Command> {
        let mut cmd = match &self.target.kind {
            TargetKind::Local => {
                for word in self.words() {
                    validate_word(word)?;
                }
                let words = self.words();
                let mut cmd = Command::new(words[0]);
                cmd.args(&words[1..]);
                cmd
            }
            TargetKind::Remote(ssh) => {
                let mut cmd = Command::new(&ssh.program);
                cmd.args(ssh.argv());
                cmd.arg(self.shell_string()?);
                cmd
            }
        };
        cmd.env_clear();
        cmd.envs(self.target.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(cmd)
    }

    /// Builds the ssh carrier for a whole remote pipeline leg: the
    /// already-quoted `stages` string (`a | b | c`) becomes the remote
    /// command line.
    pub fn to_remote_pipeline(&self, stages: &str) -> Result<Command> {
        match &self.target.kind {
            TargetKind::Remote(ssh) => {
                let mut cmd = Command::new(&ssh.program);
                cmd.args(ssh.argv());
                cmd.arg(stages);
                cmd.env_clear();
                cmd.envs(self.target.env.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(cmd)
            }
            TargetKind::Local => Err(Error::Invariant(
                "remote pipeline leg requested on a local target".to_string(),
            )),
        }
    }

    /// Runs and captures, with stderr bounded. Only spawn failures are
    /// errors; a non-zero exit is reported in the output.
    pub fn run(&self) -> Result<CmdOutput> {
        debug!("running {self} on {}", self.target.pretty());
        let mut command = self.to_command()?;
        command.stdin(Stdio::null());
        let output = command.output()?;
        Ok(CmdOutput {
            status: output.status.code().unwrap_or(-1),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: util::tail(&String::from_utf8_lossy(&output.stderr), 4096).to_string(),
        })
    }

    /// Runs, mapping a non-zero exit to `CommandFailed`. The failure is
    /// classified transient unless stderr carries a permanent marker.
    pub fn run_ok(&self) -> Result<CmdOutput> {
        let output = self.run()?;
        if output.success {
            return Ok(output);
        }
        Err(self.failure(&output))
    }

    pub fn failure(&self, output: &CmdOutput) -> Error {
        Error::CommandFailed {
            endpoint: self.target.endpoint,
            argv: self.to_string(),
            status: output.status,
            stderr_tail: output.stderr.clone(),
            transient: permanent_failure_marker(&output.stderr).is_none(),
        }
    }

    /// POSIX `command -v` probe for program availability on this side.
    pub fn exists(&self) -> Result<bool> {
        let probe = format!("command -v -- {}", quote(&self.base));
        let mut command = match &self.target.kind {
            TargetKind::Local => {
                let mut cmd = Command::new(&self.target.shell);
                cmd.arg("-c").arg(&probe);
                cmd
            }
            TargetKind::Remote(ssh) => {
                let mut cmd = Command::new(&ssh.program);
                cmd.args(ssh.argv());
                cmd.arg(&probe);
                cmd
            }
        };
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        Ok(command.status()?.success())
    }
}

impl Display for Cmd<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let TargetKind::Remote(ssh) = &self.target.kind {
            write!(f, "{} {} ", ssh.program, ssh.dest)?;
        }
        if let Some(sudo) = self.elevation() {
            write!(f, "{sudo} -n ")?;
        }
        write!(f, "{}", self.base)?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

/// Owns one spawned pipeline stage. `join` reaps it on the normal path; a
/// guard dropped before `join` (because a sibling stage failed or an error
/// unwound the pipeline) kills and reaps the child, so no stage outlives
/// its pipeline on any exit path.
pub struct StageGuard {
    name: String,
    child: Option<std::process::Child>,
}

impl StageGuard {
    pub fn new(name: impl Into<String>, child: std::process::Child) -> Self {
        Self {
            name: name.into(),
            child: Some(child),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child
            .take()
            .expect("a guard is joined at most once")
            .wait()
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        // try_wait also reaps a stage that already exited on its own
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Directory holding the per-destination ControlMaster sockets.
pub fn control_socket_dir() -> PathBuf {
    let base = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let uid = unsafe { libc::getuid() };
    base.join(format!("zmirror-ssh-{uid}"))
}

/// Removes multiplex sockets left behind by runs that died more than
/// `max_age` ago. Called once at process start.
pub fn cleanup_stale_sockets(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    for entry in entries {
        let entry = entry?;
        let modified = entry.metadata().and_then(|m| m.modified());
        let stale = match modified {
            Ok(t) => now.duration_since(t).map(|age| age > max_age).unwrap_or(false),
            Err(_) => false,
        };
        if stale {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not remove stale socket {:?}: {e}", entry.path()),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_target() -> CmdTarget {
        CmdTarget::local(Endpoint::Local, None, "sh".to_string(), Vec::new())
    }

    fn remote_target() -> CmdTarget {
        let ssh = Ssh::new("alice@nas".to_string(), "ssh".to_string(), vec![]);
        CmdTarget::remote(Endpoint::Dst, ssh, Some("sudo".to_string()), "sh".to_string(), Vec::new())
    }

    #[test]
    fn word_validation() {
        assert!(validate_word("tank/my data@snap-1").is_ok());
        assert!(validate_word("-o").is_ok());
        assert!(validate_word("a;b").is_err());
        assert!(validate_word("a`b").is_err());
        assert!(validate_word("a$b").is_err());
        assert!(validate_word("a\"b").is_err());
        assert!(validate_word("a\nb").is_err());
    }

    #[test]
    fn shell_string_quotes_spaces() {
        let target = local_target();
        let mut cmd = Cmd::new(&target, false, "zfs");
        cmd.args(["list", "tank/my data"]);
        assert_eq!(cmd.shell_string().unwrap(), "zfs list 'tank/my data'");
    }

    #[test]
    fn elevation_prefixes_privileged_commands() {
        let target = remote_target();
        let mut cmd = Cmd::new(&target, true, "zfs");
        cmd.args(["destroy", "tank/a@s1"]);
        assert_eq!(
            cmd.shell_string().unwrap(),
            "sudo -n zfs destroy tank/a@s1"
        );
        let mut plain = Cmd::new(&target, false, "zfs");
        plain.arg("list");
        assert_eq!(plain.shell_string().unwrap(), "zfs list");
    }

    #[test]
    fn shell_string_rejects_metacharacters() {
        let target = remote_target();
        let mut cmd = Cmd::new(&target, false, "zfs");
        cmd.arg("tank/$(reboot)");
        assert!(cmd.shell_string().is_err());
    }

    #[test]
    fn byte_batching_splits_and_preserves_order() {
        let items: Vec<String> = (0..10).map(|i| format!("tank/ds{i:02}")).collect();
        let batches = batch_by_bytes(&items, 20, 60);
        assert!(batches.len() > 1);
        let rejoined: Vec<String> = batches.concat();
        assert_eq!(rejoined, items);
        for batch in &batches {
            let used: usize = batch.iter().map(|s| s.len() + 1).sum();
            assert!(20 + used <= 60 || batch.len() == 1);
        }
    }

    #[test]
    fn csv_batching() {
        let tags: Vec<String> = (0..8).map(|i| format!("snap{i}")).collect();
        let chunks = batch_csv(&tags, 10, 30);
        assert!(chunks.len() > 1);
        let all: Vec<&str> = chunks.iter().flat_map(|c| c.split(',')).collect();
        assert_eq!(all.len(), 8);
        for chunk in &chunks {
            assert!(10 + chunk.len() <= 30 || !chunk.contains(','));
        }
    }

    #[test]
    fn control_sockets_are_per_destination_and_port() {
        let ssh = Ssh::new("alice@host.example.org".to_string(), "ssh".to_string(), vec![])
            .with_control_socket(Path::new("/tmp/zm"), Some(2222));
        let argv = ssh.argv();
        let sock_idx = argv.iter().position(|a| a == "-S").unwrap() + 1;
        assert!(argv[sock_idx].starts_with("/tmp/zm/"));
        assert!(argv[sock_idx].ends_with("-2222"));
        assert!(argv.iter().any(|a| a == "ControlMaster=auto"));
        assert_eq!(argv.last().unwrap(), "alice@host.example.org");

        let default_port = Ssh::new("host".to_string(), "ssh".to_string(), vec![])
            .with_control_socket(Path::new("/tmp/zm"), None);
        let argv = default_port.argv();
        let sock_idx = argv.iter().position(|a| a == "-S").unwrap() + 1;
        assert!(argv[sock_idx].ends_with("host-22"));
    }

    #[test]
    fn stage_guard_joins_and_reports_the_status() {
        let child = Command::new("sh")
            .args(["-c", "exit 7"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let guard = StageGuard::new("probe", child);
        assert_eq!(guard.name(), "probe");
        let status = guard.join().unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn dropped_stage_guards_do_not_leave_children_behind() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let started = std::time::Instant::now();
        drop(StageGuard::new("stuck", child));
        // the drop killed and reaped the sleeper instead of waiting it out
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn stale_socket_cleanup_missing_dir_is_ok() {
        let removed = cleanup_stale_sockets(Path::new("/nonexistent/zmirror-test"), STALE_SOCKET_MAX_AGE).unwrap();
        assert_eq!(removed, 0);
    }
}
