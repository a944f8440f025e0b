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

use crate::repl::Endpoint;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes. `SEVERITY_*` values double as a severity order: the
/// scheduler reports the maximum severity seen across all datasets.
pub const EXIT_OK: i32 = 0;
pub const EXIT_DATASET_FAILURES: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_FATAL: i32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument combination, malformed locator, forbidden shell
    /// metacharacter, malformed regex.
    #[error("{0}")]
    Usage(String),

    /// Required program missing or disabled, insufficient privilege,
    /// missing pool, overlapping dataset trees.
    #[error("{0}")]
    Precondition(String),

    /// The destination's most recent snapshot has no common-GUID ancestor
    /// on the source.
    #[error(
        "destination {dataset} has diverged: latest snapshot {latest} is not known \
         to the source; use --force or --force-once to roll it back"
    )]
    Divergence { dataset: String, latest: String },

    /// No included snapshot exists on the source. Governed by
    /// --skip-missing-snapshots.
    #[error("source dataset {dataset} has no snapshot matching the snapshot filters")]
    MissingSnapshots { dataset: String },

    /// A child process exited non-zero. `transient` records whether the
    /// stderr looked retryable at the call site.
    #[error("command failed with status {status} on {endpoint}: {argv}: {stderr_tail}")]
    CommandFailed {
        endpoint: Endpoint,
        argv: String,
        status: i32,
        stderr_tail: String,
        transient: bool,
    },

    /// A stage of the send/receive pipeline failed.
    #[error("pipeline stage {stage} failed: {detail}")]
    Pipeline { stage: String, detail: String },

    /// Raised by the fault-injection harness. Always transient.
    #[error("injected fault at site {site}")]
    Injected { site: String },

    /// The destination dataset is encrypted and its key is not loaded, so it
    /// can be neither rolled back nor force-destroyed. Never retried.
    #[error("destination {dataset} cannot be modified: {detail}")]
    EncryptedDataset { dataset: String, detail: String },

    /// The receive side rejected the stream for a semantic reason.
    #[error("receive into {dataset} rejected: {detail}")]
    ReceiveRejected { dataset: String, detail: String },

    /// A planner step whose `from` is not present on the destination at
    /// execution time, or similar. Indicates a bug.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => EXIT_USAGE,
            // MissingSnapshots only becomes an error under
            // --skip-missing-snapshots=fail, which aborts the run
            Error::Precondition(_)
            | Error::Divergence { .. }
            | Error::Invariant(_)
            | Error::MissingSnapshots { .. } => EXIT_FATAL,
            Error::CommandFailed { .. }
            | Error::Pipeline { .. }
            | Error::Injected { .. }
            | Error::EncryptedDataset { .. }
            | Error::ReceiveRejected { .. }
            | Error::Io(_) => EXIT_DATASET_FAILURES,
        }
    }

    /// Whether the retry loop may try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Injected { .. } | Error::Pipeline { .. } | Error::Io(_) => true,
            Error::CommandFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }
}

/// Inspect a failed command's stderr for markers that make a retry
/// pointless. Returns the matched marker so the caller can report it.
pub fn permanent_failure_marker(stderr: &str) -> Option<&'static str> {
    const MARKERS: [&str; 4] = [
        "key not loaded",
        "encryption key",
        "permission denied",
        "invalid option",
    ];
    MARKERS.into_iter().find(|m| stderr.contains(m))
}

/// True when stderr indicates the named entity is simply absent, which the
/// driver treats as "skip with a warning" rather than a failure.
pub fn is_dataset_gone(stderr: &str) -> bool {
    stderr.contains("dataset does not exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_kind() {
        assert_eq!(Error::usage("x").exit_code(), EXIT_USAGE);
        assert_eq!(Error::precondition("x").exit_code(), EXIT_FATAL);
        assert_eq!(
            Error::Divergence {
                dataset: "tank/a".into(),
                latest: "t8".into()
            }
            .exit_code(),
            EXIT_FATAL
        );
        assert_eq!(
            Error::Injected { site: "full_zfs_send".into() }.exit_code(),
            EXIT_DATASET_FAILURES
        );
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Injected { site: "x".into() }.is_transient());
        assert!(Error::Io(io::Error::other("broken pipe")).is_transient());
        assert!(!Error::usage("x").is_transient());
        assert!(
            !Error::EncryptedDataset {
                dataset: "tank/a".into(),
                detail: "key not loaded".into()
            }
            .is_transient()
        );
        let failed = Error::CommandFailed {
            endpoint: Endpoint::Dst,
            argv: "zfs list".into(),
            status: 1,
            stderr_tail: "connection reset".into(),
            transient: true,
        };
        assert!(failed.is_transient());
    }

    #[test]
    fn stderr_markers() {
        assert_eq!(
            permanent_failure_marker("cannot receive: key not loaded for tank/enc"),
            Some("key not loaded")
        );
        assert_eq!(permanent_failure_marker("broken pipe"), None);
        assert!(is_dataset_gone("cannot open 'tank/x': dataset does not exist"));
    }
}
