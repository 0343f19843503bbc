//! Result store: the single persisted verdict artifact.
//!
//! A run deletes the artifact on start and rewrites it once at the end with
//! the literal `PASS` or `FAIL`. Readers normalize anything else (missing
//! file, empty file, unexpected content) to `FAIL`, so a consumer that only
//! looks at the file never sees an ambiguous outcome.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Final PASS/FAIL classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestVerdict {
    Pass,
    Fail,
}

impl TestVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            TestVerdict::Pass => "PASS",
            TestVerdict::Fail => "FAIL",
        }
    }

    /// Process exit code reported to the wrapping CI step.
    pub fn exit_code(self) -> u8 {
        match self {
            TestVerdict::Pass => 0,
            TestVerdict::Fail => 1,
        }
    }
}

impl fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-backed verdict persistence.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the artifact if present. Never fails the run.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "cleaned up previous test result"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no previous test result to clean up");
            }
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "could not clean up previous test result"
            ),
        }
    }

    /// Overwrite the artifact with the verdict literal.
    ///
    /// The content is written to a sibling temp file and renamed into place so
    /// a reader never observes a half-written verdict. Returns whether the
    /// artifact was persisted; failures are logged, not raised.
    pub fn write(&self, verdict: TestVerdict) -> bool {
        match self.write_atomic(verdict) {
            Ok(()) => {
                info!(verdict = %verdict, path = %self.path.display(), "test result written");
                true
            }
            Err(e) => {
                warn!(
                    verdict = %verdict,
                    path = %self.path.display(),
                    error = %e,
                    "failed to write test result"
                );
                false
            }
        }
    }

    /// `PASS` only if the artifact exists and its trimmed content is exactly
    /// `PASS`; everything else reads as `FAIL`.
    pub fn read(&self) -> TestVerdict {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim() == "PASS" => TestVerdict::Pass,
            Ok(content) => {
                debug!(content = %content.trim(), "test result is not PASS");
                TestVerdict::Fail
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no readable test result");
                TestVerdict::Fail
            }
        }
    }

    fn write_atomic(&self, verdict: TestVerdict) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "test-result".into());
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        std::fs::write(&tmp, verdict.as_str())?;
        std::fs::rename(&tmp, &self.path)
    }
}
