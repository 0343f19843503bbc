//! Log tail watching. Feeds new AUT log lines to the status tracker.
//!
//! Polling (seek to the stored offset, read new bytes) is simple and works on
//! every platform. Only complete lines are consumed: a trailing fragment with
//! no newline yet stays in the file and is re-read on the next poll, so a
//! half-flushed pattern can never be misclassified.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::status::StatusTracker;

/// Strip ANSI escape sequences (CSI, OSC and two-byte escapes).
pub fn strip_ansi(input: &str) -> String {
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Byte offset into the tailed log, shared between the watcher thread and
/// its owner. Only ever moves forward, except back to 0 when the log is
/// rotated or truncated.
#[derive(Debug, Clone, Default)]
pub struct LogCursor(Arc<AtomicU64>);

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cursor positioned at the current end of `path`, so content written
    /// before this point (an earlier session's log) is never classified.
    /// A missing file gives offset 0.
    pub fn at_end_of(path: &Path) -> Self {
        let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if len > 0 {
            debug!(path = %path.display(), offset = len, "skipping existing log content");
        }
        Self(Arc::new(AtomicU64::new(len)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, offset: u64) {
        self.0.store(offset, Ordering::Release);
    }
}

/// Identity of the file currently behind a path. A change means the log was
/// replaced (rotated) since the last poll.
#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// Incremental reader for a line-oriented log file that may be rotated.
///
/// Follows the path like `tail -F`: when the file is replaced or shrinks
/// below the current offset, reading restarts at the beginning of the new
/// content.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    position: u64,
    identity: Option<(u64, u64)>,
}

impl LogTail {
    pub fn new(path: &Path) -> Self {
        Self::with_position(path, 0)
    }

    /// Start from a specific byte offset in the file currently at `path`.
    /// An offset beyond EOF is treated as a truncation on the next poll.
    pub fn with_position(path: &Path, position: u64) -> Self {
        let identity = std::fs::metadata(path)
            .ok()
            .and_then(|meta| file_identity(&meta));
        Self {
            path: path.to_path_buf(),
            position,
            identity,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read every complete line appended since the last poll and hand each
    /// non-empty, ANSI-stripped line to `on_line`.
    ///
    /// A missing file is not an error: the AUT may not have created it yet.
    /// Returns the number of lines delivered.
    pub fn poll<F: FnMut(&str)>(&mut self, mut on_line: F) -> Result<usize> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open log: {}", self.path.display()));
            }
        };

        let meta = file
            .metadata()
            .with_context(|| format!("failed to stat log: {}", self.path.display()))?;
        let file_len = meta.len();
        let identity = file_identity(&meta);
        if self.identity.is_some() && identity != self.identity {
            debug!(position = self.position, "log replaced; reading from the start");
            self.position = 0;
        } else if self.position > file_len {
            debug!(
                position = self.position,
                file_len, "log shrank below cursor; reading from the start"
            );
            self.position = 0;
        }
        self.identity = identity;
        if file_len == self.position {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.position))
            .context("failed to seek in log")?;
        let mut new_bytes = Vec::new();
        file.read_to_end(&mut new_bytes)
            .context("failed to read log")?;

        let Some(last_newline) = new_bytes.iter().rposition(|&b| b == b'\n') else {
            return Ok(0);
        };
        let complete = &new_bytes[..=last_newline];
        self.position += complete.len() as u64;

        let mut delivered = 0;
        for raw in complete.split(|&b| b == b'\n') {
            let text = String::from_utf8_lossy(raw);
            let stripped = strip_ansi(&text);
            let line = stripped.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            on_line(line);
            delivered += 1;
        }

        Ok(delivered)
    }
}

/// Background thread polling a [`LogTail`] into a [`StatusTracker`].
///
/// Owned by the run scope: `stop()` (or drop) signals the thread and joins it,
/// so no polling outlives the run.
pub struct TailWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TailWatcher {
    /// Begin tailing `path` from the cursor's current offset.
    pub fn start(
        path: &Path,
        cursor: LogCursor,
        tracker: StatusTracker,
        poll_interval: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let mut tail = LogTail::with_position(path, cursor.get());
        let log_path = path.to_path_buf();

        let handle = thread::Builder::new()
            .name("autorun-tail".to_string())
            .spawn(move || {
                debug!(path = %log_path.display(), "log watcher started");
                while !stop_flag.load(Ordering::Relaxed) {
                    let polled = tail.poll(|line| {
                        if let Some(state) = tracker.update(line) {
                            info!(state = ?state, line = %line, "test status changed");
                        }
                    });
                    match polled {
                        Ok(0) => {}
                        Ok(n) => debug!(lines = n, "log lines read"),
                        Err(e) => warn!(error = %e, "log watcher poll error"),
                    }
                    cursor.set(tail.position());
                    thread::sleep(poll_interval);
                }
                debug!(position = tail.position(), "log watcher stopped");
            })
            .context("failed to spawn log watcher thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to finish its current iteration.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("log watcher thread panicked");
            }
        }
    }
}

impl Drop for TailWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusPatterns, StatusState};
    use proptest::prelude::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    fn collect(tail: &mut LogTail) -> Vec<String> {
        let mut lines = Vec::new();
        tail.poll(|l| lines.push(l.to_string())).unwrap();
        lines
    }

    #[test]
    fn strip_ansi_removes_csi() {
        assert_eq!(
            strip_ansi("\x1b[32m✅ All tests passed\x1b[0m"),
            "✅ All tests passed"
        );
    }

    #[test]
    fn strip_ansi_passthrough_clean_text() {
        assert_eq!(strip_ansi("[main/INFO]: plain"), "[main/INFO]: plain");
    }

    #[test]
    fn missing_file_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tail = LogTail::new(&tmp.path().join("logs").join("latest.log"));
        assert_eq!(tail.poll(|_| panic!("no lines expected")).unwrap(), 0);
        assert_eq!(tail.position(), 0);
    }

    #[test]
    fn reads_only_new_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        let mut tail = LogTail::new(&log);

        append(&log, "first\nsecond\n");
        assert_eq!(collect(&mut tail), vec!["first", "second"]);

        append(&log, "third\n");
        assert_eq!(collect(&mut tail), vec!["third"]);
        assert!(collect(&mut tail).is_empty());
        assert_eq!(tail.position(), std::fs::metadata(&log).unwrap().len());
    }

    #[test]
    fn partial_trailing_line_waits_for_newline() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        let mut tail = LogTail::new(&log);

        append(&log, "ready\n✅ All tests");
        assert_eq!(collect(&mut tail), vec!["ready"]);
        assert_eq!(tail.position(), "ready\n".len() as u64);

        append(&log, " passed (4/4)\n");
        assert_eq!(collect(&mut tail), vec!["✅ All tests passed (4/4)"]);
    }

    #[test]
    fn crlf_and_blank_lines_are_normalized() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        let mut tail = LogTail::new(&log);

        append(&log, "one\r\n\r\n   \ntwo\n");
        assert_eq!(collect(&mut tail), vec!["one", "two"]);
    }

    #[test]
    fn truncated_log_is_read_from_the_start() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        append(&log, "short\n");

        let mut tail = LogTail::with_position(&log, 10_000);
        assert_eq!(collect(&mut tail), vec!["short"]);
        assert_eq!(tail.position(), "short\n".len() as u64);

        append(&log, "after\n");
        assert_eq!(collect(&mut tail), vec!["after"]);
    }

    #[test]
    fn rewritten_shorter_log_delivers_its_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        append(&log, "[main/INFO]: loading an earlier session of the game\n[main/INFO]: done\n");
        let mut tail = LogTail::new(&log);
        assert_eq!(collect(&mut tail).len(), 2);

        std::fs::write(&log, "Some tests failed (2/4)\n").unwrap();
        assert_eq!(collect(&mut tail), vec!["Some tests failed (2/4)"]);
    }

    #[cfg(unix)]
    #[test]
    fn replaced_log_is_followed_even_when_longer() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        append(&log, "old\n");
        let mut tail = LogTail::new(&log);
        assert_eq!(collect(&mut tail), vec!["old"]);

        std::fs::rename(&log, tmp.path().join("2026-01-01-1.log")).unwrap();
        append(&log, "[main/INFO]: new session\n✅ All tests passed (4/4)\n");
        assert_eq!(
            collect(&mut tail),
            vec!["[main/INFO]: new session", "✅ All tests passed (4/4)"]
        );
    }

    #[test]
    fn cursor_at_end_skips_existing_content() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        assert_eq!(LogCursor::at_end_of(&log).get(), 0);

        append(&log, "✅ All tests passed (4/4)\n");
        let cursor = LogCursor::at_end_of(&log);
        assert_eq!(cursor.get(), std::fs::metadata(&log).unwrap().len());

        let mut tail = LogTail::with_position(&log, cursor.get());
        assert!(collect(&mut tail).is_empty());
        append(&log, "fresh\n");
        assert_eq!(collect(&mut tail), vec!["fresh"]);
    }

    #[test]
    fn watcher_feeds_tracker_and_advances_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        let tracker = StatusTracker::new(StatusPatterns::default());
        let cursor = LogCursor::new();

        let watcher = TailWatcher::start(
            &log,
            cursor.clone(),
            tracker.clone(),
            Duration::from_millis(10),
        )
        .unwrap();

        // File appears only after the watcher is running.
        std::thread::sleep(Duration::from_millis(40));
        append(&log, "[INFO] loading\n[INFO] ✅ All tests passed (4/4)\n");

        let mut state = StatusState::Unknown;
        for _ in 0..100 {
            state = tracker.get();
            if state != StatusState::Unknown {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        watcher.stop();

        assert_eq!(state, StatusState::Pass);
        assert_eq!(cursor.get(), std::fs::metadata(&log).unwrap().len());
    }

    #[test]
    fn watcher_resumes_from_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("latest.log");
        append(&log, "Some tests failed from an earlier session\n");

        let tracker = StatusTracker::new(StatusPatterns::default());
        let cursor = LogCursor::new();
        cursor.set(std::fs::metadata(&log).unwrap().len());

        let watcher =
            TailWatcher::start(&log, cursor, tracker.clone(), Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        watcher.stop();

        assert_eq!(tracker.get(), StatusState::Unknown);
    }

    proptest! {
        #[test]
        fn each_line_delivered_exactly_once(
            lines in prop::collection::vec("[a-z0-9 ]{1,12}", 1..12),
            splits in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let log = tmp.path().join("latest.log");
            let text: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let bytes = text.as_bytes();

            let mut cuts: Vec<usize> = splits.iter().map(|i| i.index(bytes.len() + 1)).collect();
            cuts.push(bytes.len());
            cuts.sort_unstable();

            let mut tail = LogTail::new(&log);
            let mut seen = Vec::new();
            let mut written = 0;
            for cut in cuts {
                let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&log).unwrap();
                f.write_all(&bytes[written..cut]).unwrap();
                written = cut;
                tail.poll(|l| seen.push(l.to_string())).unwrap();
            }
            tail.poll(|l| seen.push(l.to_string())).unwrap();

            let expected: Vec<String> = lines
                .iter()
                .filter(|l| !l.trim().is_empty())
                .cloned()
                .collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
