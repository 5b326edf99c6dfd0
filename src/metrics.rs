// =============================================================================
// metrics.rs - WHAT HAPPENED THIS RUN
// =============================================================================
//
// A run is one pass of monitor + analysis. Every stage bumps an atomic
// counter here instead of threading tallies through return values, and
// errors are collected as short strings (first ten kept) so the Telegram
// summary and the workflow outputs can show something useful.
//
// At the end we take a snapshot, which is plain data: it serialises to the
// GITHUB_OUTPUT `key=value` lines and decides the process exit code.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use serde::Serialize;

/// How many error messages are kept for reporting. The counter keeps going.
pub const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Debug, Default)]
pub struct RunMetrics {
    total_found: AtomicU64,
    new_added: AtomicU64,
    pdf_uploaded: AtomicU64,
    total_pending: AtomicU64,
    analyzed: AtomicU64,
    errors: AtomicU64,
    quota_exhausted: AtomicBool,
    error_messages: Mutex<Vec<String>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_found(&self, n: usize) {
        self.total_found.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_new(&self, n: usize) {
        self.new_added.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn increment_uploaded(&self) {
        self.pdf_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, n: usize) {
        self.total_pending.store(n as u64, Ordering::Relaxed);
    }

    pub fn increment_analyzed(&self) {
        self.analyzed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one error and keep its message if there is room.
    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut messages = self.error_messages.lock();
        if messages.len() < MAX_ERROR_MESSAGES {
            messages.push(message.into());
        }
    }

    pub fn mark_quota_exhausted(&self) {
        self.quota_exhausted.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            total_found: self.total_found.load(Ordering::Relaxed),
            new_added: self.new_added.load(Ordering::Relaxed),
            pdf_uploaded: self.pdf_uploaded.load(Ordering::Relaxed),
            total_pending: self.total_pending.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            quota_exhausted: self.quota_exhausted.load(Ordering::Relaxed),
            error_messages: self.error_messages.lock().clone(),
        }
    }
}

/// Frozen view of a run's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_found: u64,
    pub new_added: u64,
    pub pdf_uploaded: u64,
    pub total_pending: u64,
    pub analyzed: u64,
    pub errors: u64,
    pub quota_exhausted: bool,
    pub error_messages: Vec<String>,
}

impl RunSummary {
    /// Non-zero only when nothing was analysed and something failed.
    pub fn exit_code(&self) -> i32 {
        if self.analyzed == 0 && self.errors > 0 {
            1
        } else {
            0
        }
    }

    pub fn output_lines(&self) -> Vec<String> {
        vec![
            format!("total_found={}", self.total_found),
            format!("new_added={}", self.new_added),
            format!("pdf_uploaded={}", self.pdf_uploaded),
            format!("total_pending={}", self.total_pending),
            format!("analyzed={}", self.analyzed),
            format!("errors={}", self.errors),
            format!("quota_exhausted={}", self.quota_exhausted),
        ]
    }

    /// Append the output lines to the file GitHub Actions named in
    /// `GITHUB_OUTPUT`. Other steps may have written to it already.
    pub fn write_github_output(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in self.output_lines() {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_messages_are_capped_but_counted() {
        let metrics = RunMetrics::new();
        for i in 0..15 {
            metrics.record_error(format!("err {}", i));
        }
        let summary = metrics.snapshot();
        assert_eq!(summary.errors, 15);
        assert_eq!(summary.error_messages.len(), MAX_ERROR_MESSAGES);
        assert_eq!(summary.error_messages[0], "err 0");
    }

    #[test]
    fn test_exit_code_only_fails_when_nothing_was_analyzed() {
        let metrics = RunMetrics::new();
        assert_eq!(metrics.snapshot().exit_code(), 0);

        metrics.record_error("삼성전자: PDF 추출 실패");
        assert_eq!(metrics.snapshot().exit_code(), 1);

        metrics.increment_analyzed();
        assert_eq!(metrics.snapshot().exit_code(), 0);
    }

    #[test]
    fn test_github_output_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_output");
        std::fs::write(&path, "previous=1\n").unwrap();

        let metrics = RunMetrics::new();
        metrics.add_found(4);
        metrics.add_new(2);
        metrics.increment_uploaded();
        metrics.set_pending(3);
        metrics.increment_analyzed();
        metrics.mark_quota_exhausted();
        metrics.snapshot().write_github_output(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "previous=1\ntotal_found=4\nnew_added=2\npdf_uploaded=1\ntotal_pending=3\nanalyzed=1\nerrors=0\nquota_exhausted=true\n"
        );
    }
}
