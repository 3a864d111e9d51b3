//! Download progress tracking

use std::fmt;

use tracing::debug;

/// Progress callback: bytes written so far and the expected total, if known
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Counts bytes as they are written and reports progress
pub struct ProgressWriter {
    total: Option<u64>,
    current: u64,
    last_reported: u64,
    report_every: u64,
    on_progress: Option<ProgressCallback>,
}

impl ProgressWriter {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            current: 0,
            last_reported: 0,
            report_every: 1024 * 1024,
            on_progress: None,
        }
    }

    /// Replace the default debug log with a callback
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_report_interval(mut self, bytes: u64) -> Self {
        self.report_every = bytes.max(1);
        self
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Record `n` more bytes written
    pub fn advance(&mut self, n: u64) {
        self.current += n;
        let done = self.total.map(|t| self.current >= t).unwrap_or(false);
        if self.current - self.last_reported >= self.report_every || done {
            self.last_reported = self.current;
            self.report();
        }
    }

    fn report(&self) {
        match &self.on_progress {
            Some(callback) => callback(self.current, self.total),
            None => match self.total {
                Some(total) if total > 0 => debug!(
                    "Downloaded {} of {} bytes ({:.1}%)",
                    self.current,
                    total,
                    self.current as f64 / total as f64 * 100.0
                ),
                _ => debug!("Downloaded {} bytes", self.current),
            },
        }
    }
}

impl fmt::Debug for ProgressWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressWriter")
            .field("total", &self.total)
            .field("current", &self.current)
            .finish()
    }
}
