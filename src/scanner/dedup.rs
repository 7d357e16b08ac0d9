use chrono::{DateTime, Duration, Utc};

pub const DEDUP_WINDOW_MS: i64 = 2000;

/// Collapses the stream of identical decodes produced while one code stays in view.
///
/// Only the most recently accepted `(code, seen_at)` pair is remembered, so
/// alternating between two codes always passes.
#[derive(Debug, Clone)]
pub struct ScanDeduplicator {
    window: Duration,
    last: Option<(String, DateTime<Utc>)>,
}

impl Default for ScanDeduplicator {
    fn default() -> Self {
        Self::new(Duration::milliseconds(DEDUP_WINDOW_MS))
    }
}

impl ScanDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn accept(&mut self, code: &str, now: DateTime<Utc>) -> bool {
        let accepted = match &self.last {
            None => true,
            Some((last_code, _)) if last_code != code => true,
            Some((_, seen_at)) => now.signed_duration_since(*seen_at) >= self.window,
        };

        if accepted {
            self.last = Some((code.to_string(), now));
        }
        accepted
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
