use chrono::Utc;
use helm_proto::LogLine;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const DEFAULT_CAPACITY: usize = 500;

/// Bounded ring of recent operational log lines, kept so the cloud's
/// `request_logs` can be answered without shipping the full tracing stream.
/// Components record the lines an operator would want to see remotely:
/// connection transitions, pairing progress, command failures.
#[derive(Debug, Clone)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LogRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn record(&self, level: &str, message: impl Into<String>) {
        let mut lines = self.inner.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Most recent lines, oldest first, capped at `limit` when given.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<LogLine> {
        let lines = self.inner.lock().unwrap();
        let take = limit.unwrap_or(lines.len()).min(lines.len());
        lines.iter().skip(lines.len() - take).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let ring = LogRing::with_capacity(3);
        for i in 0..5 {
            ring.record("info", format!("line {i}"));
        }
        let lines = ring.snapshot(None);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].message, "line 2");
        assert_eq!(lines[2].message, "line 4");
    }

    #[test]
    fn snapshot_limit_returns_newest() {
        let ring = LogRing::with_capacity(10);
        for i in 0..4 {
            ring.record("info", format!("line {i}"));
        }
        let lines = ring.snapshot(Some(2));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "line 2");
        assert_eq!(lines[1].message, "line 3");
    }
}
