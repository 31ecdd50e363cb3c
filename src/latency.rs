//! Per-source call accounting for the aggregator.
//!
//! Every guarded upstream call is recorded with its wall time and how it
//! ended. Outcome counters cover the life of the process; the median and tail
//! figures come from a short window of recent durations per source.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ProfileError;
use crate::sources::SourceKind;

const RECENT_CALLS: usize = 128;

/// How a guarded call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    Timeout,
    Failed,
}

impl CallOutcome {
    pub fn of<T>(result: &Result<T, ProfileError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Ok,
            Err(ProfileError::Timeout { .. }) => CallOutcome::Timeout,
            Err(_) => CallOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLatency {
    pub source: SourceKind,
    pub calls: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub median_ms: u64,
    pub p95_ms: u64,
    pub slowest_ms: u64,
    pub last_call_at: Option<DateTime<Utc>>,
}

impl SourceLatency {
    /// Calls that ended in a timeout or an upstream error.
    pub fn degraded(&self) -> u64 {
        self.timeouts + self.failures
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub generated_at: DateTime<Utc>,
    /// Most degraded sources first, then slowest.
    pub sources: Vec<SourceLatency>,
}

impl LatencySnapshot {
    pub fn source(&self, kind: SourceKind) -> Option<&SourceLatency> {
        self.sources.iter().find(|s| s.source == kind)
    }
}

#[derive(Default)]
struct SourceCalls {
    recent: VecDeque<Duration>,
    calls: u64,
    timeouts: u64,
    failures: u64,
    last_call_at: Option<DateTime<Utc>>,
}

impl SourceCalls {
    fn summarize(&self, source: SourceKind) -> SourceLatency {
        let mut sorted: Vec<Duration> = self.recent.iter().copied().collect();
        sorted.sort_unstable();

        SourceLatency {
            source,
            calls: self.calls,
            timeouts: self.timeouts,
            failures: self.failures,
            median_ms: millis(quantile(&sorted, 0.5)),
            p95_ms: millis(quantile(&sorted, 0.95)),
            slowest_ms: millis(sorted.last().copied().unwrap_or_default()),
            last_call_at: self.last_call_at,
        }
    }
}

/// Shared by the aggregator (writer) and the service (reader).
#[derive(Default)]
pub struct LatencyRecorder {
    sources: Mutex<HashMap<SourceKind, SourceCalls>>,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: SourceKind, elapsed: Duration, outcome: CallOutcome) {
        let mut sources = self.sources.lock();
        let calls = sources.entry(source).or_default();

        calls.calls += 1;
        match outcome {
            CallOutcome::Ok => {}
            CallOutcome::Timeout => calls.timeouts += 1,
            CallOutcome::Failed => calls.failures += 1,
        }
        if calls.recent.len() == RECENT_CALLS {
            calls.recent.pop_front();
        }
        calls.recent.push_back(elapsed);
        calls.last_call_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let mut sources: Vec<SourceLatency> = self
            .sources
            .lock()
            .iter()
            .map(|(kind, calls)| calls.summarize(*kind))
            .collect();

        sources.sort_by(|a, b| {
            b.degraded()
                .cmp(&a.degraded())
                .then(b.p95_ms.cmp(&a.p95_ms))
                .then(a.source.cmp(&b.source))
        });

        LatencySnapshot {
            generated_at: Utc::now(),
            sources,
        }
    }
}

/// Nearest-rank quantile over an ascending slice.
fn quantile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
