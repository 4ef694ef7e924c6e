use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timing and outcome of one turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnMetrics {
    pub session: String,
    #[serde(with = "crate::config::secs")]
    pub duration: Duration,
    pub tool_calls: usize,
    pub success: bool,
}

impl TurnMetrics {
    pub fn success_rate(turns: &[Self]) -> f32 {
        if turns.is_empty() {
            return 0.0;
        }
        let successes = turns.iter().filter(|t| t.success).count();
        successes as f32 / turns.len() as f32
    }
}

#[derive(Default, Clone)]
pub struct MetricsTracker {
    turns: Arc<Mutex<Vec<TurnMetrics>>>,
}

impl MetricsTracker {
    pub fn start_turn(&self, session: impl Into<String>) -> TurnGuard {
        TurnGuard {
            session: session.into(),
            start: Instant::now(),
            tool_calls: 0,
            metrics: self.clone(),
        }
    }

    pub fn turns(&self) -> Vec<TurnMetrics> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TurnMetrics>> {
        self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct TurnGuard {
    session: String,
    start: Instant,
    tool_calls: usize,
    metrics: MetricsTracker,
}

impl TurnGuard {
    pub fn record_tool_calls(&mut self, count: usize) {
        self.tool_calls += count;
    }

    pub fn finish(self, success: bool) -> TurnMetrics {
        let turn = TurnMetrics {
            session: self.session,
            duration: self.start.elapsed(),
            tool_calls: self.tool_calls,
            success,
        };
        self.metrics.lock().push(turn.clone());
        turn
    }
}
