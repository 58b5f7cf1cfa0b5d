//! Analysis probes polled by the interpreter.
//!
//! A probe answers one question: does it look like someone is watching?
//! The interpreter never aborts on a positive answer; it quietly corrupts
//! its own decoding instead.

use std::time::{Duration, Instant};

pub trait AnalysisProbe {
    fn analysis_detected(&mut self) -> bool;
}

impl<F: FnMut() -> bool> AnalysisProbe for F {
    fn analysis_detected(&mut self) -> bool {
        self()
    }
}

/// Never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl AnalysisProbe for NoProbe {
    fn analysis_detected(&mut self) -> bool {
        false
    }
}

/// Fires when more wall-clock time than `threshold` passes between two
/// consecutive polls, the usual symptom of single-stepping.
#[derive(Debug, Clone)]
pub struct TimingProbe {
    threshold: Duration,
    last: Option<Instant>,
}

impl TimingProbe {
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(250);

    pub fn new(threshold: Duration) -> Self {
        TimingProbe { threshold, last: None }
    }
}

impl Default for TimingProbe {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl AnalysisProbe for TimingProbe {
    fn analysis_detected(&mut self) -> bool {
        let now = Instant::now();
        let slow = self
            .last
            .is_some_and(|last| now.duration_since(last) > self.threshold);
        self.last = Some(now);
        slow
    }
}
