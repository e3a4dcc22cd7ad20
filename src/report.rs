//! Run timers, summaries and failure records

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::scheduler::{RunSummary, RunTermination};
use crate::stability::Stability;

/// A start/stop accumulator.
#[derive(Debug, Default)]
pub struct Timer {
    total: Duration,
    started: Option<Instant>,
}

impl Timer {
    pub fn start(&mut self) {
        debug_assert!(self.started.is_none(), "timer started twice");
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    pub fn seconds(&self) -> f64 {
        self.total.as_secs_f64()
    }
}

/// The coarse per-run timers the report carries.
#[derive(Debug, Default)]
pub struct Timers {
    pub setup: Timer,
    pub simulation: Timer,
}

/// Serializable end-of-run summary.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub rank: usize,
    pub ranks: usize,
    pub lattice: &'static str,
    pub local_sites: usize,
    pub steps: u64,
    pub resets: u32,
    pub termination: &'static str,
    pub final_stability: &'static str,
    pub setup_seconds: f64,
    pub simulation_seconds: f64,
    /// Wall time stamp, filled by the caller (the library itself never
    /// consults a clock source beyond monotonic timers).
    pub completed_at: String,
}

fn termination_name(termination: RunTermination) -> &'static str {
    match termination {
        RunTermination::MaxSteps => "max-steps",
        RunTermination::Converged => "converged",
        RunTermination::ExternalTerminate => "terminated",
    }
}

fn stability_name(stability: Stability) -> &'static str {
    match stability {
        Stability::Undefined => "undefined",
        Stability::Unstable => "unstable",
        Stability::Stable => "stable",
        Stability::StableAndConverged => "stable-and-converged",
    }
}

impl RunReport {
    pub fn new(
        rank: usize,
        ranks: usize,
        lattice: &'static str,
        local_sites: usize,
        summary: &RunSummary,
        timers: &Timers,
        completed_at: String,
    ) -> Self {
        RunReport {
            rank,
            ranks,
            lattice,
            local_sites,
            steps: summary.steps,
            resets: summary.resets,
            termination: termination_name(summary.termination),
            final_stability: stability_name(summary.final_stability),
            setup_seconds: timers.setup.seconds(),
            simulation_seconds: timers.simulation.seconds(),
            completed_at,
        }
    }
}

/// Rank-tagged record written when a run aborts.
#[derive(Debug, Serialize)]
pub struct FailureRecord {
    pub rank: usize,
    pub step: u64,
    pub stability: &'static str,
    pub error: String,
}

impl FailureRecord {
    pub fn new(rank: usize, step: u64, stability: Stability, error: String) -> Self {
        FailureRecord { rank, step, stability: stability_name(stability), error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates_across_windows() {
        let mut timer = Timer::default();
        timer.start();
        timer.stop();
        timer.start();
        timer.stop();
        assert!(timer.seconds() >= 0.0);
        // Stopping an unstarted timer is a no-op.
        timer.stop();
    }

    #[test]
    fn report_serialises_to_json() {
        let summary = RunSummary {
            termination: RunTermination::Converged,
            steps: 128,
            resets: 0,
            final_stability: Stability::StableAndConverged,
        };
        let timers = Timers::default();
        let report =
            RunReport::new(0, 1, "D3Q15", 64, &summary, &timers, "2026-01-01T00:00:00Z".into());
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("stable-and-converged"));
        assert!(json.contains("converged"));
    }
}
