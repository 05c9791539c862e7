// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Prometheus metrics for admission decisions and sweeps.

use crate::limiter::Decision;
use crate::sweeper::SweepReport;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric handles sharing one registry. Cloning is cheap.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    decisions: IntCounterVec,
    decision_seconds: Histogram,
    swept: IntCounter,
}

impl Metrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let decisions = IntCounterVec::new(
            Opts::new("post_decisions_total", "Admission decisions by outcome"),
            &["outcome", "class"],
        )?;
        let decision_seconds = Histogram::with_opts(
            HistogramOpts::new("post_decision_seconds", "Time spent deciding a submission")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5]),
        )?;
        let swept = IntCounter::new(
            "post_sweep_removed_total",
            "Expired counters removed by the retention sweeper",
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(decision_seconds.clone()))?;
        registry.register(Box::new(swept.clone()))?;

        Ok(Self {
            registry,
            decisions,
            decision_seconds,
            swept,
        })
    }

    /// Count a decision. Contract violations and storage failures are
    /// labelled apart from rate limit rejections.
    pub fn observe_decision(&self, decision: &Decision, elapsed: Duration) {
        let (outcome, class) = match decision {
            Decision::Accept => ("accepted", "accepted"),
            Decision::Reject(r) => (r.reason.code(), r.reason.class()),
        };
        self.decisions.with_label_values(&[outcome, class]).inc();
        self.decision_seconds.observe(elapsed.as_secs_f64());
    }

    /// Count records removed by a sweep.
    pub fn observe_sweep(&self, report: &SweepReport) {
        self.swept.inc_by(report.removed as u64);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
