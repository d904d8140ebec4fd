use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct EvaluationTelemetry {
    examples_completed: AtomicU64,
    target_failures: AtomicU64,
    units_scored: AtomicU64,
    unit_failures: AtomicU64,
    in_flight: AtomicU64,
}

impl EvaluationTelemetry {
    pub fn inc_examples_completed(&self) {
        self.examples_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_target_failures(&self) {
        self.target_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_units_scored(&self, count: u64) {
        self.units_scored.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_unit_failures(&self, count: u64) {
        self.unit_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EvaluationTelemetrySnapshot {
        EvaluationTelemetrySnapshot {
            examples_completed: self.examples_completed.load(Ordering::Relaxed),
            target_failures: self.target_failures.load(Ordering::Relaxed),
            units_scored: self.units_scored.load(Ordering::Relaxed),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvaluationTelemetrySnapshot {
    pub examples_completed: u64,
    pub target_failures: u64,
    pub units_scored: u64,
    pub unit_failures: u64,
    pub in_flight: u64,
}
