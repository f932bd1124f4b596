//! Output rendering for fleet commands.
//!
//! The provisioner and decommissioner report progress through an
//! [`Observer`]. Different implementations handle interactive TTY, plain
//! text, and JSON output modes.
//!
//! Fleet members run concurrently on a single task, so observer calls for
//! different VMs interleave. Methods take `&self`; implementations keep any
//! mutable rendering state behind a `Mutex`.

pub mod interactive;
pub mod json;
pub mod plain;

use crate::decommission::{DestroyOutcome, DestroyReport};
use crate::provision::{FleetReport, VmOutcome};
use crate::planner::VmSpec;
use crate::vm_state::PipelineStep;

/// Controls how much the terminal observers print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One spinner per VM, step titles in place.
    Normal,
    /// Like Normal, plus tracing output on stderr.
    Verbose,
    /// Final per-VM results only.
    Quiet,
    /// No ANSI, one line per event (for piped/non-TTY).
    Plain,
}

/// Every method has an empty default so renderers only implement what
/// they show.
pub trait Observer {
    fn fleet_started(&self, _specs: &[VmSpec]) {}
    fn step_started(&self, _spec: &VmSpec, _step: PipelineStep) {}
    fn step_finished(&self, _spec: &VmSpec, _step: PipelineStep) {}
    fn vm_finished(&self, _outcome: &VmOutcome) {}
    fn fleet_finished(&self, _report: &FleetReport) {}

    fn destroy_started(&self, _names: &[String]) {}
    fn destroy_finished(&self, _outcome: &DestroyOutcome) {}
    fn destroy_summary(&self, _report: &DestroyReport) {}
}

/// Collects events as strings so tests can assert on ordering.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
impl Observer for RecordingObserver {
    fn step_started(&self, spec: &VmSpec, step: PipelineStep) {
        self.push(format!("{}:{step}:started", spec.name));
    }

    fn step_finished(&self, spec: &VmSpec, step: PipelineStep) {
        self.push(format!("{}:{step}:done", spec.name));
    }

    fn vm_finished(&self, outcome: &VmOutcome) {
        self.push(format!("{}:{}", outcome.name, outcome.kind.label()));
    }

    fn destroy_finished(&self, outcome: &DestroyOutcome) {
        self.push(format!("{}:{}", outcome.name, outcome.kind.label()));
    }
}
