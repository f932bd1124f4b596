//! Plain text observer: no ANSI, suitable for piped output.

use crate::decommission::{DestroyKind, DestroyOutcome, DestroyReport};
use crate::planner::VmSpec;
use crate::provision::{FleetReport, OutcomeKind, VmOutcome};
use crate::vm_state::PipelineStep;

use super::Observer;

pub struct PlainObserver {
    /// Only print per-VM results and the summary.
    quiet: bool,
}

impl PlainObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

fn step_prefix(spec: &VmSpec, step: PipelineStep) -> String {
    format!("[{}] [{}/{}]", spec.name, step.number(), PipelineStep::ALL.len())
}

pub fn describe_outcome(outcome: &VmOutcome) -> String {
    match &outcome.kind {
        OutcomeKind::Provisioned { resumed_from: None } => {
            format!("{}: reachable at {}", outcome.name, outcome.ip)
        }
        OutcomeKind::Provisioned {
            resumed_from: Some(state),
        } => format!(
            "{}: reachable at {} (resumed after {state})",
            outcome.name, outcome.ip
        ),
        OutcomeKind::AlreadyReachable => format!("{}: already reachable", outcome.name),
        OutcomeKind::Failed { step, error } => {
            format!("{}: FAILED at {step}: {error}", outcome.name)
        }
        OutcomeKind::Skipped => format!("{}: skipped", outcome.name),
    }
}

pub fn describe_destroy(outcome: &DestroyOutcome) -> String {
    match &outcome.kind {
        DestroyKind::Destroyed => format!("{}: destroyed", outcome.name),
        DestroyKind::NotFound => format!("{}: does not exist, nothing to do", outcome.name),
        DestroyKind::Failed { error } => format!("{}: FAILED: {error}", outcome.name),
    }
}

pub fn fleet_summary(report: &FleetReport) -> String {
    format!(
        "{} provisioned, {} already reachable, {} failed, {} skipped",
        report.count("provisioned"),
        report.count("already-reachable"),
        report.count("failed"),
        report.count("skipped"),
    )
}

pub fn destroy_summary(report: &DestroyReport) -> String {
    format!(
        "{} destroyed, {} not found, {} failed",
        report.count("destroyed"),
        report.count("not-found"),
        report.count("failed"),
    )
}

impl Observer for PlainObserver {
    fn fleet_started(&self, specs: &[VmSpec]) {
        if !self.quiet {
            println!("provisioning {} VM(s)", specs.len());
        }
    }

    fn step_started(&self, spec: &VmSpec, step: PipelineStep) {
        if !self.quiet {
            println!("{} {}", step_prefix(spec, step), step.title());
        }
    }

    fn step_finished(&self, spec: &VmSpec, step: PipelineStep) {
        if !self.quiet {
            println!("{} \u{2713} {}", step_prefix(spec, step), step.title());
        }
    }

    fn vm_finished(&self, outcome: &VmOutcome) {
        println!("{}", describe_outcome(outcome));
    }

    fn fleet_finished(&self, report: &FleetReport) {
        println!("{}", fleet_summary(report));
    }

    fn destroy_finished(&self, outcome: &DestroyOutcome) {
        println!("{}", describe_destroy(outcome));
    }

    fn destroy_summary(&self, report: &DestroyReport) {
        println!("{}", destroy_summary(report));
    }
}
