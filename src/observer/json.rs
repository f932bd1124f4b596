//! JSON-lines observer: one object per event on stdout.

use facet::Facet;

use crate::decommission::{DestroyKind, DestroyOutcome, DestroyReport};
use crate::planner::VmSpec;
use crate::provision::{FleetReport, OutcomeKind, VmOutcome};
use crate::vm_state::PipelineStep;

use super::Observer;

pub struct JsonObserver;

#[derive(Facet)]
struct StepJson {
    event: String,
    vm: String,
    step: String,
    number: u32,
}

#[derive(Facet)]
struct VmJson {
    event: String,
    vm: String,
    serial: u32,
    ip: String,
    status: String,
    resumed_from: Option<String>,
    failed_step: Option<String>,
    error: Option<String>,
}

#[derive(Facet)]
struct DestroyJson {
    event: String,
    vm: String,
    status: String,
    error: Option<String>,
}

#[derive(Facet)]
struct SummaryJson {
    event: String,
    total: u32,
    failed: u32,
}

/// Print one JSON line, or log why it could not be serialized.
pub fn emit<E: std::fmt::Display>(line: Result<String, E>) {
    match line {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("JSON serialization failed: {e}"),
    }
}

fn step_event(event: &str, spec: &VmSpec, step: PipelineStep) {
    emit(facet_json::to_string(&StepJson {
        event: event.into(),
        vm: spec.name.clone(),
        step: step.to_string(),
        number: step.number() as u32,
    }));
}

impl Observer for JsonObserver {
    fn step_started(&self, spec: &VmSpec, step: PipelineStep) {
        step_event("step_started", spec, step);
    }

    fn step_finished(&self, spec: &VmSpec, step: PipelineStep) {
        step_event("step_finished", spec, step);
    }

    fn vm_finished(&self, outcome: &VmOutcome) {
        let (resumed_from, failed_step, error) = match &outcome.kind {
            OutcomeKind::Provisioned { resumed_from } => {
                (resumed_from.map(|s| s.to_string()), None, None)
            }
            OutcomeKind::Failed { step, error } => {
                (None, Some(step.to_string()), Some(error.clone()))
            }
            OutcomeKind::AlreadyReachable | OutcomeKind::Skipped => (None, None, None),
        };
        emit(facet_json::to_string(&VmJson {
            event: "vm".into(),
            vm: outcome.name.clone(),
            serial: outcome.serial,
            ip: outcome.ip.to_string(),
            status: outcome.kind.label().into(),
            resumed_from,
            failed_step,
            error,
        }));
    }

    fn fleet_finished(&self, report: &FleetReport) {
        emit(facet_json::to_string(&SummaryJson {
            event: "summary".into(),
            total: report.outcomes.len() as u32,
            failed: report.failed_count() as u32,
        }));
    }

    fn destroy_finished(&self, outcome: &DestroyOutcome) {
        let error = match &outcome.kind {
            DestroyKind::Failed { error } => Some(error.clone()),
            DestroyKind::Destroyed | DestroyKind::NotFound => None,
        };
        emit(facet_json::to_string(&DestroyJson {
            event: "destroy".into(),
            vm: outcome.name.clone(),
            status: outcome.kind.label().into(),
            error,
        }));
    }

    fn destroy_summary(&self, report: &DestroyReport) {
        emit(facet_json::to_string(&SummaryJson {
            event: "summary".into(),
            total: report.outcomes.len() as u32,
            failed: report.failed_count() as u32,
        }));
    }
}
