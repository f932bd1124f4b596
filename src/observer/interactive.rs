//! Interactive TTY observer: one spinner line per VM.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::decommission::{DestroyKind, DestroyOutcome, DestroyReport};
use crate::planner::VmSpec;
use crate::provision::{FleetReport, OutcomeKind, VmOutcome};
use crate::vm_state::PipelineStep;

use super::Observer;
use super::plain::{describe_destroy, describe_outcome, destroy_summary, fleet_summary};

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} \u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn skipped_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} - {msg:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Spinner per VM, keyed by name. Bars are added in fleet order so the
/// display stays sorted by serial while pipelines interleave.
pub struct InteractiveObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    /// Spinners without step titles.
    quiet: bool,
}

impl InteractiveObserver {
    pub fn new(quiet: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            quiet,
        }
    }

    fn add_bars<'a>(&self, names: impl Iterator<Item = &'a str>, message: &str) {
        let names: Vec<&str> = names.collect();
        let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        for name in names {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style());
            bar.set_prefix(format!("{name:width$}"));
            bar.set_message(message.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            bars.insert(name.to_string(), bar);
        }
    }

    fn with_bar(&self, name: &str, f: impl FnOnce(&ProgressBar)) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.get(name) {
            f(bar);
        }
    }

    fn finish(&self, name: &str, style: ProgressStyle, message: String) {
        self.with_bar(name, |bar| {
            bar.set_style(style);
            bar.finish_with_message(message);
        });
    }
}

impl Observer for InteractiveObserver {
    fn fleet_started(&self, specs: &[VmSpec]) {
        self.add_bars(specs.iter().map(|s| s.name.as_str()), "waiting");
    }

    fn step_started(&self, spec: &VmSpec, step: PipelineStep) {
        let message = if self.quiet {
            "provisioning".to_string()
        } else {
            format!(
                "[{}/{}] {}",
                step.number(),
                PipelineStep::ALL.len(),
                step.title()
            )
        };
        self.with_bar(&spec.name, |bar| bar.set_message(message));
    }

    fn vm_finished(&self, outcome: &VmOutcome) {
        let (style, message) = match &outcome.kind {
            OutcomeKind::Provisioned { .. } => (done_style(), format!("ready at {}", outcome.ip)),
            OutcomeKind::AlreadyReachable => (done_style(), "already reachable".to_string()),
            OutcomeKind::Failed { step, error } => {
                (failed_style(), format!("failed at {step}: {error}"))
            }
            OutcomeKind::Skipped => (skipped_style(), "skipped".to_string()),
        };
        self.finish(&outcome.name, style, message);
        // Keep the full line in scrollback even if the terminal is narrow.
        if outcome.is_failed() {
            self.multi.println(describe_outcome(outcome)).ok();
        }
    }

    fn fleet_finished(&self, report: &FleetReport) {
        self.multi.println(fleet_summary(report)).ok();
    }

    fn destroy_started(&self, names: &[String]) {
        self.add_bars(names.iter().map(String::as_str), "destroying");
    }

    fn destroy_finished(&self, outcome: &DestroyOutcome) {
        let (style, message) = match &outcome.kind {
            DestroyKind::Destroyed => (done_style(), "destroyed".to_string()),
            DestroyKind::NotFound => (skipped_style(), "does not exist".to_string()),
            DestroyKind::Failed { error } => (failed_style(), format!("failed: {error}")),
        };
        self.finish(&outcome.name, style, message);
        if matches!(outcome.kind, DestroyKind::Failed { .. }) {
            self.multi.println(describe_destroy(outcome)).ok();
        }
    }

    fn destroy_summary(&self, report: &DestroyReport) {
        self.multi.println(destroy_summary(report)).ok();
    }
}
