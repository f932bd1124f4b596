//! Shared vocabulary for per-VM provisioning progress.
//!
//! `ProvisioningState` records how far a VM has come through the pipeline.
//! `PipelineStep` is the ordered list of steps the provisioner runs. Each
//! step either completes a state or is safe to repeat on resume.

use std::fmt;
use std::str::FromStr;

/// How far a VM has come through provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProvisioningState {
    /// Spec created, nothing done on the hypervisor yet.
    Planned,
    /// Domain cloned from the template.
    Cloned,
    /// vCPU and memory limits written to the persistent config.
    Configured,
    /// Default NIC replaced by the bridge NIC.
    NetworkAttached,
    /// Network config uploaded and SSH host keys regenerated in the image.
    Customized,
    /// Domain started.
    Started,
    /// Hostname set, rebooted, back on SSH. Provisioning is complete.
    Reachable,
    /// A step failed. The record keeps the last completed state.
    Failed,
}

impl ProvisioningState {
    pub const ALL: [ProvisioningState; 8] = [
        ProvisioningState::Planned,
        ProvisioningState::Cloned,
        ProvisioningState::Configured,
        ProvisioningState::NetworkAttached,
        ProvisioningState::Customized,
        ProvisioningState::Started,
        ProvisioningState::Reachable,
        ProvisioningState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningState::Planned => "planned",
            ProvisioningState::Cloned => "cloned",
            ProvisioningState::Configured => "configured",
            ProvisioningState::NetworkAttached => "network-attached",
            ProvisioningState::Customized => "customized",
            ProvisioningState::Started => "started",
            ProvisioningState::Reachable => "reachable",
            ProvisioningState::Failed => "failed",
        }
    }

    /// Steps still to run for a VM whose last completed state is `self`.
    pub fn remaining_steps(self) -> &'static [PipelineStep] {
        let done = PipelineStep::ALL
            .iter()
            .rposition(|s| s.completes().is_some_and(|c| c <= self))
            .map_or(0, |i| i + 1);
        &PipelineStep::ALL[done..]
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown provisioning state '{s}'"))
    }
}

/// One step of the provisioning pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Clone,
    Configure,
    AttachNetwork,
    UploadNetworkConfig,
    RegenerateHostKeys,
    Start,
    WaitReachable,
    SetHostname,
    Reboot,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 9] = [
        PipelineStep::Clone,
        PipelineStep::Configure,
        PipelineStep::AttachNetwork,
        PipelineStep::UploadNetworkConfig,
        PipelineStep::RegenerateHostKeys,
        PipelineStep::Start,
        PipelineStep::WaitReachable,
        PipelineStep::SetHostname,
        PipelineStep::Reboot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStep::Clone => "clone",
            PipelineStep::Configure => "configure",
            PipelineStep::AttachNetwork => "attach-network",
            PipelineStep::UploadNetworkConfig => "upload-network-config",
            PipelineStep::RegenerateHostKeys => "regenerate-host-keys",
            PipelineStep::Start => "start",
            PipelineStep::WaitReachable => "wait-reachable",
            PipelineStep::SetHostname => "set-hostname",
            PipelineStep::Reboot => "reboot",
        }
    }

    /// Human-readable label for progress output.
    pub fn title(self) -> &'static str {
        match self {
            PipelineStep::Clone => "Cloning template",
            PipelineStep::Configure => "Setting vCPU and memory",
            PipelineStep::AttachNetwork => "Attaching bridge interface",
            PipelineStep::UploadNetworkConfig => "Uploading network config",
            PipelineStep::RegenerateHostKeys => "Regenerating SSH host keys",
            PipelineStep::Start => "Starting VM",
            PipelineStep::WaitReachable => "Waiting for SSH",
            PipelineStep::SetHostname => "Setting hostname",
            PipelineStep::Reboot => "Rebooting",
        }
    }

    /// 1-based position in the pipeline.
    pub fn number(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }

    /// The state recorded once this step succeeds, if it completes one.
    pub fn completes(self) -> Option<ProvisioningState> {
        match self {
            PipelineStep::Clone => Some(ProvisioningState::Cloned),
            PipelineStep::Configure => Some(ProvisioningState::Configured),
            PipelineStep::AttachNetwork => Some(ProvisioningState::NetworkAttached),
            PipelineStep::RegenerateHostKeys => Some(ProvisioningState::Customized),
            PipelineStep::Start => Some(ProvisioningState::Started),
            PipelineStep::Reboot => Some(ProvisioningState::Reachable),
            PipelineStep::UploadNetworkConfig
            | PipelineStep::WaitReachable
            | PipelineStep::SetHostname => None,
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown pipeline step '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_runs_everything() {
        assert_eq!(
            ProvisioningState::Planned.remaining_steps(),
            &PipelineStep::ALL[..]
        );
    }

    #[test]
    fn reachable_runs_nothing() {
        assert!(ProvisioningState::Reachable.remaining_steps().is_empty());
    }

    #[test]
    fn resume_after_network_attached_reuploads_config() {
        let steps = ProvisioningState::NetworkAttached.remaining_steps();
        assert_eq!(steps[0], PipelineStep::UploadNetworkConfig);
        assert_eq!(steps.len(), 6);
    }

    #[test]
    fn resume_after_started_waits_for_ssh() {
        assert_eq!(
            ProvisioningState::Started.remaining_steps(),
            &[
                PipelineStep::WaitReachable,
                PipelineStep::SetHostname,
                PipelineStep::Reboot
            ]
        );
    }

    #[test]
    fn completed_states_are_strictly_increasing() {
        let completed: Vec<_> = PipelineStep::ALL
            .iter()
            .filter_map(|s| s.completes())
            .collect();
        assert!(completed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(completed.last(), Some(&ProvisioningState::Reachable));
    }

    #[test]
    fn names_round_trip() {
        for st in ProvisioningState::ALL {
            assert_eq!(st.as_str().parse::<ProvisioningState>().unwrap(), st);
        }
        for step in PipelineStep::ALL {
            assert_eq!(step.as_str().parse::<PipelineStep>().unwrap(), step);
        }
        assert!("bogus".parse::<ProvisioningState>().is_err());
    }

    #[test]
    fn step_numbers_are_one_based() {
        assert_eq!(PipelineStep::Clone.number(), 1);
        assert_eq!(PipelineStep::Reboot.number(), 9);
    }
}
