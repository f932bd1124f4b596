//! Per-VM provisioning pipeline and the bounded-concurrency fleet driver.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;

use crate::backend::remote::{self, BOOT_ID_COMMAND, REBOOT_COMMAND, REGENERATE_HOST_KEYS};
use crate::backend::{Backend, CustomizeOp};
use crate::config::{Config, ErrorPolicy};
use crate::error::HerdError;
use crate::netplan::{self, NetplanOptions};
use crate::observer::Observer;
use crate::paths;
use crate::planner::VmSpec;
use crate::retry::{self, RetryPolicy};
use crate::state::StateStore;
use crate::vm_state::{PipelineStep, ProvisioningState};

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub retry: RetryPolicy,
    pub on_error: ErrorPolicy,
    pub workers: usize,
    pub reachable_timeout: Duration,
    pub reboot_timeout: Duration,
    pub poll_interval: Duration,
    pub netplan: NetplanOptions,
    pub staging_dir: PathBuf,
}

impl ProvisionSettings {
    pub fn from_config(config: &Config) -> Result<Self, HerdError> {
        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            on_error: config.error_policy()?,
            workers: config.provision.workers,
            reachable_timeout: config.reachable_timeout(),
            reboot_timeout: config.reboot_timeout(),
            poll_interval: config.poll_interval(),
            netplan: NetplanOptions {
                interface: config.provision.interface.clone(),
                nameservers: config.provision.nameservers.clone(),
            },
            staging_dir: paths::staging_dir(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The pipeline ran to the end. `resumed_from` is the last state a
    /// previous run had completed, if any.
    Provisioned {
        resumed_from: Option<ProvisioningState>,
    },
    /// Already reachable before this run; nothing was touched.
    AlreadyReachable,
    Failed {
        step: PipelineStep,
        error: String,
    },
    /// Never started because the fleet was aborted.
    Skipped,
}

impl OutcomeKind {
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeKind::Provisioned { .. } => "provisioned",
            OutcomeKind::AlreadyReachable => "already-reachable",
            OutcomeKind::Failed { .. } => "failed",
            OutcomeKind::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOutcome {
    pub name: String,
    pub serial: u32,
    pub ip: Ipv4Addr,
    pub kind: OutcomeKind,
}

impl VmOutcome {
    fn new(spec: &VmSpec, kind: OutcomeKind) -> Self {
        Self {
            name: spec.name.clone(),
            serial: spec.serial,
            ip: spec.network.ip,
            kind,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed { .. })
    }
}

/// Per-VM outcomes, ordered by serial.
#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub outcomes: Vec<VmOutcome>,
}

impl FleetReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.kind.label() == label)
            .count()
    }

    /// Err with `FleetFailed` when any VM failed.
    pub fn into_result(self) -> Result<Self, HerdError> {
        match self.failed_count() {
            0 => Ok(self),
            failed => Err(HerdError::FleetFailed {
                failed,
                total: self.outcomes.len(),
            }),
        }
    }
}

pub struct Provisioner<'a, B> {
    backend: &'a B,
    store: &'a StateStore,
    observer: &'a dyn Observer,
    settings: ProvisionSettings,
}

impl<'a, B: Backend> Provisioner<'a, B> {
    pub fn new(
        backend: &'a B,
        store: &'a StateStore,
        observer: &'a dyn Observer,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            backend,
            store,
            observer,
            settings,
        }
    }

    /// Provision every spec, at most `workers` at a time.
    ///
    /// Under `ErrorPolicy::Abort`, VMs not yet started when the first
    /// failure lands are reported as skipped; VMs in flight run to the end.
    pub async fn run_fleet(&self, specs: &[VmSpec]) -> FleetReport {
        self.observer.fleet_started(specs);
        let aborted = AtomicBool::new(false);
        let aborted = &aborted;

        let mut outcomes: Vec<VmOutcome> = stream::iter(specs)
            .map(|spec| async move {
                let outcome = if aborted.load(Ordering::SeqCst) {
                    tracing::info!(vm = %spec.name, "skipped, fleet aborted");
                    VmOutcome::new(spec, OutcomeKind::Skipped)
                } else {
                    self.provision_vm(spec).await
                };
                if outcome.is_failed() && self.settings.on_error == ErrorPolicy::Abort {
                    aborted.store(true, Ordering::SeqCst);
                }
                self.observer.vm_finished(&outcome);
                outcome
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        outcomes.sort_by_key(|o| o.serial);
        let report = FleetReport { outcomes };
        self.observer.fleet_finished(&report);
        report
    }

    /// Run the remaining pipeline for one VM and record the result.
    pub async fn provision_vm(&self, spec: &VmSpec) -> VmOutcome {
        match self.run_pipeline(spec).await {
            Ok(kind) => VmOutcome::new(spec, kind),
            Err((step, e)) => {
                let error = e.to_string();
                tracing::error!(vm = %spec.name, step = %step, "{error}");
                if let Err(store_err) = self.store.mark_failed(&spec.name, step, &error).await
                {
                    tracing::warn!(vm = %spec.name, "could not record failure: {store_err}");
                }
                VmOutcome::new(spec, OutcomeKind::Failed { step, error })
            }
        }
    }

    async fn run_pipeline(&self, spec: &VmSpec) -> Result<OutcomeKind, (PipelineStep, HerdError)> {
        let first = PipelineStep::Clone;
        let record = match self.store.get(&spec.name).await.map_err(|e| (first, e))? {
            Some(r) if r.is_complete() => {
                tracing::info!(vm = %spec.name, "already reachable, nothing to do");
                return Ok(OutcomeKind::AlreadyReachable);
            }
            Some(r) => r,
            None => self.store.begin(&spec.name).await.map_err(|e| (first, e))?,
        };

        let resumed_from = Some(record.last_completed)
            .filter(|s| *s != ProvisioningState::Planned);
        if let Some(state) = resumed_from {
            tracing::info!(vm = %spec.name, from = %state, "resuming");
        }

        for &step in record.last_completed.remaining_steps() {
            self.observer.step_started(spec, step);
            self.run_step(spec, step).await.map_err(|e| (step, e))?;
            if let Some(state) = step.completes() {
                self.store
                    .advance(&spec.name, state)
                    .await
                    .map_err(|e| (step, e))?;
            }
            tracing::info!(vm = %spec.name, step = %step, "step complete");
            self.observer.step_finished(spec, step);
        }

        Ok(OutcomeKind::Provisioned { resumed_from })
    }

    async fn run_step(&self, spec: &VmSpec, step: PipelineStep) -> Result<(), HerdError> {
        let backend = self.backend;
        let name = spec.name.as_str();
        let ip = spec.network.ip;
        let policy = &self.settings.retry;
        let label = format!("{name}/{step}");
        let failed = |e: HerdError| hypervisor_failure(step, name, e);

        match step {
            PipelineStep::Clone => {
                if backend.domain_exists(name).await.map_err(failed)? {
                    return Err(HerdError::HypervisorCallFailed {
                        step: step.to_string(),
                        vm: name.to_string(),
                        message: "a domain with this name already exists and is not tracked \
                                  as part of this fleet"
                            .into(),
                    });
                }
                let template = spec.template.as_str();
                retry::with_backoff(policy, &label, move || async move {
                    let Err(e) = backend.clone_domain(template, name).await else {
                        return Ok(());
                    };
                    // virt-clone defines the domain before copying disks; a
                    // failed copy leaves it behind and blocks every retry.
                    if backend.domain_exists(name).await? {
                        tracing::warn!(vm = name, "removing partial clone");
                        backend.undefine_with_storage(name).await?;
                    }
                    Err(e)
                })
                .await
                .map_err(failed)
            }
            PipelineStep::Configure => {
                let resources = spec.resources;
                retry::with_backoff(policy, &label, move || {
                    backend.set_resources(name, resources)
                })
                .await
                .map_err(failed)
            }
            PipelineStep::AttachNetwork => {
                let bridge = spec.network.bridge.as_str();
                retry::with_backoff(policy, &label, move || backend.attach_bridge(name, bridge))
                    .await
                    .map_err(failed)
            }
            PipelineStep::UploadNetworkConfig => {
                let staged =
                    netplan::stage(&self.settings.staging_dir, spec, &self.settings.netplan)
                        .await?;
                let ops = vec![
                    CustomizeOp::Run(netplan::PURGE_COMMAND.into()),
                    CustomizeOp::Run(netplan::DISABLE_CLOUD_INIT_NETWORK.into()),
                    CustomizeOp::Upload {
                        local: staged.clone(),
                        guest: netplan::GUEST_PATH.into(),
                    },
                    CustomizeOp::Chmod {
                        mode: "0600".into(),
                        guest: netplan::GUEST_PATH.into(),
                    },
                ];
                let ops = ops.as_slice();
                let result =
                    retry::with_backoff(policy, &label, move || backend.customize(name, ops)).await;
                netplan::unstage(&staged).await;
                result.map_err(failed)
            }
            PipelineStep::RegenerateHostKeys => {
                let ops: Vec<CustomizeOp> = REGENERATE_HOST_KEYS
                    .iter()
                    .map(|cmd| CustomizeOp::Run(cmd.to_string()))
                    .collect();
                let ops = ops.as_slice();
                retry::with_backoff(policy, &label, move || backend.customize(name, ops))
                    .await
                    .map_err(failed)
            }
            PipelineStep::Start => retry::with_backoff(policy, &label, move || backend.start(name))
                .await
                .map_err(failed),
            PipelineStep::WaitReachable => {
                let timeout = self.settings.reachable_timeout;
                if self.poll_until(timeout, move || backend.ssh_port_open(ip)).await {
                    Ok(())
                } else {
                    Err(timed_out(step, name, timeout))
                }
            }
            PipelineStep::SetHostname => {
                let command = remote::hostname_command(name, ip);
                let command = command.as_str();
                retry::with_backoff(policy, &label, move || backend.remote_exec(ip, command))
                    .await
                    .map(|_| ())
                    .map_err(failed)
            }
            PipelineStep::Reboot => self.reboot(spec, &label).await,
        }
    }

    /// Reboot the guest and wait until it answers with a new boot id.
    async fn reboot(&self, spec: &VmSpec, label: &str) -> Result<(), HerdError> {
        let step = PipelineStep::Reboot;
        let backend = self.backend;
        let name = spec.name.as_str();
        let ip = spec.network.ip;
        let policy = &self.settings.retry;
        let failed = |e: HerdError| hypervisor_failure(step, name, e);

        let before = retry::with_backoff(policy, label, move || {
            backend.remote_exec(ip, BOOT_ID_COMMAND)
        })
        .await
        .map_err(failed)?;
        let before = before.trim();

        retry::with_backoff(policy, label, move || backend.remote_exec(ip, REBOOT_COMMAND))
            .await
            .map_err(failed)?;
        tracing::debug!(vm = name, boot_id = before, "reboot requested");

        let timeout = self.settings.reboot_timeout;
        let back = self
            .poll_until(timeout, move || async move {
                if !backend.ssh_port_open(ip).await {
                    return false;
                }
                match backend.remote_exec(ip, BOOT_ID_COMMAND).await {
                    Ok(id) => id.trim() != before,
                    Err(_) => false,
                }
            })
            .await;
        if back {
            Ok(())
        } else {
            Err(timed_out(step, name, timeout))
        }
    }

    /// Call `check` every poll interval until it returns true or `timeout`
    /// elapses.
    async fn poll_until<F, Fut>(&self, timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if check().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }
}

fn hypervisor_failure(step: PipelineStep, vm: &str, e: HerdError) -> HerdError {
    match e {
        e @ (HerdError::HypervisorCallFailed { .. } | HerdError::Timeout { .. }) => e,
        other => HerdError::HypervisorCallFailed {
            step: step.to_string(),
            vm: vm.to_string(),
            message: other.to_string(),
        },
    }
}

fn timed_out(step: PipelineStep, vm: &str, timeout: Duration) -> HerdError {
    HerdError::Timeout {
        step: step.to_string(),
        vm: vm.to_string(),
        seconds: timeout.as_secs(),
    }
}
