//! In-memory backend for provisioner and decommissioner tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use super::remote::{BOOT_ID_COMMAND, REBOOT_COMMAND};
use super::{Backend, CustomizeOp};
use crate::error::HerdError;
use crate::planner::Resources;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeDomain {
    pub running: bool,
    pub resources: Option<Resources>,
    pub bridge: Option<String>,
    pub customizations: Vec<CustomizeOp>,
    /// Backing image paths.
    pub disks: Vec<String>,
}

impl FakeDomain {
    fn with_disk(name: &str) -> Self {
        Self {
            disks: vec![format!("/var/lib/libvirt/images/{name}.qcow2")],
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct FakeState {
    domains: BTreeMap<String, FakeDomain>,
    calls: Vec<(String, String)>,
    /// Remaining injected failures per (operation, target).
    failures: HashMap<(String, String), u32>,
    unreachable: HashSet<Ipv4Addr>,
    /// Guests whose reboot command never takes effect.
    stuck: HashSet<Ipv4Addr>,
    boot_ids: HashMap<Ipv4Addr, u32>,
    remote_commands: Vec<(Ipv4Addr, String)>,
    deleted_disks: Vec<String>,
}

impl FakeState {
    fn take_failure(&mut self, op: &str, target: &str) -> bool {
        let key = (op.to_string(), target.to_string());
        match self.failures.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

const PARTIAL_CLONE: &str = "partial_clone";

/// Operations that change a domain, its image or its guest.
const MUTATIONS: &[&str] = &[
    "clone_domain",
    "set_resources",
    "attach_bridge",
    "customize",
    "start",
    "force_stop",
    "undefine_with_storage",
    "remote_exec",
];

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-existing stopped domain.
    pub fn with_domain(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .domains
            .insert(name.to_string(), FakeDomain::with_disk(name));
        self
    }

    pub fn with_running_domain(self, name: &str) -> Self {
        self.state.lock().unwrap().domains.insert(
            name.to_string(),
            FakeDomain {
                running: true,
                ..FakeDomain::with_disk(name)
            },
        );
        self
    }

    /// Make the next `times` calls of `op` against `target` fail.
    pub fn fail(self, op: &str, target: &str, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op.to_string(), target.to_string()), times);
        self
    }

    /// Make the next `times` clones of `name` define the domain and then fail,
    /// as virt-clone does when the disk copy breaks.
    pub fn partial_clone(self, name: &str, times: u32) -> Self {
        self.fail(PARTIAL_CLONE, name, times)
    }

    pub fn unreachable(self, ip: Ipv4Addr) -> Self {
        self.state.lock().unwrap().unreachable.insert(ip);
        self
    }

    pub fn stuck_on_reboot(self, ip: Ipv4Addr) -> Self {
        self.state.lock().unwrap().stuck.insert(ip);
        self
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().domains.contains_key(name)
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state.lock().unwrap().domains.get(name).cloned()
    }

    pub fn deleted_disks(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_disks.clone()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, target: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, t)| t == target)
            .map(|(op, _)| op)
            .collect()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|(op, _)| MUTATIONS.contains(&op.as_str()))
            .count()
    }

    pub fn remote_commands(&self, ip: Ipv4Addr) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .remote_commands
            .iter()
            .filter(|(i, _)| *i == ip)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn boot_count(&self, ip: Ipv4Addr) -> u32 {
        self.state
            .lock()
            .unwrap()
            .boot_ids
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }

    /// Log the call and consume an injected failure if one is pending.
    fn record(&self, op: &str, target: &str) -> Result<(), HerdError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((op.to_string(), target.to_string()));
        if state.take_failure(op, target) {
            return Err(HerdError::ExternalCommand {
                command: op.to_string(),
                message: format!("injected failure for {target}"),
            });
        }
        Ok(())
    }

    fn with_existing<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeDomain) -> T,
    ) -> Result<T, HerdError> {
        let mut state = self.state.lock().unwrap();
        state
            .domains
            .get_mut(name)
            .map(f)
            .ok_or_else(|| HerdError::VmNotFound {
                name: name.to_string(),
            })
    }
}

impl Backend for FakeBackend {
    async fn domain_exists(&self, name: &str) -> Result<bool, HerdError> {
        self.record("domain_exists", name)?;
        Ok(self.exists(name))
    }

    async fn clone_domain(&self, template: &str, name: &str) -> Result<(), HerdError> {
        self.record("clone_domain", name)?;
        let mut state = self.state.lock().unwrap();
        if state.domains.contains_key(name) {
            return Err(HerdError::ExternalCommand {
                command: "virt-clone".into(),
                message: format!("domain '{name}' already exists"),
            });
        }
        if template.is_empty() {
            return Err(HerdError::ExternalCommand {
                command: "virt-clone".into(),
                message: "no template".into(),
            });
        }
        state
            .domains
            .insert(name.to_string(), FakeDomain::with_disk(name));
        if state.take_failure(PARTIAL_CLONE, name) {
            return Err(HerdError::ExternalCommand {
                command: "virt-clone".into(),
                message: format!("copying disk of '{name}' failed"),
            });
        }
        Ok(())
    }

    async fn set_resources(&self, name: &str, resources: Resources) -> Result<(), HerdError> {
        self.record("set_resources", name)?;
        self.with_existing(name, |d| d.resources = Some(resources))
    }

    async fn attach_bridge(&self, name: &str, bridge: &str) -> Result<(), HerdError> {
        self.record("attach_bridge", name)?;
        self.with_existing(name, |d| d.bridge = Some(bridge.to_string()))
    }

    async fn customize(&self, name: &str, ops: &[CustomizeOp]) -> Result<(), HerdError> {
        self.record("customize", name)?;
        for op in ops {
            if let CustomizeOp::Upload { local, .. } = op
                && !local.exists()
            {
                return Err(HerdError::ExternalCommand {
                    command: "virt-customize".into(),
                    message: format!("{} does not exist", local.display()),
                });
            }
        }
        self.with_existing(name, |d| d.customizations.extend(ops.iter().cloned()))
    }

    async fn start(&self, name: &str) -> Result<(), HerdError> {
        self.record("start", name)?;
        self.with_existing(name, |d| d.running = true)
    }

    async fn force_stop(&self, name: &str) -> Result<(), HerdError> {
        self.record("force_stop", name)?;
        self.with_existing(name, |d| d.running = false)
    }

    async fn undefine_with_storage(&self, name: &str) -> Result<(), HerdError> {
        self.record("undefine_with_storage", name)?;
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .remove(name)
            .ok_or_else(|| HerdError::VmNotFound {
                name: name.to_string(),
            })?;
        state.deleted_disks.extend(domain.disks);
        Ok(())
    }

    async fn ssh_port_open(&self, ip: Ipv4Addr) -> bool {
        let target = ip.to_string();
        if self.record("ssh_port_open", &target).is_err() {
            return false;
        }
        !self.state.lock().unwrap().unreachable.contains(&ip)
    }

    async fn remote_exec(&self, ip: Ipv4Addr, command: &str) -> Result<String, HerdError> {
        self.record("remote_exec", &ip.to_string())?;
        let mut state = self.state.lock().unwrap();
        state.remote_commands.push((ip, command.to_string()));
        if command == BOOT_ID_COMMAND {
            let boot = state.boot_ids.get(&ip).copied().unwrap_or(0);
            return Ok(format!("boot-{boot}\n"));
        }
        if command == REBOOT_COMMAND && !state.stuck.contains(&ip) {
            *state.boot_ids.entry(ip).or_insert(0) += 1;
        }
        Ok(String::new())
    }
}
