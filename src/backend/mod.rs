pub mod libvirt;
pub mod remote;

#[cfg(test)]
pub mod fake;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::HerdError;
use crate::planner::Resources;

/// One offline edit applied to a guest image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomizeOp {
    /// Run a shell command inside the image.
    Run(String),
    /// Copy a host file to a guest path.
    Upload { local: PathBuf, guest: String },
    /// Set a guest file's mode, e.g. `0600`.
    Chmod { mode: String, guest: String },
}

/// Everything the provisioner and decommissioner need from the hypervisor,
/// the guest image and the running guest.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Backend {
    /// Err when the hypervisor cannot answer; never a guess of `false`.
    async fn domain_exists(&self, name: &str) -> Result<bool, HerdError>;

    /// Full clone of `template` (definition and disks) as `name`.
    async fn clone_domain(&self, template: &str, name: &str) -> Result<(), HerdError>;
    /// Maximum and current vCPUs and memory, persistent config only.
    async fn set_resources(&self, name: &str, resources: Resources) -> Result<(), HerdError>;
    /// Drop the default-network NIC and attach a virtio NIC on `bridge`.
    async fn attach_bridge(&self, name: &str, bridge: &str) -> Result<(), HerdError>;
    /// Apply offline edits to the (stopped) domain's disk image.
    async fn customize(&self, name: &str, ops: &[CustomizeOp]) -> Result<(), HerdError>;
    /// Start the domain. Already running is success.
    async fn start(&self, name: &str) -> Result<(), HerdError>;

    /// Hard power-off. Already stopped is success.
    async fn force_stop(&self, name: &str) -> Result<(), HerdError>;
    /// Remove the definition and its disk volumes.
    async fn undefine_with_storage(&self, name: &str) -> Result<(), HerdError>;

    /// Whether the guest's SSH port accepts connections.
    async fn ssh_port_open(&self, ip: Ipv4Addr) -> bool;
    /// Run a shell command on the guest over SSH and return its stdout.
    async fn remote_exec(&self, ip: Ipv4Addr, command: &str) -> Result<String, HerdError>;
}
