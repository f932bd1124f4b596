use std::net::Ipv4Addr;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorNumber};
use virt::storage_vol::StorageVol;
use virt::sys;

use super::remote::SshTarget;
use super::{Backend, CustomizeOp};
use crate::config::Config;
use crate::domain_xml::{self, DiskSource, DomainDevices};
use crate::error::HerdError;
use crate::planner::Resources;
use crate::util;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// libvirt for domain control, `virt-clone`/`virt-customize` for disk work,
/// `ssh` for the running guest. One connection shared by every VM pipeline.
pub struct LibvirtBackend {
    conn: ConnGuard,
    uri: String,
    ssh: SshTarget,
}

impl LibvirtBackend {
    pub fn connect(config: &Config) -> Result<Self, HerdError> {
        // Suppress libvirt's default error handler that prints to stderr;
        // errors surface through Result instead.
        virt_error::clear_error_callback();

        let uri = config.libvirt_uri().to_string();
        let conn = Connect::open(Some(&uri))
            .map(ConnGuard)
            .map_err(|e| HerdError::Libvirt {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!("ensure libvirtd is running and you have access to {uri}"),
            })?;
        tracing::debug!(uri, "connected to libvirt");

        Ok(Self {
            conn,
            uri,
            ssh: SshTarget::from_config(config),
        })
    }

    /// `Ok(None)` only when libvirt says there is no such domain.
    fn find(&self, name: &str) -> Result<Option<Domain>, HerdError> {
        match Domain::lookup_by_name(&self.conn, name) {
            Ok(dom) => Ok(Some(dom)),
            Err(e) if matches!(e.code(), ErrorNumber::NoDomain) => Ok(None),
            Err(e) => Err(libvirt_err(format!("looking up '{name}': {e}"))),
        }
    }

    fn lookup(&self, name: &str) -> Result<Domain, HerdError> {
        self.find(name)?.ok_or_else(|| HerdError::VmNotFound {
            name: name.to_string(),
        })
    }

    fn devices(&self, dom: &Domain, name: &str) -> Result<DomainDevices, HerdError> {
        let xml = dom
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(|e| libvirt_err(format!("reading XML of '{name}': {e}")))?;
        DomainDevices::parse(&xml)
    }

    async fn remove_disk(&self, vm: &str, disk: &DiskSource) -> Result<(), HerdError> {
        let path = disk.path();
        if let Ok(vol) = StorageVol::lookup_by_path(&self.conn, path) {
            vol.delete(0)
                .map_err(|e| libvirt_err(format!("deleting volume {path}: {e}")))?;
            tracing::debug!(vm, path, "deleted storage volume");
            return Ok(());
        }
        match disk {
            DiskSource::File(path) => remove_disk_file(path).await,
            DiskSource::Block(path) => {
                tracing::warn!(vm, path = %path, "block device is not in a storage pool, leaving it");
                Ok(())
            }
        }
    }
}

/// Delete a disk image outside any storage pool. Already gone is fine.
async fn remove_disk_file(path: &str) -> Result<(), HerdError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path, "removed disk image");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "disk image already gone");
            Ok(())
        }
        Err(e) => Err(HerdError::Io {
            context: format!("removing disk {path}"),
            source: e,
        }),
    }
}

fn libvirt_err(message: String) -> HerdError {
    HerdError::Libvirt {
        message,
        hint: "check libvirt permissions and `virsh dominfo` for details".into(),
    }
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

impl Backend for LibvirtBackend {
    async fn domain_exists(&self, name: &str) -> Result<bool, HerdError> {
        Ok(self.find(name)?.is_some())
    }

    async fn clone_domain(&self, template: &str, name: &str) -> Result<(), HerdError> {
        util::run_command(
            "virt-clone",
            [
                "--connect",
                &self.uri,
                "--original",
                template,
                "--name",
                name,
                "--auto-clone",
            ],
        )
        .await?;
        Ok(())
    }

    async fn set_resources(&self, name: &str, resources: Resources) -> Result<(), HerdError> {
        let dom = self.lookup(name)?;
        let vcpus = resources.vcpus;
        let memory_kib = resources.memory_kib();

        dom.set_vcpus_flags(vcpus, sys::VIR_DOMAIN_VCPU_CONFIG | sys::VIR_DOMAIN_VCPU_MAXIMUM)
            .map_err(|e| libvirt_err(format!("setting maximum vCPUs of '{name}': {e}")))?;
        dom.set_vcpus_flags(vcpus, sys::VIR_DOMAIN_VCPU_CONFIG)
            .map_err(|e| libvirt_err(format!("setting vCPUs of '{name}': {e}")))?;

        dom.set_memory_flags(memory_kib, sys::VIR_DOMAIN_MEM_CONFIG | sys::VIR_DOMAIN_MEM_MAXIMUM)
            .map_err(|e| libvirt_err(format!("setting maximum memory of '{name}': {e}")))?;
        dom.set_memory_flags(memory_kib, sys::VIR_DOMAIN_MEM_CONFIG)
            .map_err(|e| libvirt_err(format!("setting memory of '{name}': {e}")))?;

        tracing::debug!(vm = name, vcpus, memory_kib, "resources set");
        Ok(())
    }

    async fn attach_bridge(&self, name: &str, bridge: &str) -> Result<(), HerdError> {
        let dom = self.lookup(name)?;
        let devices = self.devices(&dom, name)?;

        for mac in devices.network_interface_macs("default") {
            let device = domain_xml::network_interface_xml("default", &mac)?;
            dom.detach_device_flags(&device, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)
                .map_err(|e| libvirt_err(format!("detaching NIC {mac} from '{name}': {e}")))?;
            tracing::debug!(vm = name, mac, "detached default network interface");
        }

        if devices.has_bridge_interface(bridge) {
            tracing::debug!(vm = name, bridge, "bridge interface already attached");
            return Ok(());
        }
        dom.attach_device_flags(
            &domain_xml::bridge_interface_xml(bridge)?,
            sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG,
        )
        .map_err(|e| libvirt_err(format!("attaching bridge {bridge} to '{name}': {e}")))?;
        Ok(())
    }

    async fn customize(&self, name: &str, ops: &[CustomizeOp]) -> Result<(), HerdError> {
        let mut args: Vec<String> = vec![
            "--connect".into(),
            self.uri.clone(),
            "--domain".into(),
            name.into(),
        ];
        for op in ops {
            match op {
                CustomizeOp::Run(cmd) => {
                    args.push("--run-command".into());
                    args.push(cmd.clone());
                }
                CustomizeOp::Upload { local, guest } => {
                    args.push("--upload".into());
                    args.push(format!("{}:{guest}", local.display()));
                }
                CustomizeOp::Chmod { mode, guest } => {
                    args.push("--chmod".into());
                    args.push(format!("{mode}:{guest}"));
                }
            }
        }
        util::run_command("virt-customize", args).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), HerdError> {
        let dom = self.lookup(name)?;
        if is_running(&dom) {
            tracing::info!(vm = name, "VM already running");
            return Ok(());
        }
        dom.create().map_err(|e| HerdError::Libvirt {
            message: format!("failed to start '{name}': {e}"),
            hint: format!("check `virsh -c {} start {name}` for details", self.uri),
        })?;
        Ok(())
    }

    async fn force_stop(&self, name: &str) -> Result<(), HerdError> {
        let dom = self.lookup(name)?;
        if !is_running(&dom) {
            return Ok(());
        }
        if let Err(e) = dom.destroy() {
            // Lost a race with a guest that powered off by itself.
            if is_running(&dom) {
                return Err(libvirt_err(format!("force stop of '{name}' failed: {e}")));
            }
            tracing::warn!(vm = name, "destroy reported {e}, but the VM is stopped");
        }
        Ok(())
    }

    async fn undefine_with_storage(&self, name: &str) -> Result<(), HerdError> {
        let dom = self.lookup(name)?;
        let disks = self.devices(&dom, name)?.disk_sources();

        dom.undefine_flags(sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE | sys::VIR_DOMAIN_UNDEFINE_NVRAM)
            .map_err(|e| libvirt_err(format!("failed to undefine '{name}': {e}")))?;

        for disk in &disks {
            self.remove_disk(name, disk).await?;
        }
        Ok(())
    }

    async fn ssh_port_open(&self, ip: Ipv4Addr) -> bool {
        self.ssh.port_open(ip).await
    }

    async fn remote_exec(&self, ip: Ipv4Addr, command: &str) -> Result<String, HerdError> {
        self.ssh.exec(ip, command).await
    }
}
