//! Remote guest access over SSH: reachability probe, command execution and
//! the guest-side commands used after first boot.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::HerdError;
use crate::util::{self, shell_quote};

/// Prints the kernel's per-boot random id; changes on every reboot.
pub const BOOT_ID_COMMAND: &str = "cat /proc/sys/kernel/random/boot_id";

/// Detached so the SSH session returns before the guest goes down.
pub const REBOOT_COMMAND: &str = "nohup sh -c 'sleep 2; sudo systemctl reboot' >/dev/null 2>&1 &";

/// Host key regeneration, run offline inside the image.
pub const REGENERATE_HOST_KEYS: [&str; 2] = ["rm -f /etc/ssh/ssh_host_*", "ssh-keygen -A"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub key: Option<PathBuf>,
    pub port: u16,
}

impl SshTarget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user: config.ssh.user.clone(),
            key: config.ssh_key(),
            port: config.ssh.port,
        }
    }

    /// Arguments for a non-interactive `ssh` run of `command` on `ip`.
    pub fn args(&self, ip: Ipv4Addr, command: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "LogLevel=ERROR",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.push("-p".into());
        args.push(self.port.to_string());
        if let Some(key) = &self.key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{ip}", self.user));
        args.push("--".into());
        args.push(command.into());
        args
    }

    pub async fn exec(&self, ip: Ipv4Addr, command: &str) -> Result<String, HerdError> {
        util::run_command("ssh", self.args(ip, command)).await
    }

    /// One TCP connect attempt against the SSH port.
    pub async fn port_open(&self, ip: Ipv4Addr) -> bool {
        matches!(
            tokio::time::timeout(
                PROBE_TIMEOUT,
                tokio::net::TcpStream::connect((ip, self.port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

/// Set the hostname and replace any `/etc/hosts` line for it.
pub fn hostname_command(hostname: &str, ip: Ipv4Addr) -> String {
    let name = shell_quote(hostname);
    let pattern = shell_quote(&format!("/[[:space:]]{hostname}$/d"));
    let entry = shell_quote(&format!("{ip} {hostname}"));
    format!(
        "sudo hostnamectl set-hostname {name} && \
sudo sed -i {pattern} /etc/hosts && \
echo {entry} | sudo tee -a /etc/hosts >/dev/null"
    )
}
