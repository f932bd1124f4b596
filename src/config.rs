use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use facet::Facet;

use crate::error::HerdError;
use crate::paths;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "herd.toml";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub hypervisor: HypervisorConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub provision: ProvisionConfig,
    #[facet(default)]
    pub retry: RetryConfig,
    #[facet(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    /// Template VM cloned for every fleet member.
    #[facet(default)]
    pub template: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: "qemu:///system".into(),
            template: String::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    #[facet(default = "ubuntu")]
    pub user: String,
    /// Private key path; empty uses ssh's own defaults.
    #[facet(default)]
    pub key: String,
    #[facet(default = 22)]
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".into(),
            key: String::new(),
            port: 22,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ProvisionConfig {
    #[facet(default = 2)]
    pub workers: usize,
    #[facet(default = "continue")]
    pub on_error: String,
    #[facet(default = 300)]
    pub reachable_timeout_s: u64,
    #[facet(default = 300)]
    pub reboot_timeout_s: u64,
    #[facet(default = 5)]
    pub poll_interval_s: u64,
    /// Guest interface name for the netplan file; empty matches `en*`.
    #[facet(default)]
    pub interface: String,
    #[facet(default)]
    pub nameservers: Vec<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            on_error: "continue".into(),
            reachable_timeout_s: 300,
            reboot_timeout_s: 300,
            poll_interval_s: 5,
            interface: String::new(),
            nameservers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct RetryConfig {
    #[facet(default = 3)]
    pub max_attempts: u32,
    #[facet(default = 2000)]
    pub initial_delay_ms: u64,
    #[facet(default = 30000)]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 30000,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct StateConfig {
    /// State directory; empty uses `~/.local/share/herd/state`.
    #[facet(default)]
    pub dir: String,
}

/// What the provisioner does after one VM's pipeline fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Keep provisioning the remaining VMs.
    Continue,
    /// Start no further VMs; in-flight pipelines finish.
    Abort,
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" | "continue-on-error" => Ok(ErrorPolicy::Continue),
            "abort" | "abort-fleet" => Ok(ErrorPolicy::Abort),
            other => Err(format!(
                "unknown error policy '{other}' (use 'continue' or 'abort')"
            )),
        }
    }
}

impl Config {
    pub fn libvirt_uri(&self) -> &str {
        &self.hypervisor.libvirt_uri
    }

    pub fn state_dir(&self) -> PathBuf {
        if self.state.dir.is_empty() {
            paths::default_state_dir()
        } else {
            expand_home(&self.state.dir)
        }
    }

    pub fn ssh_key(&self) -> Option<PathBuf> {
        (!self.ssh.key.is_empty()).then(|| expand_home(&self.ssh.key))
    }

    pub fn error_policy(&self) -> Result<ErrorPolicy, HerdError> {
        self.provision
            .on_error
            .parse()
            .map_err(|message| HerdError::Validation { message })
    }

    pub fn reachable_timeout(&self) -> Duration {
        Duration::from_secs(self.provision.reachable_timeout_s)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.provision.reboot_timeout_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.provision.poll_interval_s)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), HerdError> {
    if config.hypervisor.libvirt_uri.is_empty() {
        return Err(HerdError::Validation {
            message: "hypervisor.libvirt_uri must not be empty".into(),
        });
    }
    if config.ssh.user.is_empty() {
        return Err(HerdError::Validation {
            message: "ssh.user must not be empty".into(),
        });
    }
    if config.ssh.port == 0 {
        return Err(HerdError::Validation {
            message: "ssh.port must not be 0".into(),
        });
    }

    let p = &config.provision;
    if p.workers < 1 {
        return Err(HerdError::Validation {
            message: "provision.workers must be at least 1".into(),
        });
    }
    config.error_policy()?;
    if p.reachable_timeout_s == 0 || p.reboot_timeout_s == 0 {
        return Err(HerdError::Validation {
            message: "provision timeouts must be greater than 0".into(),
        });
    }
    if p.poll_interval_s == 0 {
        return Err(HerdError::Validation {
            message: "provision.poll_interval_s must be greater than 0".into(),
        });
    }
    for ns in &p.nameservers {
        if ns.parse::<IpAddr>().is_err() {
            return Err(HerdError::Validation {
                message: format!("provision.nameservers: '{ns}' is not an IP address"),
            });
        }
    }

    let r = &config.retry;
    if r.max_attempts < 1 {
        return Err(HerdError::Validation {
            message: "retry.max_attempts must be at least 1".into(),
        });
    }
    if r.initial_delay_ms > r.max_delay_ms {
        return Err(HerdError::Validation {
            message: "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
        });
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the config from `path`, or from `./herd.toml` when no path is given.
/// With neither, built-in defaults apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, HerdError> {
    let path = match path {
        Some(p) => p,
        None => {
            let local = Path::new(DEFAULT_CONFIG_FILE);
            if !local.exists() {
                tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
                return Ok(Config::default());
            }
            local
        }
    };

    let contents = std::fs::read_to_string(path).map_err(|source| HerdError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents).map_err(|e| match e {
        HerdError::ConfigParse { message, .. } => HerdError::ConfigParse {
            path: path.display().to_string(),
            message,
        },
        other => other,
    })?;

    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<Config, HerdError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| HerdError::ConfigParse {
        path: "<inline>".into(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml = r#"
[hypervisor]
libvirt_uri = "qemu+ssh://root@kvm1/system"
template = "ubuntu-2404-golden"

[ssh]
user = "ops"
key = "/home/ops/.ssh/id_ed25519"
port = 2222

[provision]
workers = 4
on_error = "abort"
reachable_timeout_s = 120
reboot_timeout_s = 180
poll_interval_s = 2
interface = "enp1s0"
nameservers = ["10.9.9.1", "1.1.1.1"]

[retry]
max_attempts = 5
initial_delay_ms = 500
max_delay_ms = 10000

[state]
dir = "/var/lib/herd"
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.libvirt_uri(), "qemu+ssh://root@kvm1/system");
        assert_eq!(config.hypervisor.template, "ubuntu-2404-golden");
        assert_eq!(config.ssh.user, "ops");
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(
            config.ssh_key(),
            Some(PathBuf::from("/home/ops/.ssh/id_ed25519"))
        );
        assert_eq!(config.provision.workers, 4);
        assert_eq!(config.error_policy().unwrap(), ErrorPolicy::Abort);
        assert_eq!(config.reachable_timeout(), Duration::from_secs(120));
        assert_eq!(config.provision.interface, "enp1s0");
        assert_eq!(config.provision.nameservers.len(), 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/herd"));
    }

    #[test]
    fn absent_sections_use_defaults() {
        let toml = r#"
[hypervisor]
template = "golden"
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.libvirt_uri(), "qemu:///system");
        assert_eq!(config.ssh.user, "ubuntu");
        assert_eq!(config.ssh.port, 22);
        assert!(config.ssh_key().is_none());
        assert_eq!(config.provision.workers, 2);
        assert_eq!(config.error_policy().unwrap(), ErrorPolicy::Continue);
        assert_eq!(config.reachable_timeout(), Duration::from_secs(300));
        assert_eq!(config.reboot_timeout(), Duration::from_secs(300));
        assert_eq!(config.retry.initial_delay_ms, 2000);
        assert_eq!(config.state_dir(), paths::default_state_dir());
    }

    #[test]
    fn default_config_is_valid() {
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.provision.workers = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn unknown_error_policy_rejected() {
        let mut config = Config::default();
        config.provision.on_error = "retry-forever".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_nameserver_rejected() {
        let mut config = Config::default();
        config.provision.nameservers = vec!["not-an-ip".into()];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn inverted_retry_delays_rejected() {
        let mut config = Config::default();
        config.retry.initial_delay_ms = 60_000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn error_policy_accepts_long_names() {
        assert_eq!(
            "continue-on-error".parse::<ErrorPolicy>().unwrap(),
            ErrorPolicy::Continue
        );
        assert_eq!(
            "abort-fleet".parse::<ErrorPolicy>().unwrap(),
            ErrorPolicy::Abort
        );
    }

    #[test]
    fn home_relative_paths_expand() {
        let expanded = expand_home("~/.ssh/id_ed25519");
        assert!(expanded.ends_with(".ssh/id_ed25519"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/herd.toml"))).unwrap_err();
        assert!(matches!(err, HerdError::ConfigLoad { .. }));
    }
}
