//! Static-address netplan file for a fleet member.
//!
//! The file is rendered per VM, staged on the host, uploaded into the guest
//! image while the domain is offline, then removed from the staging area.

use std::path::{Path, PathBuf};

use facet_value::{VArray, Value, value};

use crate::error::HerdError;
use crate::planner::VmSpec;

/// Where the rendered file lands inside the guest.
pub const GUEST_PATH: &str = "/etc/netplan/01-herd.yaml";

/// Removes every existing netplan file so only ours remains.
pub const PURGE_COMMAND: &str = "rm -f /etc/netplan/*.yaml /etc/netplan/*.yml";

/// Stops cloud-init from regenerating the network config on boot.
pub const DISABLE_CLOUD_INIT_NETWORK: &str = "if [ -d /etc/cloud/cloud.cfg.d ]; then \
echo 'network: {config: disabled}' > /etc/cloud/cloud.cfg.d/99-herd-disable-network.cfg; fi";

#[derive(Debug, Clone, Default)]
pub struct NetplanOptions {
    /// Guest interface name. Empty matches any `en*` interface.
    pub interface: String,
    pub nameservers: Vec<String>,
}

pub fn render(spec: &VmSpec, opts: &NetplanOptions) -> Result<String, HerdError> {
    let net = &spec.network;
    let cidr = net.cidr();
    let gateway = net.gateway.to_string();

    let mut route = value!({
        "to": "default",
        "via": (gateway.as_str()),
    });
    if !net.gateway_in_subnet()
        && let Some(obj) = route.as_object_mut()
    {
        obj.insert("on-link", Value::from(true));
    }

    let mut ethernet = value!({
        "dhcp4": false,
        "dhcp6": false,
        "addresses": [(cidr.as_str())],
        "routes": [route],
    });
    if let Some(obj) = ethernet.as_object_mut() {
        if opts.interface.is_empty() {
            obj.insert("match", value!({ "name": "en*" }));
        }
        if !opts.nameservers.is_empty() {
            let addresses =
                VArray::from_iter(opts.nameservers.iter().map(|n| Value::from(n.as_str())));
            obj.insert("nameservers", value!({ "addresses": (Value::from(addresses)) }));
        }
    }

    let key = if opts.interface.is_empty() {
        "id0"
    } else {
        opts.interface.as_str()
    };
    let mut ethernets = value!({});
    if let Some(obj) = ethernets.as_object_mut() {
        obj.insert(key, ethernet);
    }

    let doc = value!({
        "network": {
            "version": 2,
            "renderer": "networkd",
            "ethernets": (ethernets),
        },
    });
    let yaml = facet_yaml::to_string(&doc).map_err(|e| HerdError::Validation {
        message: format!("rendering netplan config for {}: {e}", spec.name),
    })?;
    Ok(yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string())
}

/// Write the rendered file into the staging directory `dir` and return its path.
pub async fn stage(
    dir: &Path,
    spec: &VmSpec,
    opts: &NetplanOptions,
) -> Result<PathBuf, HerdError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| HerdError::Io {
            context: format!("creating directory {}", dir.display()),
            source: e,
        })?;
    let path = dir.join(format!("{}-netplan.yaml", spec.name));
    tokio::fs::write(&path, render(spec, opts)?)
        .await
        .map_err(|e| HerdError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })?;
    tracing::debug!(vm = %spec.name, path = %path.display(), "staged netplan config");
    Ok(path)
}

/// Remove a staged file. Missing files are fine.
pub async fn unstage(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), "failed to remove staged netplan file: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use facet::Facet;

    use super::*;
    use crate::planner::{NetworkSpec, Resources};

    fn spec() -> VmSpec {
        VmSpec {
            basename: "lab".into(),
            serial: 1,
            name: "lab01".into(),
            network: NetworkSpec {
                ip: Ipv4Addr::new(10, 9, 9, 210),
                prefix_len: 24,
                gateway: Ipv4Addr::new(10, 9, 9, 1),
                bridge: "br0".into(),
            },
            resources: Resources {
                vcpus: 2,
                memory_mb: 2048,
            },
            template: "golden".into(),
        }
    }

    /// Read-back shape, enough to check what netplan will see.
    #[derive(Facet)]
    struct Doc {
        network: Network,
    }

    #[derive(Facet)]
    struct Network {
        version: u32,
        renderer: String,
        ethernets: BTreeMap<String, Ethernet>,
    }

    #[derive(Facet)]
    struct Ethernet {
        #[facet(rename = "match", default)]
        matcher: Option<Match>,
        dhcp4: bool,
        addresses: Vec<String>,
        routes: Vec<Route>,
        #[facet(default)]
        nameservers: Option<Nameservers>,
    }

    #[derive(Facet)]
    struct Match {
        name: String,
    }

    #[derive(Facet)]
    struct Route {
        to: String,
        via: String,
        #[facet(rename = "on-link", default)]
        on_link: Option<bool>,
    }

    #[derive(Facet)]
    struct Nameservers {
        addresses: Vec<String>,
    }

    fn parse(yaml: &str) -> Network {
        facet_yaml::from_str::<Doc>(yaml).unwrap().network
    }

    #[test]
    fn renders_static_address_with_default_match() {
        let yaml = render(&spec(), &NetplanOptions::default()).unwrap();
        assert!(!yaml.starts_with("---"));

        let net = parse(&yaml);
        assert_eq!(net.version, 2);
        assert_eq!(net.renderer, "networkd");
        let eth = &net.ethernets["id0"];
        assert_eq!(eth.matcher.as_ref().unwrap().name, "en*");
        assert!(!eth.dhcp4);
        assert_eq!(eth.addresses, ["10.9.9.210/24"]);
        assert_eq!(eth.routes[0].to, "default");
        assert_eq!(eth.routes[0].via, "10.9.9.1");
        assert_eq!(eth.routes[0].on_link, None);
        assert!(eth.nameservers.is_none());
    }

    #[test]
    fn renders_named_interface_and_nameservers() {
        let opts = NetplanOptions {
            interface: "enp1s0".into(),
            nameservers: vec!["10.9.9.1".into(), "1.1.1.1".into()],
        };
        let net = parse(&render(&spec(), &opts).unwrap());
        let eth = &net.ethernets["enp1s0"];
        assert!(eth.matcher.is_none());
        assert_eq!(
            eth.nameservers.as_ref().unwrap().addresses,
            ["10.9.9.1", "1.1.1.1"]
        );
    }

    #[test]
    fn interface_name_is_quoted_as_a_key() {
        let opts = NetplanOptions {
            interface: "enp1s0 # uplink".into(),
            nameservers: vec![],
        };
        let net = parse(&render(&spec(), &opts).unwrap());
        assert_eq!(
            net.ethernets.keys().collect::<Vec<_>>(),
            ["enp1s0 # uplink"]
        );
    }

    #[test]
    fn off_subnet_gateway_is_on_link() {
        let mut s = spec();
        s.network.gateway = Ipv4Addr::new(10, 9, 8, 1);
        let net = parse(&render(&s, &NetplanOptions::default()).unwrap());
        assert_eq!(net.ethernets["id0"].routes[0].on_link, Some(true));
    }

    #[tokio::test]
    async fn stage_and_unstage() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage(dir.path(), &spec(), &NetplanOptions::default())
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "lab01-netplan.yaml");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("10.9.9.210/24"));

        unstage(&path).await;
        assert!(!path.exists());
        // Second removal is silent.
        unstage(&path).await;
    }
}
