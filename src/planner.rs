//! Fleet planning: expand a base name, serial range and shared parameters
//! into the ordered list of concrete VM specifications.
//!
//! Planning is pure. Every validation error surfaces here, before any
//! hypervisor call is made.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::error::HerdError;
use crate::util;

/// Serials print with at least this many digits (`lab01`, `lab02`, ...).
pub const SERIAL_WIDTH: usize = 2;

/// Inclusive range of VM serials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialRange {
    start: u32,
    end: u32,
}

impl SerialRange {
    pub fn new(start: u32, end: u32) -> Result<Self, HerdError> {
        if start > end {
            return Err(HerdError::InvalidRange {
                message: format!("start {start} is greater than end {end}"),
            });
        }
        Ok(Self { start, end })
    }

    /// `count` serials beginning at `first`.
    pub fn from_count(first: u32, count: u32) -> Result<Self, HerdError> {
        if count == 0 {
            return Err(HerdError::InvalidRange {
                message: "vm_count must be at least 1".into(),
            });
        }
        let end = first
            .checked_add(count - 1)
            .ok_or_else(|| HerdError::InvalidRange {
                message: format!("{count} serials starting at {first} overflow"),
            })?;
        Self::new(first, end)
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    /// VM names for every serial in the range, in order.
    pub fn names(&self, basename: &str) -> Vec<String> {
        self.iter().map(|s| vm_name(basename, s)).collect()
    }
}

impl FromStr for SerialRange {
    type Err = HerdError;

    /// Parse `NN-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.split_once('-').ok_or_else(|| HerdError::InvalidRange {
            message: format!("expected NN-MM, got '{s}'"),
        })?;
        let parse = |part: &str| -> Result<u32, HerdError> {
            let part = part.trim();
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(HerdError::InvalidRange {
                    message: format!("'{part}' is not a serial number in '{s}'"),
                });
            }
            part.parse().map_err(|_| HerdError::InvalidRange {
                message: format!("serial '{part}' is too large"),
            })
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

impl fmt::Display for SerialRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0w$}-{:0w$}",
            self.start,
            self.end,
            w = SERIAL_WIDTH
        )
    }
}

/// `basename` followed by the zero-padded serial.
pub fn vm_name(basename: &str, serial: u32) -> String {
    format!("{basename}{serial:0width$}", width = SERIAL_WIDTH)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub bridge: String,
}

impl NetworkSpec {
    /// `ip/prefix` notation as written into netplan.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.prefix_len)
    }

    /// Whether the gateway is reachable without an on-link route.
    pub fn gateway_in_subnet(&self) -> bool {
        let mask = prefix_mask(self.prefix_len);
        u32::from(self.ip) & mask == u32::from(self.gateway) & mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub vcpus: u32,
    pub memory_mb: u64,
}

impl Resources {
    pub fn memory_kib(&self) -> u64 {
        self.memory_mb.saturating_mul(1024)
    }
}

/// One fleet member, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub basename: String,
    pub serial: u32,
    pub name: String,
    pub network: NetworkSpec,
    pub resources: Resources,
    pub template: String,
}

/// Raw fleet parameters as they arrive from the command line.
///
/// Address fields are optional so that a missing one is reported as a
/// validation error rather than a usage error.
#[derive(Debug, Clone, Default)]
pub struct FleetParams {
    pub basename: String,
    pub first_serial: u32,
    pub vm_count: u32,
    pub bridge: String,
    pub vcpus: u32,
    pub memory: String,
    pub base_ip: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub template: String,
}

/// A validated request to build a fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetRequest {
    pub basename: String,
    pub serials: SerialRange,
    pub base_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub bridge: String,
    pub resources: Resources,
    pub template: String,
}

impl FleetRequest {
    pub fn from_params(params: &FleetParams) -> Result<Self, HerdError> {
        validate_basename(&params.basename)?;
        let serials = SerialRange::from_count(params.first_serial, params.vm_count)?;

        if params.template.is_empty() {
            return Err(HerdError::Validation {
                message: "a template VM is required (--template or hypervisor.template)".into(),
            });
        }
        if params.bridge.is_empty() {
            return Err(HerdError::Validation {
                message: "network_bridge must not be empty".into(),
            });
        }
        if params.vcpus == 0 {
            return Err(HerdError::Validation {
                message: "vcpu must be greater than 0".into(),
            });
        }
        let memory_mb = util::parse_memory_mb(&params.memory)?;

        let base_ip = parse_ipv4("base_ip", params.base_ip.as_deref())?;
        let prefix_len = parse_mask(params.mask.as_deref())?;
        let gateway = parse_ipv4("gw", params.gateway.as_deref())?;

        Ok(Self {
            basename: params.basename.clone(),
            serials,
            base_ip,
            prefix_len,
            gateway,
            bridge: params.bridge.clone(),
            resources: Resources {
                vcpus: params.vcpus,
                memory_mb,
            },
            template: params.template.clone(),
        })
    }

    /// Expand into one spec per serial, in serial order.
    ///
    /// Fails with `AddressOverflow` if any VM's last octet would pass 255,
    /// and with `InvalidAddress` if a VM would take the gateway's address.
    pub fn plan(&self) -> Result<Vec<VmSpec>, HerdError> {
        let mut specs = Vec::with_capacity(self.serials.len());
        for (offset, serial) in self.serials.iter().enumerate() {
            let ip = offset_ip(self.base_ip, offset as u32)?;
            if ip == self.gateway {
                return Err(HerdError::InvalidAddress {
                    message: format!(
                        "{} would be assigned the gateway address {ip}",
                        vm_name(&self.basename, serial)
                    ),
                });
            }
            specs.push(VmSpec {
                basename: self.basename.clone(),
                serial,
                name: vm_name(&self.basename, serial),
                network: NetworkSpec {
                    ip,
                    prefix_len: self.prefix_len,
                    gateway: self.gateway,
                    bridge: self.bridge.clone(),
                },
                resources: self.resources,
                template: self.template.clone(),
            });
        }
        Ok(specs)
    }
}

/// `base` with `offset` added to its last octet. Never carries into the
/// third octet.
pub fn offset_ip(base: Ipv4Addr, offset: u32) -> Result<Ipv4Addr, HerdError> {
    let [a, b, c, d] = base.octets();
    let last = u32::from(d)
        .checked_add(offset)
        .filter(|v| *v <= 255)
        .ok_or_else(|| HerdError::AddressOverflow {
            base: base.to_string(),
            offset,
        })?;
    Ok(Ipv4Addr::new(a, b, c, last as u8))
}

pub fn validate_basename(name: &str) -> Result<(), HerdError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(HerdError::Validation {
            message: format!("basename must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

fn parse_ipv4(field: &str, value: Option<&str>) -> Result<Ipv4Addr, HerdError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HerdError::InvalidAddress {
            message: format!("{field} is required"),
        })?;
    value.parse().map_err(|_| HerdError::InvalidAddress {
        message: format!("{field} '{value}' is not a dotted-quad IPv4 address"),
    })
}

/// Accepts a prefix length (`24`, `/24`) or a dotted netmask (`255.255.255.0`).
fn parse_mask(value: Option<&str>) -> Result<u8, HerdError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HerdError::InvalidAddress {
            message: "mask is required".into(),
        })?;
    let invalid = || HerdError::InvalidAddress {
        message: format!("mask '{value}' must be a prefix length in 1..=32 or a netmask"),
    };

    let prefix = if value.contains('.') {
        let bits = u32::from(value.parse::<Ipv4Addr>().map_err(|_| invalid())?);
        let ones = bits.leading_ones();
        if bits.checked_shl(ones).unwrap_or(0) != 0 {
            return Err(invalid());
        }
        ones as u8
    } else {
        value
            .trim_start_matches('/')
            .parse::<u8>()
            .map_err(|_| invalid())?
    };

    if !(1..=32).contains(&prefix) {
        return Err(invalid());
    }
    Ok(prefix)
}

fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}
