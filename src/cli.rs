use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::planner::FleetParams;

#[derive(Parser, Debug)]
#[command(
    name = "herd",
    version,
    about = "Provision and tear down serial-numbered VM fleets via libvirt"
)]
pub struct Cli {
    /// Path to config file (default: ./herd.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print per-VM results
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Interactive on a TTY, plain otherwise
    Auto,
    Interactive,
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Clone, configure and boot a fleet from a template VM
    Create(FleetArgs),

    /// Print the fleet `create` would build, without touching anything
    Plan(FleetArgs),

    /// Force stop and remove VMs with their storage
    #[command(override_usage = "herd destroy <BASENAME> <SERIAL_RANGE>")]
    Destroy {
        /// <basename> <serial_range>, e.g. `vmguest 01-03`
        #[arg(num_args = 0..)]
        args: Vec<String>,
    },

    /// Show the tracked provisioning state of a range of VMs
    Status {
        basename: String,
        /// Serial range, e.g. `01-03`
        range: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct FleetArgs {
    /// Name prefix; VMs are named <basename><NN>
    #[arg(long)]
    pub basename: String,

    /// Number of VMs
    #[arg(long)]
    pub vm_count: u32,

    /// Serial of the first VM
    #[arg(long, default_value_t = 1)]
    pub first_serial: u32,

    /// Host bridge for the VMs' network interface
    #[arg(long)]
    pub network_bridge: String,

    /// vCPUs per VM
    #[arg(long)]
    pub vcpu: u32,

    /// Memory per VM, in MB or with a unit (e.g. 2048, 2G)
    #[arg(long)]
    pub memory: String,

    /// Address of the first VM; the rest count up from it
    #[arg(long)]
    pub base_ip: Option<String>,

    /// Prefix length or dotted netmask (e.g. 24 or 255.255.255.0)
    #[arg(long)]
    pub mask: Option<String>,

    /// Default gateway
    #[arg(long)]
    pub gw: Option<String>,

    /// Template VM to clone (overrides config)
    #[arg(long)]
    pub template: Option<String>,

    /// VMs provisioned at once (overrides config)
    #[arg(long)]
    pub workers: Option<usize>,

    /// What to do when a VM fails: continue or abort (overrides config)
    #[arg(long)]
    pub on_error: Option<String>,
}

impl FleetArgs {
    /// Planner input, with the template falling back to the configured one.
    pub fn to_params(&self, default_template: &str) -> FleetParams {
        FleetParams {
            basename: self.basename.clone(),
            first_serial: self.first_serial,
            vm_count: self.vm_count,
            bridge: self.network_bridge.clone(),
            vcpus: self.vcpu,
            memory: self.memory.clone(),
            base_ip: self.base_ip.clone(),
            mask: self.mask.clone(),
            gateway: self.gw.clone(),
            template: self
                .template
                .clone()
                .unwrap_or_else(|| default_template.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("herd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn create_flags_map_to_params() {
        let cli = parse(&[
            "create",
            "--basename",
            "lab",
            "--vm-count",
            "2",
            "--network-bridge",
            "br0",
            "--vcpu",
            "2",
            "--memory",
            "2048",
            "--base-ip",
            "10.9.9.210",
            "--mask",
            "24",
            "--gw",
            "10.9.9.1",
        ]);
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        let params = args.to_params("ubuntu-template");
        assert_eq!(params.basename, "lab");
        assert_eq!(params.first_serial, 1);
        assert_eq!(params.bridge, "br0");
        assert_eq!(params.gateway.as_deref(), Some("10.9.9.1"));
        assert_eq!(params.template, "ubuntu-template");
    }

    #[test]
    fn template_flag_overrides_config() {
        let cli = parse(&[
            "plan",
            "--basename",
            "lab",
            "--vm-count",
            "1",
            "--network-bridge",
            "br0",
            "--vcpu",
            "1",
            "--memory",
            "1G",
            "--template",
            "golden",
        ]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.to_params("ubuntu-template").template, "golden");
        assert!(args.base_ip.is_none());
    }

    #[test]
    fn destroy_takes_free_arguments() {
        let cli = parse(&["destroy", "vmguest", "01-03"]);
        let Command::Destroy { args } = cli.command else {
            panic!("expected destroy");
        };
        assert_eq!(args, ["vmguest", "01-03"]);

        let cli = parse(&["destroy"]);
        assert!(matches!(cli.command, Command::Destroy { args } if args.is_empty()));
    }

    #[test]
    fn output_and_globals_after_subcommand() {
        let cli = parse(&["status", "lab", "01-02", "--output", "json", "-q"]);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(cli.quiet);
    }
}
