use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HerdError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("invalid serial range: {message}")]
    InvalidRange { message: String },

    #[error("invalid address: {message}")]
    InvalidAddress { message: String },

    #[error("address overflow: {base} + {offset} runs past .255")]
    #[diagnostic(help("pick a lower base_ip or a smaller vm_count"))]
    AddressOverflow { base: String, offset: u32 },

    #[error("{vm}: step '{step}' failed: {message}")]
    HypervisorCallFailed {
        step: String,
        vm: String,
        message: String,
    },

    #[error("{vm}: step '{step}' timed out after {seconds}s")]
    Timeout {
        step: String,
        vm: String,
        seconds: u64,
    },

    #[error("VM '{name}' does not exist")]
    VmNotFound { name: String },

    #[error("libvirt error: {message}")]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state store error for '{name}': {message}")]
    StateStore { name: String, message: String },

    #[error("{failed} of {total} VMs failed")]
    FleetFailed { failed: usize, total: usize },
}
