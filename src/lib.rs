#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod config;
pub mod decommission;
pub mod domain_xml;
pub mod error;
pub mod logging;
pub mod netplan;
pub mod observer;
pub mod paths;
pub mod planner;
pub mod provision;
pub mod retry;
pub mod state;
pub mod util;
pub mod vm_state;
