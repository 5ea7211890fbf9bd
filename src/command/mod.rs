//! Command-line front end
//!
//! This module handles:
//! - Building the argument parser from the command registry
//! - Turning a command outcome into the JSON report

mod args;
mod report;

pub use args::{cli, from_matches, Invocation, RunConfig};
pub use report::Report;
