//! Command-line surface: the default daemon mode, plus a `run-check`
//! debug mode that exercises one probe against one live pid without
//! touching the IPC queues.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sdc-app-checks")]
#[command(about = "Sidecar application check runner")]
#[command(version)]
pub struct Args {
    /// Baseline configuration file path.
    #[arg(long, default_value = "/opt/draios/etc/dragent.default.yaml")]
    pub default_config: PathBuf,

    /// User overlay configuration file path.
    #[arg(long, default_value = "/opt/draios/etc/dragent.yaml")]
    pub overlay_config: PathBuf,

    /// Enable verbose (debug-level) logging, overriding configured log level.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one named check against one pid directly, print the result, and
    /// exit — does not open any IPC queue.
    RunCheck {
        check_name: String,
        pid: i32,
        /// Virtual pid as seen inside the target's own namespace.
        #[arg(long, default_value_t = 1)]
        vpid: i32,
        /// Port to make available to template expansion and probes.
        #[arg(long)]
        port: Option<u16>,
    },
}
