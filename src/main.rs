//! Sidecar application check runner: dispatches probe checks against
//! processes that may live in foreign mount/network/UTS namespaces,
//! driven by an external agent over a pair of POSIX message queues.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod cli;
mod config;
mod dispatcher;
mod error;
mod ipc;
mod namespace;
mod probe;
mod probes;
mod template;

use cli::{Args, Command};
use config::ConfigStore;
use dispatcher::Dispatcher;
use ipc::{raise_msgqueue_rlimit, IpcEndpoint, QueueDirection};
use namespace::NamespaceGate;
use probe::{AgentConfig, ProbeInstance, ProcessRequestRecord};

const INBOUND_QUEUE: &str = "/sdc_app_checks_in";
const OUTBOUND_QUEUE: &str = "/sdc_app_checks_out";
const QUEUE_DEPTH: i64 = 1;
const RECEIVE_TIMEOUT_SECS: i64 = 1;

static STACK_DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stack_dump(_signum: libc::c_int) {
    STACK_DUMP_REQUESTED.store(true, Ordering::SeqCst);
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = ConfigStore::load(&args.default_config, &args.overlay_config);

    init_logging(&config, args.verbose);

    match args.command {
        Some(Command::RunCheck { check_name, pid, vpid, port }) => run_check(&config, &check_name, pid, vpid, port),
        None => run_daemon(config),
    }
}

fn init_logging(config: &ConfigStore, verbose: bool) {
    let configured = config.log_level().to_string().to_lowercase();
    let default_filter = if verbose { "debug".to_string() } else { configured };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(default_filter),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Runs one check against one live pid outside of the IPC loop, for local
/// debugging. Always exits 0: the resolved configuration and outcome are
/// printed regardless of whether the probe itself failed.
fn run_check(config: &ConfigStore, check_name: &str, pid: i32, vpid: i32, port: Option<u16>) -> Result<()> {
    let registry = probes::builtin_registry();
    let gate = NamespaceGate::open(config.ns_root());
    let agent_config = AgentConfig::new(hostname());

    let def = config
        .enabled_probes()
        .into_iter()
        .find(|d| d.name == check_name)
        .unwrap_or_else(|| config::ProbeDefinition {
            name: check_name.to_string(),
            module_name: check_name.to_string(),
            conf: Default::default(),
            interval: std::time::Duration::from_secs(15),
            enabled: true,
        });

    let request = ProcessRequestRecord {
        pid,
        vpid,
        check: check_name.to_string(),
        ports: port.into_iter().collect(),
    };

    match ProbeInstance::create(&def, &request, &registry, &gate, &agent_config) {
        Ok(mut instance) => {
            println!("instance_conf: {:?}", instance.instance_conf);
            let (metrics, service_checks, error) = instance.run(&gate);
            println!("metrics: {metrics:?}");
            println!("service_checks: {service_checks:?}");
            if let Some(err) = error {
                println!("error: {err}");
            }
        }
        Err(e) => println!("error: {e}"),
    }

    Ok(())
}

fn run_daemon(config: ConfigStore) -> Result<()> {
    info!("starting sidecar application check runner");

    raise_msgqueue_rlimit().context("failed to raise RLIMIT_MSGQUEUE")?;

    unsafe {
        signal::signal(Signal::SIGUSR1, SigHandler::Handler(request_stack_dump))
            .context("failed to install SIGUSR1 handler")?;
    }

    let gate = NamespaceGate::open(config.ns_root());
    if !gate.container_support() {
        tracing::warn!("could not open own namespace handles, running without container crossing support");
    }

    info!(ipc_root = %config.ipc_root(), "resolved IPC path prefix");

    let registry = probes::builtin_registry();
    let agent_config = AgentConfig::new(hostname());
    let mut dispatcher = Dispatcher::new(config, registry, gate, agent_config);

    let inqueue = IpcEndpoint::open(INBOUND_QUEUE, QueueDirection::Receive, QUEUE_DEPTH)
        .context("failed to open inbound IPC queue")?;
    let outqueue = IpcEndpoint::open(OUTBOUND_QUEUE, QueueDirection::Send, QUEUE_DEPTH)
        .context("failed to open outbound IPC queue")?;

    let mut stderr = std::io::stderr();
    dispatcher::run_loop(&mut dispatcher, &inqueue, &outqueue, &mut stderr, RECEIVE_TIMEOUT_SECS, || {
        if STACK_DUMP_REQUESTED.swap(false, Ordering::SeqCst) {
            eprintln!("{}", std::backtrace::Backtrace::force_capture());
        }
        true
    })
}
