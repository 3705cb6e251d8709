//! The main request/response loop: decode one batch, resolve or build a
//! `ProbeInstance` per pid, run it, aggregate results, encode one response,
//! then do periodic cache maintenance and emit a heartbeat.

use std::collections::HashMap;
use std::io::Write;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, error};

use crate::cache::InstanceCache;
use crate::config::{ConfigStore, ProbeDefinition};
use crate::ipc::IpcEndpoint;
use crate::namespace::NamespaceGate;
use crate::probe::{AgentConfig, Metric, ProbeInstance, ProbeRegistry, ProcessRequestRecord, ServiceCheck};

#[derive(Debug, Serialize)]
struct ResponseEntry {
    pid: i32,
    display_name: String,
    metrics: Vec<Metric>,
    service_checks: Vec<ServiceCheck>,
    expiration_ts: i64,
}

pub struct Dispatcher {
    probe_defs: HashMap<String, ProbeDefinition>,
    registry: ProbeRegistry,
    gate: NamespaceGate,
    agent_config: AgentConfig,
    cache: InstanceCache,
}

impl Dispatcher {
    /// Resolves `config.enabled_probes()` exactly once: per the lifecycle
    /// note that `ProbeDefinition`s are created at startup and immutable
    /// thereafter, nothing in the request path re-reads `config`.
    pub fn new(config: ConfigStore, registry: ProbeRegistry, gate: NamespaceGate, agent_config: AgentConfig) -> Self {
        let probe_defs = config.enabled_probes().into_iter().map(|def| (def.name.clone(), def)).collect();
        Self {
            probe_defs,
            registry,
            gate,
            agent_config,
            cache: InstanceCache::new(),
        }
    }

    /// Process exactly one inbound batch, returning the encoded JSON
    /// response. This is the unit the dispatch loop and `run-check` both
    /// build on.
    pub fn handle_batch(&mut self, requests: Vec<ProcessRequestRecord>) -> Vec<u8> {
        self.cache.begin_request();
        let mut response = Vec::with_capacity(requests.len());

        for request in requests {
            self.cache.touch(request.pid);

            // Checked unconditionally, not just on the "must construct"
            // path: a pid blacklisted by a prior run error keeps its
            // retained ProbeInstance in the cache and must still be
            // skipped on every later batch until the blacklist flushes.
            if self.cache.is_blacklisted(request.pid) {
                debug!(pid = request.pid, "process is blacklisted");
                continue;
            }

            if self.cache.get_mut(request.pid).is_none() {
                let def = match self.probe_defs.get(&request.check) {
                    Some(def) => def,
                    None => {
                        error!(check = %request.check, "cannot find check configuration for name");
                        continue;
                    }
                };

                match ProbeInstance::create(def, &request, &self.registry, &self.gate, &self.agent_config) {
                    Ok(instance) => self.cache.insert(request.pid, instance),
                    Err(e) => {
                        error!(pid = request.pid, check = %def.name, error = %e, "exception on creating check");
                        self.cache.blacklist(request.pid);
                        continue;
                    }
                }
            }

            let instance = self.cache.get_mut(request.pid).expect("just inserted or already present");
            let (metrics, service_checks, run_error) = instance.run(&self.gate);
            // Pulled out now: `instance` must not be touched again below, since
            // the cache calls that follow need to re-borrow `self.cache`.
            let name = instance.name.clone();
            let interval = instance.interval;

            if let Some(err) = run_error {
                if !self.cache.is_blacklisted(request.pid) {
                    error!(pid = request.pid, check = %name, error = %err, "exception on running check");
                    self.cache.blacklist(request.pid);
                }
            }

            let expiration_ts = (SystemTime::now() + interval)
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;

            response.push(ResponseEntry {
                pid: request.pid,
                display_name: name,
                metrics,
                service_checks,
                expiration_ts,
            });
        }

        serde_json::to_vec(&response).unwrap_or_else(|_| b"[]".to_vec())
    }

    pub fn run_periodic_maintenance(&mut self, now: Instant) {
        self.cache.run_periodic_maintenance(now);
    }

    /// Writes `HB,<pid>,<max_rss_kb>,<unix_seconds>\n` to `out` and flushes
    /// it immediately.
    pub fn emit_heartbeat<W: Write>(out: &mut W) -> std::io::Result<()> {
        let pid = std::process::id();
        let max_rss_kb = max_rss_kb();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        write!(out, "HB,{pid},{max_rss_kb},{now}\n")?;
        out.flush()
    }
}

fn max_rss_kb() -> i64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if ret != 0 {
        return 0;
    }
    usage.ru_maxrss as i64
}

/// Receives one batch (bounded timeout), dispatches it, and sends the
/// response on `out`; on "queue full" the response is silently dropped —
/// the agent is expected to have stalled.
pub fn run_loop(
    dispatcher: &mut Dispatcher,
    inqueue: &IpcEndpoint,
    outqueue: &IpcEndpoint,
    stderr: &mut impl Write,
    receive_timeout_secs: i64,
    mut should_continue: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    while should_continue() {
        if let Some(bytes) = inqueue.receive(receive_timeout_secs)? {
            match serde_json::from_slice::<Vec<ProcessRequestRecord>>(&bytes) {
                Ok(requests) => {
                    let response = dispatcher.handle_batch(requests);
                    match outqueue.send(&response) {
                        Ok(true) => {}
                        Ok(false) => error!("outbound queue full or rejected message, response dropped"),
                        Err(e) => error!(error = %e, "failed to send response"),
                    }
                }
                Err(e) => error!(error = %e, "malformed inbound request batch"),
            }
        }

        dispatcher.run_periodic_maintenance(Instant::now());
        Dispatcher::emit_heartbeat(stderr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::builtin_registry;
    use std::time::Duration as StdDuration;

    fn dispatcher_with(default_yaml: &str, overlay_yaml: &str) -> Dispatcher {
        let config = ConfigStore::from_yaml(default_yaml, overlay_yaml);
        let registry = builtin_registry();
        let gate = NamespaceGate::open(String::new()); // no container support in test sandbox
        let agent_config = AgentConfig::new("test-host".to_string());
        Dispatcher::new(config, registry, gate, agent_config)
    }

    const ECHO_CONFIG: &str = r#"
app_checks:
  - name: echo
    interval: 1
"#;

    #[test]
    fn s1_trivial_probe_roundtrip() {
        let mut dispatcher = dispatcher_with(ECHO_CONFIG, "");
        let requests = vec![ProcessRequestRecord {
            pid: 100,
            vpid: 1,
            check: "echo".into(),
            ports: vec![8080],
        }];
        let response = dispatcher.handle_batch(requests);
        let parsed: serde_json::Value = serde_json::from_slice(&response).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["pid"], 100);
        assert_eq!(entries[0]["display_name"], "echo");
        assert_eq!(entries[0]["metrics"][0]["name"], "up");
    }

    #[test]
    fn s3_unknown_probe_is_silently_omitted() {
        let mut dispatcher = dispatcher_with(ECHO_CONFIG, "");
        let requests = vec![ProcessRequestRecord {
            pid: 101,
            vpid: 1,
            check: "missing".into(),
            ports: vec![],
        }];
        let response = dispatcher.handle_batch(requests);
        let parsed: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 0);
        assert!(!dispatcher.cache.is_blacklisted(101));
    }

    #[test]
    fn s6_cache_eviction_after_interval() {
        let mut dispatcher = dispatcher_with(ECHO_CONFIG, "");
        dispatcher.handle_batch(vec![ProcessRequestRecord {
            pid: 100,
            vpid: 1,
            check: "echo".into(),
            ports: vec![],
        }]);
        assert!(dispatcher.cache.contains_known(100));

        // Simulate the next batch, 11 minutes later, not mentioning pid 100.
        dispatcher.handle_batch(vec![]);
        let future = Instant::now() + StdDuration::from_secs(11 * 60);
        dispatcher.run_periodic_maintenance(future);

        assert!(!dispatcher.cache.contains_known(100));
    }

    const TCP_CONNECT_FAILING_CONFIG: &str = r#"
app_checks:
  - name: tcp_connect
    interval: 1
    conf:
      host: 127.0.0.1
      port: 1
"#;

    #[test]
    fn s4_probe_run_error_blacklists_and_is_skipped_next_batch() {
        let mut dispatcher = dispatcher_with(TCP_CONNECT_FAILING_CONFIG, "");
        let request = || ProcessRequestRecord {
            pid: 200,
            vpid: 1,
            check: "tcp_connect".into(),
            ports: vec![],
        };

        let first = dispatcher.handle_batch(vec![request()]);
        let parsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 1, "the failing batch still carries the pid's entry");
        assert_eq!(entries[0]["pid"], 200);
        assert!(dispatcher.cache.is_blacklisted(200));
        assert!(dispatcher.cache.contains_known(200), "instance is retained, not evicted, on a run error");

        let second = dispatcher.handle_batch(vec![request()]);
        let parsed: serde_json::Value = serde_json::from_slice(&second).unwrap();
        assert_eq!(
            parsed.as_array().unwrap().len(),
            0,
            "a blacklisted pid is silently skipped on the next batch"
        );
    }

    #[test]
    fn probe_name_unknown_does_not_blacklist() {
        let mut dispatcher = dispatcher_with("", "");
        dispatcher.handle_batch(vec![ProcessRequestRecord {
            pid: 5,
            vpid: 1,
            check: "anything".into(),
            ports: vec![],
        }]);
        assert!(!dispatcher.cache.is_blacklisted(5));
    }
}
