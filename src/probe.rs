//! The `Probe` capability trait, the per-process `ProbeInstance` that binds
//! one probe to one target pid, and the registry that resolves probe names
//! to factories.

use std::cell::RefCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigValue, ProbeDefinition};
use crate::error::{NamespaceEnterError, ProbeInitError, ProbeLoadError, ProbeRunError};
use crate::namespace::{NamespaceGate, NamespaceKind};
use crate::template;

/// One element of an inbound IPC request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequestRecord {
    pub pid: i32,
    pub vpid: i32,
    pub check: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Fixed metadata handed to every probe at construction time.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub is_developer_mode: bool,
    pub version: f64,
    pub hostname: String,
    pub api_key: String,
}

impl AgentConfig {
    pub fn new(hostname: String) -> Self {
        Self {
            is_developer_mode: false,
            version: 1.0,
            hostname,
            api_key: String::new(),
        }
    }
}

/// A single emitted metric, `(name, value)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value }
    }
}

/// A service-health verdict, e.g. `("redis.can_connect", "OK")`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCheck {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}

impl ServiceCheck {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
            message: None,
        }
    }
}

/// Per-process resolved configuration handed to [`Probe::check`].
pub type InstanceConf = HashMap<String, ConfigValue>;

/// The capability every probe module must implement. Modeled as a trait
/// object rather than a dynamically-loaded subclass: the registry resolves
/// a name to a boxed factory at startup instead of importing a module at
/// runtime.
pub trait Probe: Send {
    /// Run one collection cycle against `instance_conf`.
    fn check(&mut self, instance_conf: &InstanceConf) -> Result<(), String>;

    /// Metrics buffered since the last call.
    fn metrics(&mut self) -> Vec<Metric>;

    /// Service-check verdicts buffered since the last call.
    fn service_checks(&mut self) -> Vec<ServiceCheck>;

    /// Drain and discard buffered events, bounding memory growth.
    fn drain_events(&mut self) {}

    /// Drain and discard buffered service metadata, bounding memory growth.
    fn drain_service_metadata(&mut self) {}

    /// Namespace kinds this probe needs to enter when its target lives in a
    /// foreign container. Empty by default.
    fn needed_ns(&self) -> &'static [NamespaceKind] {
        &[]
    }
}

/// Builds a fresh [`Probe`] instance for one probe module.
pub trait ProbeFactory: Send + Sync {
    fn create(&self, init_config: &InstanceConf, agent_config: &AgentConfig) -> Box<dyn Probe>;
}

impl<F> ProbeFactory for F
where
    F: Fn(&InstanceConf, &AgentConfig) -> Box<dyn Probe> + Send + Sync,
{
    fn create(&self, init_config: &InstanceConf, agent_config: &AgentConfig) -> Box<dyn Probe> {
        (self)(init_config, agent_config)
    }
}

/// Two compiled-in name -> factory maps: custom entries shadow built-ins by
/// name. `resolved` caches `name -> module_name` so repeated instantiation of
/// the same probe name skips straight to a map lookup instead of re-walking
/// both maps.
pub struct ProbeRegistry {
    custom: HashMap<&'static str, Box<dyn ProbeFactory>>,
    builtin: HashMap<&'static str, Box<dyn ProbeFactory>>,
    resolved: RefCell<HashMap<String, String>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self {
            custom: HashMap::new(),
            builtin: HashMap::new(),
            resolved: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_builtin(mut self, name: &'static str, factory: impl ProbeFactory + 'static) -> Self {
        self.builtin.insert(name, Box::new(factory));
        self
    }

    #[allow(dead_code)]
    pub fn with_custom(mut self, name: &'static str, factory: impl ProbeFactory + 'static) -> Self {
        self.custom.insert(name, Box::new(factory));
        self
    }

    fn lookup(&self, module_name: &str) -> Result<&dyn ProbeFactory, ProbeLoadError> {
        if let Some(f) = self.custom.get(module_name) {
            return Ok(f.as_ref());
        }
        if let Some(f) = self.builtin.get(module_name) {
            return Ok(f.as_ref());
        }
        Err(ProbeLoadError::NotFound(module_name.to_string()))
    }

    /// Resolve probe `name` to its factory via `module_name`, custom registry
    /// first, built-in as a fallback. The `name -> module_name` association
    /// is cached on first resolution, so later calls for the same `name`
    /// skip straight to the cached `module_name` before the map lookup.
    pub fn resolve(&self, name: &str, module_name: &str) -> Result<&dyn ProbeFactory, ProbeLoadError> {
        let cached_module_name = self.resolved.borrow().get(name).cloned();
        if let Some(cached) = cached_module_name {
            return self.lookup(&cached);
        }

        let factory = self.lookup(module_name)?;
        self.resolved.borrow_mut().insert(name.to_string(), module_name.to_string());
        Ok(factory)
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A probe implementation bound to one target pid, with resolved
/// per-process configuration.
pub struct ProbeInstance {
    pub name: String,
    pub pid: i32,
    pub vpid: i32,
    pub interval: std::time::Duration,
    pub is_foreign_namespace: bool,
    pub instance_conf: InstanceConf,
    probe: Box<dyn Probe>,
}

impl ProbeInstance {
    /// Construct a fresh instance for `request`, resolving the probe module
    /// through `registry` and stat-ing the target's mount namespace through
    /// `gate` to decide whether namespace crossing will be required.
    pub fn create(
        def: &ProbeDefinition,
        request: &ProcessRequestRecord,
        registry: &ProbeRegistry,
        gate: &NamespaceGate,
        agent_config: &AgentConfig,
    ) -> Result<Self, ProbeInitError> {
        let factory = registry.resolve(&def.name, &def.module_name)?;
        let init_config = InstanceConf::new();
        let probe = factory.create(&init_config, agent_config);

        let is_foreign_namespace = if gate.container_support() {
            gate.is_foreign(request.pid)
                .map_err(|source| ProbeInitError::NamespaceStat { pid: request.pid, source })?
        } else {
            false
        };

        let mut instance_conf: InstanceConf = HashMap::new();
        instance_conf.insert("host".to_string(), ConfigValue::Str("localhost".to_string()));
        instance_conf.insert("name".to_string(), ConfigValue::Str(def.name.clone()));
        instance_conf.insert(
            "ports".to_string(),
            ConfigValue::Seq(request.ports.iter().map(|p| ConfigValue::Int(*p as i64)).collect()),
        );
        if let Some(first) = request.ports.first() {
            instance_conf.insert("port".to_string(), ConfigValue::Int(*first as i64));
        }

        for (key, value) in &def.conf {
            let resolved = match value {
                ConfigValue::Str(s) => template::expand(s, request).map_err(|source| ProbeInitError::Template {
                    key: key.clone(),
                    source,
                })?,
                other => other.clone(),
            };
            instance_conf.insert(key.clone(), resolved);
        }

        Ok(Self {
            name: def.name.clone(),
            pid: request.pid,
            vpid: request.vpid,
            interval: def.interval,
            is_foreign_namespace,
            instance_conf,
            probe,
        })
    }

    /// Run one collection cycle: optionally cross into the target's
    /// namespaces, call `check`, always drain events/metadata and restore
    /// namespaces, then return whatever metrics/service-checks accumulated.
    pub fn run(&mut self, gate: &NamespaceGate) -> (Vec<Metric>, Vec<ServiceCheck>, Option<ProbeRunError>) {
        let needed_ns = self.probe.needed_ns();
        let check_result: Result<Result<(), String>, NamespaceEnterError> = if self.is_foreign_namespace {
            let probe = &mut self.probe;
            let instance_conf = &self.instance_conf;
            gate.enter(self.pid, needed_ns, move || probe.check(instance_conf))
        } else {
            Ok(self.probe.check(&self.instance_conf))
        };

        let error = match check_result {
            Err(ns_err) => Some(ProbeRunError::Namespace(ns_err)),
            Ok(Err(msg)) => Some(ProbeRunError::Check(msg)),
            Ok(Ok(())) => None,
        };

        self.probe.drain_events();
        self.probe.drain_service_metadata();

        (self.probe.metrics(), self.probe.service_checks(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceGate;
    use crate::probes::builtin_registry;

    fn def_with_conf(conf: HashMap<String, ConfigValue>) -> ProbeDefinition {
        ProbeDefinition {
            name: "echo".to_string(),
            module_name: "echo".to_string(),
            conf,
            interval: std::time::Duration::from_secs(15),
            enabled: true,
        }
    }

    #[test]
    fn s2_template_tokens_expand_against_request_ports() {
        let mut conf = HashMap::new();
        conf.insert("url".to_string(), ConfigValue::Str("http://{port}/status".to_string()));
        let def = def_with_conf(conf);

        let request = ProcessRequestRecord {
            pid: 1,
            vpid: 1,
            check: "echo".to_string(),
            ports: vec![9000, 9001],
        };

        let registry = builtin_registry();
        let gate = NamespaceGate::open(String::new());
        let agent_config = AgentConfig::new("test-host".to_string());

        let instance = ProbeInstance::create(&def, &request, &registry, &gate, &agent_config).unwrap();

        assert_eq!(
            instance.instance_conf.get("url"),
            Some(&ConfigValue::Str("http://9000/status".to_string()))
        );
        assert_eq!(instance.instance_conf.get("port"), Some(&ConfigValue::Int(9000)));
    }

    #[test]
    fn resolve_caches_module_name_by_probe_name() {
        let registry = builtin_registry();
        assert!(registry.resolve("echo", "echo").is_ok());
        // Second call carries a bogus `module_name`; it must still succeed
        // because `name` was already cached against the real module on the
        // first call.
        assert!(registry.resolve("echo", "does-not-exist").is_ok());
    }
}
