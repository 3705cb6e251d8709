//! Layered YAML configuration: a baseline document merged with a user
//! overlay. Exposes the enabled probe definitions and scalar settings.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde_yaml::Value as YamlValue;
use tracing::{error, Level};

use crate::error::ConfigError;

/// A resolved configuration scalar or structured value. String values may
/// still contain unexpanded `{token}` placeholders until
/// [`crate::template::expand`] runs over them.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Seq(Vec<ConfigValue>),
    Null,
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&YamlValue> for ConfigValue {
    fn from(v: &YamlValue) -> Self {
        match v {
            YamlValue::Null => ConfigValue::Null,
            YamlValue::Bool(b) => ConfigValue::Bool(*b),
            YamlValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ConfigValue::Int(i)
                } else {
                    ConfigValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            YamlValue::String(s) => ConfigValue::Str(s.clone()),
            YamlValue::Sequence(seq) => ConfigValue::Seq(seq.iter().map(ConfigValue::from).collect()),
            // Mappings are not meaningful as a single probe-conf value in
            // this wire format; represent them opaquely rather than guess.
            YamlValue::Mapping(_) | YamlValue::Tagged(_) => ConfigValue::Null,
        }
    }
}

/// One `app_checks` entry, resolved from the merged configuration document.
#[derive(Debug, Clone)]
pub struct ProbeDefinition {
    pub name: String,
    pub module_name: String,
    pub conf: HashMap<String, ConfigValue>,
    pub interval: Duration,
    pub enabled: bool,
}

fn mapping_get<'a>(doc: &'a YamlValue, key: &str) -> Option<&'a YamlValue> {
    doc.get(key)
}

fn load_document(path: &Path) -> YamlValue {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(source) => {
            error!(
                error = %ConfigError::Read { path: path.display().to_string(), source },
                "treating as empty document"
            );
            return YamlValue::Mapping(Default::default());
        }
    };
    match serde_yaml::from_str(&text) {
        Ok(v) => v,
        Err(source) => {
            error!(
                error = %ConfigError::Parse { path: path.display().to_string(), source },
                "treating as empty document"
            );
            YamlValue::Mapping(Default::default())
        }
    }
}

fn parse_probe_def(node: &YamlValue) -> Option<ProbeDefinition> {
    let name = mapping_get(node, "name")?.as_str()?.to_string();
    let module_name = mapping_get(node, "check_module")
        .and_then(|v| v.as_str())
        .unwrap_or(&name)
        .to_string();
    let interval_secs = mapping_get(node, "interval").and_then(|v| v.as_u64()).unwrap_or(1);
    let enabled = mapping_get(node, "enabled").and_then(|v| v.as_bool()).unwrap_or(true);
    let conf = mapping_get(node, "conf")
        .and_then(|v| v.as_mapping())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), ConfigValue::from(v))))
                .collect()
        })
        .unwrap_or_default();

    Some(ProbeDefinition {
        name,
        module_name,
        conf,
        interval: Duration::from_secs(interval_secs),
        enabled,
    })
}

/// Merged view over a baseline and an overlay YAML document.
pub struct ConfigStore {
    default_root: YamlValue,
    overlay_root: YamlValue,
}

impl ConfigStore {
    pub fn load(default_path: &Path, overlay_path: &Path) -> Self {
        Self {
            default_root: load_document(default_path),
            overlay_root: load_document(overlay_path),
        }
    }

    #[cfg(test)]
    pub fn from_yaml(default_yaml: &str, overlay_yaml: &str) -> Self {
        Self {
            default_root: serde_yaml::from_str(default_yaml).unwrap_or(YamlValue::Mapping(Default::default())),
            overlay_root: serde_yaml::from_str(overlay_yaml).unwrap_or(YamlValue::Mapping(Default::default())),
        }
    }

    fn sequence(doc: &YamlValue, key: &str) -> Vec<YamlValue> {
        mapping_get(doc, key)
            .and_then(|v| v.as_sequence())
            .cloned()
            .unwrap_or_default()
    }

    /// Enabled probe definitions, overlay entries winning over baseline
    /// entries with the same `name`.
    ///
    /// The source concatenates overlay before baseline then reverses the
    /// whole list before indexing by name, so that later (baseline) entries
    /// never clobber earlier (overlay) ones when building the name map. We
    /// get the identical observable result by ingesting baseline first and
    /// letting overlay entries overwrite it.
    pub fn enabled_probes(&self) -> Vec<ProbeDefinition> {
        let mut by_name: HashMap<String, ProbeDefinition> = HashMap::new();

        for node in Self::sequence(&self.default_root, "app_checks") {
            if let Some(def) = parse_probe_def(&node) {
                by_name.insert(def.name.clone(), def);
            }
        }
        for node in Self::sequence(&self.overlay_root, "app_checks") {
            if let Some(def) = parse_probe_def(&node) {
                by_name.insert(def.name.clone(), def);
            }
        }

        by_name.into_values().filter(|d| d.enabled).collect()
    }

    /// Two-level `section.key` lookup: overlay wins, then baseline, then
    /// `default`.
    pub fn setting(&self, section: &str, key: &str, default: ConfigValue) -> ConfigValue {
        if let Some(v) = mapping_get(&self.overlay_root, section).and_then(|s| mapping_get(s, key)) {
            return ConfigValue::from(v);
        }
        if let Some(v) = mapping_get(&self.default_root, section).and_then(|s| mapping_get(s, key)) {
            return ConfigValue::from(v);
        }
        default
    }

    pub fn log_level(&self) -> Level {
        match self.setting("log", "file_priority", ConfigValue::Str("info".into())) {
            ConfigValue::Str(s) => match s.as_str() {
                "error" => Level::ERROR,
                "warning" => Level::WARN,
                "debug" => Level::DEBUG,
                _ => Level::INFO,
            },
            _ => Level::INFO,
        }
    }

    /// The `SYSDIG_HOST_ROOT`-style prefix used to build `/proc/<pid>/ns/<ns>`
    /// paths, including the worker's own. Environment-sourced, independent of
    /// the two layered YAML documents; empty string when unset.
    pub fn ns_root(&self) -> String {
        std::env::var("SYSDIG_HOST_ROOT").unwrap_or_default()
    }

    /// The prefix used for IPC-adjacent path construction. Same source as
    /// [`ConfigStore::ns_root`]; kept as a distinct accessor since the two
    /// concerns (namespace paths, IPC paths) are conceptually separate even
    /// though they read the same environment variable today.
    pub fn ipc_root(&self) -> String {
        self.ns_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASELINE: &str = r#"
app_checks:
  - name: echo
    interval: 5
    conf:
      greeting: hello
  - name: http
    enabled: false
"#;

    const OVERLAY: &str = r#"
app_checks:
  - name: echo
    conf:
      greeting: overridden
log:
  file_priority: debug
"#;

    #[test]
    fn overlay_wins_on_duplicate_name() {
        let store = ConfigStore::from_yaml(BASELINE, OVERLAY);
        let probes = store.enabled_probes();
        assert_eq!(probes.len(), 1);
        let echo = &probes[0];
        assert_eq!(echo.name, "echo");
        assert_eq!(echo.conf.get("greeting").unwrap().as_str(), Some("overridden"));
    }

    #[test]
    fn disabled_entries_are_excluded() {
        let store = ConfigStore::from_yaml(BASELINE, OVERLAY);
        assert!(store.enabled_probes().iter().all(|d| d.name != "http"));
    }

    #[test]
    fn setting_falls_back_through_layers() {
        let store = ConfigStore::from_yaml(BASELINE, OVERLAY);
        assert_eq!(store.log_level(), Level::DEBUG);
        assert_eq!(
            store.setting("nonexistent", "key", ConfigValue::Str("fallback".into())),
            ConfigValue::Str("fallback".into())
        );
    }

    #[test]
    fn missing_files_yield_empty_documents() {
        let store = ConfigStore::load(Path::new("/nonexistent/default.yaml"), Path::new("/nonexistent/overlay.yaml"));
        assert!(store.enabled_probes().is_empty());
    }

    #[test]
    fn reload_is_deterministic() {
        let a = ConfigStore::from_yaml(BASELINE, OVERLAY).enabled_probes();
        let b = ConfigStore::from_yaml(BASELINE, OVERLAY).enabled_probes();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].name, b[0].name);
    }

    #[test]
    fn ns_root_and_ipc_root_are_env_sourced_not_document_sourced() {
        // Baseline/overlay carry no `SYSDIG_HOST_ROOT`-equivalent key anywhere;
        // both accessors must still resolve without consulting either document.
        let store = ConfigStore::from_yaml(BASELINE, OVERLAY);
        assert_eq!(store.ns_root(), std::env::var("SYSDIG_HOST_ROOT").unwrap_or_default());
        assert_eq!(store.ipc_root(), store.ns_root());
    }
}
