//! Error taxonomy for the probe dispatch engine.
//!
//! None of these propagate to the agent as protocol errors; the dispatcher
//! catches every probe-scope error and turns it into a log line plus, for
//! errors raised while running a check, a blacklist entry.

use thiserror::Error;

use crate::namespace::NamespaceKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProbeLoadError {
    #[error("no probe module named {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template token {{{0}}}")]
    UnknownToken(String),
    #[error("template token {{{0}}} requires at least one port")]
    MissingPort(String),
}

#[derive(Debug, Error)]
pub enum ProbeInitError {
    #[error("probe module load failed: {0}")]
    Load(#[from] ProbeLoadError),
    #[error("stat on namespace file for pid {pid}: {source}")]
    NamespaceStat { pid: i32, source: std::io::Error },
    #[error("template expansion failed for key {key}: {source}")]
    Template {
        key: String,
        #[source]
        source: TemplateError,
    },
}

#[derive(Debug, Error)]
pub enum NamespaceEnterError {
    #[error("open namespace file {path} for pid {pid}: {source}")]
    Open {
        pid: i32,
        path: String,
        source: std::io::Error,
    },
    #[error("setns({kind:?}) into pid {pid}: {source}")]
    SetNs {
        pid: i32,
        kind: NamespaceKind,
        source: nix::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProbeRunError {
    #[error("namespace excursion failed: {0}")]
    Namespace(#[from] NamespaceEnterError),
    #[error("probe check() failed: {0}")]
    Check(String),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("mq_open {name} failed: {source}")]
    Open { name: String, source: std::io::Error },
    #[error("mq_close {name} failed: {source}")]
    Close { name: String, source: std::io::Error },
    #[error("setrlimit(RLIMIT_MSGQUEUE) failed: {0}")]
    SetRlimit(nix::Error),
    #[error("mq_timedreceive on {name} failed: {source}")]
    Receive { name: String, source: std::io::Error },
}
