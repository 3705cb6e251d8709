//! Built-in reference probes and the registry that wires them up.
//!
//! Real production probes are out of scope for this engine (§1); these
//! exist so the dispatch loop is exercisable end-to-end and so `run-check`
//! has something to demonstrate against.

mod echo;
mod http_status;
mod tcp_connect;

pub use echo::EchoProbe;
pub use http_status::HttpStatusProbe;
pub use tcp_connect::TcpConnectProbe;

use crate::probe::{Probe, ProbeRegistry};

/// Built-in probe registry: `echo`, `tcp_connect`, `http_status`.
pub fn builtin_registry() -> ProbeRegistry {
    ProbeRegistry::new()
        .with_builtin("echo", |_init, _agent| {
            Box::new(EchoProbe::new()) as Box<dyn Probe>
        })
        .with_builtin("tcp_connect", |_init, _agent| {
            Box::new(TcpConnectProbe::new()) as Box<dyn Probe>
        })
        .with_builtin("http_status", |_init, _agent| {
            Box::new(HttpStatusProbe::new()) as Box<dyn Probe>
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_builtin_by_name() {
        let registry = builtin_registry();
        assert!(registry.resolve("echo", "echo").is_ok());
        assert!(registry.resolve("tcp_connect", "tcp_connect").is_ok());
        assert!(registry.resolve("http_status", "http_status").is_ok());
        assert!(registry.resolve("nonexistent", "nonexistent").is_err());
    }
}
