//! Reports whether `host:port` accepts a TCP connection. Needs the target's
//! network namespace whenever it differs from the worker's own.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::namespace::NamespaceKind;
use crate::probe::{InstanceConf, Metric, Probe, ServiceCheck};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const NEEDED_NS: &[NamespaceKind] = &[NamespaceKind::Net];

pub struct TcpConnectProbe {
    metrics: Vec<Metric>,
    service_checks: Vec<ServiceCheck>,
}

impl TcpConnectProbe {
    pub fn new() -> Self {
        Self {
            metrics: Vec::new(),
            service_checks: Vec::new(),
        }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for TcpConnectProbe {
    fn check(&mut self, instance_conf: &InstanceConf) -> Result<(), String> {
        let host = instance_conf
            .get("host")
            .and_then(|v| v.as_str())
            .unwrap_or("localhost");
        let port = instance_conf
            .get("port")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| "no port in instance_conf".to_string())?;

        let addr = format!("{host}:{port}");
        let addrs: Vec<std::net::SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| format!("resolve {addr}: {e}"))?
            .collect();
        let addr = addrs.first().ok_or_else(|| format!("no address for {addr}"))?;

        match TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
            Ok(_) => {
                self.metrics.push(Metric::new("tcp_connect.can_connect", 1.0));
                self.service_checks.push(ServiceCheck::new("tcp_connect", "OK"));
                Ok(())
            }
            Err(e) => {
                self.metrics.push(Metric::new("tcp_connect.can_connect", 0.0));
                self.service_checks
                    .push(ServiceCheck::new("tcp_connect", "CRITICAL"));
                Err(format!("connect {addr}: {e}"))
            }
        }
    }

    fn metrics(&mut self) -> Vec<Metric> {
        std::mem::take(&mut self.metrics)
    }

    fn service_checks(&mut self) -> Vec<ServiceCheck> {
        std::mem::take(&mut self.service_checks)
    }

    fn needed_ns(&self) -> &'static [NamespaceKind] {
        NEEDED_NS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn reports_up_when_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut conf = InstanceConf::new();
        conf.insert("host".into(), crate::config::ConfigValue::Str("127.0.0.1".into()));
        conf.insert("port".into(), crate::config::ConfigValue::Int(port as i64));

        let mut probe = TcpConnectProbe::new();
        probe.check(&conf).unwrap();
        assert_eq!(probe.metrics(), vec![Metric::new("tcp_connect.can_connect", 1.0)]);
    }

    #[test]
    fn reports_down_when_nothing_listens() {
        let mut conf = InstanceConf::new();
        conf.insert("host".into(), crate::config::ConfigValue::Str("127.0.0.1".into()));
        conf.insert("port".into(), crate::config::ConfigValue::Int(1));

        let mut probe = TcpConnectProbe::new();
        assert!(probe.check(&conf).is_err());
        assert_eq!(probe.metrics(), vec![Metric::new("tcp_connect.can_connect", 0.0)]);
    }
}
