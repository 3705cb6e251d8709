//! Issues a bare-bones HTTP GET against `host:port{path}` and reports the
//! response status line. Needs the target's network namespace.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::namespace::NamespaceKind;
use crate::probe::{InstanceConf, Metric, Probe, ServiceCheck};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const NEEDED_NS: &[NamespaceKind] = &[NamespaceKind::Net];

pub struct HttpStatusProbe {
    metrics: Vec<Metric>,
    service_checks: Vec<ServiceCheck>,
}

impl HttpStatusProbe {
    pub fn new() -> Self {
        Self {
            metrics: Vec::new(),
            service_checks: Vec::new(),
        }
    }

    fn fetch_status(host: &str, port: i64, path: &str) -> Result<u16, String> {
        let addr = format!("{host}:{port}");
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| format!("resolve {addr}: {e}"))?
            .next()
            .ok_or_else(|| format!("no address for {addr}"))?;

        let mut stream = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT)
            .map_err(|e| format!("connect {addr}: {e}"))?;
        stream
            .set_read_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|e| e.to_string())?;

        let request = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).map_err(|e| e.to_string())?;

        let mut response = String::new();
        stream.read_to_string(&mut response).map_err(|e| e.to_string())?;

        let status_line = response.lines().next().ok_or("empty response")?;
        let code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| format!("malformed status line: {status_line}"))?;
        Ok(code)
    }
}

impl Default for HttpStatusProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for HttpStatusProbe {
    fn check(&mut self, instance_conf: &InstanceConf) -> Result<(), String> {
        let host = instance_conf
            .get("host")
            .and_then(|v| v.as_str())
            .unwrap_or("localhost");
        let port = instance_conf
            .get("port")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| "no port in instance_conf".to_string())?;
        let path = instance_conf
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("/");

        match Self::fetch_status(host, port, path) {
            Ok(code) => {
                self.metrics.push(Metric::new("http_status.code", code as f64));
                let status = if code < 400 { "OK" } else { "CRITICAL" };
                self.service_checks.push(ServiceCheck::new("http_status", status));
                Ok(())
            }
            Err(e) => {
                self.service_checks
                    .push(ServiceCheck::new("http_status", "CRITICAL"));
                Err(e)
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
    use std::thread;

    #[test]
    fn reports_status_code_from_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
            }
        });

        let mut conf = InstanceConf::new();
        conf.insert("host".into(), crate::config::ConfigValue::Str("127.0.0.1".into()));
        conf.insert("port".into(), crate::config::ConfigValue::Int(port as i64));

        let mut probe = HttpStatusProbe::new();
        probe.check(&conf).unwrap();
        assert_eq!(probe.metrics(), vec![Metric::new("http_status.code", 200.0)]);

        handle.join().unwrap();
    }
}
