//! Trivial probe used in S1-style smoke tests: always reports `up=1`.

use crate::probe::{InstanceConf, Metric, Probe, ServiceCheck};

pub struct EchoProbe {
    metrics: Vec<Metric>,
}

impl EchoProbe {
    pub fn new() -> Self {
        Self { metrics: Vec::new() }
    }
}

impl Default for EchoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for EchoProbe {
    fn check(&mut self, _instance_conf: &InstanceConf) -> Result<(), String> {
        self.metrics.push(Metric::new("up", 1.0));
        Ok(())
    }

    fn metrics(&mut self) -> Vec<Metric> {
        std::mem::take(&mut self.metrics)
    }

    fn service_checks(&mut self) -> Vec<ServiceCheck> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_up_metric() {
        let mut probe = EchoProbe::new();
        probe.check(&InstanceConf::new()).unwrap();
        let metrics = probe.metrics();
        assert_eq!(metrics, vec![Metric::new("up", 1.0)]);
    }
}
