//! YAML configuration for the tcp-steer daemon.
//!
//! One file describes the interface, the data-path mode, the monitored
//! frontend ports, and the statically provisioned backend pool. Validation
//! happens at load time so the data path never sees a malformed pool.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use tcp_steer_common::MAX_BACKENDS;

// ---------------------------------------------------------------------------
// Config Types
// ---------------------------------------------------------------------------

/// Which rendition of the data path to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteerMode {
    /// Kernel XDP program (requires root and a compiled eBPF ELF).
    Xdp,
    /// AF_PACKET userspace stage (requires CAP_NET_RAW; portable fallback).
    Userspace,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Network interface the data path attaches to.
    pub interface: String,

    /// Data-path mode.
    #[serde(default = "default_mode")]
    pub mode: SteerMode,

    /// TCP destination ports subject to load balancing.
    pub listeners: Vec<u16>,

    /// Backend pool, in slot order. At most MAX_BACKENDS entries; slots
    /// beyond the list stay unpopulated.
    pub backends: Vec<Ipv4Addr>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Interval between stats log lines. 0 disables the reporter.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Settings for userspace mode; ignored in XDP mode.
    #[serde(default)]
    pub userspace: UserspaceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserspaceConfig {
    /// Worker thread count. 0 = one per CPU.
    #[serde(default)]
    pub workers: usize,
    /// Pin worker threads to CPU cores by index.
    #[serde(default)]
    pub pin_cpus: bool,
}

fn default_mode() -> SteerMode {
    SteerMode::Xdp
}

fn default_stats_interval() -> u64 {
    10
}

fn default_metrics_bind() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

impl Default for UserspaceConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            pin_cpus: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            bail!("interface must not be empty");
        }

        if self.listeners.is_empty() {
            bail!("at least one listener port is required");
        }
        if self.listeners.iter().any(|&p| p == 0) {
            bail!("listener port 0 is not valid");
        }

        if self.backends.is_empty() {
            bail!("at least one backend is required");
        }
        if self.backends.len() > MAX_BACKENDS as usize {
            bail!(
                "at most {} backends are supported, got {}",
                MAX_BACKENDS,
                self.backends.len()
            );
        }
        // 0.0.0.0 encodes "unpopulated slot" in the pool; it can never be a
        // real backend.
        if self.backends.iter().any(|b| b.is_unspecified()) {
            bail!("backend 0.0.0.0 is not valid (marks an empty pool slot)");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(
            r#"
interface: eth0
listeners: [80, 443]
backends: ["10.0.1.10", "10.0.1.11"]
"#,
        )
        .unwrap();

        assert_eq!(config.interface, "eth0");
        assert_eq!(config.mode, SteerMode::Xdp);
        assert_eq!(config.listeners, vec![80, 443]);
        assert_eq!(config.backends.len(), 2);
        assert!(!config.metrics.enabled);
        assert_eq!(config.stats_interval_secs, 10);
        assert_eq!(config.userspace.workers, 0);
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
interface: eth0
mode: userspace
listeners: [8080]
backends: ["192.168.1.1"]
metrics:
  enabled: true
  bind: "0.0.0.0:9100"
stats_interval_secs: 5
userspace:
  workers: 4
  pin_cpus: true
"#,
        )
        .unwrap();

        assert_eq!(config.mode, SteerMode::Userspace);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.userspace.workers, 4);
        assert!(config.userspace.pin_cpus);
    }

    #[test]
    fn empty_listeners_rejected() {
        let err = parse(
            r#"
interface: eth0
listeners: []
backends: ["10.0.1.10"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("listener"));
    }

    #[test]
    fn too_many_backends_rejected() {
        let backends: Vec<String> =
            (0..=MAX_BACKENDS).map(|i| format!("\"10.0.1.{}\"", i + 1)).collect();
        let yaml = format!(
            "interface: eth0\nlisteners: [80]\nbackends: [{}]\n",
            backends.join(", ")
        );
        let err = parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("at most"));
    }

    #[test]
    fn zero_backend_rejected() {
        let err = parse(
            r#"
interface: eth0
listeners: [80]
backends: ["0.0.0.0"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("0.0.0.0"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let result = parse(
            r#"
interface: eth0
listeners: [80]
backends: ["10.0.1.10"]
health_check: true
"#,
        );
        assert!(result.is_err());
    }
}
