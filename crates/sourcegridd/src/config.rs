//! Daemon configuration file (`sourcegrid.toml`).
//!
//! ```toml
//! [server]
//! port = 8080
//! data_dir = "/var/lib/sourcegrid"
//! reconcile_interval = "10s"
//!
//! [rollout]
//! batch_size = 2
//! health_timeout = "1m"
//!
//! [[connectors]]
//! name = "datagen"
//! source_class = "org.example.DataGeneratorSource"
//! ```
//!
//! Every section and field is optional. Durations are strings such as
//! `"5s"`, `"500ms"` or `"1m"`; a bare number is seconds.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use sourcegrid_dispatch::DispatchConfig;
use sourcegrid_lifecycle::LifecycleConfig;
use sourcegrid_orchestrator::OrchestratorConfig;
use sourcegrid_placement::PlacementPolicy;
use sourcegrid_rollout::RollingConfig;
use sourcegrid_state::ConnectorType;
use sourcegrid_status::StatusConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerSection,
    pub dispatch: DispatchSection,
    pub lifecycle: LifecycleSection,
    pub status: StatusSection,
    pub rollout: RolloutSection,
    pub placement: PlacementPolicy,
    pub membership: MembershipSection,
    /// Built-in connector catalog.
    pub connectors: Vec<ConnectorType>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub reconcile_interval: String,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            data_dir: PathBuf::from("/var/lib/sourcegrid"),
            reconcile_interval: "10s".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub call_timeout: String,
    pub max_idempotent_retries: u32,
    pub max_start_retries: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
    pub max_in_flight: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            call_timeout: "5s".to_string(),
            max_idempotent_retries: 3,
            max_start_retries: 1,
            initial_backoff: "100ms".to_string(),
            max_backoff: "2s".to_string(),
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    /// `"0s"` disables heartbeat expiry.
    pub heartbeat_threshold: String,
    pub max_auto_retries: u32,
    pub max_restarts_per_pass: u32,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            heartbeat_threshold: "30s".to_string(),
            max_auto_retries: 3,
            max_restarts_per_pass: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusSection {
    pub aggregation_deadline: String,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            aggregation_deadline: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolloutSection {
    pub batch_size: u32,
    pub max_unavailable_fraction: f64,
    pub health_timeout: String,
    pub poll_interval: String,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_unavailable_fraction: 0.25,
            health_timeout: "30s".to_string(),
            poll_interval: "500ms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    /// Interval workers are told to heartbeat at.
    pub heartbeat_interval: String,
    pub dead_timeout: String,
    pub reap_interval: String,
}

impl Default for MembershipSection {
    fn default() -> Self {
        Self {
            heartbeat_interval: "5s".to_string(),
            dead_timeout: "30s".to_string(),
            reap_interval: "15s".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or use defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.rollout.batch_size == 0 {
            bail!("rollout.batch_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.rollout.max_unavailable_fraction) {
            bail!("rollout.max_unavailable_fraction must be within [0, 1]");
        }
        if self.dispatch.max_in_flight == 0 {
            bail!("dispatch.max_in_flight must be at least 1");
        }
        for connector in &self.connectors {
            if connector.name.trim().is_empty() {
                bail!("connector catalog entries need a name");
            }
        }
        // Surface bad durations at startup rather than on first use.
        self.orchestrator_config()?;
        self.reconcile_interval()?;
        self.reap_interval()?;
        self.heartbeat_interval()?;
        self.dead_timeout()?;
        Ok(())
    }

    pub fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        Ok(OrchestratorConfig {
            dispatch: DispatchConfig {
                call_timeout: duration("dispatch.call_timeout", &self.dispatch.call_timeout)?,
                max_idempotent_retries: self.dispatch.max_idempotent_retries,
                max_start_retries: self.dispatch.max_start_retries,
                initial_backoff: duration(
                    "dispatch.initial_backoff",
                    &self.dispatch.initial_backoff,
                )?,
                max_backoff: duration("dispatch.max_backoff", &self.dispatch.max_backoff)?,
                max_in_flight: self.dispatch.max_in_flight,
            },
            lifecycle: LifecycleConfig {
                heartbeat_threshold: duration(
                    "lifecycle.heartbeat_threshold",
                    &self.lifecycle.heartbeat_threshold,
                )?,
                max_auto_retries: self.lifecycle.max_auto_retries,
                max_restarts_per_pass: self.lifecycle.max_restarts_per_pass,
                placement: self.placement.clone(),
            },
            status: StatusConfig {
                aggregation_deadline: duration(
                    "status.aggregation_deadline",
                    &self.status.aggregation_deadline,
                )?,
            },
            rollout: RollingConfig {
                batch_size: self.rollout.batch_size,
                max_unavailable_fraction: self.rollout.max_unavailable_fraction,
                health_timeout: duration("rollout.health_timeout", &self.rollout.health_timeout)?,
                poll_interval: duration("rollout.poll_interval", &self.rollout.poll_interval)?,
            },
        })
    }

    pub fn reconcile_interval(&self) -> anyhow::Result<Duration> {
        let interval = duration("server.reconcile_interval", &self.server.reconcile_interval)?;
        if interval.is_zero() {
            bail!("server.reconcile_interval must be positive");
        }
        Ok(interval)
    }

    pub fn reap_interval(&self) -> anyhow::Result<Duration> {
        let interval = duration("membership.reap_interval", &self.membership.reap_interval)?;
        if interval.is_zero() {
            bail!("membership.reap_interval must be positive");
        }
        Ok(interval)
    }

    pub fn heartbeat_interval(&self) -> anyhow::Result<Duration> {
        duration("membership.heartbeat_interval", &self.membership.heartbeat_interval)
    }

    pub fn dead_timeout(&self) -> anyhow::Result<Duration> {
        duration("membership.dead_timeout", &self.membership.dead_timeout)
    }
}

fn duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("invalid duration for {field}: {value:?}"))
}

/// Parse a duration string like "5s", "500ms" or "1m".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        let orchestrator = config.orchestrator_config().unwrap();
        let dispatch = DispatchConfig::default();
        assert_eq!(orchestrator.dispatch.call_timeout, dispatch.call_timeout);
        assert_eq!(orchestrator.dispatch.initial_backoff, dispatch.initial_backoff);
        assert_eq!(orchestrator.dispatch.max_in_flight, dispatch.max_in_flight);
        assert_eq!(
            orchestrator.lifecycle.heartbeat_threshold,
            LifecycleConfig::default().heartbeat_threshold
        );
        assert_eq!(
            orchestrator.status.aggregation_deadline,
            StatusConfig::default().aggregation_deadline
        );
        let rollout = RollingConfig::default();
        assert_eq!(orchestrator.rollout.batch_size, rollout.batch_size);
        assert_eq!(orchestrator.rollout.health_timeout, rollout.health_timeout);
        assert!(orchestrator.lifecycle.placement.allow_colocation);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reconcile_interval().unwrap(), Duration::from_secs(10));
        assert!(config.connectors.is_empty());
    }

    #[test]
    fn full_file() {
        let config = DaemonConfig::parse(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            data_dir = "/tmp/sg"
            reconcile_interval = "500ms"
            json_logs = true

            [dispatch]
            call_timeout = "2s"
            max_in_flight = 8

            [lifecycle]
            heartbeat_threshold = "0s"
            max_auto_retries = 5

            [rollout]
            batch_size = 4
            max_unavailable_fraction = 0.5
            health_timeout = "1m"

            [placement]
            allow_colocation = false

            [membership]
            dead_timeout = "45s"

            [[connectors]]
            name = "datagen"
            description = "synthetic records"
            source_class = "org.example.DataGeneratorSource"

            [[connectors]]
            name = "kafka"
            archive = "file:///opt/connectors/kafka.nar"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.server.port, 9000);
        assert!(config.server.json_logs);
        assert_eq!(config.reconcile_interval().unwrap(), Duration::from_millis(500));

        let orchestrator = config.orchestrator_config().unwrap();
        assert_eq!(orchestrator.dispatch.call_timeout, Duration::from_secs(2));
        assert_eq!(orchestrator.dispatch.max_in_flight, 8);
        // Unset fields keep their defaults.
        assert_eq!(orchestrator.dispatch.max_idempotent_retries, 3);
        assert!(orchestrator.lifecycle.heartbeat_threshold.is_zero());
        assert_eq!(orchestrator.lifecycle.max_auto_retries, 5);
        assert!(!orchestrator.lifecycle.placement.allow_colocation);
        assert_eq!(orchestrator.rollout.batch_size, 4);
        assert_eq!(orchestrator.rollout.health_timeout, Duration::from_secs(60));
        assert_eq!(config.dead_timeout().unwrap(), Duration::from_secs(45));

        assert_eq!(config.connectors.len(), 2);
        assert_eq!(
            config.connectors[0].source_class.as_deref(),
            Some("org.example.DataGeneratorSource")
        );
        assert_eq!(config.connectors[1].source_class, None);
    }

    #[test]
    fn bad_duration_names_the_field() {
        let err = DaemonConfig::parse("[rollout]\nhealth_timeout = \"soon\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("rollout.health_timeout"));
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(DaemonConfig::parse("[rollout]\nbatch_size = 0\n").is_err());
        assert!(DaemonConfig::parse("[rollout]\nmax_unavailable_fraction = 1.5\n").is_err());
        assert!(DaemonConfig::parse("[server]\nreconcile_interval = \"0s\"\n").is_err());
        assert!(DaemonConfig::parse("[[connectors]]\nname = \"\"\n").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sourcegrid.toml");
        std::fs::write(&path, "[server]\nport = 7070\n").unwrap();
        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 7070);

        assert!(DaemonConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
        assert_eq!(DaemonConfig::load(None).unwrap().server.port, 8080);
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("fast"), None);
    }
}
