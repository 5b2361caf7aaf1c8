use anyhow::{bail, Context, Result};
use loom_model::ComputeDescriptor;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ControllerConfig {
    pub controller: ControllerSection,
    pub pools: PoolSection,
    pub console: ConsoleSection,
    pub computes: Vec<ComputeDescriptor>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ControllerSection {
    pub projects_dir: PathBuf,
    /// Events buffered per notification subscriber before the oldest drop.
    pub notification_capacity: usize,
    /// Idle time after which a subscriber is sent a ping.
    #[serde(deserialize_with = "human")]
    pub heartbeat: Duration,
    #[serde(deserialize_with = "human")]
    pub usage_sample_interval: Duration,
    /// Debounce between a mutation and the topology dump it triggers.
    #[serde(deserialize_with = "human")]
    pub persist_delay: Duration,
    #[serde(deserialize_with = "human")]
    pub compute_refresh: Duration,
    /// Disk image tool used for rebase.
    pub image_tool: PathBuf,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            projects_dir: loom_home().join("projects"),
            notification_capacity: 1024,
            heartbeat: Duration::from_secs(5),
            usage_sample_interval: Duration::from_secs(2),
            persist_delay: Duration::from_millis(200),
            compute_refresh: Duration::from_secs(30),
            image_tool: PathBuf::from("qemu-img"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PoolSection {
    pub application_ids: u32,
    pub dynamips_ids: u32,
    pub udp_port_start: u16,
    pub udp_port_end: u16,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            application_ids: 512,
            dynamips_ids: 4096,
            udp_port_start: 20000,
            udp_port_end: 30000,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConsoleSection {
    #[serde(deserialize_with = "human")]
    pub heartbeat: Duration,
    #[serde(deserialize_with = "human")]
    pub reconnect_delay: Duration,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    /// Reads `path`; a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&txt).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(txt: &str) -> Result<Self> {
        let config: Self = toml::from_str(txt)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.notification_capacity == 0 {
            bail!("controller.notification_capacity must be at least 1");
        }
        if self.pools.udp_port_start > self.pools.udp_port_end {
            bail!(
                "pools.udp_port_start ({}) is above udp_port_end ({})",
                self.pools.udp_port_start,
                self.pools.udp_port_end
            );
        }
        for compute in &self.computes {
            compute
                .validate()
                .with_context(|| format!("compute {}", compute.compute_id))?;
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        loom_home().join("loom.toml")
    }
}

fn loom_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".loom")
}

fn human<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    let s = String::deserialize(d)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn empty_file_gives_defaults() {
        let config = ControllerConfig::parse("").unwrap();
        assert_eq!(config.controller.notification_capacity, 1024);
        assert_eq!(config.controller.persist_delay, Duration::from_millis(200));
        assert_eq!(config.pools.application_ids, 512);
        assert_eq!(config.console.heartbeat, Duration::from_secs(30));
        assert!(config.computes.is_empty());
        assert!(config.controller.projects_dir.ends_with(".loom/projects"));
    }

    #[test]
    fn partial_sections_and_computes() {
        let config = ControllerConfig::parse(
            r#"
            [controller]
            heartbeat = "1m 30s"

            [pools]
            dynamips_ids = 8

            [[computes]]
            compute_id = "c1"
            host = "example.com"
            port = 84
            "#,
        )
        .unwrap();
        assert_eq!(config.controller.heartbeat, Duration::from_secs(90));
        assert_eq!(config.controller.notification_capacity, 1024);
        assert_eq!(config.pools.dynamips_ids, 8);
        assert_eq!(config.pools.udp_port_start, 20000);
        assert_eq!(config.computes[0].base_url(), "http://example.com:84");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(ControllerConfig::parse("[controller]\nheartbeat = \"soon\"").is_err());
        assert!(ControllerConfig::parse("[pools]\nudp_port_start = 9\nudp_port_end = 1").is_err());
        assert!(ControllerConfig::parse(
            "[[computes]]\ncompute_id = \"c1\"\nhost = \"h\"\nport = 0"
        )
        .is_err());
    }

    #[test]
    #[serial]
    fn paths_follow_home() {
        let dir = tempfile::tempdir().unwrap();
        let old = std::env::var_os("HOME");
        std::env::set_var("HOME", dir.path());
        let config_path = ControllerConfig::default_path();
        let projects = ControllerSection::default().projects_dir;
        match old {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
        assert_eq!(config_path, dir.path().join(".loom").join("loom.toml"));
        assert_eq!(projects, dir.path().join(".loom").join("projects"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.pools.dynamips_ids, 4096);
    }
}
