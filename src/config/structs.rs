//! Configuration structures

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// First identifier of the reference deployment, also the HTB root handle.
pub const DEFAULT_MARK_MIN: u32 = 9527;
/// Last identifier (inclusive), 32 values in total.
pub const DEFAULT_MARK_MAX: u32 = 9558;
/// 32 Gbit/s expressed in kbit.
pub const DEFAULT_MAX_RATE_KBIT: u64 = 32_000_000;

/// Top-level configuration file (`config.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// LAN-facing interface (downlink traffic is shaped here)
    #[serde(default)]
    pub lan_interface: String,
    /// WAN-facing interface (uplink traffic is shaped here)
    #[serde(default)]
    pub wan_interface: String,
    /// Carried for the dashboard login, never read by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_hash: Option<String>,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding `paths.yaml` and `models.yaml`
    pub state_dir: PathBuf,
    /// Directory holding the cross-process lock files
    pub lock_dir: PathBuf,
    pub mark_min: u32,
    pub mark_max: u32,
    /// Global HTB rate ceiling (kbit)
    pub max_rate_kbit: u64,
    pub monitor_interval_ms: u64,
    /// Upper bound on the termination sweep
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_dir: PathBuf::from("/tmp"),
            mark_min: DEFAULT_MARK_MIN,
            mark_max: DEFAULT_MARK_MAX,
            max_rate_kbit: DEFAULT_MAX_RATE_KBIT,
            monitor_interval_ms: 1000,
            shutdown_timeout_secs: 10,
        }
    }
}

impl EngineSettings {
    pub fn mark_range(&self) -> RangeInclusive<u32> {
        self.mark_min..=self.mark_max
    }

    pub fn paths_file(&self) -> PathBuf {
        self.state_dir.join("paths.yaml")
    }

    pub fn models_file(&self) -> PathBuf {
        self.state_dir.join("models.yaml")
    }

    pub fn id_lock_file(&self) -> PathBuf {
        self.lock_dir.join("nethang_id.lock")
    }

    pub fn marking_lock_file(&self) -> PathBuf {
        self.lock_dir.join("nethang_iptables_modi.lock")
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

pub(crate) fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".nethang")
}

/// Model catalog file (`models.yaml`)
///
/// `components` holds the YAML anchors the catalog authors reuse; the engine
/// never reads it directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub components: Option<serde_yaml::Value>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
}

impl ModelCatalog {
    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }
}

/// A named impairment preset
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    #[serde(default)]
    pub description: Option<String>,
    /// `{uplink: {..}, downlink: {..}}`
    #[serde(default)]
    pub global: Mapping,
    #[serde(default)]
    pub timeline: Option<Vec<Mapping>>,
}

impl ModelEntry {
    pub fn timeline(&self) -> &[Mapping] {
        self.timeline.as_deref().unwrap_or_default()
    }
}
