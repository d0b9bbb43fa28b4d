//! Path data model: selector, per-direction impairment profiles and the
//! persisted path record.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

use crate::config::structs::DEFAULT_MAX_RATE_KBIT;
use crate::error::{Error, Result};

pub const DEFAULT_QDEPTH: u32 = 1000;
pub const DEFAULT_JITTER_DIST: &str = "normal";

/// Traffic direction. Uplink flows LAN -> WAN, downlink WAN -> LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Uplink, Direction::Downlink];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Any,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A port filter: `Any` or a concrete port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSpec {
    #[default]
    Any,
    Port(u16),
}

impl PortSpec {
    /// Concrete port usable in a match, if any.
    pub fn port(self) -> Option<u16> {
        match self {
            PortSpec::Port(p) if p > 0 => Some(p),
            _ => None,
        }
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PortSpec::Any => serializer.serialize_str("Any"),
            PortSpec::Port(p) => serializer.serialize_u16(*p),
        }
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }

        let raw = Option::<Raw>::deserialize(deserializer)?;
        let number = match raw {
            None => return Ok(PortSpec::Any),
            Some(Raw::Num(n)) => n,
            Some(Raw::Text(t)) => {
                let t = t.trim();
                if t.is_empty() || t.eq_ignore_ascii_case("any") {
                    return Ok(PortSpec::Any);
                }
                t.parse::<u64>()
                    .map_err(|_| de::Error::custom(format!("invalid port '{}'", t)))?
            }
        };

        u16::try_from(number)
            .map(PortSpec::Port)
            .map_err(|_| de::Error::custom(format!("port {} out of range", number)))
    }
}

/// Traffic selector. Immutable once created; `mark` is the path identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub lan_ip: Option<String>,
    #[serde(default)]
    pub lan_port: PortSpec,
    #[serde(default)]
    pub wan_ip: Option<String>,
    #[serde(default)]
    pub wan_port: PortSpec,
    #[serde(default)]
    pub mark: u32,
}

impl Selector {
    pub fn lan_ip(&self) -> Option<&str> {
        self.lan_ip.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn wan_ip(&self) -> Option<&str> {
        self.wan_ip.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        for ip in [self.lan_ip(), self.wan_ip()].into_iter().flatten() {
            if !is_valid_address(ip) {
                return Err(Error::InvalidSelector(format!("'{}' is not an IP address or network", ip)));
            }
        }

        for (side, port) in [("lan", self.lan_port), ("wan", self.wan_port)] {
            match port {
                PortSpec::Any => {}
                PortSpec::Port(0) => {
                    return Err(Error::InvalidSelector(format!("{} port must be within 1-65535", side)));
                }
                PortSpec::Port(p) if self.protocol == Protocol::Any => {
                    return Err(Error::InvalidSelector(format!(
                        "{} port {} requires protocol tcp or udp",
                        side, p
                    )));
                }
                PortSpec::Port(_) => {}
            }
        }

        Ok(())
    }
}

fn is_valid_address(s: &str) -> bool {
    match s.split_once('/') {
        None => s.parse::<IpAddr>().is_ok(),
        Some((addr, prefix)) => match (addr.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(IpAddr::V4(_)), Ok(p)) => p <= 32,
            (Ok(IpAddr::V6(_)), Ok(p)) => p <= 128,
            _ => false,
        },
    }
}

/// Per-direction mode. Anything other than `bypass` is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionMode {
    Bypass,
    #[default]
    #[serde(other)]
    Shape,
}

/// Raw impairment settings. Absent or null fields fall back to defaults in
/// the accessors, so a record round-trips exactly as it was written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingSettings {
    /// kbit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u64>,
    /// kbit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_ceil: Option<u64>,
    /// KB, 0 derives from the limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_burst: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_cburst: Option<f64>,
    /// packets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qdepth: Option<u32>,
    /// percent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    /// ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    /// ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_dist: Option<String>,
    /// `[min_ms, max_ms]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reorder_allowed: Option<bool>,
}

impl ShapingSettings {
    pub fn rate_limit(&self) -> u64 {
        self.rate_limit.unwrap_or(DEFAULT_MAX_RATE_KBIT)
    }

    pub fn rate_ceil(&self) -> u64 {
        self.rate_ceil.unwrap_or(DEFAULT_MAX_RATE_KBIT)
    }

    pub fn rate_burst(&self) -> f64 {
        self.rate_burst.unwrap_or(0.0)
    }

    pub fn rate_cburst(&self) -> f64 {
        self.rate_cburst.unwrap_or(0.0)
    }

    pub fn qdepth(&self) -> u32 {
        self.qdepth.unwrap_or(DEFAULT_QDEPTH)
    }

    pub fn loss(&self) -> f64 {
        self.loss.unwrap_or(0.0)
    }

    pub fn jitter_dist(&self) -> &str {
        self.jitter_dist.as_deref().unwrap_or(DEFAULT_JITTER_DIST)
    }

    pub fn slot(&self) -> [u32; 2] {
        self.slot.unwrap_or([0, 0])
    }

    pub fn reorder_allowed(&self) -> bool {
        self.reorder_allowed.unwrap_or(false)
    }

    /// Delay and jitter as handed to netem.
    ///
    /// netem ignores jitter without a base delay, so a zero delay becomes
    /// 1ms. The applied jitter is half the configured one: netem's
    /// distribution spreads `±jitter`, and halving makes the observed
    /// spread match the requested figure.
    pub fn applied_delay_jitter(&self) -> (u32, u32) {
        let delay = self.delay.unwrap_or(0);
        let jitter = self.jitter.unwrap_or(0);

        if jitter == 0 {
            return (delay, 0);
        }

        (delay.max(1), jitter / 2)
    }
}

/// Impairment profile of one direction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentProfile {
    #[serde(default)]
    pub mode: DirectionMode,
    #[serde(flatten)]
    pub settings: ShapingSettings,
}

impl ImpairmentProfile {
    pub fn bypass() -> Self {
        Self {
            mode: DirectionMode::Bypass,
            settings: ShapingSettings::default(),
        }
    }

    pub fn shaped(settings: ShapingSettings) -> Self {
        Self {
            mode: DirectionMode::Shape,
            settings,
        }
    }

    pub fn is_bypass(&self) -> bool {
        self.mode == DirectionMode::Bypass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    #[default]
    Custom,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStatus {
    Active,
    #[default]
    Inactive,
}

/// What a new path shapes with: explicit profiles or a catalog model.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSettings {
    Custom {
        uplink: ImpairmentProfile,
        downlink: ImpairmentProfile,
    },
    Model(String),
}

/// One entry of the persisted path list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRecord {
    #[serde(default)]
    pub id: u32,
    pub selector: Selector,
    #[serde(default)]
    pub mode: PathMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub status: PathStatus,
    #[serde(default)]
    pub uplink: ImpairmentProfile,
    #[serde(default)]
    pub downlink: ImpairmentProfile,
}

impl PathRecord {
    /// Unassigned record (id and mark are filled in by the store).
    pub fn new(selector: Selector, settings: PathSettings) -> Self {
        let (mode, model, uplink, downlink) = match settings {
            PathSettings::Custom { uplink, downlink } => (PathMode::Custom, None, uplink, downlink),
            PathSettings::Model(name) => (
                PathMode::Model,
                Some(name),
                ImpairmentProfile::bypass(),
                ImpairmentProfile::bypass(),
            ),
        };

        Self {
            id: 0,
            selector,
            mode,
            model,
            status: PathStatus::Inactive,
            uplink,
            downlink,
        }
    }

    pub fn profile(&self, direction: Direction) -> &ImpairmentProfile {
        match direction {
            Direction::Uplink => &self.uplink,
            Direction::Downlink => &self.downlink,
        }
    }
}
