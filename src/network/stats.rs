//! Kernel counter parsing and rate derivation
//!
//! Reads the text output of `iptables -nvxL FORWARD -t mangle` (ingress
//! counters per marking rule) and `tc -s qdisc show dev <iface>` (netem leaf
//! counters per path). Rates come from the delta between two samples:
//! (Current - Last) / TimeDelta.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use super::tc::round2;

/// Ethernet header bytes not included in the netfilter byte counter
pub const ETHERNET_HEADER_SIZE: u64 = 14;

static MARK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MARK x?set 0x([0-9a-fA-F]+)").expect("valid regex"));
static NETEM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^qdisc netem (\d+):").expect("valid regex"));
static SENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Sent (\d+) bytes (\d+) pkt").expect("valid regex"));
static DROPPED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"dropped (\d+)").expect("valid regex"));
static BACKLOG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"backlog (\d+)([KMG]?)b (\d+)p").expect("valid regex"));

/// Packets/bytes seen by one marking rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
}

/// Marking rule counters keyed by (mark, in iface, out iface)
#[derive(Debug, Clone, Default)]
pub struct MarkingCounters {
    rows: HashMap<(u32, String, String), Counter>,
}

impl MarkingCounters {
    /// Counter of the rule marking `mark` on the `in_iface -> out_iface` pair.
    /// A missing rule reads as zero.
    pub fn get(&self, mark: u32, in_iface: &str, out_iface: &str) -> Counter {
        self.rows
            .get(&(mark, in_iface.to_string(), out_iface.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Parse `iptables -nvxL FORWARD -t mangle`.
///
/// Byte counts are adjusted to include the Ethernet header of every packet.
pub fn parse_marking_table(text: &str) -> MarkingCounters {
    let mut counters = MarkingCounters::default();

    for line in text.lines() {
        let Some(caps) = MARK_RE.captures(line) else {
            continue;
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 7 {
            continue;
        }

        let (Ok(packets), Ok(bytes), Ok(mark)) = (
            parts[0].parse::<u64>(),
            parts[1].parse::<u64>(),
            u32::from_str_radix(&caps[1], 16),
        ) else {
            continue;
        };

        let entry = counters
            .rows
            .entry((mark, parts[5].to_string(), parts[6].to_string()))
            .or_default();
        entry.packets += packets;
        entry.bytes += bytes + packets * ETHERNET_HEADER_SIZE;
    }

    counters
}

/// Counters of one netem leaf qdisc
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub backlog_bytes: u64,
    pub backlog_packets: u64,
    pub drops: u64,
}

/// Parse `tc -s qdisc show dev <iface>` into netem counters keyed by handle.
///
/// Only netem leaves are collected; the handle equals the path identifier.
pub fn parse_shaping_stats(text: &str) -> HashMap<u32, QueueCounters> {
    let mut stats = HashMap::new();
    let mut current: Option<u32> = None;

    for line in text.lines() {
        if line.starts_with("qdisc ") {
            current = NETEM_RE
                .captures(line)
                .and_then(|c| c[1].parse::<u32>().ok());
            if let Some(id) = current {
                stats.insert(id, QueueCounters::default());
            }
            continue;
        }

        let Some(entry) = current.and_then(|id| stats.get_mut(&id)) else {
            continue;
        };

        if let Some(c) = SENT_RE.captures(line) {
            entry.sent_bytes = c[1].parse().unwrap_or(0);
            entry.sent_packets = c[2].parse().unwrap_or(0);
        }
        if let Some(c) = DROPPED_RE.captures(line) {
            entry.drops = c[1].parse().unwrap_or(0);
        }
        if let Some(c) = BACKLOG_RE.captures(line) {
            let scale = match &c[2] {
                "K" => 1024,
                "M" => 1024 * 1024,
                "G" => 1024 * 1024 * 1024,
                _ => 1,
            };
            entry.backlog_bytes = c[1].parse::<u64>().unwrap_or(0) * scale;
            entry.backlog_packets = c[3].parse().unwrap_or(0);
        }
    }

    stats
}

/// One direction of one path at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionSample {
    pub ingress: Counter,
    pub queue: QueueCounters,
}

/// Rates between two samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DirectionRates {
    pub ingress_bps: f64,
    pub ingress_pps: f64,
    pub egress_bps: f64,
    pub egress_pps: f64,
    /// Queue drops per ingress packet, 4 decimals
    pub drop_ratio: f64,
}

impl DirectionRates {
    /// Derive rates from `previous` to `current`. No previous sample or no
    /// elapsed time gives zero rates. Counter resets count as zero progress.
    pub fn between(previous: Option<&DirectionSample>, current: &DirectionSample, elapsed_secs: f64) -> Self {
        let prev = previous.copied().unwrap_or_default();

        let ingress_bytes = current.ingress.bytes.saturating_sub(prev.ingress.bytes);
        let ingress_packets = current.ingress.packets.saturating_sub(prev.ingress.packets);
        let egress_bytes = current.queue.sent_bytes.saturating_sub(prev.queue.sent_bytes);
        let egress_packets = current.queue.sent_packets.saturating_sub(prev.queue.sent_packets);
        let drops = current.queue.drops.saturating_sub(prev.queue.drops);

        let per_sec = |delta: u64| {
            if previous.is_none() || elapsed_secs <= 0.0 {
                0.0
            } else {
                delta as f64 / elapsed_secs
            }
        };

        let drop_ratio = if ingress_packets == 0 {
            0.0
        } else {
            round4(drops as f64 / ingress_packets as f64)
        };

        Self {
            ingress_bps: per_sec(ingress_bytes * 8),
            ingress_pps: per_sec(ingress_packets),
            egress_bps: per_sec(egress_bytes * 8),
            egress_pps: per_sec(egress_packets),
            drop_ratio,
        }
    }

    pub fn ingress_kbps(&self) -> f64 {
        round2(self.ingress_bps / 1000.0)
    }

    pub fn egress_kbps(&self) -> f64 {
        round2(self.egress_bps / 1000.0)
    }

    pub fn drop_percent(&self) -> f64 {
        round2(self.drop_ratio * 100.0)
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
