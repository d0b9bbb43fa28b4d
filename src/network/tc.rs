//! Traffic Control (tc) rule planning for HTB + netem
//!
//! Each path owns one HTB class `9527:<mark>` on the egress interface of a
//! direction, with a netem leaf qdisc `<mark>:` below it and an `fw` filter
//! steering packets carrying `<mark>` into the class. Unmarked traffic falls
//! into the catch-all class `9527:ffff`, which is never shaped.
//!
//! Planning is pure: the builder returns the ordered invocations and the
//! [`Shaper`](super::shaper::Shaper) executes them.

use super::command::{FailurePolicy, Invocation};
use crate::path::model::{ImpairmentProfile, ShapingSettings};

/// HTB root handle major
pub const ROOT_HANDLE: u32 = 9527;
/// Catch-all class minor (hex, as tc reads it)
pub const DEFAULT_CLASS: &str = "ffff";
pub const FILTER_PRIO: u32 = 2;
const QUANTUM: u32 = 60000;
const ROOT_DIRECT_QLEN: u32 = 1000;
/// Default burst is the limit / 80, in KB
const BURST_DIVISOR: f64 = 80.0;

/// `add` creates the class tree, `change` mutates it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Add,
    Change,
}

impl RuleOp {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleOp::Add => "add",
            RuleOp::Change => "change",
        }
    }
}

/// HTB class parameters derived from a profile
#[derive(Debug, Clone, PartialEq)]
pub struct HtbRate {
    pub rate_kbit: u64,
    pub ceil_kbit: u64,
    pub burst_kb: f64,
    pub cburst_kb: f64,
}

impl HtbRate {
    pub fn derive(settings: &ShapingSettings, max_rate_kbit: u64) -> Self {
        let requested = settings.rate_limit();
        let rate_kbit = requested.min(max_rate_kbit);

        let ceil = settings.rate_ceil();
        let ceil_kbit = if ceil < max_rate_kbit { ceil } else { rate_kbit };

        let default_burst = round2(requested as f64 / BURST_DIVISOR);
        let pick = |v: f64| if v > 0.0 { v } else { default_burst };

        Self {
            rate_kbit,
            ceil_kbit,
            burst_kb: pick(settings.rate_burst()),
            cburst_kb: pick(settings.rate_cburst()),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "rate".into(),
            format!("{}kbit", self.rate_kbit),
            "ceil".into(),
            format!("{}kbit", self.ceil_kbit),
            "burst".into(),
            format!("{}KB", self.burst_kb),
            "cburst".into(),
            format!("{}KB", self.cburst_kb),
        ]
    }
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// netem option list: queue limit, delay/jitter, loss and slotting.
pub fn netem_args(settings: &ShapingSettings) -> Vec<String> {
    let mut args = vec!["limit".to_string(), settings.qdepth().to_string()];

    let (delay, jitter) = settings.applied_delay_jitter();
    if delay != 0 || jitter != 0 {
        args.push("delay".into());
        args.push(format!("{}ms", delay));
        if jitter != 0 {
            args.push(format!("{}ms", jitter));
            args.push("distribution".into());
            args.push(settings.jitter_dist().to_string());
        }
    }

    args.push("loss".into());
    args.push(format!("{}%", settings.loss()));

    let [slot_min, slot_max] = settings.slot();
    args.push("slot".into());
    args.push(format!("{}ms", slot_min));
    args.push(format!("{}ms", slot_max));

    args
}

/// Plans tc invocations for one egress interface.
#[derive(Debug, Clone, Copy)]
pub struct ShapingRuleBuilder<'a> {
    iface: &'a str,
    max_rate_kbit: u64,
}

impl<'a> ShapingRuleBuilder<'a> {
    pub fn new(iface: &'a str, max_rate_kbit: u64) -> Self {
        Self { iface, max_rate_kbit }
    }

    /// Full sequence for applying `profile` with `op`.
    ///
    /// Bypassed directions only get their state removed.
    pub fn plan(&self, mark: u32, op: RuleOp, profile: &ImpairmentProfile) -> Vec<Invocation> {
        if profile.is_bypass() {
            return self.teardown(mark);
        }

        match op {
            RuleOp::Add => {
                let mut plan = self.teardown(mark);
                plan.extend(self.ensure_root());
                plan.extend(self.configure(mark, op, &profile.settings));
                plan
            }
            RuleOp::Change => self.configure(mark, op, &profile.settings),
        }
    }

    /// Remove filter, class and leaf qdisc of `mark`. Absence is not an error.
    pub fn teardown(&self, mark: u32) -> Vec<Invocation> {
        let root = format!("{}:", ROOT_HANDLE);
        let classid = format!("{}:{}", ROOT_HANDLE, mark);
        let prio = FILTER_PRIO.to_string();
        let mark = mark.to_string();

        vec![
            Invocation::tc(
                [
                    "filter", "del", "dev", self.iface, "parent", root.as_str(), "handle", mark.as_str(),
                    "protocol", "ip", "prio", prio.as_str(), "fw",
                ],
                FailurePolicy::Tolerated,
            ),
            Invocation::tc(
                ["class", "del", "dev", self.iface, "classid", classid.as_str()],
                FailurePolicy::Tolerated,
            ),
            Invocation::tc(
                ["qdisc", "del", "dev", self.iface, "parent", classid.as_str(), "handle", mark.as_str()],
                FailurePolicy::Tolerated,
            ),
        ]
    }

    /// Root HTB with the unshaped catch-all class. Both fail harmlessly when present.
    pub fn ensure_root(&self) -> Vec<Invocation> {
        let root = format!("{}:", ROOT_HANDLE);
        let default_class = format!("{}:{}", ROOT_HANDLE, DEFAULT_CLASS);
        let default_hex = format!("0x{}", DEFAULT_CLASS);
        let qlen = ROOT_DIRECT_QLEN.to_string();
        let max_rate = format!("{}kbit", self.max_rate_kbit);
        let quantum = QUANTUM.to_string();

        vec![
            Invocation::tc(
                [
                    "qdisc", "add", "dev", self.iface, "root", "handle", root.as_str(), "htb",
                    "default", default_hex.as_str(), "direct_qlen", qlen.as_str(),
                ],
                FailurePolicy::Tolerated,
            ),
            Invocation::tc(
                [
                    "class", "add", "dev", self.iface, "parent", root.as_str(), "classid",
                    default_class.as_str(), "htb", "rate", max_rate.as_str(), "quantum", quantum.as_str(),
                ],
                FailurePolicy::Tolerated,
            ),
        ]
    }

    /// Class, netem leaf and (for `add`) the fw filter.
    pub fn configure(&self, mark: u32, op: RuleOp, settings: &ShapingSettings) -> Vec<Invocation> {
        let root = format!("{}:", ROOT_HANDLE);
        let classid = format!("{}:{}", ROOT_HANDLE, mark);
        let leaf = format!("{}:", mark);

        let mut class = vec![
            "class".to_string(),
            op.as_str().into(),
            "dev".into(),
            self.iface.into(),
            "parent".into(),
            root.clone(),
            "classid".into(),
            classid.clone(),
            "htb".into(),
        ];
        class.extend(HtbRate::derive(settings, self.max_rate_kbit).args());
        class.extend(["quantum".to_string(), QUANTUM.to_string()]);

        let mut qdisc = vec![
            "qdisc".to_string(),
            op.as_str().into(),
            "dev".into(),
            self.iface.into(),
            "parent".into(),
            classid.clone(),
            "handle".into(),
            leaf,
            "netem".into(),
        ];
        qdisc.extend(netem_args(settings));

        let mut plan = vec![
            Invocation::tc(class, FailurePolicy::Required),
            Invocation::tc(qdisc, FailurePolicy::Required),
        ];

        if op == RuleOp::Add {
            let prio = FILTER_PRIO.to_string();
            let mark = mark.to_string();
            plan.push(Invocation::tc(
                [
                    "filter", "add", "dev", self.iface, "parent", root.as_str(), "prio", prio.as_str(),
                    "protocol", "ip", "handle", mark.as_str(), "fw", "flowid", classid.as_str(),
                ],
                FailurePolicy::Required,
            ));
        }

        plan
    }
}
