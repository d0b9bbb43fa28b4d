//! Applies shaping and marking plans to the host

use log::{debug, info, warn};
use std::sync::Arc;

use super::command::CommandRunner;
use super::iptables::MarkingRule;
use super::tc::{RuleOp, ShapingRuleBuilder};
use crate::error::Result;
use crate::path::model::{Direction, ImpairmentProfile, Selector};
use crate::sync::FileLock;

/// Host side of the engine: interfaces, tool runner and the marking lock.
pub struct Shaper {
    runner: Arc<dyn CommandRunner>,
    lan_iface: String,
    wan_iface: String,
    max_rate_kbit: u64,
    marking_lock: FileLock,
}

impl Shaper {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        lan_iface: impl Into<String>,
        wan_iface: impl Into<String>,
        max_rate_kbit: u64,
        marking_lock: FileLock,
    ) -> Self {
        Self {
            runner,
            lan_iface: lan_iface.into(),
            wan_iface: wan_iface.into(),
            max_rate_kbit,
            marking_lock,
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn lan_iface(&self) -> &str {
        &self.lan_iface
    }

    pub fn wan_iface(&self) -> &str {
        &self.wan_iface
    }

    /// Interface packets of `direction` arrive on.
    pub fn ingress_iface(&self, direction: Direction) -> &str {
        match direction {
            Direction::Uplink => &self.lan_iface,
            Direction::Downlink => &self.wan_iface,
        }
    }

    /// Interface `direction` is shaped on.
    pub fn egress_iface(&self, direction: Direction) -> &str {
        match direction {
            Direction::Uplink => &self.wan_iface,
            Direction::Downlink => &self.lan_iface,
        }
    }

    fn builder(&self, direction: Direction) -> ShapingRuleBuilder<'_> {
        ShapingRuleBuilder::new(self.egress_iface(direction), self.max_rate_kbit)
    }

    fn marking_rule<'a>(&'a self, selector: &'a Selector, direction: Direction) -> MarkingRule<'a> {
        MarkingRule::new(
            selector,
            direction,
            self.ingress_iface(direction),
            self.egress_iface(direction),
        )
    }

    /// Apply one direction's profile with `op`.
    pub fn apply(&self, mark: u32, direction: Direction, op: RuleOp, profile: &ImpairmentProfile) -> Result<()> {
        if profile.is_bypass() {
            info!("Bypassing {} for path {}", direction, mark);
        } else {
            debug!("Apply {} {} for path {}: {:?}", op.as_str(), direction, mark, profile.settings);
        }
        self.runner.execute_all(&self.builder(direction).plan(mark, op, profile))
    }

    /// Remove class, leaf qdisc and filter of `mark` in `direction`.
    pub fn clear(&self, mark: u32, direction: Direction) {
        debug!("Cleaning up path {} {}", mark, direction);
        if let Err(e) = self.runner.execute_all(&self.builder(direction).teardown(mark)) {
            warn!("Cleanup of path {} {} failed: {}", mark, direction, e);
        }
    }

    /// Install the marking rules of both directions under the marking lock.
    pub fn install_marking(&self, selector: &Selector) -> Result<()> {
        let _guard = self.marking_lock.acquire()?;
        for direction in Direction::ALL {
            self.runner.execute(&self.marking_rule(selector, direction).append())?;
        }
        Ok(())
    }

    /// Remove the marking rules of both directions. Failures are logged.
    pub fn remove_marking(&self, selector: &Selector) {
        let _guard = match self.marking_lock.acquire() {
            Ok(g) => g,
            Err(e) => {
                warn!("Cannot remove marking rules of path {}: {}", selector.mark, e);
                return;
            }
        };

        for direction in Direction::ALL {
            if let Err(e) = self.runner.execute(&self.marking_rule(selector, direction).delete()) {
                warn!("Removing {} marking rule of path {} failed: {}", direction, selector.mark, e);
            }
        }
    }
}

impl std::fmt::Debug for Shaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shaper")
            .field("lan_iface", &self.lan_iface)
            .field("wan_iface", &self.wan_iface)
            .field("max_rate_kbit", &self.max_rate_kbit)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::network::command::testing::RecordingRunner;

    /// Shaper over a recording runner with `lan0`/`wan0` interfaces.
    pub(crate) fn recording_shaper(lock_dir: &std::path::Path) -> (Arc<Shaper>, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::new());
        let shaper = Shaper::new(
            runner.clone(),
            "lan0",
            "wan0",
            32_000_000,
            FileLock::new(lock_dir.join("marking.lock")),
        );
        (Arc::new(shaper), runner)
    }
}
