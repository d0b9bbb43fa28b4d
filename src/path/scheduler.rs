//! Model scheduler
//!
//! Drives a model-mode path from a catalog entry. A model without a timeline
//! is applied once and held. A timeline is replayed forever: every step is
//! `global` merged with the step's overrides, held for the step's `duration`.
//! The first application of a run uses `add`; later ones use `change`.

use log::{debug, info};
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::merge::merge;
use super::model::{Direction, ImpairmentProfile};
use crate::config::{ModelCatalog, ModelEntry};
use crate::error::{Error, Result};
use crate::network::shaper::Shaper;
use crate::network::tc::RuleOp;

/// Resolved settings of one timeline step
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub uplink: ImpairmentProfile,
    pub downlink: ImpairmentProfile,
    pub duration: Option<Duration>,
}

impl Step {
    fn from_settings(model: &str, settings: &Mapping) -> Result<Self> {
        let duration = settings
            .get("duration")
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0 && secs.is_finite())
            .map(Duration::from_secs_f64);

        Ok(Self {
            uplink: direction_profile(model, settings, Direction::Uplink)?,
            downlink: direction_profile(model, settings, Direction::Downlink)?,
            duration,
        })
    }

    pub fn profile(&self, direction: Direction) -> &ImpairmentProfile {
        match direction {
            Direction::Uplink => &self.uplink,
            Direction::Downlink => &self.downlink,
        }
    }
}

/// A missing or null direction is bypassed.
fn direction_profile(model: &str, settings: &Mapping, direction: Direction) -> Result<ImpairmentProfile> {
    match settings.get(direction.as_str()) {
        None | Some(Value::Null) => Ok(ImpairmentProfile::bypass()),
        Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
            Error::InvalidConfig(format!("model '{}' {} settings: {}", model, direction, e))
        }),
    }
}

/// Flatten a catalog entry into its steps. A static model yields one step
/// without duration.
pub fn compile(model: &str, entry: &ModelEntry) -> Result<Vec<Step>> {
    if entry.timeline().is_empty() {
        return Ok(vec![Step::from_settings(model, &entry.global)?]);
    }

    entry
        .timeline()
        .iter()
        .map(|slot| Step::from_settings(model, &merge(&entry.global, slot)))
        .collect()
}

#[derive(Debug)]
pub struct ModelScheduler {
    shaper: Arc<Shaper>,
    mark: u32,
    model: String,
    steps: Vec<Step>,
    looping: bool,
}

impl ModelScheduler {
    /// Look `model` up in the catalog. Fails with `UnknownModel` before
    /// anything touches the host.
    pub fn resolve(shaper: Arc<Shaper>, mark: u32, model: &str, catalog: &ModelCatalog) -> Result<Self> {
        let entry = catalog.get(model).ok_or_else(|| Error::UnknownModel {
            name: model.to_string(),
        })?;

        Ok(Self {
            shaper,
            mark,
            model: model.to_string(),
            steps: compile(model, entry)?,
            looping: !entry.timeline().is_empty(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run until `token` is cancelled. Returns early only on a failed
    /// application.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!("Running model '{}' for path {}", self.model, self.mark);
        for direction in Direction::ALL {
            self.shaper.clear(self.mark, direction);
        }

        let mut installed = [false; 2];

        if !self.looping {
            self.apply_step(&self.steps[0], &mut installed)?;
            token.cancelled().await;
            return Ok(());
        }

        // Without any duration the timeline would spin; hold the first pass.
        let timed = self.steps.iter().any(|s| s.duration.is_some());

        loop {
            for (index, step) in self.steps.iter().enumerate() {
                if token.is_cancelled() {
                    return Ok(());
                }
                debug!("Path {} model '{}' step {}", self.mark, self.model, index);
                self.apply_step(step, &mut installed)?;

                if let Some(duration) = step.duration {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = time::sleep(duration) => {}
                    }
                }
            }

            if !timed {
                token.cancelled().await;
                return Ok(());
            }
        }
    }

    /// `installed` tracks which directions currently own a class: a bypassed
    /// step removes it, so the next shaped step has to `add` again.
    fn apply_step(&self, step: &Step, installed: &mut [bool; 2]) -> Result<()> {
        for (slot, direction) in Direction::ALL.into_iter().enumerate() {
            let profile = step.profile(direction);
            let op = if installed[slot] { RuleOp::Change } else { RuleOp::Add };
            self.shaper.apply(self.mark, direction, op, profile)?;
            installed[slot] = !profile.is_bypass();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::shaper::testing::recording_shaper;

    fn catalog(yaml: &str) -> ModelCatalog {
        serde_yaml::from_str(yaml).unwrap()
    }

    const MODELS: &str = r#"
version: "1.0"
models:
  static_delay:
    description: fixed 10ms uplink
    global:
      uplink: {delay: 10}
      downlink: {mode: bypass}
  flapping:
    global:
      uplink: {rate_limit: 2000, delay: 20}
      downlink: {rate_limit: 4000}
    timeline:
      - {duration: 0.05, uplink: {loss: 5}}
      - {duration: 0.05, uplink: {loss: 0, delay: 80}, downlink: {delay: 30}}
  untimed:
    global:
      uplink: {delay: 5}
    timeline:
      - {uplink: {delay: 6}}
      - {uplink: {delay: 7}}
"#;

    #[test]
    fn test_compile_merges_steps_over_global() {
        let catalog = catalog(MODELS);
        let steps = compile("flapping", catalog.get("flapping").unwrap()).unwrap();
        assert_eq!(steps.len(), 2);

        assert_eq!(steps[0].uplink.settings.rate_limit, Some(2000));
        assert_eq!(steps[0].uplink.settings.loss, Some(5.0));
        assert_eq!(steps[0].duration, Some(Duration::from_millis(50)));

        assert_eq!(steps[1].uplink.settings.delay, Some(80));
        assert_eq!(steps[1].downlink.settings.rate_limit, Some(4000));
        assert_eq!(steps[1].downlink.settings.delay, Some(30));
    }

    #[test]
    fn test_missing_direction_is_bypass() {
        let catalog = catalog(MODELS);
        let steps = compile("untimed", catalog.get("untimed").unwrap()).unwrap();
        assert!(steps.iter().all(|s| s.downlink.is_bypass()));
        assert!(steps[0].duration.is_none());
    }

    #[test]
    fn test_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let (shaper, runner) = recording_shaper(dir.path());
        let err = ModelScheduler::resolve(shaper, 9527, "nope", &catalog(MODELS)).unwrap_err();
        assert!(matches!(err, Error::UnknownModel { ref name } if name == "nope"));
        assert!(runner.lines().is_empty());
    }

    #[tokio::test]
    async fn test_static_model_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        let (shaper, runner) = recording_shaper(dir.path());
        let scheduler = ModelScheduler::resolve(shaper, 9527, "static_delay", &catalog(MODELS)).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token.clone()));
        time::sleep(Duration::from_millis(50)).await;

        let netem = runner.matching("netem");
        assert_eq!(netem.len(), 1);
        assert!(netem[0].starts_with("tc qdisc add dev wan0 parent 9527:9527 handle 9527: netem"));
        assert!(netem[0].contains("delay 10ms"));
        assert!(runner.matching("qdisc change").is_empty());
        assert!(runner.matching("tc class add dev lan0 parent 9527: classid").is_empty());

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(runner.matching("netem").len(), 1);
    }

    #[tokio::test]
    async fn test_timeline_adds_once_then_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (shaper, runner) = recording_shaper(dir.path());
        let scheduler = ModelScheduler::resolve(shaper, 9530, "flapping", &catalog(MODELS)).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token.clone()));
        time::sleep(Duration::from_millis(180)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        for iface in ["wan0", "lan0"] {
            let applied = runner.matching(&format!("dev {} parent 9527:9530 handle 9530: netem", iface));
            assert!(applied.len() >= 3, "{} applications on {}", applied.len(), iface);
            assert!(applied[0].starts_with("tc qdisc add"));
            assert!(applied[1..].iter().all(|l| l.starts_with("tc qdisc change")));
        }

        // Only the first application installs the fw filter
        assert_eq!(runner.matching("filter add").len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_long_step() {
        let dir = tempfile::tempdir().unwrap();
        let (shaper, _runner) = recording_shaper(dir.path());
        let models = catalog(
            "models:\n  slow:\n    global: {uplink: {delay: 1}}\n    timeline:\n      - {duration: 3600}\n",
        );
        let scheduler = ModelScheduler::resolve(shaper, 9527, "slow", &models).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token.clone()));
        time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let joined = time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok(), "scheduler ignored cancellation");
    }

    #[tokio::test]
    async fn test_failed_application_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let (shaper, runner) = recording_shaper(dir.path());
        runner.fail_when("netem");
        let scheduler = ModelScheduler::resolve(shaper, 9527, "static_delay", &catalog(MODELS)).unwrap();

        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ShapingCommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_bypassed_step_reinstalls_with_add() {
        let dir = tempfile::tempdir().unwrap();
        let (shaper, runner) = recording_shaper(dir.path());
        let models = catalog(
            r#"
models:
  outage:
    global:
      uplink: {delay: 10}
    timeline:
      - {duration: 0.03}
      - {duration: 0.03, uplink: {mode: bypass}}
"#,
        );
        let scheduler = ModelScheduler::resolve(shaper, 9527, "outage", &models).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token.clone()));
        time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let applied = runner.matching("dev wan0 parent 9527:9527 handle 9527: netem");
        assert!(applied.len() >= 2);
        assert!(applied.iter().all(|l| l.starts_with("tc qdisc add")));
    }
}
