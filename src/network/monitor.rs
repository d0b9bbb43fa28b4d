//! Traffic monitor
//!
//! One shared sampling loop for all paths. Every tick it reads the marking
//! counters and the netem statistics of both interfaces, derives per-path
//! rates and pushes the last [`BUFFER_LEN`] samples to a callback.

use chrono::Local;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::shaper::Shaper;
use super::stats::{parse_marking_table, parse_shaping_stats, DirectionRates, DirectionSample};
use super::tc::round2;
use crate::error::Result;
use crate::path::model::Direction;

/// Samples kept per series
pub const BUFFER_LEN: usize = 100;

/// Receives the rolling payload after every tick.
pub type StatsCallback = Arc<dyn Fn(&StatsPayload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    BitRateIn,
    BitRateOut,
    PacketRateIn,
    PacketRateOut,
    BytesIn,
    BytesOut,
    PacketsIn,
    PacketsOut,
    QueuePackets,
    QueueDropPackets,
    QueueDropRate,
}

impl Metric {
    pub const ALL: [Metric; 11] = [
        Metric::BitRateIn,
        Metric::BitRateOut,
        Metric::PacketRateIn,
        Metric::PacketRateOut,
        Metric::BytesIn,
        Metric::BytesOut,
        Metric::PacketsIn,
        Metric::PacketsOut,
        Metric::QueuePackets,
        Metric::QueueDropPackets,
        Metric::QueueDropRate,
    ];

    fn value(self, sample: &DirectionSample, rates: &DirectionRates) -> f64 {
        match self {
            Metric::BitRateIn => rates.ingress_kbps(),
            Metric::BitRateOut => rates.egress_kbps(),
            Metric::PacketRateIn => round2(rates.ingress_pps),
            Metric::PacketRateOut => round2(rates.egress_pps),
            Metric::BytesIn => sample.ingress.bytes as f64,
            Metric::BytesOut => sample.queue.sent_bytes as f64,
            Metric::PacketsIn => sample.ingress.packets as f64,
            Metric::PacketsOut => sample.queue.sent_packets as f64,
            Metric::QueuePackets => sample.queue.backlog_packets as f64,
            Metric::QueueDropPackets => sample.queue.drops as f64,
            Metric::QueueDropRate => rates.drop_percent(),
        }
    }
}

pub type DirectionSeries = BTreeMap<Metric, Vec<Option<f64>>>;

/// What listeners receive each tick. Unfilled slots are `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsPayload {
    pub timestamps: Vec<Option<String>>,
    pub series: BTreeMap<u32, BTreeMap<Direction, DirectionSeries>>,
}

/// Per-path samples of one tick
pub type TickSamples = HashMap<(u32, Direction), DirectionSample>;

/// Read both tools once and resolve the sample of every identifier in `range`.
///
/// A direction without a netem entry is absent from the result.
pub fn query(shaper: &Shaper, range: RangeInclusive<u32>) -> Result<TickSamples> {
    let runner = shaper.runner();
    let marking_out = runner.run("iptables", &strings(&["-nvxL", "FORWARD", "-t", "mangle"]))?;
    let marking = parse_marking_table(&marking_out);

    let mut samples = TickSamples::new();
    for direction in Direction::ALL {
        let egress = shaper.egress_iface(direction);
        let qdisc_out = runner.run("tc", &strings(&["-s", "qdisc", "show", "dev", egress]))?;
        let queues = parse_shaping_stats(&qdisc_out);

        for id in range.clone() {
            let Some(queue) = queues.get(&id) else {
                continue;
            };
            let ingress = marking.get(id, shaper.ingress_iface(direction), egress);
            samples.insert((id, direction), DirectionSample { ingress, queue: *queue });
        }
    }

    Ok(samples)
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn empty_buffer<T: Clone>() -> VecDeque<Option<T>> {
    VecDeque::from(vec![None; BUFFER_LEN])
}

fn push_rolling<T>(buffer: &mut VecDeque<T>, value: T) {
    buffer.pop_front();
    buffer.push_back(value);
}

/// Rolling buffers and the previous sample of every series.
#[derive(Debug)]
pub struct Sampler {
    timestamps: VecDeque<Option<String>>,
    series: BTreeMap<u32, BTreeMap<Direction, BTreeMap<Metric, VecDeque<Option<f64>>>>>,
    previous: HashMap<(u32, Direction), (Instant, DirectionSample)>,
}

impl Sampler {
    pub fn new(range: RangeInclusive<u32>) -> Self {
        let series = range
            .map(|id| {
                let directions: BTreeMap<_, BTreeMap<_, _>> = Direction::ALL
                    .into_iter()
                    .map(|d| (d, Metric::ALL.into_iter().map(|m| (m, empty_buffer())).collect()))
                    .collect();
                (id, directions)
            })
            .collect();

        Self {
            timestamps: empty_buffer(),
            series,
            previous: HashMap::new(),
        }
    }

    /// Push one tick. Series without a sample keep their buffers untouched.
    pub fn record(&mut self, samples: &TickSamples, at: Instant, label: String) {
        push_rolling(&mut self.timestamps, Some(label));
        self.previous.retain(|key, _| samples.contains_key(key));

        for (&(id, direction), sample) in samples {
            let Some(metrics) = self.series.get_mut(&id).and_then(|d| d.get_mut(&direction)) else {
                continue;
            };

            let rates = match self.previous.get(&(id, direction)) {
                Some((then, prev)) => {
                    DirectionRates::between(Some(prev), sample, at.saturating_duration_since(*then).as_secs_f64())
                }
                None => DirectionRates::between(None, sample, 0.0),
            };

            for (metric, buffer) in metrics.iter_mut() {
                push_rolling(buffer, Some(metric.value(sample, &rates)));
            }
            self.previous.insert((id, direction), (at, *sample));
        }
    }

    pub fn payload(&self) -> StatsPayload {
        StatsPayload {
            timestamps: self.timestamps.iter().cloned().collect(),
            series: self
                .series
                .iter()
                .map(|(id, directions)| {
                    let directions: BTreeMap<_, DirectionSeries> = directions
                        .iter()
                        .map(|(d, metrics)| {
                            let metrics: DirectionSeries = metrics
                                .iter()
                                .map(|(m, buf)| (*m, buf.iter().copied().collect()))
                                .collect();
                            (*d, metrics)
                        })
                        .collect();
                    (*id, directions)
                })
                .collect(),
        }
    }
}

/// Background sampling loop, started and stopped by the engine.
pub struct TrafficMonitor {
    shaper: Arc<Shaper>,
    range: RangeInclusive<u32>,
    interval: Duration,
    callback: StatsCallback,
    sampler: Arc<Mutex<Sampler>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl TrafficMonitor {
    pub fn new(shaper: Arc<Shaper>, range: RangeInclusive<u32>, interval: Duration, callback: StatsCallback) -> Self {
        let sampler = Arc::new(Mutex::new(Sampler::new(range.clone())));
        Self {
            shaper,
            range,
            interval,
            callback,
            sampler,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawn the sampling loop. No-op when already running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        info!("Traffic monitor starting (interval: {:?})", self.interval);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.shaper.clone(),
            self.range.clone(),
            self.interval,
            self.sampler.clone(),
            self.callback.clone(),
            token.clone(),
        ));
        self.task = Some((token, handle));
    }

    /// Cancel the loop and wait for it. A loop that did not end cleanly is
    /// restarted rather than left behind.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.task.take() else {
            return;
        };

        token.cancel();
        match handle.await {
            Ok(()) => info!("Traffic monitor stopped"),
            Err(e) => {
                warn!("Traffic monitor did not stop cleanly ({}), restarting it", e);
                self.start();
            }
        }
    }

    /// Current rolling payload.
    pub fn latest(&self) -> StatsPayload {
        match self.sampler.lock() {
            Ok(sampler) => sampler.payload(),
            Err(poisoned) => poisoned.into_inner().payload(),
        }
    }
}

impl Drop for TrafficMonitor {
    fn drop(&mut self) {
        if let Some((token, handle)) = self.task.take() {
            token.cancel();
            handle.abort();
        }
    }
}

async fn run(
    shaper: Arc<Shaper>,
    range: RangeInclusive<u32>,
    period: Duration,
    sampler: Arc<Mutex<Sampler>>,
    callback: StatsCallback,
    token: CancellationToken,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let samples = match query(&shaper, range.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Traffic monitor tick error: {}", e);
                continue;
            }
        };
        debug!("Monitor tick: {} active series", samples.len());

        let payload = {
            let mut sampler = match sampler.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            sampler.record(&samples, Instant::now(), Local::now().format("%H:%M:%S").to_string());
            sampler.payload()
        };
        callback(&payload);
    }
}
