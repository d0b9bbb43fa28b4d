//! Path lifecycle: marking rules plus one background worker per active path

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::{Direction, ImpairmentProfile, PathMode, PathRecord, PathStatus, Selector};
use super::scheduler::ModelScheduler;
use crate::config::ModelCatalog;
use crate::error::{Error, Result};
use crate::network::shaper::Shaper;
use crate::network::tc::RuleOp;

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self) -> JoinHandle<()> {
        self.token.cancel();
        self.handle.abort();
        self.handle
    }
}

enum Job {
    Custom {
        uplink: ImpairmentProfile,
        downlink: ImpairmentProfile,
    },
    Model(ModelScheduler),
}

impl Job {
    async fn run(self, shaper: &Shaper, id: u32, token: CancellationToken) -> Result<()> {
        match self {
            Job::Custom { uplink, downlink } => {
                info!("Running custom settings for path {}", id);
                shaper.apply(id, Direction::Uplink, RuleOp::Add, &uplink)?;
                shaper.apply(id, Direction::Downlink, RuleOp::Add, &downlink)
            }
            Job::Model(scheduler) => scheduler.run(token).await,
        }
    }
}

/// A live path. Equality of paths is equality of their selectors.
pub struct Path {
    record: PathRecord,
    shaper: Arc<Shaper>,
    worker: Option<Worker>,
    /// Set once this object put rules on the host
    installed: bool,
}

impl Path {
    pub fn new(record: PathRecord, shaper: Arc<Shaper>) -> Self {
        Self {
            record,
            shaper,
            worker: None,
            installed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.record.id
    }

    pub fn record(&self) -> &PathRecord {
        &self.record
    }

    pub fn selector(&self) -> &Selector {
        &self.record.selector
    }

    pub fn status(&self) -> PathStatus {
        self.record.status
    }

    pub fn is_active(&self) -> bool {
        self.record.status == PathStatus::Active
    }

    /// Take new settings from `record`, keeping the live status. A running
    /// worker keeps its settings until the next activation.
    pub fn replace_settings(&mut self, record: PathRecord) {
        let status = self.record.status;
        self.record = record;
        self.record.status = status;
    }

    /// Install marking rules and start the worker. Activating an active path
    /// restarts it.
    pub async fn activate(&mut self, catalog: &ModelCatalog) -> Result<()> {
        let id = self.id();
        let job = match self.record.mode {
            PathMode::Custom => Job::Custom {
                uplink: self.record.uplink.clone(),
                downlink: self.record.downlink.clone(),
            },
            PathMode::Model => {
                let name = self.record.model.as_deref().unwrap_or_default();
                Job::Model(ModelScheduler::resolve(self.shaper.clone(), id, name, catalog)?)
            }
        };

        if self.worker.is_some() {
            self.deactivate().await;
        }

        info!("Activating path {}", id);
        self.installed = true;
        if let Err(e) = self.shaper.install_marking(&self.record.selector) {
            self.shaper.remove_marking(&self.record.selector);
            self.installed = false;
            return Err(e);
        }

        let token = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();
        let shaper = self.shaper.clone();
        let worker_token = token.clone();

        let handle = tokio::spawn(async move {
            let _ = started_tx.send(());
            match job.run(&shaper, id, worker_token).await {
                Ok(()) => debug!("Path {} worker finished", id),
                Err(e) => error!("Path {} worker failed: {}", id, e),
            }
        });

        if let Err(e) = started_rx.await {
            handle.abort();
            self.shaper.remove_marking(&self.record.selector);
            self.installed = false;
            return Err(Error::WorkerStart {
                id,
                reason: e.to_string(),
            });
        }

        self.worker = Some(Worker { token, handle });
        self.record.status = PathStatus::Active;
        Ok(())
    }

    /// Stop the worker, then remove marking and shaping state. Never fails;
    /// cleanup errors are logged.
    pub async fn deactivate(&mut self) {
        let id = self.id();
        info!("Deactivating path {}", id);

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.stop().await {
                if e.is_panic() {
                    warn!("Path {} worker panicked: {}", id, e);
                }
            }
        }

        self.shaper.remove_marking(&self.record.selector);
        for direction in Direction::ALL {
            self.shaper.clear(id, direction);
        }

        self.installed = false;
        self.record.status = PathStatus::Inactive;
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.record.selector == other.record.selector
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("record", &self.record)
            .field("running", &self.worker.is_some())
            .field("installed", &self.installed)
            .finish()
    }
}

impl Drop for Path {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker.stop());
        }
        if !self.installed {
            return;
        }

        debug!("Path {} dropped while installed, cleaning up", self.id());
        self.shaper.remove_marking(&self.record.selector);
        for direction in Direction::ALL {
            self.shaper.clear(self.id(), direction);
        }
    }
}
