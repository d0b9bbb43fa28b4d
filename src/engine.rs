//! Engine service
//!
//! One object per process owning the path store, the traffic monitor and the
//! event sink. The monitor runs exactly while at least one path is active.

use log::{debug, info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::{load_config, load_models, save_config, Config, ModelCatalog};
use crate::error::{Error, Result};
use crate::network::command::CommandRunner;
use crate::network::monitor::{StatsPayload, TrafficMonitor};
use crate::network::shaper::Shaper;
use crate::path::{IdAllocator, PathRecord, PathSettings, Selector};
use crate::store::{PathList, PathStore};
use crate::sync::FileLock;

const EVENT_CAPACITY: usize = 64;
/// Coalesces the burst of notifications a single save produces
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PathsChanged,
    ConfigChanged,
    StatsTick(Arc<StatsPayload>),
}

/// Result of probing one host tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: &'static str,
    pub available: bool,
    pub detail: String,
}

pub struct Engine {
    config_path: PathBuf,
    config: Mutex<Config>,
    shaper: Arc<Shaper>,
    store: tokio::sync::Mutex<PathStore>,
    monitor: tokio::sync::Mutex<TrafficMonitor>,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Load `config_path` and build the engine on top of `runner`.
    pub fn open(config_path: &Path, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let config = load_config(config_path)?;
        Ok(Self::new(config_path.to_path_buf(), config, runner))
    }

    pub fn new(config_path: PathBuf, config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        let settings = &config.engine;
        let shaper = Arc::new(Shaper::new(
            runner,
            config.lan_interface.clone(),
            config.wan_interface.clone(),
            settings.max_rate_kbit,
            FileLock::new(settings.marking_lock_file()),
        ));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let paths_tx = events.clone();
        let store = PathStore::open(
            PathList::new(settings.paths_file()),
            FileLock::new(settings.id_lock_file()),
            IdAllocator::new(settings.mark_range()),
            shaper.clone(),
        )
        .with_change_hook(Arc::new(move || {
            let _ = paths_tx.send(EngineEvent::PathsChanged);
        }));

        let stats_tx = events.clone();
        let monitor = TrafficMonitor::new(
            shaper.clone(),
            settings.mark_range(),
            settings.monitor_interval(),
            Arc::new(move |payload: &StatsPayload| {
                let _ = stats_tx.send(EngineEvent::StatsTick(Arc::new(payload.clone())));
            }),
        );

        Self {
            config_path,
            config: Mutex::new(config),
            shaper,
            store: tokio::sync::Mutex::new(store),
            monitor: tokio::sync::Mutex::new(monitor),
            events,
        }
    }

    /// Startup reset: nothing from a previous run stays installed.
    pub async fn start(&self) -> Result<()> {
        if self.shaper.lan_iface().is_empty() || self.shaper.wan_iface().is_empty() {
            warn!("LAN/WAN interfaces are not configured, shaping commands will fail");
        }

        info!(
            "Engine starting (LAN: {}, WAN: {})",
            self.shaper.lan_iface(),
            self.shaper.wan_iface()
        );
        self.store.lock().await.reset_all().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> Config {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Persist `config`. Interface changes take effect on the next start.
    pub fn save_config(&self, config: Config) -> Result<()> {
        save_config(&self.config_path, &config)?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        let _ = self.events.send(EngineEvent::ConfigChanged);
        Ok(())
    }

    /// Re-read on every call; the catalog is edited outside the engine.
    pub fn models(&self) -> ModelCatalog {
        load_models(&self.config().engine.models_file())
    }

    pub async fn list_paths(&self) -> Vec<PathRecord> {
        self.store.lock().await.list()
    }

    pub async fn get_path(&self, id: u32) -> Result<PathRecord> {
        self.store.lock().await.get(id).cloned()
    }

    pub async fn add_path(&self, selector: Selector, settings: PathSettings) -> Result<u32> {
        self.add_record(PathRecord::new(selector, settings)).await
    }

    /// Add a full record; its id, mark and status are reassigned.
    pub async fn add_record(&self, record: PathRecord) -> Result<u32> {
        self.store.lock().await.add(record)
    }

    pub async fn update_path(&self, id: u32, record: PathRecord) -> Result<()> {
        let active = {
            let mut store = self.store.lock().await;
            store.update(id, record)?;
            store.active_count()
        };
        self.sync_monitor(active).await;
        Ok(())
    }

    pub async fn delete_path(&self, id: u32) -> Result<()> {
        let active = {
            let mut store = self.store.lock().await;
            store.delete(id)?;
            store.active_count()
        };
        self.sync_monitor(active).await;
        Ok(())
    }

    pub async fn activate_path(&self, id: u32) -> Result<()> {
        let catalog = self.models();
        let active = {
            let mut store = self.store.lock().await;
            store.activate(id, &catalog).await?;
            store.active_count()
        };
        self.sync_monitor(active).await;
        Ok(())
    }

    pub async fn deactivate_path(&self, id: u32) -> Result<()> {
        let active = {
            let mut store = self.store.lock().await;
            store.deactivate(id).await?;
            store.active_count()
        };
        self.sync_monitor(active).await;
        Ok(())
    }

    /// Re-derive the path index after an external change to the list.
    pub async fn refresh(&self) {
        let active = {
            let mut store = self.store.lock().await;
            store.refresh();
            store.active_count()
        };
        self.sync_monitor(active).await;
        let _ = self.events.send(EngineEvent::PathsChanged);
    }

    pub async fn stats(&self) -> StatsPayload {
        self.monitor.lock().await.latest()
    }

    pub async fn monitor_running(&self) -> bool {
        self.monitor.lock().await.is_running()
    }

    async fn sync_monitor(&self, active: usize) {
        let mut monitor = self.monitor.lock().await;
        if active == 0 {
            monitor.stop().await;
        } else {
            monitor.start();
        }
    }

    /// Run harmless listing commands to see whether the tools are usable,
    /// plus whether the process may change kernel state at all.
    pub fn check_tools(&self) -> Vec<ToolStatus> {
        let probes: [(&'static str, &[&str]); 2] = [
            ("tc", &["qdisc", "show"]),
            ("iptables", &["-t", "mangle", "-nL", "FORWARD"]),
        ];

        probes
            .into_iter()
            .map(|(tool, args)| {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                match self.shaper.runner().run(tool, &args) {
                    Ok(_) => ToolStatus {
                        tool,
                        available: true,
                        detail: format!("{} executed successfully", tool),
                    },
                    Err(e) => ToolStatus {
                        tool,
                        available: false,
                        detail: e.to_string(),
                    },
                }
            })
            .chain(std::iter::once(privilege_status()))
            .collect()
    }

    /// Termination sweep: stop the monitor, tear down active paths and mark
    /// the list inactive, all within the configured timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let limit = self.config().engine.shutdown_timeout();
        info!("Engine shutting down (limit: {:?})", limit);

        let deadline = Instant::now() + limit;
        let sweep = async {
            self.monitor.lock().await.stop().await;
            self.store.lock().await.shutdown(deadline).await
        };

        // The list lock gives up at `deadline`, before the overall bound.
        match time::timeout(limit + SHUTDOWN_GRACE, sweep).await {
            Ok(result) => result,
            Err(_) => Err(Error::ShutdownTimeout {
                waited: limit + SHUTDOWN_GRACE,
            }),
        }
    }

    /// Watch the state directory and refresh the index whenever the path
    /// list changes on disk. Stops when the returned handle is dropped.
    pub fn watch(self: &Arc<Self>) -> Result<PathWatch> {
        let paths_file = self.store_paths_file();
        let dir = paths_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|e| Error::persistence(&dir, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let file_name = paths_file.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event.paths.iter().any(|p| p.file_name() == file_name.as_deref());
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Path list watch error: {}", e),
        })
        .map_err(|e| Error::persistence(&dir, e))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::persistence(&dir, e))?;
        info!("Watching {} for path list changes", dir.display());

        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                time::sleep(WATCH_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                debug!("Path list changed on disk, refreshing");
                engine.refresh().await;
            }
        });

        Ok(PathWatch {
            _watcher: watcher,
            task,
        })
    }

    fn store_paths_file(&self) -> PathBuf {
        self.config().engine.paths_file()
    }
}

fn privilege_status() -> ToolStatus {
    let euid = nix::unistd::geteuid();
    ToolStatus {
        tool: "privileges",
        available: euid.is_root(),
        detail: if euid.is_root() {
            "running as root".to_string()
        } else {
            format!("running as uid {}, tc and iptables changes need root or CAP_NET_ADMIN", euid)
        },
    }
}

/// Keeps the path list watcher alive.
pub struct PathWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for PathWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
