//! Path store
//!
//! The persisted path list (`paths.yaml`) is the source of truth. The store
//! keeps an in-memory index of live [`Path`]s derived from it, and every
//! read-modify-write of the list runs under the identifier lock so that
//! concurrent processes sharing the state directory never lose updates.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ModelCatalog;
use crate::error::{Error, Result};
use crate::network::shaper::Shaper;
use crate::path::{IdAllocator, Path, PathMode, PathRecord, PathStatus};
use crate::sync::{FileLock, LockGuard};

/// Called after every persisted mutation.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// YAML document holding the path records
#[derive(Debug, Clone)]
pub struct PathList {
    path: PathBuf,
}

impl PathList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Absent, empty or unreadable lists load as empty.
    pub fn load(&self) -> Vec<PathRecord> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Cannot read {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        if text.trim().is_empty() {
            return Vec::new();
        }

        match serde_yaml::from_str::<Option<Vec<PathRecord>>>(&text) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                error!("Error parsing {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Rewrite the whole document.
    pub fn save(&self, records: &[PathRecord]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
        }

        let text = serde_yaml::to_string(records).map_err(|e| Error::persistence(&self.path, e))?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text).map_err(|e| Error::persistence(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::persistence(&self.path, e))?;

        debug!("Saved {} paths to {}", records.len(), self.path.display());
        Ok(())
    }
}

pub struct PathStore {
    list: PathList,
    id_lock: FileLock,
    allocator: IdAllocator,
    shaper: Arc<Shaper>,
    paths: BTreeMap<u32, Path>,
    on_change: Option<ChangeHook>,
}

impl PathStore {
    /// Build the index from the persisted list.
    pub fn open(list: PathList, id_lock: FileLock, allocator: IdAllocator, shaper: Arc<Shaper>) -> Self {
        let mut store = Self {
            list,
            id_lock,
            allocator,
            shaper,
            paths: BTreeMap::new(),
            on_change: None,
        };
        store.refresh();
        store
    }

    pub fn with_change_hook(mut self, hook: ChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    pub fn path_list(&self) -> &PathList {
        &self.list
    }

    pub fn list(&self) -> Vec<PathRecord> {
        self.paths.values().map(|p| p.record().clone()).collect()
    }

    pub fn get(&self, id: u32) -> Result<&PathRecord> {
        self.paths.get(&id).map(Path::record).ok_or(Error::NotFound { id })
    }

    pub fn active_count(&self) -> usize {
        self.paths.values().filter(|p| p.is_active()).count()
    }

    /// Assign an identifier to `record`, persist it and index it.
    pub fn add(&mut self, mut record: PathRecord) -> Result<u32> {
        validate(&record)?;

        let record = self.id_lock.with(|| {
            let id = self.allocator.acquire_id(&self.list)?;
            record.id = id;
            record.selector.mark = id;
            record.status = PathStatus::Inactive;

            let mut records = self.list.load();
            records.push(record.clone());
            self.list.save(&records)?;
            Ok(record)
        })?;

        let id = record.id;
        info!("Added path {}", id);
        self.paths.insert(id, Path::new(record, self.shaper.clone()));
        self.changed();
        Ok(id)
    }

    /// Replace the persisted record `id`, then re-derive the index.
    pub fn update(&mut self, id: u32, mut record: PathRecord) -> Result<()> {
        validate(&record)?;

        self.id_lock.with(|| {
            let mut records = self.list.load();
            let slot = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(Error::NotFound { id })?;

            record.id = id;
            record.selector.mark = id;
            record.status = slot.status;
            *slot = record;
            self.list.save(&records)
        })?;

        info!("Updated path {}", id);
        self.refresh();
        self.changed();
        Ok(())
    }

    /// Remove the persisted record `id`. The path should be deactivated first;
    /// a path still holding rules is torn down when it leaves the index.
    pub fn delete(&mut self, id: u32) -> Result<()> {
        self.id_lock.with(|| {
            let mut records = self.list.load();
            let index = records
                .iter()
                .position(|r| r.id == id)
                .ok_or(Error::NotFound { id })?;
            records.remove(index);
            self.list.save(&records)
        })?;

        info!("Deleted path {}", id);
        self.allocator.release_id(id);
        self.paths.remove(&id);
        self.changed();
        Ok(())
    }

    pub async fn activate(&mut self, id: u32, catalog: &ModelCatalog) -> Result<()> {
        let path = self.paths.get_mut(&id).ok_or(Error::NotFound { id })?;
        path.activate(catalog).await?;
        self.persist_status(id, PathStatus::Active)
    }

    pub async fn deactivate(&mut self, id: u32) -> Result<()> {
        let path = self.paths.get_mut(&id).ok_or(Error::NotFound { id })?;
        path.deactivate().await;
        self.persist_status(id, PathStatus::Inactive)
    }

    /// Deactivate every indexed path and mark the whole list inactive.
    pub async fn reset_all(&mut self) -> Result<()> {
        self.deactivate_all().await;
        let guard = self.id_lock.acquire()?;
        self.persist_all_inactive(guard)
    }

    /// [`reset_all`](Self::reset_all) for process exit: only active paths are
    /// torn down and the list lock is waited for until `deadline`.
    pub async fn shutdown(&mut self, deadline: Instant) -> Result<()> {
        for path in self.paths.values_mut().filter(|p| p.is_active()) {
            path.deactivate().await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let guard = self.id_lock.acquire_timeout(remaining)?;
        self.persist_all_inactive(guard)
    }

    async fn deactivate_all(&mut self) {
        for path in self.paths.values_mut() {
            path.deactivate().await;
        }
    }

    /// Rebuild the index from the persisted list. Paths whose selector did not
    /// change keep their live state; the others are replaced or dropped.
    pub fn refresh(&mut self) {
        let mut previous = std::mem::take(&mut self.paths);

        for record in self.list.load() {
            let id = record.id;
            let path = match previous.remove(&id) {
                Some(mut live) if *live.selector() == record.selector => {
                    live.replace_settings(record);
                    live
                }
                _ => Path::new(record, self.shaper.clone()),
            };
            self.paths.insert(id, path);
        }

        if !previous.is_empty() {
            debug!("Dropping {} paths no longer listed", previous.len());
        }
    }

    fn persist_status(&self, id: u32, status: PathStatus) -> Result<()> {
        self.id_lock.with(|| {
            let mut records = self.list.load();
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.status = status;
            }
            self.list.save(&records)
        })?;
        self.changed();
        Ok(())
    }

    fn persist_all_inactive(&self, guard: LockGuard) -> Result<()> {
        let mut records = self.list.load();
        for record in &mut records {
            record.status = PathStatus::Inactive;
        }
        self.list.save(&records)?;
        drop(guard);

        self.changed();
        Ok(())
    }

    fn changed(&self) {
        if let Some(hook) = &self.on_change {
            hook();
        }
    }
}

impl std::fmt::Debug for PathStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathStore")
            .field("list", &self.list)
            .field("paths", &self.paths)
            .finish()
    }
}

fn validate(record: &PathRecord) -> Result<()> {
    record.selector.validate()?;
    if record.mode == PathMode::Model && record.model.as_deref().map_or(true, str::is_empty) {
        return Err(Error::UnknownModel { name: String::new() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::command::testing::RecordingRunner;
    use crate::network::shaper::testing::recording_shaper;
    use crate::path::{ImpairmentProfile, PathSettings, Protocol, Selector, ShapingSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn open_store(dir: &std::path::Path, range: std::ops::RangeInclusive<u32>) -> (PathStore, Arc<RecordingRunner>) {
        let (shaper, runner) = recording_shaper(dir);
        let store = PathStore::open(
            PathList::new(dir.join("paths.yaml")),
            FileLock::new(dir.join("nethang_id.lock")),
            IdAllocator::new(range),
            shaper,
        );
        (store, runner)
    }

    fn custom(lan_ip: &str) -> PathRecord {
        let selector = Selector {
            protocol: Protocol::Tcp,
            lan_ip: Some(lan_ip.into()),
            ..Default::default()
        };
        PathRecord::new(
            selector,
            PathSettings::Custom {
                uplink: ImpairmentProfile::shaped(ShapingSettings {
                    delay: Some(20),
                    ..Default::default()
                }),
                downlink: ImpairmentProfile::bypass(),
            },
        )
    }

    fn models() -> ModelCatalog {
        serde_yaml::from_str("models:\n  slow:\n    global: {uplink: {delay: 10}}\n    timeline:\n      - {duration: 3600}\n")
            .unwrap()
    }

    #[test]
    fn test_path_list_load_tolerates_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let list = PathList::new(dir.path().join("paths.yaml"));
        assert!(list.load().is_empty());

        fs::write(list.path(), "").unwrap();
        assert!(list.load().is_empty());

        fs::write(list.path(), "- id: [unterminated").unwrap();
        assert!(list.load().is_empty());
    }

    #[test]
    fn test_path_list_round_trip_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let list = PathList::new(dir.path().join("state/paths.yaml"));
        let mut a = custom("10.0.0.1");
        a.id = 9530;
        let mut b = custom("10.0.0.2");
        b.id = 9527;

        list.save(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(list.load(), vec![a, b]);
    }

    #[test]
    fn test_add_assigns_identifier_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, runner) = open_store(dir.path(), 9527..=9558);

        assert_eq!(store.add(custom("10.0.0.1")).unwrap(), 9527);
        assert_eq!(store.add(custom("10.0.0.2")).unwrap(), 9528);

        let persisted = store.path_list().load();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[1].selector.mark, 9528);
        assert_eq!(persisted[1].status, PathStatus::Inactive);
        assert_eq!(store.get(9528).unwrap().selector.lan_ip.as_deref(), Some("10.0.0.2"));

        // Adding never touches the host
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_add_rejects_invalid_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), 9527..=9558);

        let err = store.add(custom("10.0.0.300")).unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));

        let nameless = PathRecord::new(Selector::default(), PathSettings::Model(String::new()));
        assert!(matches!(store.add(nameless), Err(Error::UnknownModel { .. })));

        assert!(store.path_list().load().is_empty());
    }

    #[test]
    fn test_exhausted_range() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), 9527..=9528);

        store.add(custom("10.0.0.1")).unwrap();
        store.add(custom("10.0.0.2")).unwrap();
        assert!(matches!(
            store.add(custom("10.0.0.3")),
            Err(Error::NoIdentifierAvailable { min: 9527, max: 9528 })
        ));

        store.delete(9527).unwrap();
        assert_eq!(store.add(custom("10.0.0.3")).unwrap(), 9527);
    }

    #[test]
    fn test_update_and_delete_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), 9527..=9558);
        store.add(custom("10.0.0.1")).unwrap();

        assert!(matches!(store.delete(9540), Err(Error::NotFound { id: 9540 })));
        assert!(matches!(
            store.update(9540, custom("10.0.0.9")),
            Err(Error::NotFound { id: 9540 })
        ));

        store.update(9527, custom("10.0.0.9")).unwrap();
        let updated = store.get(9527).unwrap();
        assert_eq!(updated.selector.lan_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(updated.selector.mark, 9527);
        assert_eq!(store.path_list().load()[0].selector.lan_ip.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_activation_status_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), 9527..=9558);
        let id = store.add(custom("10.0.0.1")).unwrap();

        assert!(matches!(
            store.activate(9999, &models()).await,
            Err(Error::NotFound { id: 9999 })
        ));

        store.activate(id, &models()).await.unwrap();
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.path_list().load()[0].status, PathStatus::Active);

        store.deactivate(id).await.unwrap();
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.path_list().load()[0].status, PathStatus::Inactive);
    }

    #[tokio::test]
    async fn test_failed_activation_leaves_status_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), 9527..=9558);
        let id = store
            .add(PathRecord::new(Selector::default(), PathSettings::Model("absent".into())))
            .unwrap();

        let err = store.activate(id, &models()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownModel);
        assert_eq!(store.path_list().load()[0].status, PathStatus::Inactive);
    }

    #[tokio::test]
    async fn test_reset_all_deactivates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, runner) = open_store(dir.path(), 9527..=9558);
        let a = store.add(custom("10.0.0.1")).unwrap();
        store.add(custom("10.0.0.2")).unwrap();
        store.activate(a, &models()).await.unwrap();
        runner.clear();

        store.reset_all().await.unwrap();
        assert_eq!(store.active_count(), 0);
        assert!(store.path_list().load().iter().all(|r| r.status == PathStatus::Inactive));
        // Both paths are swept, active or not
        assert_eq!(runner.matching("-D FORWARD").len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_sweeps_active_paths_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, runner) = open_store(dir.path(), 9527..=9558);
        let a = store.add(custom("10.0.0.1")).unwrap();
        store.add(custom("10.0.0.2")).unwrap();
        store.activate(a, &models()).await.unwrap();
        runner.clear();

        store.shutdown(Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(runner.matching("-D FORWARD").len(), 2);
        assert!(store.path_list().load().iter().all(|r| r.status == PathStatus::Inactive));
    }

    #[tokio::test]
    async fn test_shutdown_lock_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), 9527..=9558);
        let _held = FileLock::new(dir.path().join("nethang_id.lock")).acquire().unwrap();

        let err = store.shutdown(Instant::now() + Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LockTimeout);
    }

    #[tokio::test]
    async fn test_refresh_keeps_unchanged_live_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, runner) = open_store(dir.path(), 9527..=9558);
        let mut slow = PathRecord::new(Selector::default(), PathSettings::Model("slow".into()));
        slow.selector.protocol = Protocol::Udp;
        let id = store.add(slow).unwrap();
        let doomed = store.add(custom("10.0.0.2")).unwrap();
        store.activate(id, &models()).await.unwrap();
        store.activate(doomed, &models()).await.unwrap();
        runner.clear();

        // Another process rewrites the list: new description of `id`, `doomed` removed
        let mut records = store.path_list().load();
        records.retain(|r| r.id == id);
        records[0].model = Some("other".into());
        records.push({
            let mut r = custom("10.0.0.3");
            r.id = 9540;
            r.selector.mark = 9540;
            r
        });
        store.path_list().save(&records).unwrap();

        store.refresh();
        assert_eq!(store.list().len(), 2);
        assert!(store.get(id).unwrap().status == PathStatus::Active);
        assert_eq!(store.get(id).unwrap().model.as_deref(), Some("other"));
        assert!(matches!(store.get(doomed), Err(Error::NotFound { .. })));

        // Only the removed path was torn down
        let removed = runner.matching("-D FORWARD");
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|l| l.contains("10.0.0.2")));
    }

    #[test]
    fn test_change_hook_fires_on_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path(), 9527..=9558);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut store = store.with_change_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let id = store.add(custom("10.0.0.1")).unwrap();
        store.update(id, custom("10.0.0.5")).unwrap();
        store.delete(id).unwrap();
        assert!(store.delete(id).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_adds_get_distinct_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let workers: Vec<_> = (0..2)
            .map(|n| {
                let root = root.clone();
                thread::spawn(move || {
                    let (mut store, _) = open_store(&root, 9527..=9558);
                    (0..8)
                        .map(|i| store.add(custom(&format!("10.{}.0.{}", n, i + 1))).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u32> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        let persisted = PathList::new(root.join("paths.yaml")).load();
        assert_eq!(persisted.len(), 16);
    }
}
