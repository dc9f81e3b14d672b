//! Application context handed to the acquisition driver.
//!
//! Bundles the collaborators the driver depends on: hardware core, event bus,
//! user interface, storage factory, optional autofocus and the disk-space probe,
//! plus the engine configuration.

use crate::config::EngineConfig;
use crate::data::datastore::DatastoreFactory;
use crate::error::{AcqError, AppResult};
use crate::events::EventBus;
use crate::hardware::{AutofocusManager, MicroscopeCore};
use crate::ui::UserInterface;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;

/// Reports usable disk space.
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to this process on the filesystem holding `path`.
    fn usable_space(&self, path: &Path) -> AppResult<u64>;
}

/// Disk-space probe backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn usable_space(&self, path: &Path) -> AppResult<u64> {
        // Walk up to an existing ancestor; a missing leaf has no mount point yet.
        let mut existing: PathBuf = path.to_path_buf();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent.to_path_buf(),
                None => return Ok(0),
            }
        }
        let canonical = existing.canonicalize()?;

        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| canonical.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                AcqError::Hardware(format!(
                    "no filesystem found for {}",
                    canonical.display()
                ))
            })
    }
}

/// Disk-space probe returning a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub u64);

impl DiskSpaceProbe for FixedDiskSpace {
    fn usable_space(&self, _path: &Path) -> AppResult<u64> {
        Ok(self.0)
    }
}

/// Collaborators of the acquisition driver.
#[derive(Clone)]
pub struct AppContext {
    /// Hardware core.
    pub core: Arc<dyn MicroscopeCore>,
    /// Lifecycle event bus.
    pub events: Arc<EventBus>,
    /// Prompts and error reports.
    pub ui: Arc<dyn UserInterface>,
    /// Creates datastores and pipelines.
    pub storage: Arc<dyn DatastoreFactory>,
    /// Autofocus, when one is configured.
    pub autofocus: Option<Arc<dyn AutofocusManager>>,
    /// Free-space checks before saving.
    pub disk: Arc<dyn DiskSpaceProbe>,
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
}

impl AppContext {
    /// Context with a fresh event bus, the system disk probe and default configuration.
    pub fn new(
        core: Arc<dyn MicroscopeCore>,
        ui: Arc<dyn UserInterface>,
        storage: Arc<dyn DatastoreFactory>,
    ) -> Self {
        Self {
            core,
            events: Arc::new(EventBus::default()),
            ui,
            storage,
            autofocus: None,
            disk: Arc::new(SystemDiskProbe),
            config: Arc::new(EngineConfig::default()),
        }
    }

    #[allow(missing_docs)]
    pub fn with_autofocus(mut self, autofocus: Arc<dyn AutofocusManager>) -> Self {
        self.autofocus = Some(autofocus);
        self
    }

    #[allow(missing_docs)]
    pub fn with_disk_probe(mut self, disk: Arc<dyn DiskSpaceProbe>) -> Self {
        self.disk = disk;
        self
    }

    #[allow(missing_docs)]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    #[allow(missing_docs)]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_probe_reports_value() {
        let probe = FixedDiskSpace(1234);
        assert_eq!(probe.usable_space(Path::new("/nowhere")).unwrap(), 1234);
    }

    #[test]
    fn system_probe_handles_missing_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet");
        // Either a real figure for the temp filesystem or a lookup error
        // on exotic sandboxes; never a panic.
        let _ = SystemDiskProbe.usable_space(&missing);
    }
}
