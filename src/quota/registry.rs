use crate::quota::{DiskOptions, DiskQuotaController, QuotaSnapshot};
use crate::util::error::{LogError, LogResult};
use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-lifetime table of quota controllers keyed by stream id.
///
/// Engines register their controller on open and remove it on drop; the
/// administration path reaches a stream's controller through here.
#[derive(Debug, Default)]
pub struct QuotaRegistry {
    controllers: RwLock<HashMap<u64, Arc<DiskQuotaController>>>,
}

impl QuotaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controller: Arc<DiskQuotaController>) -> LogResult<()> {
        let stream_id = controller.stream_id();
        let mut controllers = self.controllers.write();
        if controllers.contains_key(&stream_id) {
            return Err(LogError::state_not_match(format!(
                "stream {stream_id} already has a quota controller"
            )));
        }
        controllers.insert(stream_id, controller);
        info!("event=quota_register stream_id={}", stream_id);
        Ok(())
    }

    pub fn deregister(&self, stream_id: u64) -> Option<Arc<DiskQuotaController>> {
        let removed = self.controllers.write().remove(&stream_id);
        if removed.is_some() {
            info!("event=quota_deregister stream_id={}", stream_id);
        }
        removed
    }

    pub fn get(&self, stream_id: u64) -> Option<Arc<DiskQuotaController>> {
        self.controllers.read().get(&stream_id).cloned()
    }

    pub fn update_options(&self, stream_id: u64, options: DiskOptions) -> LogResult<()> {
        let controller = self.get(stream_id).ok_or(LogError::EntryNotExist)?;
        controller.update_options(options)
    }

    pub fn snapshots(&self) -> Vec<QuotaSnapshot> {
        let mut snapshots: Vec<_> = self
            .controllers
            .read()
            .values()
            .map(|controller| controller.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.stream_id);
        snapshots
    }

    pub fn len(&self) -> usize {
        self.controllers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
