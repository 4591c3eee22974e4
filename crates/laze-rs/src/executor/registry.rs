//! Per-device registry of live tensors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::backend::spec::DeviceBackend;
use crate::device::Device;
use crate::metrics;
use crate::tensor::TensorData;

/// Tracks every tensor with (potential) pending work, keyed by device and
/// stable tensor id.
///
/// Entries are weak: the registry never extends a tensor's lifetime, and a
/// payload dropped while registered simply leaves a dead entry that the next
/// snapshot prunes.
pub(crate) struct LiveTensorRegistry<B: DeviceBackend + 'static> {
    devices: Mutex<HashMap<Device, HashMap<u64, Weak<TensorData<B>>>>>,
}

impl<B: DeviceBackend + 'static> LiveTensorRegistry<B> {
    pub(crate) fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `data` under its device and id. Idempotent: re-registering an
    /// already-tracked tensor overwrites the same slot.
    pub(crate) fn register(&self, data: &Arc<TensorData<B>>) {
        let mut devices = self.devices.lock().expect("live tensor registry poisoned");
        let entries = devices.entry(data.device()).or_default();
        if entries.insert(data.id(), Arc::downgrade(data)).is_none() {
            metrics::inc("tensor.registered");
        }
    }

    /// Removes the entry if present; a no-op for unknown ids.
    pub(crate) fn unregister(&self, device: Device, id: u64) -> bool {
        let mut devices = self.devices.lock().expect("live tensor registry poisoned");
        let removed = devices
            .get_mut(&device)
            .map_or(false, |entries| entries.remove(&id).is_some());
        if removed {
            metrics::inc("tensor.unregistered");
        }
        removed
    }

    /// Upgrades the live entries for one device (or all devices), pruning
    /// dead references in passing. Results are ordered by tensor id so steps
    /// lower deterministically.
    pub(crate) fn snapshot(&self, device: Option<&Device>) -> Vec<Arc<TensorData<B>>> {
        let mut devices = self.devices.lock().expect("live tensor registry poisoned");
        let mut live = Vec::new();
        match device {
            Some(device) => {
                if let Some(entries) = devices.get_mut(device) {
                    collect_live(entries, &mut live);
                }
            }
            None => {
                for entries in devices.values_mut() {
                    collect_live(entries, &mut live);
                }
            }
        }
        live.sort_by_key(|data| data.id());
        live
    }
}

fn collect_live<B: DeviceBackend + 'static>(
    entries: &mut HashMap<u64, Weak<TensorData<B>>>,
    live: &mut Vec<Arc<TensorData<B>>>,
) {
    entries.retain(|_, weak| match weak.upgrade() {
        Some(data) => {
            live.push(data);
            true
        }
        None => false,
    });
}
