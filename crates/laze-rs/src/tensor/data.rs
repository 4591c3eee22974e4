//! Shared tensor payloads tracked by the executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::spec::{DeviceBackend, TensorSpec};
use crate::device::Device;
use crate::executor::LazyGraphExecutor;
use crate::ir::{NodeId, Value};

static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_tensor_id() -> u64 {
    TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Where a tensor's contents currently live.
pub enum TensorState<B: DeviceBackend + 'static> {
    /// Graph work recorded but not yet executed.
    Pending(Value),
    /// Device handle produced by a completed step.
    Materialized(B::TensorHandle),
}

/// Shared payload behind every lazy tensor.
///
/// The executor's live registry holds these only weakly; user wrappers and
/// step snapshots hold them strongly. Dropping the last strong reference
/// best-effort unregisters the tensor through the weak executor link, which
/// keeps destruction safe to race with a concurrent step.
pub struct TensorData<B: DeviceBackend + 'static> {
    id: u64,
    device: Device,
    spec: TensorSpec,
    state: Mutex<TensorState<B>>,
    executor: Weak<LazyGraphExecutor<B>>,
}

impl<B: DeviceBackend + 'static> TensorData<B> {
    pub(crate) fn new_pending(
        executor: &Arc<LazyGraphExecutor<B>>,
        device: Device,
        spec: TensorSpec,
        value: Value,
    ) -> Arc<Self> {
        Arc::new(TensorData {
            id: next_tensor_id(),
            device,
            spec,
            state: Mutex::new(TensorState::Pending(value)),
            executor: Arc::downgrade(executor),
        })
    }

    pub(crate) fn new_materialized(
        executor: &Arc<LazyGraphExecutor<B>>,
        device: Device,
        spec: TensorSpec,
        handle: B::TensorHandle,
    ) -> Arc<Self> {
        Arc::new(TensorData {
            id: next_tensor_id(),
            device,
            spec,
            state: Mutex::new(TensorState::Materialized(handle)),
            executor: Arc::downgrade(executor),
        })
    }

    /// Stable process-unique tensor id; the registry keys on it.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            &*self.state.lock().expect("tensor state poisoned"),
            TensorState::Pending(_)
        )
    }

    /// The pending graph value, if any.
    pub fn current_value(&self) -> Option<Value> {
        match &*self.state.lock().expect("tensor state poisoned") {
            TensorState::Pending(value) => Some(value.clone()),
            TensorState::Materialized(_) => None,
        }
    }

    /// The materialized device handle, if any.
    pub fn handle(&self) -> Option<B::TensorHandle> {
        match &*self.state.lock().expect("tensor state poisoned") {
            TensorState::Pending(_) => None,
            TensorState::Materialized(handle) => Some(handle.clone()),
        }
    }

    /// Graph value to use when this tensor feeds a new op: the pending value
    /// itself, or a device-data node wrapping the materialized handle.
    pub(crate) fn ir_value_for_operand(&self) -> Value {
        match &*self.state.lock().expect("tensor state poisoned") {
            TensorState::Pending(value) => value.clone(),
            TensorState::Materialized(handle) => {
                Value::device_data(self.id, Arc::new(handle.clone()), self.spec.clone())
            }
        }
    }

    /// Binds a step result, but only when the pending value is still the one
    /// the step snapshotted. Returns `false` when a concurrent op replaced
    /// the pending work; that newer graph re-executes on a later step.
    pub(crate) fn bind_if_pending_on(&self, expected: NodeId, handle: B::TensorHandle) -> bool {
        let mut state = self.state.lock().expect("tensor state poisoned");
        match &*state {
            TensorState::Pending(value) if value.id() == expected => {
                *state = TensorState::Materialized(handle);
                true
            }
            _ => false,
        }
    }
}

impl<B: DeviceBackend + 'static> Drop for TensorData<B> {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.unregister_dropped(self.device, self.id);
        }
    }
}
