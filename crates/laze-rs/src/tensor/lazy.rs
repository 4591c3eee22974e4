//! User-facing lazy tensor wrapper.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::backend::spec::{DType, DeviceBackend, Shape, TensorInit, TensorLiteral, TensorSpec};
use crate::device::Device;
use crate::executor::LazyGraphExecutor;
use crate::ir::Value;
use crate::tensor::data::TensorData;

/// A tensor whose computation may still be deferred in the executor's graph.
///
/// Wrappers pair the shared payload with the executor it belongs to, so ops
/// can record nodes and register results without any process-global state.
/// Cloning shares the payload; the clone observes the same materialization.
pub struct LazyTensor<B: DeviceBackend + 'static> {
    data: Arc<TensorData<B>>,
    executor: Arc<LazyGraphExecutor<B>>,
}

impl<B: DeviceBackend + 'static> Clone for LazyTensor<B> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<B: DeviceBackend + 'static> LazyTensor<B> {
    /// Uploads a host literal to `device` eagerly. The result carries no
    /// pending graph work and is therefore not registered.
    pub fn from_literal(
        executor: &Arc<LazyGraphExecutor<B>>,
        device: Device,
        literal: TensorLiteral,
    ) -> Result<Self> {
        let spec = literal.spec.clone();
        let handle = executor
            .backend()
            .materialize(&device, TensorInit::Literal(literal))?;
        Ok(Self {
            data: TensorData::new_materialized(executor, device, spec, handle),
            executor: Arc::clone(executor),
        })
    }

    /// Materializes an all-zero `f32` tensor on `device`.
    pub fn zeros(
        executor: &Arc<LazyGraphExecutor<B>>,
        device: Device,
        dims: impl Into<Vec<usize>>,
    ) -> Result<Self> {
        let spec = TensorSpec::new(DType::F32, Shape::new(dims));
        let handle = executor
            .backend()
            .materialize(&device, TensorInit::Zeroed(spec.clone()))?;
        Ok(Self {
            data: TensorData::new_materialized(executor, device, spec, handle),
            executor: Arc::clone(executor),
        })
    }

    /// Records a uniform `[0, 1)` sample of the given shape, seeded by the
    /// device's current seed node. Pending until the next `mark_step`.
    pub fn rng_uniform(
        executor: &Arc<LazyGraphExecutor<B>>,
        device: Device,
        dims: impl Into<Vec<usize>>,
    ) -> Self {
        let spec = TensorSpec::new(DType::F32, Shape::new(dims));
        let seed = executor.get_rng_seed(&device);
        let value = Value::rng_uniform(&seed, spec.clone());
        Self::from_pending(executor, device, spec, value)
    }

    /// Wraps freshly recorded graph work and registers it as live.
    pub(crate) fn from_pending(
        executor: &Arc<LazyGraphExecutor<B>>,
        device: Device,
        spec: TensorSpec,
        value: Value,
    ) -> Self {
        let data = TensorData::new_pending(executor, device, spec, value);
        executor.register_tensor(&data);
        Self {
            data,
            executor: Arc::clone(executor),
        }
    }

    pub(crate) fn from_parts(
        data: Arc<TensorData<B>>,
        executor: Arc<LazyGraphExecutor<B>>,
    ) -> Self {
        Self { data, executor }
    }

    pub fn data(&self) -> &Arc<TensorData<B>> {
        &self.data
    }

    pub fn executor(&self) -> &Arc<LazyGraphExecutor<B>> {
        &self.executor
    }

    pub fn id(&self) -> u64 {
        self.data.id()
    }

    pub fn device(&self) -> Device {
        self.data.device()
    }

    pub fn spec(&self) -> &TensorSpec {
        self.data.spec()
    }

    pub fn is_pending(&self) -> bool {
        self.data.is_pending()
    }

    /// Reads the materialized contents back to the host. Pending tensors must
    /// be synchronized with `mark_step` first.
    pub fn to_literal(&self) -> Result<TensorLiteral> {
        let handle = self.data.handle().ok_or_else(|| {
            anyhow!(
                "tensor {} on {} has pending graph work; synchronize with mark_step first",
                self.data.id(),
                self.data.device()
            )
        })?;
        Ok(self.executor.backend().to_literal(&handle)?)
    }
}
