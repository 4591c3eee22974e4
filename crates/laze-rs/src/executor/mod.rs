//! The lazy graph executor: live-tensor tracking, rng seed state, and step
//! synchronization on top of a single backend instance.
//!
//! ## Architecture
//!
//! ```text
//! LazyTensor
//!      |
//!      | contains Arc<LazyGraphExecutor>
//!      v
//! LazyGraphExecutor
//!      |
//!      +-- LiveTensorRegistry (weak refs to pending tensors, per device)
//!      |
//!      +-- RngSeedStore (seed integer + seed node, per device)
//!      |
//!      +-- StepCache (lowered step programs, keyed by structure)
//!      |
//!      +-- Backend (program execution)
//! ```
//!
//! ## Lazy Execution Model
//!
//! 1. **Record**: tensor ops append IR nodes; the resulting tensor registers
//!    as live on its device
//! 2. **Accumulate**: registrations build up a per-device pending DAG
//! 3. **Mark step**: `mark_step(device)` snapshots the live set, lowers the
//!    merged DAG into one program (shared subexpressions emitted once), and
//!    executes it
//! 4. **Bind**: result handles are written back into the snapshot tensors,
//!    which leave the live set; the device's rng seed advances
//!
//! A failing step materializes nothing: tensors, registry, and seed state are
//! left exactly as they were, so the caller can retry.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc, Mutex,
};
use std::time::{Instant, SystemTime};

use anyhow::{anyhow, Result};

use crate::backend::spec::{DeviceBackend, Program};
use crate::device::Device;
use crate::ir::Value;
use crate::metrics;
use crate::tensor::{LazyTensor, TensorData};
use crate::trace::{self, CacheOutcome, StepContext, StepStats, StepStatus};

mod lowering;
mod registry;
mod rng;
mod step_cache;

pub use step_cache::CachePolicy;

pub(crate) use step_cache::DEFAULT_STEP_CACHE_CAPACITY;

use lowering::{plan_step, StepPlan};
use registry::LiveTensorRegistry;
use rng::RngSeedStore;
use step_cache::{StepCacheState, StepKey};

static EXECUTOR_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Coordination point for all lazy tensors executing on one backend.
///
/// The executor never owns tensor payloads; it tracks them weakly and holds
/// only bookkeeping state. Constructed once and shared (`Arc`) with every
/// tensor created against it.
pub struct LazyGraphExecutor<B: DeviceBackend + 'static> {
    backend: Arc<B>,
    registry: LiveTensorRegistry<B>,
    seeds: RngSeedStore,
    step_cache: StepCacheState,
    step_locks: Mutex<HashMap<Device, Arc<Mutex<()>>>>,
    id: usize,
}

impl<B: DeviceBackend + 'static> LazyGraphExecutor<B> {
    /// Creates an executor wrapping the provided backend.
    pub fn new(backend: Arc<B>) -> Arc<Self> {
        Self::with_policy(backend, CachePolicy::default())
    }

    /// Creates an executor with the provided step-cache policy.
    pub fn with_policy(backend: Arc<B>, policy: CachePolicy) -> Arc<Self> {
        let id = EXECUTOR_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Arc::new(LazyGraphExecutor {
            backend,
            registry: LiveTensorRegistry::new(),
            seeds: RngSeedStore::new(),
            step_cache: StepCacheState::from_policy(policy),
            step_locks: Mutex::new(HashMap::new()),
            id,
        })
    }

    /// Returns the underlying backend handle.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Process-unique executor identity; step trace events carry it.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Tracks a tensor payload as live on its device. Idempotent.
    pub fn register_tensor(&self, data: &Arc<TensorData<B>>) {
        self.registry.register(data);
    }

    /// Stops tracking a tensor payload. A no-op (returning `false`) when the
    /// payload was never registered or has already been removed.
    pub fn unregister_tensor(&self, data: &TensorData<B>) -> bool {
        self.registry.unregister(data.device(), data.id())
    }

    /// Registry cleanup invoked from `TensorData::drop`.
    pub(crate) fn unregister_dropped(&self, device: Device, id: u64) {
        self.registry.unregister(device, id);
    }

    /// Snapshot of the live tensors for one device, or for all devices when
    /// `device` is `None`. Payloads already dropped are skipped.
    pub fn get_live_tensors(self: &Arc<Self>, device: Option<&Device>) -> Vec<LazyTensor<B>> {
        self.registry
            .snapshot(device)
            .into_iter()
            .map(|data| LazyTensor::from_parts(data, Arc::clone(self)))
            .collect()
    }

    /// The device's current seed node, for stochastic ops to consume as an
    /// operand. Created with the default seed on first access.
    pub fn get_rng_seed(&self, device: &Device) -> Value {
        self.seeds.seed_value(device)
    }

    /// The device's current raw seed value.
    pub fn get_running_seed(&self, device: &Device) -> u64 {
        self.seeds.running_seed(device)
    }

    /// Replaces the device's seed and regenerates its seed node. Nodes
    /// already recorded keep the seed they captured.
    pub fn set_rng_seed(&self, device: &Device, seed: u64) {
        self.seeds.set_seed(device, seed)
    }

    /// Synchronizes one device: lowers and executes its pending graph, binds
    /// the results back, and advances the rng seed.
    ///
    /// Steps are serialized per device; tensor creation on other threads
    /// proceeds concurrently and is picked up by a later step. On failure
    /// every tensor, the registry, and the seed state are left untouched.
    pub fn mark_step(&self, device: &Device) -> Result<()> {
        metrics::inc("mark_step.calls");
        let step_lock = self.step_lock(device);
        let _step = step_lock.lock().expect("step lock poisoned");

        let result = self.run_step(device);
        if result.is_err() {
            metrics::inc("mark_step.failures");
        }
        result
    }

    fn run_step(&self, device: &Device) -> Result<()> {
        let mut pending: Vec<(Arc<TensorData<B>>, Value)> = Vec::new();
        for data in self.registry.snapshot(Some(device)) {
            if let Some(value) = data.current_value() {
                pending.push((data, value));
            }
        }

        if pending.is_empty() {
            metrics::inc("mark_step.empty");
            self.seeds.advance(device);
            return Ok(());
        }

        let roots: Vec<Value> = pending.iter().map(|(_, value)| value.clone()).collect();
        let plan = plan_step(&roots)?;
        let (program, cache) = self.resolve_program(&plan)?;
        let entry_inputs = plan.collect_entry_inputs(self.backend.as_ref(), device)?;
        let outputs =
            self.execute_program(device, &plan, &program, cache, entry_inputs, pending.len())?;

        for ((data, value), slot) in pending.iter().zip(plan.result_slots.iter()) {
            // Skip tensors whose pending value was replaced since the
            // snapshot; their newer graph executes on a later step.
            if data.bind_if_pending_on(value.id(), outputs[*slot].clone()) {
                self.registry.unregister(data.device(), data.id());
            }
        }

        self.seeds.advance(device);
        Ok(())
    }

    fn resolve_program(&self, plan: &StepPlan) -> Result<(Arc<Program>, CacheOutcome)> {
        if !self.step_cache.is_enabled() {
            return Ok((Arc::new(plan.build_program()?), CacheOutcome::Bypass));
        }
        let key = StepKey {
            hash: plan.fingerprint,
        };
        if let Some(program) = self.step_cache.get(&key) {
            metrics::inc("step_cache.hit");
            return Ok((program, CacheOutcome::Hit));
        }
        metrics::inc("step_cache.miss");
        let program = Arc::new(plan.build_program()?);
        self.step_cache.insert(key, Arc::clone(&program));
        Ok((program, CacheOutcome::Miss))
    }

    fn execute_program(
        &self,
        device: &Device,
        plan: &StepPlan,
        program: &Arc<Program>,
        cache: CacheOutcome,
        entry_inputs: Vec<B::TensorHandle>,
        tensors: usize,
    ) -> Result<Vec<B::TensorHandle>> {
        let trace_sink = trace::current_sink();
        let context = StepContext {
            trace_id: trace::next_trace_id(),
            executor: self.id,
            backend: self.backend.backend_name().to_string(),
            device: *device,
            step_hash: plan.fingerprint,
            cache,
            tensors,
            timestamp: SystemTime::now(),
        };

        if let Some(ref sink) = trace_sink {
            sink.before_step(&context);
        }

        let start = Instant::now();
        match self.backend.run_program(device, program, &entry_inputs) {
            Ok(outputs) => {
                if outputs.len() != plan.result_count() {
                    let message = format!(
                        "backend returned {} results, expected {}",
                        outputs.len(),
                        plan.result_count()
                    );
                    if let Some(ref sink) = trace_sink {
                        sink.after_step(
                            &context,
                            &StepStats {
                                duration: start.elapsed(),
                                output_count: outputs.len(),
                                status: StepStatus::Failure {
                                    message: message.clone(),
                                },
                            },
                        );
                    }
                    return Err(anyhow!(message));
                }

                if let Some(ref sink) = trace_sink {
                    sink.after_step(
                        &context,
                        &StepStats {
                            duration: start.elapsed(),
                            output_count: outputs.len(),
                            status: StepStatus::Success,
                        },
                    );
                }

                Ok(outputs)
            }
            Err(err) => {
                if let Some(ref sink) = trace_sink {
                    sink.after_step(
                        &context,
                        &StepStats {
                            duration: start.elapsed(),
                            output_count: 0,
                            status: StepStatus::Failure {
                                message: err.to_string(),
                            },
                        },
                    );
                }
                Err(err.into())
            }
        }
    }

    fn step_lock(&self, device: &Device) -> Arc<Mutex<()>> {
        let mut locks = self.step_locks.lock().expect("step locks poisoned");
        Arc::clone(locks.entry(*device).or_default())
    }
}
