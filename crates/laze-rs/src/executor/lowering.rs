//! Lowers pending graph values into portable step programs.
//!
//! A step plan is built in one deterministic post-order walk over the merged
//! DAG of every pending root. Each node is visited exactly once, so shared
//! subexpressions lower to a single instruction. Device-data and seed nodes
//! become program parameters; their canonical signature covers spec and
//! position only, which lets structurally equal steps share one cached
//! program even as input handles and seed values change.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::backend::hashing::fnv1a_hash;
use crate::backend::spec::{
    BinaryOp, DeviceBackend, Operation, Program, ProgramBuilder, TensorInit, TensorLiteral,
    TensorSpec, UnaryOp, ValueId,
};
use crate::device::Device;
use crate::ir::{NodeId, NodeOp, Value};

pub(crate) const STEP_ENTRY: &str = "step";

/// Program input collected during the walk, resolved to a backend handle just
/// before execution.
pub(crate) enum ParamRef {
    Data {
        origin: u64,
        handle: Arc<dyn Any + Send + Sync>,
    },
    Seed(u64),
}

/// Everything `mark_step` needs to execute one synchronization boundary.
pub(crate) struct StepPlan {
    order: Vec<Value>,
    params: Vec<ParamRef>,
    results: Vec<NodeId>,
    /// Result slot per root, parallel to the snapshot order. Roots sharing a
    /// node share a slot.
    pub(crate) result_slots: Vec<usize>,
    pub(crate) fingerprint: u64,
}

#[derive(Serialize)]
enum SigOp {
    Param,
    Constant { byte_hash: u64 },
    Unary(UnaryOp),
    Binary(BinaryOp),
    RngUniform,
}

#[derive(Serialize)]
struct SigNode<'a> {
    op: SigOp,
    operands: Vec<u32>,
    spec: &'a TensorSpec,
}

#[derive(Serialize)]
struct StepSignature<'a> {
    nodes: &'a [SigNode<'a>],
    results: &'a [u32],
}

/// Plans one step over the pending `roots`, in snapshot order.
pub(crate) fn plan_step(roots: &[Value]) -> Result<StepPlan> {
    let order = postorder(roots);

    let mut canon: HashMap<NodeId, u32> = HashMap::new();
    let mut params = Vec::new();
    let mut nodes = Vec::with_capacity(order.len());
    for (index, value) in order.iter().enumerate() {
        canon.insert(value.id(), index as u32);
        let op = match value.op() {
            NodeOp::DeviceData(backing) => {
                params.push(ParamRef::Data {
                    origin: backing.origin,
                    handle: Arc::clone(&backing.handle),
                });
                SigOp::Param
            }
            NodeOp::Seed(seed) => {
                params.push(ParamRef::Seed(*seed));
                SigOp::Param
            }
            NodeOp::Constant(literal) => SigOp::Constant {
                byte_hash: fnv1a_hash(literal.bytes.as_ref()),
            },
            NodeOp::Unary(op) => SigOp::Unary(*op),
            NodeOp::Binary(op) => SigOp::Binary(*op),
            NodeOp::RngUniform => SigOp::RngUniform,
        };
        let mut operands = Vec::with_capacity(value.operands().len());
        for operand in value.operands() {
            operands.push(
                *canon
                    .get(&operand.id())
                    .ok_or_else(|| anyhow!("graph operand visited out of post-order"))?,
            );
        }
        nodes.push(SigNode {
            op,
            operands,
            spec: value.spec(),
        });
    }

    let mut result_index: HashMap<NodeId, usize> = HashMap::new();
    let mut results = Vec::new();
    let mut result_slots = Vec::with_capacity(roots.len());
    for root in roots {
        let id = root.id();
        let slot = match result_index.get(&id) {
            Some(slot) => *slot,
            None => {
                let slot = results.len();
                result_index.insert(id, slot);
                results.push(id);
                slot
            }
        };
        result_slots.push(slot);
    }

    let mut canon_results = Vec::with_capacity(results.len());
    for id in &results {
        canon_results.push(
            *canon
                .get(id)
                .ok_or_else(|| anyhow!("step root missing from lowering order"))?,
        );
    }

    let signature = StepSignature {
        nodes: &nodes,
        results: &canon_results,
    };
    let fingerprint = fnv1a_hash(&bincode::serialize(&signature)?);

    Ok(StepPlan {
        order,
        params,
        results,
        result_slots,
        fingerprint,
    })
}

impl StepPlan {
    pub(crate) fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Builds the step program; called on cache misses only.
    pub(crate) fn build_program(&self) -> Result<Program> {
        let mut builder = ProgramBuilder::new();
        let mut ids: HashMap<NodeId, ValueId> = HashMap::new();
        for value in &self.order {
            let id = match value.op() {
                NodeOp::DeviceData(_) | NodeOp::Seed(_) => {
                    builder.add_parameter(value.spec().clone())
                }
                NodeOp::Constant(literal) => builder.emit(
                    Operation::Constant(literal.clone()),
                    Vec::new(),
                    value.spec().clone(),
                ),
                NodeOp::Unary(op) => {
                    let operands = operand_ids(&ids, value)?;
                    builder.emit(Operation::Unary(*op), operands, value.spec().clone())
                }
                NodeOp::Binary(op) => {
                    let operands = operand_ids(&ids, value)?;
                    builder.emit(Operation::Binary(*op), operands, value.spec().clone())
                }
                NodeOp::RngUniform => {
                    let operands = operand_ids(&ids, value)?;
                    builder.emit(Operation::RngUniform, operands, value.spec().clone())
                }
            };
            ids.insert(value.id(), id);
        }
        let mut result_ids = Vec::with_capacity(self.results.len());
        for node in &self.results {
            result_ids.push(
                *ids.get(node)
                    .ok_or_else(|| anyhow!("step result was not lowered"))?,
            );
        }
        let function = builder.finish(STEP_ENTRY, result_ids);
        Ok(Program::new(STEP_ENTRY).with_functions(vec![function]))
    }

    /// Resolves the collected parameters against the executing backend, in
    /// program parameter order.
    pub(crate) fn collect_entry_inputs<B: DeviceBackend>(
        &self,
        backend: &B,
        device: &Device,
    ) -> Result<Vec<B::TensorHandle>> {
        let mut inputs = Vec::with_capacity(self.params.len());
        for param in &self.params {
            match param {
                ParamRef::Data { origin, handle } => {
                    let handle = handle.downcast_ref::<B::TensorHandle>().ok_or_else(|| {
                        anyhow!(
                            "device data for tensor {origin} does not belong to backend {}",
                            backend.backend_name()
                        )
                    })?;
                    inputs.push(handle.clone());
                }
                ParamRef::Seed(seed) => {
                    let literal = TensorLiteral::scalar_u64(*seed);
                    inputs.push(backend.materialize(device, TensorInit::Literal(literal))?);
                }
            }
        }
        Ok(inputs)
    }
}

fn operand_ids(ids: &HashMap<NodeId, ValueId>, value: &Value) -> Result<Vec<ValueId>> {
    let mut operands = Vec::with_capacity(value.operands().len());
    for operand in value.operands() {
        operands.push(
            *ids.get(&operand.id())
                .ok_or_else(|| anyhow!("graph operand emitted out of post-order"))?,
        );
    }
    Ok(operands)
}

fn postorder(roots: &[Value]) -> Vec<Value> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Value, bool)> = roots
        .iter()
        .rev()
        .map(|value| (value.clone(), false))
        .collect();
    while let Some((value, expanded)) = stack.pop() {
        if expanded {
            order.push(value);
            continue;
        }
        if !seen.insert(value.id()) {
            continue;
        }
        stack.push((value.clone(), true));
        for operand in value.operands().iter().rev() {
            stack.push((operand.clone(), false));
        }
    }
    order
}
