//! Graph node representation for deferred tensor operations.
//!
//! Recording an op allocates an immutable [`Node`] that points at its operand
//! nodes through shared ownership, so the pending work of a device forms a DAG
//! that stays alive exactly as long as some tensor (or another node) refers to
//! it. Node identity is a process-unique [`NodeId`]; step lowering relies on
//! it to emit every shared subexpression once.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::backend::spec::{BinaryOp, DType, TensorLiteral, TensorSpec, UnaryOp};

static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    fn next() -> Self {
        NodeId(NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Device-resident operand embedded in the graph.
///
/// The handle is type-erased so the IR stays independent of any one backend;
/// lowering downcasts it back to the executing backend's handle type.
#[derive(Clone)]
pub struct BackingData {
    pub origin: u64,
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for BackingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingData")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Operations a graph node can record.
#[derive(Debug, Clone)]
pub enum NodeOp {
    /// Already-materialized tensor flowing into pending work.
    DeviceData(BackingData),
    /// Host literal folded into the step program.
    Constant(TensorLiteral),
    /// Rng seed embedding; lowered as a program input so structurally equal
    /// steps share one cached program across seed changes.
    Seed(u64),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Uniform sample in `[0, 1)`; first operand is the seed node.
    RngUniform,
}

struct Node {
    id: NodeId,
    op: NodeOp,
    operands: SmallVec<[Value; 2]>,
    spec: TensorSpec,
}

/// Shared reference to a graph node.
#[derive(Clone)]
pub struct Value(Arc<Node>);

impl Value {
    fn alloc(op: NodeOp, operands: SmallVec<[Value; 2]>, spec: TensorSpec) -> Self {
        Value(Arc::new(Node {
            id: NodeId::next(),
            op,
            operands,
            spec,
        }))
    }

    pub fn device_data(origin: u64, handle: Arc<dyn Any + Send + Sync>, spec: TensorSpec) -> Self {
        Self::alloc(
            NodeOp::DeviceData(BackingData { origin, handle }),
            SmallVec::new(),
            spec,
        )
    }

    pub fn constant(literal: TensorLiteral) -> Self {
        let spec = literal.spec.clone();
        Self::alloc(NodeOp::Constant(literal), SmallVec::new(), spec)
    }

    pub fn seed(seed: u64) -> Self {
        Self::alloc(NodeOp::Seed(seed), SmallVec::new(), TensorSpec::scalar(DType::Ui64))
    }

    pub fn unary(op: UnaryOp, input: &Value) -> Self {
        let spec = input.spec().clone();
        Self::alloc(NodeOp::Unary(op), smallvec![input.clone()], spec)
    }

    /// Records a binary op; operand agreement is validated by the tensor layer.
    pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Self {
        let spec = lhs.spec().clone();
        Self::alloc(NodeOp::Binary(op), smallvec![lhs.clone(), rhs.clone()], spec)
    }

    pub fn rng_uniform(seed: &Value, spec: TensorSpec) -> Self {
        Self::alloc(NodeOp::RngUniform, smallvec![seed.clone()], spec)
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn op(&self) -> &NodeOp {
        &self.0.op
    }

    pub fn operands(&self) -> &[Value] {
        &self.0.operands
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.0.spec
    }

    /// Node identity comparison; two values are the same node, not merely
    /// structurally equal.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.op() {
            NodeOp::DeviceData(_) => "device_data",
            NodeOp::Constant(_) => "constant",
            NodeOp::Seed(_) => "seed",
            NodeOp::Unary(_) => "unary",
            NodeOp::Binary(_) => "binary",
            NodeOp::RngUniform => "rng_uniform",
        };
        write!(f, "{} {} : {}", self.id(), kind, self.spec())
    }
}
