//! Portable step-program format and the backend execution contract.
//!
//! `mark_step` lowers pending graph nodes into a [`Program`]: a flat SSA
//! function whose parameters are device-resident inputs and whose body is the
//! deduplicated instruction list for one synchronization step. Backends
//! implement [`DeviceBackend`] to materialize host literals and evaluate step
//! programs; everything in this module is backend-neutral.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;

/// Frozen program format version enforced by this interface.
pub const PROGRAM_VERSION: &str = "laze.v0.1";

fn default_program_version() -> String {
    PROGRAM_VERSION.to_string()
}

/// Scalar element types supported by the step-program contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    Ui64,
}

impl DType {
    /// Returns the storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Ui64 => 8,
        }
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::Ui64 => "ui64",
        }
    }
}

/// Logical tensor shape as an ordered list of static extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Rank-zero shape used for scalars such as rng seeds.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the total element count, or `None` when it overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim)?;
        }
        Some(count)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Shape::scalar())
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Returns the total byte length, or `None` when it overflows `usize`.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype.name())?;
        for (index, dim) in self.shape.dims().iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Dense literal tensor payload in little-endian element order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    /// Builds an `f32` literal, validating the element count against `dims`.
    pub fn from_f32(dims: impl Into<Vec<usize>>, values: &[f32]) -> BackendResult<Self> {
        let shape = Shape::new(dims);
        let expected = shape
            .element_count()
            .ok_or_else(|| BackendError::spec("literal element count overflows usize"))?;
        if expected != values.len() {
            return Err(BackendError::spec(format!(
                "literal expects {} elements, got {}",
                expected,
                values.len()
            )));
        }
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Ok(Self::new(
            TensorSpec::new(DType::F32, shape),
            Arc::from(bytes),
        ))
    }

    /// Builds the rank-zero `ui64` literal used for rng seed inputs.
    pub fn scalar_u64(value: u64) -> Self {
        Self::new(
            TensorSpec::scalar(DType::Ui64),
            Arc::from(value.to_le_bytes().to_vec()),
        )
    }

    /// Checks that the payload length matches what the spec promises.
    fn check_byte_len(&self) -> BackendResult<()> {
        let expected = self
            .spec
            .byte_len()
            .ok_or_else(|| BackendError::spec("literal byte length overflows usize"))?;
        if self.bytes.len() != expected {
            return Err(BackendError::spec(format!(
                "literal for {} has {} bytes, expected {}",
                self.spec,
                self.bytes.len(),
                expected
            )));
        }
        Ok(())
    }

    pub fn to_f32_vec(&self) -> BackendResult<Vec<f32>> {
        if self.spec.dtype != DType::F32 {
            return Err(BackendError::spec(format!(
                "literal dtype {} is not f32",
                self.spec.dtype.name()
            )));
        }
        self.check_byte_len()?;
        let mut values = Vec::with_capacity(self.bytes.len() / 4);
        for chunk in self.bytes.chunks_exact(4) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            values.push(f32::from_le_bytes(buf));
        }
        Ok(values)
    }

    pub fn to_u64_vec(&self) -> BackendResult<Vec<u64>> {
        if self.spec.dtype != DType::Ui64 {
            return Err(BackendError::spec(format!(
                "literal dtype {} is not ui64",
                self.spec.dtype.name()
            )));
        }
        self.check_byte_len()?;
        let mut values = Vec::with_capacity(self.bytes.len() / 8);
        for chunk in self.bytes.chunks_exact(8) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            values.push(u64::from_le_bytes(buf));
        }
        Ok(values)
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Initialization payload when materializing tensors on a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TensorInit {
    Literal(TensorLiteral),
    Zeroed(TensorSpec),
}

/// Elementwise unary ops in the step-program op set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Exp,
}

/// Elementwise binary ops in the step-program op set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
}

/// Unique identifier for SSA values in a step program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Declarative form of step-program operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    Unary(UnaryOp),
    Binary(BinaryOp),
    RngUniform,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::Unary(UnaryOp::Neg) => "neg",
            Operation::Unary(UnaryOp::Exp) => "exp",
            Operation::Binary(BinaryOp::Add) => "add",
            Operation::Binary(BinaryOp::Sub) => "sub",
            Operation::Binary(BinaryOp::Mul) => "mul",
            Operation::Binary(BinaryOp::Div) => "div",
            Operation::Binary(BinaryOp::Maximum) => "maximum",
            Operation::RngUniform => "rng_uniform",
        }
    }
}

/// Single SSA instruction in a step program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub spec: TensorSpec,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{} = {}(", self.id.0, self.op.name())?;
        for (index, operand) in self.operands.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}", operand.0)?;
        }
        write!(f, ") : {}", self.spec)
    }
}

/// Step function describing one synchronization boundary's computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    pub results: Vec<TensorSpec>,
    pub result_ids: Vec<ValueId>,
}

/// Complete step program with a single entry function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_program_version")]
    pub version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramFormatError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            version: PROGRAM_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramFormatError> {
        serde_json::to_string_pretty(self).map_err(ProgramFormatError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramFormatError> {
        let mut program: Program = serde_json::from_str(src).map_err(ProgramFormatError::from)?;
        program.version = normalize_program_version(program.version)?;
        Ok(program)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_program_version(version: String) -> Result<String, ProgramFormatError> {
    if version.is_empty() {
        return Ok(PROGRAM_VERSION.to_string());
    }
    if version == PROGRAM_VERSION {
        Ok(version)
    } else {
        Err(ProgramFormatError::VersionMismatch {
            found: version,
            expected: PROGRAM_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!("program @{} (version = {}) {{", self.entry, self.version),
        )?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, spec) in function.parameter_ids.iter().zip(function.parameters.iter()) {
            write_line(f, indent + 2, &format!("%{} : {}", value_id.0, spec))?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            write_line(f, indent + 2, &instruction.to_string())?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, spec) in function.result_ids.iter().zip(function.results.iter()) {
            write_line(f, indent + 2, &format!("%{} : {}", value_id.0, spec))?;
        }
    }
    write_line(f, indent, "}")
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        write!(f, "  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing step functions programmatically.
#[derive(Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, TensorSpec)>,
    instructions: Vec<Instruction>,
    specs: HashMap<ValueId, TensorSpec>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.specs.insert(id, spec.clone());
        self.parameters.push((id, spec));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<ValueId>, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.specs.insert(id, spec.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            spec,
        });
        id
    }

    pub fn spec_of(&self, id: ValueId) -> Option<&TensorSpec> {
        self.specs.get(&id)
    }

    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> Function {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self
                .specs
                .get(id)
                .expect("result value id must have a recorded spec")
                .clone();
            results.push(spec);
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Function {
            name: name.into(),
            parameters,
            parameter_ids,
            body: self.instructions,
            results,
            result_ids,
        }
    }
}

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    SpecViolation { message: String },
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn spec(message: impl Into<String>) -> Self {
        BackendError::SpecViolation {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation { message } => write!(f, "spec violation: {message}"),
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Device backend trait that materializes tensors and evaluates step programs.
///
/// Implementations must be all-or-nothing: a successful `run_program` returns
/// exactly one handle per program result in order, and a failing one returns
/// an error without materializing anything.
pub trait DeviceBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu-ref"`).
    fn backend_name(&self) -> &str;

    /// Materializes a tensor handle on `device` from host initialization data.
    fn materialize(&self, device: &Device, init: TensorInit) -> BackendResult<Self::TensorHandle>;

    /// Reads back a tensor handle into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes a step program on `device`, one entry input per parameter.
    fn run_program(
        &self,
        device: &Device,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_literals_with_overflowing_shapes() {
        assert_eq!(Shape::new(vec![usize::MAX, 2]).element_count(), None);
        assert_eq!(
            TensorSpec::new(DType::Ui64, Shape::new(vec![usize::MAX / 4])).byte_len(),
            None
        );

        let err = TensorLiteral::from_f32(vec![usize::MAX, 2], &[])
            .err()
            .expect("overflowing dims must fail validation");
        assert!(
            err.to_string().contains("overflows usize"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_literals_whose_bytes_disagree_with_their_spec() {
        let literal = TensorLiteral::new(
            TensorSpec::new(DType::F32, Shape::new(vec![3])),
            Arc::from(vec![0u8; 8]),
        );
        let err = literal
            .to_f32_vec()
            .err()
            .expect("short payload must fail read-back");
        assert!(
            err.to_string().contains("has 8 bytes, expected 12"),
            "unexpected error: {err}"
        );
    }
}
