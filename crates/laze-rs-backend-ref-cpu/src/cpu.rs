use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use laze_rs::backend::spec::{
    BackendError, BackendResult, BinaryOp, DType, DeviceBackend, Instruction, Operation, Program,
    TensorInit, TensorLiteral, TensorSpec, UnaryOp, ValueId,
};
use laze_rs::device::Device;

/// Host tensor handle produced by the reference interpreter.
#[derive(Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub storage: CpuStorage,
}

#[derive(Clone)]
pub enum CpuStorage {
    F32(Arc<[f32]>),
    U64(Arc<[u64]>),
}

/// Hook consulted before every instruction executes.
///
/// Returning `Some` overrides the builtin kernel; returning `None` falls
/// through to it. Tests use this seam to count or fail individual
/// instructions.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        instruction: &Instruction,
        inputs: &[CpuTensor],
    ) -> Option<BackendResult<CpuTensor>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _instruction: &Instruction,
        _inputs: &[CpuTensor],
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self { interceptor }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuRefBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> DeviceBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-ref"
    }

    fn materialize(&self, _device: &Device, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(literal) => literal_to_tensor(&literal),
            TensorInit::Zeroed(spec) => zeroed_tensor(&spec),
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        match &tensor.storage {
            CpuStorage::F32(values) => Ok(TensorLiteral::new(
                tensor.spec.clone(),
                f32_to_bytes(values.as_ref()),
            )),
            CpuStorage::U64(values) => Ok(TensorLiteral::new(
                tensor.spec.clone(),
                u64_to_bytes(values.as_ref()),
            )),
        }
    }

    fn run_program(
        &self,
        _device: &Device,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution("entry input arity mismatch"));
        }

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for (param_id, handle) in function.parameter_ids.iter().zip(entry_inputs.iter()) {
            values.insert(*param_id, handle.clone());
        }

        for (instr_index, instruction) in function.body.iter().enumerate() {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = values
                    .get(operand)
                    .cloned()
                    .ok_or_else(|| BackendError::execution("operand value missing"))?;
                inputs.push(tensor);
            }
            let output = execute_instruction(self.interceptor.as_ref(), instruction, &inputs)
                .map_err(|err| augment_error(err, &function.name, instr_index, instruction))?;
            values.insert(instruction.id, output);
        }

        let mut results = Vec::with_capacity(function.result_ids.len());
        for id in &function.result_ids {
            let value = values
                .get(id)
                .cloned()
                .ok_or_else(|| BackendError::execution("missing function result value"))?;
            results.push(value);
        }
        Ok(results)
    }
}

fn execute_instruction(
    interceptor: &dyn CpuKernelInterceptor,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendResult<CpuTensor> {
    if let Some(result) = interceptor.try_execute(instruction, inputs) {
        return result;
    }

    match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::Unary(op) => op_unary(inputs, &instruction.spec, *op),
        Operation::Binary(op) => op_binary(inputs, &instruction.spec, *op),
        Operation::RngUniform => op_rng_uniform(inputs, &instruction.spec),
    }
}

fn augment_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
) -> BackendError {
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!(
                "{message} (at function `{function_name}` instruction #{instruction_index}: {instruction})"
            ),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!(
                "{reason} (at function `{function_name}` instruction #{instruction_index}: {instruction})"
            ),
        },
        other => other,
    }
}

fn op_unary(inputs: &[CpuTensor], output: &TensorSpec, op: UnaryOp) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = expect_f32(input)?;
    let result: Vec<f32> = match op {
        UnaryOp::Neg => values.iter().map(|&x| -x).collect(),
        UnaryOp::Exp => values.iter().map(|&x| x.exp()).collect(),
    };
    Ok(CpuTensor {
        spec: output.clone(),
        storage: CpuStorage::F32(Arc::from(result)),
    })
}

fn op_binary(inputs: &[CpuTensor], output: &TensorSpec, op: BinaryOp) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    let a = expect_f32(lhs)?;
    let b = expect_f32(rhs)?;
    if a.len() != b.len() {
        return Err(BackendError::spec(format!(
            "binary operand lengths differ ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    let mut result = Vec::with_capacity(a.len());
    for (x, y) in a.iter().zip(b.iter()) {
        let value = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Maximum => x.max(*y),
        };
        result.push(value);
    }
    Ok(CpuTensor {
        spec: output.clone(),
        storage: CpuStorage::F32(Arc::from(result)),
    })
}

fn op_rng_uniform(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let seed_tensor = expect_single(inputs)?;
    let seed = match &seed_tensor.storage {
        CpuStorage::U64(values) if values.len() == 1 => values[0],
        _ => {
            return Err(BackendError::spec(
                "rng_uniform expects a scalar ui64 seed operand",
            ))
        }
    };
    if output.dtype != DType::F32 {
        return Err(BackendError::spec("rng_uniform output must be f32"));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut result = vec![0.0f32; element_count(output)?];
    for value in result.iter_mut() {
        *value = rng.gen::<f32>();
    }
    Ok(CpuTensor {
        spec: output.clone(),
        storage: CpuStorage::F32(Arc::from(result)),
    })
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    match literal.spec.dtype {
        DType::F32 => Ok(CpuTensor {
            spec: literal.spec.clone(),
            storage: CpuStorage::F32(Arc::from(literal.to_f32_vec()?)),
        }),
        DType::Ui64 => Ok(CpuTensor {
            spec: literal.spec.clone(),
            storage: CpuStorage::U64(Arc::from(literal.to_u64_vec()?)),
        }),
    }
}

fn zeroed_tensor(spec: &TensorSpec) -> BackendResult<CpuTensor> {
    let elem_count = element_count(spec)?;
    match spec.dtype {
        DType::F32 => Ok(CpuTensor {
            spec: spec.clone(),
            storage: CpuStorage::F32(Arc::from(vec![0.0; elem_count])),
        }),
        DType::Ui64 => Ok(CpuTensor {
            spec: spec.clone(),
            storage: CpuStorage::U64(Arc::from(vec![0; elem_count])),
        }),
    }
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [input] => Ok(input),
        _ => Err(BackendError::execution(format!(
            "expected one operand, got {}",
            inputs.len()
        ))),
    }
}

fn expect_pair(inputs: &[CpuTensor]) -> BackendResult<(&CpuTensor, &CpuTensor)> {
    match inputs {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(BackendError::execution(format!(
            "expected two operands, got {}",
            inputs.len()
        ))),
    }
}

fn expect_f32(tensor: &CpuTensor) -> BackendResult<&[f32]> {
    match &tensor.storage {
        CpuStorage::F32(values) => Ok(values.as_ref()),
        CpuStorage::U64(_) => Err(BackendError::execution("operand is not an f32 tensor")),
    }
}

fn element_count(spec: &TensorSpec) -> BackendResult<usize> {
    spec.element_count()
        .ok_or_else(|| BackendError::spec(format!("element count of {spec} overflows usize")))
}

fn f32_to_bytes(values: &[f32]) -> Arc<[u8]> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Arc::from(bytes.into_boxed_slice())
}

fn u64_to_bytes(values: &[u64]) -> Arc<[u8]> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Arc::from(bytes.into_boxed_slice())
}
