use std::sync::Arc;

use anyhow::Result;
use laze_rs::backend::spec::{
    BackendError, BackendResult, BinaryOp, DType, DeviceBackend, Instruction, Operation, Program,
    ProgramBuilder, Shape, TensorInit, TensorLiteral, TensorSpec, UnaryOp, ValueId,
};
use laze_rs::Device;
use laze_rs_backend_ref_cpu::{
    CpuKernelInterceptor, CpuRefBackend, CpuStorage, CpuTensor, GenericCpuBackend,
};

fn f32_spec(dims: impl Into<Vec<usize>>) -> TensorSpec {
    TensorSpec::new(DType::F32, Shape::new(dims))
}

fn upload<I: CpuKernelInterceptor>(
    backend: &GenericCpuBackend<I>,
    values: &[f32],
) -> Result<CpuTensor> {
    let literal = TensorLiteral::from_f32([values.len()], values)?;
    Ok(backend.materialize(&Device::cpu(0), TensorInit::Literal(literal))?)
}

fn read_f32<I: CpuKernelInterceptor>(
    backend: &GenericCpuBackend<I>,
    tensor: &CpuTensor,
) -> Result<Vec<f32>> {
    Ok(backend.to_literal(tensor)?.to_f32_vec()?)
}

/// Entry taking a scalar seed and producing sixteen uniform samples.
fn rng_program() -> Program {
    let mut builder = ProgramBuilder::new();
    let seed = builder.add_parameter(TensorSpec::scalar(DType::Ui64));
    let out = builder.emit(Operation::RngUniform, vec![seed], f32_spec([16]));
    let function = builder.finish("step", vec![out]);
    Program::new("step").with_functions(vec![function])
}

#[test]
fn runs_a_builder_assembled_program() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);

    let mut builder = ProgramBuilder::new();
    let a = builder.add_parameter(f32_spec([4]));
    let b = builder.add_parameter(f32_spec([4]));
    let sum = builder.emit(Operation::Binary(BinaryOp::Add), vec![a, b], f32_spec([4]));
    let out = builder.emit(Operation::Unary(UnaryOp::Neg), vec![sum], f32_spec([4]));
    let function = builder.finish("step", vec![out]);
    let program = Program::new("step").with_functions(vec![function]);

    let lhs = upload(&backend, &[1.0, 2.0, 3.0, 4.0])?;
    let rhs = upload(&backend, &[5.0, 6.0, 7.0, 8.0])?;
    let results = backend.run_program(&device, &program, &[lhs, rhs])?;

    assert_eq!(results.len(), 1);
    assert_eq!(read_f32(&backend, &results[0])?, vec![-6.0, -8.0, -10.0, -12.0]);
    Ok(())
}

#[test]
fn evaluates_the_elementwise_kernels() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);

    let binary_cases = [
        (BinaryOp::Add, vec![5.0, 2.0]),
        (BinaryOp::Sub, vec![1.0, -6.0]),
        (BinaryOp::Mul, vec![6.0, -8.0]),
        (BinaryOp::Div, vec![1.5, -0.5]),
        (BinaryOp::Maximum, vec![3.0, 4.0]),
    ];
    for (op, expected) in binary_cases {
        let mut builder = ProgramBuilder::new();
        let lhs = builder.emit(
            Operation::Constant(TensorLiteral::from_f32([2], &[3.0, -2.0])?),
            Vec::new(),
            f32_spec([2]),
        );
        let rhs = builder.emit(
            Operation::Constant(TensorLiteral::from_f32([2], &[2.0, 4.0])?),
            Vec::new(),
            f32_spec([2]),
        );
        let out = builder.emit(Operation::Binary(op), vec![lhs, rhs], f32_spec([2]));
        let function = builder.finish("step", vec![out]);
        let program = Program::new("step").with_functions(vec![function]);

        let results = backend.run_program(&device, &program, &[])?;
        assert_eq!(read_f32(&backend, &results[0])?, expected, "{op:?}");
    }

    let mut builder = ProgramBuilder::new();
    let input = builder.emit(
        Operation::Constant(TensorLiteral::from_f32([2], &[0.0, 1.0])?),
        Vec::new(),
        f32_spec([2]),
    );
    let out = builder.emit(Operation::Unary(UnaryOp::Exp), vec![input], f32_spec([2]));
    let function = builder.finish("step", vec![out]);
    let program = Program::new("step").with_functions(vec![function]);

    let results = backend.run_program(&device, &program, &[])?;
    assert_eq!(read_f32(&backend, &results[0])?, vec![1.0, 1.0f32.exp()]);
    Ok(())
}

#[test]
fn materializes_zeroed_and_scalar_seed_tensors() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);

    let zeroed = backend.materialize(&device, TensorInit::Zeroed(f32_spec([3])))?;
    assert_eq!(read_f32(&backend, &zeroed)?, vec![0.0, 0.0, 0.0]);

    let seed = backend.materialize(
        &device,
        TensorInit::Literal(TensorLiteral::scalar_u64(42)),
    )?;
    assert_eq!(seed.spec, TensorSpec::scalar(DType::Ui64));
    assert_eq!(backend.to_literal(&seed)?.to_u64_vec()?, vec![42]);
    Ok(())
}

#[test]
fn rng_uniform_is_deterministic_per_seed() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);
    let program = rng_program();

    let seed = |value: u64| -> Result<CpuTensor> {
        Ok(backend.materialize(
            &device,
            TensorInit::Literal(TensorLiteral::scalar_u64(value)),
        )?)
    };

    let first = backend.run_program(&device, &program, &[seed(7)?])?;
    let again = backend.run_program(&device, &program, &[seed(7)?])?;
    let other = backend.run_program(&device, &program, &[seed(8)?])?;

    let first = read_f32(&backend, &first[0])?;
    assert_eq!(first, read_f32(&backend, &again[0])?);
    assert_ne!(first, read_f32(&backend, &other[0])?);
    assert!(first.iter().all(|x| (0.0..1.0).contains(x)));
    Ok(())
}

#[test]
fn surfaces_typed_interpreter_errors() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);

    let empty = Program::new("step");
    let err = backend
        .run_program(&device, &empty, &[])
        .err()
        .expect("missing entry should be rejected");
    assert!(matches!(err, BackendError::Execution { .. }), "{err}");
    assert!(err.to_string().contains("entry function not found"));

    let err = backend
        .run_program(&device, &rng_program(), &[])
        .err()
        .expect("arity mismatch should be rejected");
    assert!(err.to_string().contains("entry input arity mismatch"));

    let mut builder = ProgramBuilder::new();
    let out = builder.emit(
        Operation::Unary(UnaryOp::Neg),
        vec![ValueId(9)],
        f32_spec([2]),
    );
    let function = builder.finish("step", vec![out]);
    let dangling = Program::new("step").with_functions(vec![function]);
    let err = backend
        .run_program(&device, &dangling, &[])
        .err()
        .expect("dangling operand should be rejected");
    assert!(err.to_string().contains("operand value missing"));

    let mut builder = ProgramBuilder::new();
    let seed = builder.add_parameter(TensorSpec::scalar(DType::Ui64));
    let out = builder.emit(Operation::Unary(UnaryOp::Neg), vec![seed], f32_spec([1]));
    let function = builder.finish("step", vec![out]);
    let wrong_dtype = Program::new("step").with_functions(vec![function]);
    let input = backend.materialize(
        &device,
        TensorInit::Literal(TensorLiteral::scalar_u64(1)),
    )?;
    let err = backend
        .run_program(&device, &wrong_dtype, &[input])
        .err()
        .expect("neg over ui64 should be rejected");
    let message = err.to_string();
    assert!(message.contains("operand is not an f32 tensor"), "{message}");
    assert!(message.contains("instruction #0"), "{message}");
    Ok(())
}

#[test]
fn rejects_overflowing_shapes_from_decoded_programs() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);
    let huge = TensorSpec::new(DType::F32, Shape::new(vec![usize::MAX, 2]));

    let err = backend
        .materialize(&device, TensorInit::Zeroed(huge.clone()))
        .err()
        .expect("zeroed allocation with overflowing dims should be rejected");
    assert!(matches!(err, BackendError::SpecViolation { .. }), "{err}");
    assert!(err.to_string().contains("overflows usize"), "{err}");

    let mut builder = ProgramBuilder::new();
    let seed = builder.add_parameter(TensorSpec::scalar(DType::Ui64));
    let out = builder.emit(Operation::RngUniform, vec![seed], huge);
    let function = builder.finish("step", vec![out]);
    let program = Program::new("step").with_functions(vec![function]);
    let decoded = Program::from_json_str(&program.to_json_string()?)?;

    let seed_input = backend.materialize(
        &device,
        TensorInit::Literal(TensorLiteral::scalar_u64(7)),
    )?;
    let err = backend
        .run_program(&device, &decoded, &[seed_input])
        .err()
        .expect("rng output with overflowing dims should be rejected");
    assert!(err.to_string().contains("overflows usize"), "{err}");
    Ok(())
}

struct OverrideAdd;

impl CpuKernelInterceptor for OverrideAdd {
    fn try_execute(
        &self,
        instruction: &Instruction,
        _inputs: &[CpuTensor],
    ) -> Option<BackendResult<CpuTensor>> {
        if !matches!(instruction.op, Operation::Binary(BinaryOp::Add)) {
            return None;
        }
        let count = instruction
            .spec
            .element_count()
            .expect("override output count fits in usize");
        let values = vec![0.5f32; count];
        Some(Ok(CpuTensor {
            spec: instruction.spec.clone(),
            storage: CpuStorage::F32(Arc::from(values.into_boxed_slice())),
        }))
    }
}

#[test]
fn interceptor_can_override_kernels() -> Result<()> {
    let backend = GenericCpuBackend::with_interceptor(OverrideAdd);
    let device = Device::cpu(0);

    let mut builder = ProgramBuilder::new();
    let a = builder.add_parameter(f32_spec([2]));
    let b = builder.add_parameter(f32_spec([2]));
    let sum = builder.emit(Operation::Binary(BinaryOp::Add), vec![a, b], f32_spec([2]));
    let out = builder.emit(Operation::Unary(UnaryOp::Neg), vec![sum], f32_spec([2]));
    let function = builder.finish("step", vec![out]);
    let program = Program::new("step").with_functions(vec![function]);

    let lhs = upload(&backend, &[1.0, 2.0])?;
    let rhs = upload(&backend, &[3.0, 4.0])?;
    let results = backend.run_program(&device, &program, &[lhs, rhs])?;

    assert_eq!(
        read_f32(&backend, &results[0])?,
        vec![-0.5, -0.5],
        "add is intercepted while neg still runs the builtin kernel"
    );
    Ok(())
}

#[test]
fn programs_round_trip_through_json() -> Result<()> {
    let backend = CpuRefBackend::new();
    let device = Device::cpu(0);

    let mut builder = ProgramBuilder::new();
    let input = builder.add_parameter(f32_spec([2]));
    let out = builder.emit(Operation::Unary(UnaryOp::Neg), vec![input], f32_spec([2]));
    let function = builder.finish("step", vec![out]);
    let program = Program::new("step").with_functions(vec![function]);

    let text = program.to_text();
    assert!(text.contains("func @step"), "{text}");
    assert!(text.contains("%1 = neg(%0) : f32[2]"), "{text}");

    let json = program.to_json_string()?;
    let decoded = Program::from_json_str(&json)?;
    assert_eq!(decoded, program);

    let input = upload(&backend, &[1.5, -2.5])?;
    let results = backend.run_program(&device, &decoded, &[input])?;
    assert_eq!(read_f32(&backend, &results[0])?, vec![-1.5, 2.5]);

    let tampered = json.replace("laze.v0.1", "laze.v9");
    assert!(Program::from_json_str(&tampered).is_err());
    Ok(())
}
