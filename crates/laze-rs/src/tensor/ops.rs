//! Elementwise math helpers on lazy tensors.
//!
//! Every helper validates operand agreement up front, records a single graph
//! node, and returns a registered pending tensor. Validation failures surface
//! before any node is allocated, so a rejected op leaves no trace in the
//! graph.

use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::backend::spec::{BinaryOp, DeviceBackend, UnaryOp};
use crate::ir::Value;
use crate::tensor::lazy::LazyTensor;

/// Extension trait exposing ergonomic math helpers on lazy tensors.
pub trait LazyTensorOps<B: DeviceBackend + 'static>: Sized {
    /// Elementwise addition recording a deferred graph node.
    fn add(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise subtraction.
    fn sub(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise multiplication.
    fn mul(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise division.
    fn div(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise maximum of two tensors.
    fn maximum(&self, rhs: &Self) -> Result<Self>;
    /// Unary negation.
    fn neg(&self) -> Result<Self>;
    /// Elementwise exponential.
    fn exp(&self) -> Result<Self>;
}

impl<B: DeviceBackend + 'static> LazyTensorOps<B> for LazyTensor<B> {
    fn add(&self, rhs: &Self) -> Result<Self> {
        binary_op("add", BinaryOp::Add, self, rhs)
    }

    fn sub(&self, rhs: &Self) -> Result<Self> {
        binary_op("sub", BinaryOp::Sub, self, rhs)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        binary_op("mul", BinaryOp::Mul, self, rhs)
    }

    fn div(&self, rhs: &Self) -> Result<Self> {
        binary_op("div", BinaryOp::Div, self, rhs)
    }

    fn maximum(&self, rhs: &Self) -> Result<Self> {
        binary_op("maximum", BinaryOp::Maximum, self, rhs)
    }

    fn neg(&self) -> Result<Self> {
        unary_op("neg", UnaryOp::Neg, self)
    }

    fn exp(&self) -> Result<Self> {
        unary_op("exp", UnaryOp::Exp, self)
    }
}

fn binary_op<B: DeviceBackend + 'static>(
    name: &'static str,
    op: BinaryOp,
    lhs: &LazyTensor<B>,
    rhs: &LazyTensor<B>,
) -> Result<LazyTensor<B>> {
    ensure_same_executor(name, lhs, rhs)?;
    ensure_same_device(name, lhs, rhs)?;
    ensure_same_dtype(name, lhs, rhs)?;
    ensure_same_shape(name, lhs, rhs)?;
    ensure_float(name, lhs)?;
    let value = Value::binary(
        op,
        &lhs.data().ir_value_for_operand(),
        &rhs.data().ir_value_for_operand(),
    );
    Ok(LazyTensor::from_pending(
        lhs.executor(),
        lhs.device(),
        lhs.spec().clone(),
        value,
    ))
}

fn unary_op<B: DeviceBackend + 'static>(
    name: &'static str,
    op: UnaryOp,
    input: &LazyTensor<B>,
) -> Result<LazyTensor<B>> {
    ensure_float(name, input)?;
    let value = Value::unary(op, &input.data().ir_value_for_operand());
    Ok(LazyTensor::from_pending(
        input.executor(),
        input.device(),
        input.spec().clone(),
        value,
    ))
}

fn ensure_same_executor<B: DeviceBackend + 'static>(
    name: &str,
    lhs: &LazyTensor<B>,
    rhs: &LazyTensor<B>,
) -> Result<()> {
    ensure!(
        Arc::ptr_eq(lhs.executor(), rhs.executor()),
        "{name} operands belong to different executors"
    );
    Ok(())
}

fn ensure_same_device<B: DeviceBackend + 'static>(
    name: &str,
    lhs: &LazyTensor<B>,
    rhs: &LazyTensor<B>,
) -> Result<()> {
    ensure!(
        lhs.device() == rhs.device(),
        "{name} operands live on different devices ({} vs {})",
        lhs.device(),
        rhs.device()
    );
    Ok(())
}

fn ensure_same_dtype<B: DeviceBackend + 'static>(
    name: &str,
    lhs: &LazyTensor<B>,
    rhs: &LazyTensor<B>,
) -> Result<()> {
    ensure!(
        lhs.spec().dtype == rhs.spec().dtype,
        "{name} operand dtypes differ ({} vs {})",
        lhs.spec().dtype.name(),
        rhs.spec().dtype.name()
    );
    Ok(())
}

fn ensure_same_shape<B: DeviceBackend + 'static>(
    name: &str,
    lhs: &LazyTensor<B>,
    rhs: &LazyTensor<B>,
) -> Result<()> {
    ensure!(
        lhs.spec().shape == rhs.spec().shape,
        "{name} operand shapes differ ({} vs {})",
        lhs.spec(),
        rhs.spec()
    );
    Ok(())
}

fn ensure_float<B: DeviceBackend + 'static>(name: &str, tensor: &LazyTensor<B>) -> Result<()> {
    ensure!(
        tensor.spec().dtype.is_float(),
        "{name} requires a float tensor, got {}",
        tensor.spec().dtype.name()
    );
    Ok(())
}
