//! Host-side fixtures shared by the conformance suite and core integration tests.

use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use bnorm_rs::backend::spec::{
    ActivationDesc, ActivationKind, DType, Device, TensorInit, TensorLiteral, TensorSpec,
};
use bnorm_rs::ops::attributes::{names, AttributeValue};
use bnorm_rs::ops::context::KernelCreationContext;
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Dense host tensor whose values are already rounded to `spec.dtype`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub spec: TensorSpec,
    pub values: Vec<f64>,
}

impl HostTensor {
    pub fn new(dtype: DType, dims: &[usize], values: Vec<f64>) -> Self {
        let values = values.into_iter().map(|v| round_to(dtype, v)).collect();
        Self {
            spec: TensorSpec::new(dtype, dims.to_vec()),
            values,
        }
    }

    pub fn random(rng: &mut StdRng, dtype: DType, dims: &[usize], lo: f64, hi: f64) -> Self {
        let len: usize = dims.iter().product();
        let values = (0..len).map(|_| rng.gen_range(lo..hi)).collect();
        Self::new(dtype, dims, values)
    }

    pub fn filled(dtype: DType, dims: &[usize], value: f64) -> Self {
        let len: usize = dims.iter().product();
        Self::new(dtype, dims, vec![value; len])
    }

    pub fn to_literal(&self) -> anyhow::Result<TensorLiteral> {
        let mut bytes = Vec::with_capacity(self.values.len() * self.spec.dtype.size_in_bytes());
        for &value in &self.values {
            match self.spec.dtype {
                DType::F16 => bytes.extend_from_slice(&f16::from_f64(value).to_le_bytes()),
                DType::Bf16 => bytes.extend_from_slice(&bf16::from_f64(value).to_le_bytes()),
                DType::F32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
                DType::F64 => bytes.extend_from_slice(&value.to_le_bytes()),
                other => bail!("host fixtures do not encode {other}"),
            }
        }
        Ok(TensorLiteral::new(self.spec.clone(), Arc::from(bytes)))
    }
}

pub fn round_to(dtype: DType, value: f64) -> f64 {
    match dtype {
        DType::F16 => f16::from_f64(value).to_f64(),
        DType::Bf16 => bf16::from_f64(value).to_f64(),
        DType::F32 => f64::from(value as f32),
        _ => value,
    }
}

pub fn literal_values(literal: &TensorLiteral) -> anyhow::Result<Vec<f64>> {
    let width = literal.spec.dtype.size_in_bytes();
    ensure!(
        literal.bytes.len() % width == 0,
        "literal of {} bytes is not a whole number of {} values",
        literal.bytes.len(),
        literal.spec.dtype
    );
    let values = literal
        .bytes
        .chunks_exact(width)
        .map(|c| -> anyhow::Result<f64> {
            match literal.spec.dtype {
                DType::F16 => Ok(f16::from_le_bytes([c[0], c[1]]).to_f64()),
                DType::Bf16 => Ok(bf16::from_le_bytes([c[0], c[1]]).to_f64()),
                DType::F32 => Ok(f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
                DType::F64 => Ok(f64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ])),
                other => bail!("host fixtures do not decode {other}"),
            }
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(values)
}

pub fn upload<D: Device>(device: &D, tensor: &HostTensor) -> anyhow::Result<D::TensorHandle> {
    device
        .materialize(TensorInit::Literal(tensor.to_literal()?))
        .map_err(|err| anyhow::anyhow!("materialize {:?} failed: {err}", tensor.spec))
}

pub fn zeroed<D: Device>(device: &D, spec: &TensorSpec) -> anyhow::Result<D::TensorHandle> {
    device
        .materialize(TensorInit::Zeroed(spec.clone()))
        .map_err(|err| anyhow::anyhow!("zero init {spec:?} failed: {err}"))
}

pub fn download<D: Device>(device: &D, handle: &D::TensorHandle) -> anyhow::Result<Vec<f64>> {
    let literal = device
        .to_literal(handle)
        .map_err(|err| anyhow::anyhow!("readback failed: {err}"))?;
    literal_values(&literal).context("decoding readback literal")
}

/// The five operator inputs in interchange order.
#[derive(Debug, Clone)]
pub struct BatchNormInputs {
    pub input: HostTensor,
    pub scale: HostTensor,
    pub bias: HostTensor,
    pub mean: HostTensor,
    pub variance: HostTensor,
}

impl BatchNormInputs {
    /// Random inputs with per-channel statistics of shape `[C]` (or `stat_dims` when given).
    pub fn random(rng: &mut StdRng, dtype: DType, dims: &[usize]) -> Self {
        let stat_dims = [dims[1]];
        Self::random_with_stats(rng, dtype, dims, &stat_dims)
    }

    pub fn random_with_stats(
        rng: &mut StdRng,
        dtype: DType,
        dims: &[usize],
        stat_dims: &[usize],
    ) -> Self {
        Self {
            input: HostTensor::random(rng, dtype, dims, -2.0, 2.0),
            scale: HostTensor::random(rng, dtype, stat_dims, 0.5, 1.5),
            bias: HostTensor::random(rng, dtype, stat_dims, -0.5, 0.5),
            mean: HostTensor::random(rng, dtype, stat_dims, -0.5, 0.5),
            variance: HostTensor::random(rng, dtype, stat_dims, 0.5, 2.0),
        }
    }

    pub fn all(&self) -> [&HostTensor; 5] {
        [
            &self.input,
            &self.scale,
            &self.bias,
            &self.mean,
            &self.variance,
        ]
    }

    /// Creation context with one output matching the input.
    pub fn context(&self, op_type: &str) -> KernelCreationContext {
        self.all()
            .into_iter()
            .fold(KernelCreationContext::new(op_type), |ctx, tensor| {
                ctx.with_input(tensor.spec.clone())
            })
            .with_output(self.input.spec.clone())
    }

    pub fn upload<D: Device>(&self, device: &D) -> anyhow::Result<Vec<D::TensorHandle>> {
        self.all()
            .into_iter()
            .map(|tensor| upload(device, tensor))
            .collect()
    }

    /// Host oracle for the inference formula, with statistics placed from axis 1.
    pub fn reference(&self, epsilon: f32, activation: Option<&ActivationDesc>) -> Vec<f64> {
        let dims = &self.input.spec.dims;
        let mut output = Vec::with_capacity(self.input.values.len());
        for (flat, &x) in self.input.values.iter().enumerate() {
            let coords = unravel(flat, dims);
            let stat = |tensor: &HostTensor| tensor.values[stat_offset(&coords, &tensor.spec.dims)];
            let normalized = (x - stat(&self.mean))
                / (stat(&self.variance) + f64::from(epsilon)).sqrt();
            let y = stat(&self.scale) * normalized + stat(&self.bias);
            output.push(match activation {
                Some(desc) => reference_activation(desc, y),
                None => y,
            });
        }
        output
    }
}

fn unravel(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (axis, dim) in dims.iter().enumerate().rev() {
        coords[axis] = index % dim;
        index /= dim;
    }
    coords
}

fn stat_offset(coords: &[usize], stat_dims: &[usize]) -> usize {
    let mut offset = 0;
    for (axis, &dim) in stat_dims.iter().enumerate() {
        let coord = if dim == 1 { 0 } else { coords[axis + 1] };
        offset = offset * dim + coord;
    }
    offset
}

pub fn reference_activation(desc: &ActivationDesc, x: f64) -> f64 {
    let alpha = f64::from(desc.alpha.unwrap_or(0.0));
    let beta = f64::from(desc.beta.unwrap_or(0.0));
    match desc.kind {
        ActivationKind::Relu => x.max(0.0),
        ActivationKind::LeakyRelu if x < 0.0 => alpha * x,
        ActivationKind::LeakyRelu => x,
        ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        ActivationKind::HardSigmoid => (alpha * x + beta).clamp(0.0, 1.0),
        ActivationKind::Tanh => x.tanh(),
        other => panic!("no host reference for {other:?}"),
    }
}

pub fn fused_attributes(
    ctx: KernelCreationContext,
    kind: ActivationKind,
    alpha: Option<f32>,
) -> KernelCreationContext {
    let ctx = ctx.with_attribute(
        names::FUSED_ACTIVATION,
        AttributeValue::String(kind.op_name().to_string()),
    );
    match alpha {
        Some(alpha) => ctx.with_attribute(names::FUSED_ALPHA, AttributeValue::Float(alpha)),
        None => ctx,
    }
}

pub fn assert_close_tol(expected: &[f64], actual: &[f64], atol: f64, rtol: f64) {
    assert_eq!(expected.len(), actual.len());
    for (idx, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        let diff = (e - a).abs();
        let thresh = atol + rtol * e.abs().max(a.abs());
        assert!(
            diff <= thresh,
            "value mismatch at index {idx}: expected {e}, actual {a}, diff {diff}, thresh {thresh}"
        );
    }
}
