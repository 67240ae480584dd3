//! Reference numerics evaluated over `f64` host vectors.

use bnorm_rs::backend::spec::{
    ActivationDesc, ActivationKind, BackendResult, BatchNormSpec, DType,
};

use half::{bf16, f16};

use crate::tensor::TensorData;

/// Rounds every value through `dtype`, as storing into a buffer of that dtype would.
pub(crate) fn cast(values: &[f64], dtype: DType) -> BackendResult<Vec<f64>> {
    Ok(TensorData::from_f64(dtype, values.iter().copied())?.to_f64_vec())
}

/// Strided views of the five normalization operands, in device operand order.
pub(crate) struct BatchNormOperands<'a> {
    pub input: &'a [f64],
    pub mean: (&'a [f64], &'a [usize]),
    pub variance: (&'a [f64], &'a [usize]),
    pub scale: (&'a [f64], &'a [usize]),
    pub bias: (&'a [f64], &'a [usize]),
}

/// Rounds one intermediate through `dtype`; wide dtypes keep the full `f64` value.
fn round_intermediate(dtype: DType, value: f64) -> f64 {
    match dtype {
        DType::F16 => f16::from_f64(value).to_f64(),
        DType::Bf16 => bf16::from_f64(value).to_f64(),
        _ => value,
    }
}

/// `y = scale * (x - mean) / sqrt(variance + epsilon) + bias`, then the fused epilogue.
///
/// Auxiliary strides are broadcast strides over `dims` (stride `0` on broadcast axes).
/// `compute_dtype` is the precision intermediates are kept in.
pub(crate) fn batch_norm(
    operands: &BatchNormOperands<'_>,
    dims: &[usize],
    spec: &BatchNormSpec,
    compute_dtype: DType,
) -> Vec<f64> {
    let epsilon = f64::from(spec.epsilon);
    let mut coords = vec![0usize; dims.len()];
    let mut output = Vec::with_capacity(operands.input.len());
    for &x in operands.input {
        let at = |(values, strides): (&[f64], &[usize])| {
            let offset: usize = coords
                .iter()
                .zip(strides)
                .map(|(coord, stride)| coord * stride)
                .sum();
            values[offset]
        };
        let mean = at(operands.mean);
        let variance = at(operands.variance);
        let scale = at(operands.scale);
        let bias = at(operands.bias);
        let normalized = round_intermediate(compute_dtype, (x - mean) / (variance + epsilon).sqrt());
        let mut y = round_intermediate(compute_dtype, scale * normalized + bias);
        if let Some(activation) = &spec.fused_activation {
            y = activate(activation, y);
        }
        output.push(y);
        advance(&mut coords, dims);
    }
    output
}

fn advance(coords: &mut [usize], dims: &[usize]) {
    for axis in (0..coords.len()).rev() {
        coords[axis] += 1;
        if coords[axis] < dims[axis] {
            return;
        }
        coords[axis] = 0;
    }
}

pub(crate) fn activate(desc: &ActivationDesc, x: f64) -> f64 {
    let alpha = f64::from(desc.alpha.unwrap_or(0.0));
    let beta = f64::from(desc.beta.unwrap_or(0.0));
    let gamma = f64::from(desc.gamma.unwrap_or(0.0));
    match desc.kind {
        ActivationKind::Relu => x.max(0.0),
        ActivationKind::LeakyRelu => {
            if x >= 0.0 {
                x
            } else {
                alpha * x
            }
        }
        ActivationKind::Elu => {
            if x >= 0.0 {
                x
            } else {
                alpha * x.exp_m1()
            }
        }
        ActivationKind::Selu => {
            if x > 0.0 {
                gamma * x
            } else {
                gamma * alpha * x.exp_m1()
            }
        }
        ActivationKind::Celu => x.max(0.0) + (alpha * (x / alpha).exp_m1()).min(0.0),
        ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        ActivationKind::HardSigmoid => (alpha * x + beta).clamp(0.0, 1.0),
        ActivationKind::Tanh => x.tanh(),
        ActivationKind::ScaledTanh => alpha * (beta * x).tanh(),
        ActivationKind::Softplus => x.exp().ln_1p(),
        ActivationKind::Softsign => x / (1.0 + x.abs()),
        ActivationKind::ThresholdedRelu => {
            if x > alpha {
                x
            } else {
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activations_match_reference_points() {
        let relu = ActivationDesc::new(ActivationKind::Relu);
        assert_eq!(activate(&relu, -2.0), 0.0);
        assert_eq!(activate(&relu, 3.0), 3.0);

        let leaky = ActivationDesc::new(ActivationKind::LeakyRelu);
        assert!((activate(&leaky, -1.0) + 0.01).abs() < 1e-6);

        let hard = ActivationDesc::new(ActivationKind::HardSigmoid);
        assert_eq!(activate(&hard, 10.0), 1.0);
        assert!((activate(&hard, 0.0) - 0.5).abs() < 1e-6);

        let thresholded = ActivationDesc::new(ActivationKind::ThresholdedRelu);
        assert_eq!(activate(&thresholded, 0.5), 0.0);
        assert_eq!(activate(&thresholded, 1.5), 1.5);
    }

    #[test]
    fn batch_norm_broadcasts_channel_statistics() {
        // [N=1, C=2, W=2]
        let input = [1.0, 3.0, 10.0, 14.0];
        let dims = [1, 2, 2];
        let strides = [0usize, 1, 0];
        let operands = BatchNormOperands {
            input: &input,
            mean: (&[2.0, 12.0], &strides),
            variance: (&[1.0, 4.0], &strides),
            scale: (&[1.0, 2.0], &strides),
            bias: (&[0.0, 1.0], &strides),
        };
        let spec = BatchNormSpec {
            epsilon: 0.0,
            spatial: true,
            fused_activation: None,
        };
        let output = batch_norm(&operands, &dims, &spec, DType::F64);
        assert_eq!(output, vec![-1.0, 1.0, -1.0, 3.0]);
    }

    #[test]
    fn half_precision_intermediates_are_rounded() {
        let strides = [0usize, 0];
        let operands = BatchNormOperands {
            input: &[1.0],
            mean: (&[0.0], &strides),
            variance: (&[3.0], &strides),
            scale: (&[1.0], &strides),
            bias: (&[0.0], &strides),
        };
        let spec = BatchNormSpec {
            epsilon: 0.0,
            spatial: true,
            fused_activation: None,
        };
        let wide = batch_norm(&operands, &[1, 1], &spec, DType::F64);
        let half = batch_norm(&operands, &[1, 1], &spec, DType::F16);
        assert_eq!(wide, vec![1.0 / 3.0f64.sqrt()]);
        assert_eq!(half, vec![f16::from_f64(1.0 / 3.0f64.sqrt()).to_f64()]);
        assert_ne!(wide, half);
    }
}
