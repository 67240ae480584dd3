use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bnorm_rs::backend::shape_helpers::checked_element_count_or_error;
use bnorm_rs::backend::spec::{
    BackendError, BackendResult, DType, SpecErrorCode, TensorLiteral, TensorSpec,
};
use half::{bf16, f16};

/// Host buffer bound to a compiled kernel.
///
/// Clones share storage, so a kernel writing through one handle is visible through every clone.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    data: Arc<RwLock<TensorData>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Si32(Vec<i32>),
    Si64(Vec<i64>),
}

impl CpuTensor {
    pub fn new(spec: TensorSpec, data: TensorData) -> BackendResult<Self> {
        if data.dtype() != spec.dtype {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeMismatch,
                format!("buffer holds {} but spec declares {}", data.dtype(), spec.dtype),
            ));
        }
        let expected = element_count(&spec)?;
        if data.len() != expected {
            return Err(BackendError::execution(format!(
                "buffer holds {} elements, spec {:?} needs {expected}",
                data.len(),
                spec.dims
            )));
        }
        Ok(Self {
            spec,
            data: Arc::new(RwLock::new(data)),
        })
    }

    pub fn zeroed(spec: TensorSpec) -> BackendResult<Self> {
        let count = element_count(&spec)?;
        let data = TensorData::from_f64(spec.dtype, std::iter::repeat(0.0).take(count))?;
        Self::new(spec, data)
    }

    pub fn from_literal(literal: &TensorLiteral) -> BackendResult<Self> {
        let data = TensorData::from_le_bytes(literal.spec.dtype, &literal.bytes)?;
        Self::new(literal.spec.clone(), data)
    }

    pub fn to_literal(&self) -> BackendResult<TensorLiteral> {
        let bytes = self.read().to_le_bytes();
        Ok(TensorLiteral::new(self.spec.clone(), Arc::from(bytes)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TensorData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TensorData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies the contents out widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.read().to_f64_vec()
    }

    /// Overwrites the contents, rounding each value to the buffer's dtype.
    pub fn store_f64(&self, values: &[f64]) -> BackendResult<()> {
        let expected = element_count(&self.spec)?;
        if values.len() != expected {
            return Err(BackendError::execution(format!(
                "cannot store {} values into a buffer of {expected} elements",
                values.len()
            )));
        }
        let data = TensorData::from_f64(self.spec.dtype, values.iter().copied())?;
        *self.write() = data;
        Ok(())
    }
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F16(_) => DType::F16,
            TensorData::Bf16(_) => DType::Bf16,
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::Si32(_) => DType::Si32,
            TensorData::Si64(_) => DType::Si64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F16(values) => values.len(),
            TensorData::Bf16(values) => values.len(),
            TensorData::F32(values) => values.len(),
            TensorData::F64(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Si64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            TensorData::F16(values) => values.iter().map(|v| v.to_f64()).collect(),
            TensorData::Bf16(values) => values.iter().map(|v| v.to_f64()).collect(),
            TensorData::F32(values) => values.iter().map(|&v| f64::from(v)).collect(),
            TensorData::F64(values) => values.clone(),
            TensorData::Si32(values) => values.iter().map(|&v| f64::from(v)).collect(),
            TensorData::Si64(values) => values.iter().map(|&v| v as f64).collect(),
        }
    }

    /// Whether cpu buffers can hold `dtype`.
    pub fn supports(dtype: DType) -> bool {
        !matches!(dtype, DType::Si8 | DType::Ui8)
    }

    /// Builds a buffer of `dtype` from `f64` values. Integer targets truncate and saturate.
    pub fn from_f64(dtype: DType, values: impl Iterator<Item = f64>) -> BackendResult<Self> {
        let data = match dtype {
            DType::F16 => TensorData::F16(values.map(f16::from_f64).collect()),
            DType::Bf16 => TensorData::Bf16(values.map(bf16::from_f64).collect()),
            DType::F32 => TensorData::F32(values.map(|v| v as f32).collect()),
            DType::F64 => TensorData::F64(values.collect()),
            DType::Si32 => TensorData::Si32(values.map(|v| v as i32).collect()),
            DType::Si64 => TensorData::Si64(values.map(|v| v as i64).collect()),
            DType::Si8 | DType::Ui8 => {
                return Err(BackendError::spec(
                    SpecErrorCode::DTypeNotSupported,
                    format!("cpu buffers do not support {dtype}"),
                ))
            }
        };
        Ok(data)
    }

    fn from_le_bytes(dtype: DType, bytes: &[u8]) -> BackendResult<Self> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(BackendError::execution(format!(
                "literal byte length {} is not a multiple of {dtype} width {width}",
                bytes.len()
            )));
        }
        let data = match dtype {
            DType::F16 => TensorData::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::Bf16 => TensorData::Bf16(
                bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F64 => TensorData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Si32 => TensorData::Si32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Si64 => TensorData::Si64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Si8 | DType::Ui8 => {
                return Err(BackendError::spec(
                    SpecErrorCode::DTypeNotSupported,
                    format!("literal dtype {dtype} unsupported"),
                ))
            }
        };
        Ok(data)
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() * self.dtype().size_in_bytes());
        match self {
            TensorData::F16(values) => values
                .iter()
                .for_each(|v| bytes.extend_from_slice(&v.to_le_bytes())),
            TensorData::Bf16(values) => values
                .iter()
                .for_each(|v| bytes.extend_from_slice(&v.to_le_bytes())),
            TensorData::F32(values) => values
                .iter()
                .for_each(|v| bytes.extend_from_slice(&v.to_le_bytes())),
            TensorData::F64(values) => values
                .iter()
                .for_each(|v| bytes.extend_from_slice(&v.to_le_bytes())),
            TensorData::Si32(values) => values
                .iter()
                .for_each(|v| bytes.extend_from_slice(&v.to_le_bytes())),
            TensorData::Si64(values) => values
                .iter()
                .for_each(|v| bytes.extend_from_slice(&v.to_le_bytes())),
        }
        bytes
    }
}

pub(crate) fn element_count(spec: &TensorSpec) -> BackendResult<usize> {
    checked_element_count_or_error(&spec.dims, || {
        BackendError::execution(format!("element count of {:?} overflows usize", spec.dims))
    })
}
