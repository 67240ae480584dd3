//! Tensor descriptor normalization.
//!
//! Raw per-tensor metadata arrives with whatever rank the interchange format allows: the primary
//! input is `[N, C, D1, ...]` while the per-channel statistics are 1-D `[C]`. Devices want every
//! operand at the primary rank so broadcasting is purely positional, so each tensor is placed
//! left-aligned at an anchor axis and padded with singleton axes up to the primary rank.

use smallvec::SmallVec;

use crate::backend::shape_helpers::is_broadcastable_to;
use crate::backend::spec::{DType, TensorSpec};
use crate::ops::context::KernelCreationContext;
use crate::ops::error::{BuildStage, OperatorError, OperatorResult};
use crate::ops::slots::{InputSlot, SlotMap, INPUT_COUNT};

/// Canonical axes a tensor can be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorAxis {
    N,
    C,
}

impl TensorAxis {
    pub fn index(self) -> usize {
        match self {
            TensorAxis::N => 0,
            TensorAxis::C => 1,
        }
    }
}

/// How a raw shape is placed into the canonical rank.
///
/// Placement is always left-aligned (the raw leading axis lands on the anchor) and never
/// flattens dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorPlacement {
    BatchAnchored,
    ChannelAnchored,
}

impl TensorPlacement {
    pub fn anchor(self) -> TensorAxis {
        match self {
            TensorPlacement::BatchAnchored => TensorAxis::N,
            TensorPlacement::ChannelAnchored => TensorAxis::C,
        }
    }
}

/// Immutable, rank-aligned tensor descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    dtype: DType,
    dims: SmallVec<[usize; 8]>,
    placement: TensorPlacement,
}

impl TensorDesc {
    /// Places `spec` at `placement`'s anchor inside a shape of exactly `rank` axes.
    pub fn place(
        spec: &TensorSpec,
        placement: TensorPlacement,
        rank: usize,
    ) -> Result<Self, String> {
        let anchor = placement.anchor().index();
        let end = anchor + spec.rank();
        if end > rank {
            return Err(format!(
                "rank-{} tensor anchored at axis {anchor} does not fit in rank {rank}",
                spec.rank()
            ));
        }
        let mut dims: SmallVec<[usize; 8]> = SmallVec::from_elem(1, rank);
        dims[anchor..end].copy_from_slice(&spec.dims);
        Ok(Self {
            dtype: spec.dtype,
            dims,
            placement,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn placement(&self) -> TensorPlacement {
        self.placement
    }

    /// Axes whose extent is not `1`.
    pub fn non_singleton_axes(&self) -> Vec<usize> {
        self.dims
            .iter()
            .enumerate()
            .filter(|(_, &dim)| dim != 1)
            .map(|(axis, _)| axis)
            .collect()
    }

    pub fn to_spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype, self.dims.to_vec())
    }
}

/// Descriptors for every operator input and output.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensors {
    inputs: SlotMap<TensorDesc>,
    outputs: Vec<TensorDesc>,
}

impl NormalizedTensors {
    pub fn input(&self, slot: InputSlot) -> &TensorDesc {
        self.inputs.get(slot)
    }

    pub fn primary(&self) -> &TensorDesc {
        self.inputs.get(InputSlot::Primary)
    }

    /// Input descriptors in interchange order.
    pub fn inputs(&self) -> &[TensorDesc] {
        self.inputs.as_slice()
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        &self.outputs
    }

    pub fn rank(&self) -> usize {
        self.primary().rank()
    }
}

fn invalid(message: impl Into<String>) -> OperatorError {
    OperatorError::invalid_argument(BuildStage::Normalize, message)
}

fn required_input(ctx: &KernelCreationContext, slot: InputSlot) -> OperatorResult<&TensorSpec> {
    ctx.input(slot.ordinal())
        .ok_or_else(|| invalid(format!("required input '{slot}' is absent")))
}

/// Produces canonical descriptors for the five inputs and every output.
///
/// The primary input keeps its shape; auxiliary inputs are channel-anchored at the primary rank;
/// output 0 is batch-anchored and must match the primary shape and dtype. Extra outputs are
/// channel-anchored like the statistics they describe.
pub fn normalize_tensors(ctx: &KernelCreationContext) -> OperatorResult<NormalizedTensors> {
    if ctx.input_count() != INPUT_COUNT {
        return Err(invalid(format!(
            "expected exactly {INPUT_COUNT} inputs, got {}",
            ctx.input_count()
        )));
    }
    if ctx.output_count() == 0 {
        return Err(invalid("expected at least one output, got 0"));
    }

    let primary_spec = required_input(ctx, InputSlot::Primary)?;
    let rank = primary_spec.rank();
    if rank <= TensorAxis::C.index() {
        return Err(invalid(format!(
            "input must have rank >= 2 to carry a channel axis, got rank {rank}"
        )));
    }
    let primary = TensorDesc::place(primary_spec, TensorPlacement::BatchAnchored, rank)
        .map_err(invalid)?;

    let mut inputs = SlotMap::from_fn(|_| primary.clone());
    for slot in InputSlot::AUXILIARY {
        let spec = required_input(ctx, slot)?;
        let desc = TensorDesc::place(spec, TensorPlacement::ChannelAnchored, rank)
            .map_err(|reason| invalid(format!("input '{slot}': {reason}")))?;
        if !is_broadcastable_to(desc.dims(), primary.dims()) {
            return Err(invalid(format!(
                "input '{slot}' with dims {:?} does not broadcast to input dims {:?}",
                desc.dims(),
                primary.dims()
            )));
        }
        tracing::debug!(
            slot = %slot,
            raw = ?spec.dims,
            placed = ?desc.dims(),
            "placed auxiliary tensor"
        );
        inputs.set(slot, desc);
    }

    let mut outputs = Vec::with_capacity(ctx.output_count());
    for (index, spec) in ctx.outputs.iter().enumerate() {
        let placement = if index == 0 {
            TensorPlacement::BatchAnchored
        } else {
            TensorPlacement::ChannelAnchored
        };
        let desc = TensorDesc::place(spec, placement, rank)
            .map_err(|reason| invalid(format!("output {index}: {reason}")))?;
        if index == 0 {
            if desc.dims() != primary.dims() {
                return Err(invalid(format!(
                    "output 0 dims {:?} differ from input dims {:?}",
                    desc.dims(),
                    primary.dims()
                )));
            }
            if desc.dtype() != primary.dtype() {
                return Err(invalid(format!(
                    "output 0 dtype {} differs from input dtype {}",
                    desc.dtype(),
                    primary.dtype()
                )));
            }
        }
        outputs.push(desc);
    }

    inputs.set(InputSlot::Primary, primary);
    Ok(NormalizedTensors { inputs, outputs })
}
