//! Named operator input slots and their two orderings.

use std::fmt;

/// Input slot of the batch-normalization operator, in interchange-format order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputSlot {
    Primary,
    Scale,
    Bias,
    Mean,
    Variance,
}

/// Number of inputs the operator requires.
pub const INPUT_COUNT: usize = 5;

impl InputSlot {
    /// Every slot, ordered as the interchange format lists the operator inputs.
    pub const ALL: [InputSlot; INPUT_COUNT] = [
        InputSlot::Primary,
        InputSlot::Scale,
        InputSlot::Bias,
        InputSlot::Mean,
        InputSlot::Variance,
    ];

    /// Auxiliary per-channel slots.
    pub const AUXILIARY: [InputSlot; 4] = [
        InputSlot::Scale,
        InputSlot::Bias,
        InputSlot::Mean,
        InputSlot::Variance,
    ];

    /// Position of this slot in the caller's input array.
    pub fn ordinal(self) -> usize {
        match self {
            InputSlot::Primary => 0,
            InputSlot::Scale => 1,
            InputSlot::Bias => 2,
            InputSlot::Mean => 3,
            InputSlot::Variance => 4,
        }
    }

    /// Graph input name bound to this slot.
    pub fn name(self) -> &'static str {
        match self {
            InputSlot::Primary => "input",
            InputSlot::Scale => "scale",
            InputSlot::Bias => "bias",
            InputSlot::Mean => "mean",
            InputSlot::Variance => "variance",
        }
    }
}

impl fmt::Display for InputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operand order of the device's normalization node.
///
/// This differs from [`InputSlot::ALL`]; graph inputs keep their interchange ordinals and only
/// the node's operand list is permuted through this table.
pub const DEVICE_OPERAND_ORDER: [InputSlot; INPUT_COUNT] = [
    InputSlot::Primary,
    InputSlot::Mean,
    InputSlot::Variance,
    InputSlot::Scale,
    InputSlot::Bias,
];

/// Per-slot storage indexed by [`InputSlot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap<T> {
    values: [T; INPUT_COUNT],
}

impl<T> SlotMap<T> {
    pub fn from_fn(mut f: impl FnMut(InputSlot) -> T) -> Self {
        Self {
            values: InputSlot::ALL.map(&mut f),
        }
    }

    pub fn get(&self, slot: InputSlot) -> &T {
        &self.values[slot.ordinal()]
    }

    pub fn set(&mut self, slot: InputSlot, value: T) {
        self.values[slot.ordinal()] = value;
    }

    /// Values in interchange order.
    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}
