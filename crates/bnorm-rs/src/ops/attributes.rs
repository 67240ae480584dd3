//! Typed operator attributes and lookup with defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ops::error::{BuildStage, OperatorError, OperatorResult};

/// Attribute names read by the batch-normalization operator.
pub mod names {
    pub const EPSILON: &str = "epsilon";
    pub const SPATIAL: &str = "spatial";
    pub const TRAINING_MODE: &str = "training_mode";
    pub const FUSED_ACTIVATION: &str = "fused_activation";
    pub const FUSED_ALPHA: &str = "fused_alpha";
    pub const FUSED_BETA: &str = "fused_beta";
    pub const FUSED_GAMMA: &str = "fused_gamma";
}

/// Attribute payload as carried by the interchange format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

impl AttributeValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AttributeValue::Int(_) => "int",
            AttributeValue::Float(_) => "float",
            AttributeValue::String(_) => "string",
            AttributeValue::Ints(_) => "ints",
            AttributeValue::Floats(_) => "floats",
        }
    }
}

/// Conversion from a raw attribute into a Rust scalar.
pub trait FromAttribute: Sized {
    const KIND: &'static str;

    fn from_attribute(value: &AttributeValue) -> Option<Self>;
}

impl FromAttribute for f32 {
    const KIND: &'static str = "float";

    fn from_attribute(value: &AttributeValue) -> Option<Self> {
        match value {
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromAttribute for i64 {
    const KIND: &'static str = "int";

    fn from_attribute(value: &AttributeValue) -> Option<Self> {
        match value {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromAttribute for String {
    const KIND: &'static str = "string";

    fn from_attribute(value: &AttributeValue) -> Option<Self> {
        match value {
            AttributeValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Named attribute set attached to one operator node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap {
    values: BTreeMap<String, AttributeValue>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reads an optional attribute, failing when it is present with the wrong type.
    pub fn optional<T: FromAttribute>(&self, name: &str) -> OperatorResult<Option<T>> {
        match self.values.get(name) {
            None => Ok(None),
            Some(value) => T::from_attribute(value).map(Some).ok_or_else(|| {
                OperatorError::invalid_argument(
                    BuildStage::Attributes,
                    format!(
                        "attribute '{name}' expected {}, found {}",
                        T::KIND,
                        value.kind_name()
                    ),
                )
            }),
        }
    }

    pub fn get_or<T: FromAttribute>(&self, name: &str, default: T) -> OperatorResult<T> {
        Ok(self.optional(name)?.unwrap_or(default))
    }
}
