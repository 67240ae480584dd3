//! Operator-construction and support-query contexts handed over by the host.

use serde::{Deserialize, Serialize};

use crate::backend::spec::TensorSpec;
use crate::ops::attributes::{AttributeMap, AttributeValue};
use crate::ops::error::OperatorResult;

/// Everything the host knows about one operator node at construction time.
///
/// `inputs` keeps the interchange order; an absent optional input is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelCreationContext {
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<Option<TensorSpec>>,
    #[serde(default)]
    pub outputs: Vec<TensorSpec>,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl KernelCreationContext {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn with_input(mut self, spec: TensorSpec) -> Self {
        self.inputs.push(Some(spec));
        self
    }

    pub fn with_missing_input(mut self) -> Self {
        self.inputs.push(None);
        self
    }

    pub fn with_output(mut self, spec: TensorSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name, value);
        self
    }

    pub fn input(&self, ordinal: usize) -> Option<&TensorSpec> {
        self.inputs.get(ordinal).and_then(Option::as_ref)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn support_query(&self) -> SupportQueryContext<'_> {
        SupportQueryContext {
            op_type: &self.op_type,
            attributes: &self.attributes,
        }
    }

    pub fn from_json_str(src: &str) -> OperatorResult<Self> {
        Ok(serde_json::from_str(src)?)
    }
}

/// Metadata visible to the host's kernel-selection query before construction.
#[derive(Debug, Clone, Copy)]
pub struct SupportQueryContext<'a> {
    pub op_type: &'a str,
    pub attributes: &'a AttributeMap,
}

impl<'a> SupportQueryContext<'a> {
    pub fn new(op_type: &'a str, attributes: &'a AttributeMap) -> Self {
        Self {
            op_type,
            attributes,
        }
    }
}
