use std::sync::Mutex;

use bnorm_rs::backend::spec::{
    BackendError, BackendResult, Device, ExecutionFlags, Graph, TensorInit, TensorLiteral,
    TensorSpec,
};

/// Buffer handle of the recording device; carries only its spec.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTensor {
    pub spec: TensorSpec,
}

#[derive(Debug, Clone)]
pub struct RecordedKernel {
    pub id: usize,
    pub graph: Graph,
    pub flags: ExecutionFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPersistent {
    pub kernel_id: usize,
}

/// One `execute` call as observed by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExecution {
    pub kernel_id: usize,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub persistent: Option<RecordedPersistent>,
}

#[derive(Default)]
struct Log {
    compiled: Vec<(Graph, ExecutionFlags)>,
    executions: Vec<RecordedExecution>,
    persistent_created: usize,
}

/// Test-only device that records compiled graphs and execute calls.
///
/// Compilation and execution can be configured to fail, and kernels can be made to declare a
/// persistent resource.
#[derive(Default)]
pub struct RecordingDevice {
    compile_failure: Option<String>,
    execute_failure: Option<String>,
    persistent: bool,
    log: Mutex<Log>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_compile(mut self, message: impl Into<String>) -> Self {
        self.compile_failure = Some(message.into());
        self
    }

    pub fn failing_execute(mut self, message: impl Into<String>) -> Self {
        self.execute_failure = Some(message.into());
        self
    }

    pub fn with_persistent_resource(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Builds a handle without going through `materialize`.
    pub fn tensor(&self, spec: TensorSpec) -> RecordedTensor {
        RecordedTensor { spec }
    }

    /// Number of `compile` calls, failed ones included.
    pub fn compile_calls(&self) -> usize {
        self.log.lock().expect("device mutex poisoned").compiled.len()
    }

    pub fn compiled_graphs(&self) -> Vec<Graph> {
        self.log
            .lock()
            .expect("device mutex poisoned")
            .compiled
            .iter()
            .map(|(graph, _)| graph.clone())
            .collect()
    }

    pub fn last_graph_or_panic(&self) -> Graph {
        self.compiled_graphs()
            .pop()
            .expect("device should have recorded a compiled graph")
    }

    pub fn last_flags(&self) -> Option<ExecutionFlags> {
        self.log
            .lock()
            .expect("device mutex poisoned")
            .compiled
            .last()
            .map(|(_, flags)| *flags)
    }

    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.log
            .lock()
            .expect("device mutex poisoned")
            .executions
            .clone()
    }

    pub fn execute_calls(&self) -> usize {
        self.log.lock().expect("device mutex poisoned").executions.len()
    }

    pub fn persistent_resources_created(&self) -> usize {
        self.log
            .lock()
            .expect("device mutex poisoned")
            .persistent_created
    }
}

impl Device for RecordingDevice {
    type TensorHandle = RecordedTensor;
    type Kernel = RecordedKernel;
    type PersistentResource = RecordedPersistent;

    fn backend_name(&self) -> &str {
        "recording"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        let spec = match init {
            TensorInit::Literal(literal) => literal.spec,
            TensorInit::Zeroed(spec) => spec,
        };
        Ok(RecordedTensor { spec })
    }

    fn to_literal(&self, _tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Err(BackendError::unimplemented(
            "to_literal",
            "recording device holds no data",
        ))
    }

    fn compile(&self, graph: &Graph, flags: ExecutionFlags) -> BackendResult<Self::Kernel> {
        let mut log = self.log.lock().expect("device mutex poisoned");
        log.compiled.push((graph.clone(), flags));
        if let Some(message) = &self.compile_failure {
            return Err(BackendError::execution(message.clone()));
        }
        Ok(RecordedKernel {
            id: log.compiled.len() - 1,
            graph: graph.clone(),
            flags,
        })
    }

    fn create_persistent_resource(
        &self,
        kernel: &Self::Kernel,
    ) -> BackendResult<Option<Self::PersistentResource>> {
        if !self.persistent {
            return Ok(None);
        }
        self.log
            .lock()
            .expect("device mutex poisoned")
            .persistent_created += 1;
        Ok(Some(RecordedPersistent {
            kernel_id: kernel.id,
        }))
    }

    fn execute(
        &self,
        kernel: &Self::Kernel,
        persistent: Option<&Self::PersistentResource>,
        inputs: &[&Self::TensorHandle],
        outputs: &[&Self::TensorHandle],
    ) -> BackendResult<()> {
        self.log
            .lock()
            .expect("device mutex poisoned")
            .executions
            .push(RecordedExecution {
                kernel_id: kernel.id,
                inputs: inputs.iter().map(|tensor| tensor.spec.clone()).collect(),
                outputs: outputs.iter().map(|tensor| tensor.spec.clone()).collect(),
                persistent: persistent.cloned(),
            });
        match &self.execute_failure {
            Some(message) => Err(BackendError::execution(message.clone())),
            None => Ok(()),
        }
    }
}
