use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::backend::spec::{ExecutionFlags, Graph};

/// In-process fingerprint builder; values are stable for the lifetime of the process only.
pub struct FingerprintHasher {
    inner: DefaultHasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            inner: DefaultHasher::new(),
        }
    }

    pub fn write<T: Hash>(&mut self, value: &T) {
        value.hash(&mut self.inner);
    }

    pub fn finish(self) -> u64 {
        self.inner.finish()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys a compiled kernel: the same graph compiled under different flags is a different kernel.
pub fn kernel_fingerprint(graph: &Graph, flags: ExecutionFlags) -> u64 {
    let mut hasher = FingerprintHasher::new();
    hasher.write(graph);
    hasher.write(&flags);
    hasher.finish()
}
