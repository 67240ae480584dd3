//! Operator-type registration table.
//!
//! The host looks operators up by type name, asks the registered support query whether a node
//! can be handled, and only then constructs it. The built-in batch-normalization entries are
//! installed on first use; hosts may add aliases with [`register_operator`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::backend::spec::{Device, ExecutionFlags};
use crate::ops::batch_norm::{query_batch_normalization, BatchNormalizationOperator};
use crate::ops::context::{KernelCreationContext, SupportQueryContext};
use crate::ops::error::{OperatorError, OperatorResult};

/// Default operator domain of the interchange format.
pub const DEFAULT_DOMAIN: &str = "";
/// Domain of host-internal operators produced by graph fusion.
pub const FUSED_DOMAIN: &str = "com.microsoft";

/// Predicate deciding whether a node with the given metadata can be handled.
pub type SupportQuery = fn(&SupportQueryContext<'_>) -> bool;

/// One registered operator type.
#[derive(Clone, Copy)]
pub struct OperatorRegistration {
    pub op_type: &'static str,
    pub domain: &'static str,
    pub since_versions: &'static [u32],
    pub query: SupportQuery,
}

impl OperatorRegistration {
    pub fn is_supported(&self, ctx: &SupportQueryContext<'_>) -> bool {
        (self.query)(ctx)
    }
}

impl std::fmt::Debug for OperatorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistration")
            .field("op_type", &self.op_type)
            .field("domain", &self.domain)
            .field("since_versions", &self.since_versions)
            .finish_non_exhaustive()
    }
}

const BUILTIN_REGISTRATIONS: [OperatorRegistration; 3] = [
    OperatorRegistration {
        op_type: "BatchNormalization",
        domain: DEFAULT_DOMAIN,
        since_versions: &[7, 9],
        query: query_batch_normalization,
    },
    OperatorRegistration {
        op_type: "BatchNormalization15",
        domain: DEFAULT_DOMAIN,
        since_versions: &[15],
        query: query_batch_normalization,
    },
    OperatorRegistration {
        op_type: "FusedBatchNormalization",
        domain: FUSED_DOMAIN,
        since_versions: &[1],
        query: query_batch_normalization,
    },
];

struct OperatorRegistry {
    entries: RwLock<HashMap<&'static str, OperatorRegistration>>,
}

impl OperatorRegistry {
    fn with_builtins() -> Self {
        let entries = BUILTIN_REGISTRATIONS
            .iter()
            .map(|registration| (registration.op_type, *registration))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    fn register(&self, registration: OperatorRegistration) -> Option<OperatorRegistration> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(registration.op_type, registration)
    }

    fn find(&self, op_type: &str) -> Option<OperatorRegistration> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op_type)
            .copied()
    }

    fn list(&self) -> Vec<OperatorRegistration> {
        let mut entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect::<Vec<_>>();
        entries.sort_by_key(|registration| registration.op_type);
        entries
    }
}

static GLOBAL_REGISTRY: OnceLock<OperatorRegistry> = OnceLock::new();

fn global_registry() -> &'static OperatorRegistry {
    GLOBAL_REGISTRY.get_or_init(OperatorRegistry::with_builtins)
}

/// Registers (or replaces) an operator type; returns the previous registration.
pub fn register_operator(registration: OperatorRegistration) -> Option<OperatorRegistration> {
    global_registry().register(registration)
}

pub fn find_registration(op_type: &str) -> Option<OperatorRegistration> {
    global_registry().find(op_type)
}

/// All registered operator types, sorted by name.
pub fn registered_operators() -> Vec<OperatorRegistration> {
    global_registry().list()
}

/// Returns `false` for unknown op types and for nodes the type's query rejects.
pub fn is_supported(ctx: &SupportQueryContext<'_>) -> bool {
    find_registration(ctx.op_type).is_some_and(|registration| registration.is_supported(ctx))
}

/// Runs the support query and, only when it passes, constructs and builds the operator.
pub fn create_operator<D: Device>(
    device: Arc<D>,
    ctx: &KernelCreationContext,
    flags: ExecutionFlags,
) -> OperatorResult<BatchNormalizationOperator<D>> {
    let registration = find_registration(&ctx.op_type).ok_or_else(|| {
        OperatorError::unsupported(ctx.op_type.clone(), "operator type is not registered")
    })?;
    if !registration.is_supported(&ctx.support_query()) {
        return Err(OperatorError::unsupported(
            ctx.op_type.clone(),
            "support query rejected the node",
        ));
    }
    tracing::debug!(
        op_type = registration.op_type,
        domain = registration.domain,
        "creating operator"
    );
    BatchNormalizationOperator::create(device, ctx, flags)
}
