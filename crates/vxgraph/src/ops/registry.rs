use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use super::{Arity, OpKind, OpNamespace, Operator};
use crate::error::{GraphError, GraphResult, OpResult};
use crate::graph::{GraphContext, OptimizeContext, OptimizeDecision};
use crate::node::Node;

/// Registrars contributing built-in, custom and internal operators.
#[linkme::distributed_slice]
pub static OPERATOR_REGISTRARS: [fn(&mut OpRegistryBuilder)] = [..];

/// Replacement compute callback installed by [`OpRegistry::register_compute_override`].
pub type ComputeFn = Arc<dyn Fn(&mut GraphContext, &mut Node) -> OpResult<()> + Send + Sync>;

type OpTable = HashMap<&'static str, Arc<dyn Operator>>;

#[derive(Default)]
pub struct OpRegistryBuilder {
    builtin: OpTable,
    custom: OpTable,
    internal: OpTable,
    client: HashMap<OpKind, Arc<dyn Operator>>,
}

impl OpRegistryBuilder {
    pub fn register<O: Operator + 'static>(&mut self, kind: OpKind, op: O) -> &mut Self {
        self.register_arc(kind, Arc::new(op))
    }

    pub fn register_arc(&mut self, kind: OpKind, op: Arc<dyn Operator>) -> &mut Self {
        let displaced = match kind.namespace() {
            OpNamespace::Builtin => self.builtin.insert(kind.name(), op),
            OpNamespace::Custom => self.custom.insert(kind.name(), op),
            OpNamespace::Internal => self.internal.insert(kind.name(), op),
            OpNamespace::Client => self.client.insert(kind, op),
        };
        if displaced.is_some() {
            tracing::warn!(op = %kind, "operator registered twice; keeping the last one");
        }
        self
    }

    pub fn build(self) -> OpRegistry {
        OpRegistry {
            builtin: self.builtin,
            custom: self.custom,
            internal: self.internal,
            client: RwLock::new(self.client),
        }
    }
}

/// Operator descriptors for every namespace plus the client override table.
pub struct OpRegistry {
    builtin: OpTable,
    custom: OpTable,
    internal: OpTable,
    client: RwLock<HashMap<OpKind, Arc<dyn Operator>>>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<OpRegistry>> = OnceLock::new();

impl OpRegistry {
    pub fn builder() -> OpRegistryBuilder {
        OpRegistryBuilder::default()
    }

    /// Builder pre-populated by every registrar in [`OPERATOR_REGISTRARS`].
    pub fn registered_builder() -> OpRegistryBuilder {
        let mut builder = Self::builder();
        for registrar in OPERATOR_REGISTRARS {
            registrar(&mut builder);
        }
        builder
    }

    pub fn with_registered() -> Self {
        Self::registered_builder().build()
    }

    pub fn global() -> Arc<OpRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| {
            let registry = Self::with_registered();
            tracing::debug!(
                builtin = registry.builtin.len(),
                custom = registry.custom.len(),
                internal = registry.internal.len(),
                "operator registry initialized"
            );
            Arc::new(registry)
        }))
    }

    fn table(&self, namespace: OpNamespace) -> Option<&OpTable> {
        match namespace {
            OpNamespace::Builtin => Some(&self.builtin),
            OpNamespace::Custom => Some(&self.custom),
            OpNamespace::Internal => Some(&self.internal),
            OpNamespace::Client => None,
        }
    }

    fn client_override(&self, kind: OpKind) -> Option<Arc<dyn Operator>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// True when `kind` has a descriptor in its namespace table or a client override.
    pub fn is_valid(&self, kind: OpKind) -> bool {
        self.get_proc(kind).is_some()
    }

    /// Descriptor for `kind`: a client override wins over the namespace tables.
    pub fn get_proc(&self, kind: OpKind) -> Option<Arc<dyn Operator>> {
        if let Some(op) = self.client_override(kind) {
            return Some(op);
        }
        self.table(kind.namespace())?.get(kind.name()).cloned()
    }

    pub fn op_name(&self, kind: OpKind) -> &'static str {
        self.get_proc(kind)
            .map(|op| op.name())
            .unwrap_or_else(|| kind.name())
    }

    pub fn list_ops(&self) -> Vec<OpKind> {
        let mut kinds: Vec<OpKind> = self
            .builtin
            .keys()
            .copied()
            .map(OpKind::builtin)
            .chain(self.custom.keys().copied().map(OpKind::custom))
            .chain(self.internal.keys().copied().map(OpKind::internal))
            .chain(
                self.client
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .copied(),
            )
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Installs `op` for `kind`, returning the override it displaced.
    pub fn register_client_override(
        &self,
        kind: OpKind,
        op: Arc<dyn Operator>,
    ) -> Option<Arc<dyn Operator>> {
        tracing::debug!(op = %kind, name = op.name(), "client override installed");
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, op)
    }

    pub fn remove_client_override(&self, kind: OpKind) -> Option<Arc<dyn Operator>> {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
    }

    /// Keeps the current descriptor of `kind` but replaces its compute callback.
    pub fn register_compute_override(&self, kind: OpKind, compute: ComputeFn) -> GraphResult<()> {
        let inner = self.get_proc(kind).ok_or_else(|| GraphError::UnregisteredOp {
            op: kind.to_string(),
        })?;
        self.register_client_override(kind, Arc::new(ComputeOverride { inner, compute }));
        Ok(())
    }
}

/// Install a client override in the global registry.
pub fn register_client_override(
    kind: OpKind,
    op: Arc<dyn Operator>,
) -> Option<Arc<dyn Operator>> {
    OpRegistry::global().register_client_override(kind, op)
}

/// Replace only the compute callback of `kind` in the global registry.
pub fn register_compute_override(kind: OpKind, compute: ComputeFn) -> GraphResult<()> {
    OpRegistry::global().register_compute_override(kind, compute)
}

struct ComputeOverride {
    inner: Arc<dyn Operator>,
    compute: ComputeFn,
}

impl Operator for ComputeOverride {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn arity(&self) -> Arity {
        self.inner.arity()
    }

    fn init(&self, node: &mut Node) -> OpResult<()> {
        self.inner.init(node)
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        self.inner.check(cx, node)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        self.inner.setup(cx, node)
    }

    fn optimize(
        &self,
        cx: &mut OptimizeContext<'_>,
        node: &mut Node,
    ) -> OpResult<OptimizeDecision> {
        self.inner.optimize(cx, node)
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        (self.compute)(cx, node)
    }

    fn deinit(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        self.inner.deinit(cx, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Operator for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn arity(&self) -> Arity {
            Arity::fixed(1, 1)
        }

        fn compute(&self, _cx: &mut GraphContext, _node: &mut Node) -> OpResult<()> {
            Ok(())
        }
    }

    const RELU: OpKind = OpKind::builtin("RELU");
    const FUSED: OpKind = OpKind::custom("FUSED");
    const HELPER: OpKind = OpKind::internal("HELPER");
    const MINE: OpKind = OpKind::client("MINE");

    fn registry() -> OpRegistry {
        let mut builder = OpRegistry::builder();
        builder
            .register(RELU, Named("relu"))
            .register(FUSED, Named("fused"))
            .register(HELPER, Named("helper"));
        builder.build()
    }

    #[test]
    fn lookups_respect_namespaces() {
        let registry = registry();
        assert!(registry.is_valid(RELU));
        assert!(registry.is_valid(FUSED));
        assert!(registry.is_valid(HELPER));
        assert!(!registry.is_valid(OpKind::custom("RELU")));
        assert!(!registry.is_valid(MINE));
        assert_eq!(registry.op_name(HELPER), "helper");
        assert_eq!(registry.op_name(MINE), "MINE");
        assert_eq!(registry.list_ops(), vec![RELU, FUSED, HELPER]);
    }

    #[test]
    fn client_override_wins_and_reports_displaced() {
        let registry = registry();
        assert!(registry
            .register_client_override(RELU, Arc::new(Named("relu_v2")))
            .is_none());
        assert_eq!(registry.op_name(RELU), "relu_v2");

        let displaced = registry
            .register_client_override(RELU, Arc::new(Named("relu_v3")))
            .expect("previous override is returned");
        assert_eq!(displaced.name(), "relu_v2");

        registry.register_client_override(MINE, Arc::new(Named("mine")));
        assert!(registry.is_valid(MINE));

        registry.remove_client_override(RELU);
        assert_eq!(registry.op_name(RELU), "relu");
    }

    #[test]
    fn compute_override_requires_existing_descriptor() {
        let registry = registry();
        let compute: ComputeFn = Arc::new(|_, _| Ok(()));
        assert!(matches!(
            registry.register_compute_override(MINE, Arc::clone(&compute)),
            Err(GraphError::UnregisteredOp { .. })
        ));
        registry
            .register_compute_override(RELU, compute)
            .expect("relu is registered");
        let op = registry.get_proc(RELU).expect("override installed");
        assert_eq!(op.name(), "relu");
        assert_eq!(op.arity(), Arity::fixed(1, 1));
    }
}
