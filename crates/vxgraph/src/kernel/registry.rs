//! Kernel tables grouped by kernel name.
//!
//! Backend crates add tables through [`KERNEL_REGISTRARS`]; the global registry runs every
//! registrar once, on first use. Isolated registries for tests come from
//! [`KernelRegistry::builder`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::{KernelBackend, KernelError, KernelTable};

#[linkme::distributed_slice]
pub static KERNEL_REGISTRARS: [fn(&mut KernelRegistryBuilder)] = [..];

#[derive(Default)]
pub struct KernelRegistryBuilder {
    tables: HashMap<&'static str, Vec<KernelTable>>,
    priorities: HashMap<&'static str, Vec<KernelBackend>>,
    rejected: Vec<KernelError>,
}

impl KernelRegistryBuilder {
    /// Adds a table. A table with duplicate keys, or a second table for the same
    /// (name, backend), is rejected and reported by [`KernelRegistry::rejected`].
    pub fn register(&mut self, table: KernelTable) -> &mut Self {
        if let Some(key) = table.first_duplicate() {
            tracing::warn!(
                kernel = table.name,
                backend = %table.backend,
                %key,
                "duplicate kernel key"
            );
            self.rejected.push(KernelError::DuplicateKey {
                name: table.name.to_string(),
                backend: table.backend,
                key,
            });
            return self;
        }
        let tables = self.tables.entry(table.name).or_default();
        if tables.iter().any(|t| t.backend == table.backend) {
            tracing::warn!(
                kernel = table.name,
                backend = %table.backend,
                "kernel table registered twice"
            );
            self.rejected.push(KernelError::DuplicateTable {
                name: table.name.to_string(),
                backend: table.backend,
            });
            return self;
        }
        tables.push(table);
        self
    }

    /// Overrides the backend order tried for one kernel name. Backends left out are never used.
    pub fn set_priority(&mut self, name: &'static str, order: &[KernelBackend]) -> &mut Self {
        self.priorities.insert(name, order.to_vec());
        self
    }

    pub fn build(self) -> KernelRegistry {
        let KernelRegistryBuilder {
            mut tables,
            priorities,
            rejected,
        } = self;
        for (name, tables) in tables.iter_mut() {
            match priorities.get(name) {
                Some(order) => {
                    tables.retain(|table| order.contains(&table.backend));
                    tables.sort_by_key(|table| {
                        order
                            .iter()
                            .position(|backend| *backend == table.backend)
                            .unwrap_or(usize::MAX)
                    });
                }
                None => tables.sort_by_key(|table| std::cmp::Reverse(table.backend.priority())),
            }
        }
        KernelRegistry { tables, rejected }
    }
}

/// Read-only kernel tables, each name's tables ordered by selection priority.
#[derive(Default)]
pub struct KernelRegistry {
    tables: HashMap<&'static str, Vec<KernelTable>>,
    rejected: Vec<KernelError>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<KernelRegistry>> = OnceLock::new();

impl KernelRegistry {
    pub fn builder() -> KernelRegistryBuilder {
        KernelRegistryBuilder::default()
    }

    /// A fresh registry holding every table contributed through [`KERNEL_REGISTRARS`].
    pub fn with_registered() -> Self {
        let mut builder = Self::builder();
        for registrar in KERNEL_REGISTRARS {
            registrar(&mut builder);
        }
        builder.build()
    }

    pub fn global() -> Arc<KernelRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| {
            let registry = Self::with_registered();
            tracing::debug!(kernels = registry.tables.len(), "kernel registry initialized");
            Arc::new(registry)
        }))
    }

    /// Tables for `name` in the order the selector tries them.
    pub fn tables(&self, name: &str) -> &[KernelTable] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn kernel_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tables.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Tables refused during registration.
    pub fn rejected(&self) -> &[KernelError] {
        &self.rejected
    }
}
