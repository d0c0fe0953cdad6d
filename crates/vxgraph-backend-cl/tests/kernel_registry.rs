use std::collections::HashSet;

use vxgraph::kernel::{KernelBackend, KernelRegistry};
use vxgraph_backend_cl::kernels::source_text;
use vxgraph_backend_cl::{builtin_kernel_sources, builtin_kernel_specs, register_gpu_kernels};

#[test]
fn builtin_kernel_registry_has_unique_ids_and_symbols() {
    let kernels = builtin_kernel_specs();
    assert!(!kernels.is_empty(), "builtin kernel registry is empty");

    let mut ids = HashSet::new();
    let mut symbols = HashSet::new();
    let mut keys = HashSet::new();
    for kernel in kernels {
        assert!(
            ids.insert(kernel.id.clone()),
            "duplicate kernel id in registry: {}",
            kernel.id
        );
        assert!(
            symbols.insert(kernel.symbol.clone()),
            "duplicate kernel symbol in registry: {}",
            kernel.symbol
        );
        assert!(
            keys.insert((kernel.kernel.clone(), kernel.key)),
            "duplicate key {:#x} in table {}",
            kernel.key,
            kernel.kernel
        );
    }
}

#[test]
fn every_symbol_is_defined_in_its_source() {
    for kernel in builtin_kernel_specs() {
        let source = source_text(&kernel.source_id)
            .unwrap_or_else(|| panic!("unknown source id {}", kernel.source_id));
        assert!(
            source.contains(&kernel.symbol),
            "{} not found in source {}",
            kernel.symbol,
            kernel.source_id
        );
    }
}

#[test]
fn builtin_kernel_sources_are_non_empty() {
    for (idx, source) in builtin_kernel_sources().iter().enumerate() {
        assert!(
            !source.trim().is_empty(),
            "builtin kernel source at index {idx} is empty"
        );
    }
}

#[test]
fn specs_serialize_to_json() {
    let specs = builtin_kernel_specs();
    let json = serde_json::to_string(&specs).unwrap();
    let parsed: Vec<vxgraph_backend_cl::KernelSpec> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.len(), specs.len());
    assert_eq!(parsed[0].symbol, "one_hot_I32toI32");
}

#[test]
fn tables_register_cleanly() {
    let mut builder = KernelRegistry::builder();
    register_gpu_kernels(&mut builder);
    let registry = builder.build();
    assert!(registry.rejected().is_empty());
    assert_eq!(registry.kernel_names(), vec!["add", "one_hot", "sigmoid"]);
    assert!(registry
        .tables("one_hot")
        .iter()
        .all(|table| table.backend == KernelBackend::GpuSource));
}
