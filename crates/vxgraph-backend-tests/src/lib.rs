//! Driver conformance checks shared by the vxgraph backend crates.

pub mod recording_driver;
pub mod smoke;

pub use recording_driver::RecordingDriver;

/// Routes `tracing` output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[macro_export]
macro_rules! define_driver_tests {
    ($module:ident, $driver_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use std::sync::Arc;

            use $crate::smoke;

            #[test]
            fn smoke_buffer_roundtrip() {
                $crate::init_tracing();
                let driver = Arc::new(($driver_ctor)());
                smoke::buffer_roundtrip(&driver);
            }

            #[test]
            fn smoke_views_share_parent_storage() {
                $crate::init_tracing();
                let driver = Arc::new(($driver_ctor)());
                smoke::views_share_parent_storage(&driver);
            }

            #[test]
            fn smoke_kernel_node_lifecycle() {
                $crate::init_tracing();
                let driver = Arc::new(($driver_ctor)());
                smoke::kernel_node_lifecycle(&driver);
            }

            #[test]
            fn smoke_graph_add_matches_expected() {
                $crate::init_tracing();
                smoke::graph_add_matches_expected(Arc::new(($driver_ctor)()));
            }

            #[test]
            fn smoke_composite_postprocess_matches_expected() {
                $crate::init_tracing();
                smoke::composite_postprocess_matches_expected(Arc::new(($driver_ctor)()));
            }
        }
    };
}
