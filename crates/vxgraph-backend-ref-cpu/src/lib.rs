mod driver;
pub mod kernels;

use std::sync::Arc;

use vxgraph::Driver;

pub use driver::HostDriver;
pub use kernels::register_cpu_kernels;

/// Register the host driver with the global driver registry.
///
/// Runs automatically the first time the registry is queried, but can also be called
/// manually. The driver is registered under both "host" and "cpu".
pub fn register_host_driver() {
    vxgraph::register_driver("host", || {
        Arc::new(HostDriver::new()) as Arc<dyn Driver>
    });
    vxgraph::register_driver("cpu", || {
        Arc::new(HostDriver::new()) as Arc<dyn Driver>
    });
}

#[vxgraph::linkme::distributed_slice(vxgraph::driver::DRIVER_REGISTRARS)]
#[linkme(crate = vxgraph::linkme)]
static REGISTER_HOST_DRIVER: fn() = register_host_driver;
