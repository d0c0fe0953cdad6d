use vxgraph::Driver;
use vxgraph_backend_ref_cpu::HostDriver;
use vxgraph_backend_tests::define_driver_tests;

define_driver_tests!(host_driver, HostDriver::new);

#[test]
fn host_driver_is_registered_by_name() {
    assert!(vxgraph::has_driver("host"));
    assert!(vxgraph::has_driver("cpu"));
    let driver = vxgraph::create_driver("host").expect("host driver registered");
    assert_eq!(driver.name(), "host");
    assert!(!driver.capabilities().shader);
}
