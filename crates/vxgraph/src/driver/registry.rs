//! Runtime driver registry for selecting drivers by name.
//!
//! Driver crates register constructors either by calling [`register_driver`] or by adding a
//! registrar to [`DRIVER_REGISTRARS`], which runs the first time the registry is queried.

use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock, PoisonError, RwLock};

use super::Driver;

/// Factory that creates a new driver instance.
pub type DriverConstructor = Box<dyn Fn() -> Arc<dyn Driver> + Send + Sync>;

/// Registrars contributed by driver crates.
#[linkme::distributed_slice]
pub static DRIVER_REGISTRARS: [fn()] = [..];

struct DriverRegistry {
    drivers: RwLock<HashMap<String, DriverConstructor>>,
}

impl DriverRegistry {
    fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: DriverConstructor) {
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Arc<dyn Driver>> {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        let constructor = drivers.get(name)?;
        Some(constructor())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();
static RUN_REGISTRARS: Once = Once::new();

fn global_registry() -> &'static DriverRegistry {
    GLOBAL_REGISTRY.get_or_init(DriverRegistry::new)
}

fn populated_registry() -> &'static DriverRegistry {
    RUN_REGISTRARS.call_once(|| {
        for registrar in DRIVER_REGISTRARS {
            registrar();
        }
    });
    global_registry()
}

/// Register a driver by name. Registering an existing name replaces its constructor.
pub fn register_driver<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn Driver> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Create a driver instance by name, or `None` if nothing registered it.
pub fn create_driver(name: &str) -> Option<Arc<dyn Driver>> {
    populated_registry().create(name)
}

/// Registered driver names, sorted.
pub fn list_drivers() -> Vec<String> {
    populated_registry().list()
}

pub fn has_driver(name: &str) -> bool {
    populated_registry().contains(name)
}
