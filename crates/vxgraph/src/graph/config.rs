use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::env::{self, EnvOverrides};
use crate::kernel::KernelOverrides;
use crate::node::PreloadPolicy;

/// Build options of a [`Graph`](super::Graph).
///
/// Every field has a default, so a JSON document only names what it changes:
///
/// ```json
/// { "kernel_cache_size": 32, "kernel_overrides": { "one_hot": "force=cpu" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Run operator legality tables during check.
    pub enable_op_constraint_check: bool,
    /// Order nodes topologically before setup. When off, insertion order is validated instead.
    pub sort_nodes: bool,
    pub kernel_cache_size: usize,
    pub preload: PreloadPolicy,
    pub kernel_overrides: KernelOverrides,
    /// Never pick shader kernels, whatever the driver supports.
    pub disable_shader: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            enable_op_constraint_check: true,
            sort_nodes: true,
            kernel_cache_size: 128,
            preload: PreloadPolicy::Auto,
            kernel_overrides: KernelOverrides::default(),
            disable_shader: false,
        }
    }
}

impl GraphConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid graph config")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read graph config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("in {}", path.display()))
    }

    /// Applies `VXGRAPH_ENABLE_OPCHECK` and `VXGRAPH_DISABLE_SHADER` as read when the
    /// first graph of the process was built. Every graph applies this to its config.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(env::process_overrides())
    }

    pub fn with_overrides(mut self, overrides: EnvOverrides) -> Self {
        if let Some(enabled) = overrides.op_check {
            self.enable_op_constraint_check = enabled;
        }
        if overrides.disable_shader {
            self.disable_shader = true;
        }
        self
    }
}
