use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::KernelBackend;

/// Per-kernel-name backend policies loaded from configuration.
///
/// Values are strings such as `"cpu"`, `"force=gpu"` or `"auto"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelOverrides {
    #[serde(flatten)]
    overrides: HashMap<String, BackendPolicy>,
}

impl KernelOverrides {
    /// Policy for `kernel`, [`BackendPolicy::Auto`] when nothing is configured.
    pub fn policy(&self, kernel: &str) -> BackendPolicy {
        self.overrides
            .get(kernel)
            .copied()
            .unwrap_or(BackendPolicy::Auto)
    }

    pub fn set(&mut self, kernel: impl Into<String>, policy: BackendPolicy) {
        self.overrides.insert(kernel.into(), policy);
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// How the selector chooses a backend for one kernel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendPolicy {
    /// Highest-priority backend the driver can run.
    #[default]
    Auto,
    /// Only this backend is considered.
    Force(KernelBackend),
}

impl<'de> Deserialize<'de> for BackendPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_policy_string(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for BackendPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            BackendPolicy::Auto => serializer.serialize_str("auto"),
            BackendPolicy::Force(backend) => {
                serializer.serialize_str(&format!("force={}", backend.name()))
            }
        }
    }
}

fn parse_policy_string(raw: &str) -> Result<BackendPolicy> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        return Ok(BackendPolicy::Auto);
    }
    let name = trimmed.strip_prefix("force=").unwrap_or(trimmed).trim();
    KernelBackend::parse(name)
        .map(BackendPolicy::Force)
        .ok_or_else(|| anyhow!("unknown kernel backend: {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_and_forced_backends() {
        let overrides: KernelOverrides = serde_json::from_value(json!({
            "one_hot": "cpu",
            "add": "force=gpu",
            "sigmoid": "auto",
        }))
        .expect("valid overrides");
        assert_eq!(
            overrides.policy("one_hot"),
            BackendPolicy::Force(KernelBackend::Cpu)
        );
        assert_eq!(
            overrides.policy("add"),
            BackendPolicy::Force(KernelBackend::GpuSource)
        );
        assert_eq!(overrides.policy("sigmoid"), BackendPolicy::Auto);
        assert_eq!(overrides.policy("concat"), BackendPolicy::Auto);
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = serde_json::from_value::<KernelOverrides>(json!({ "add": "force=tpu" }))
            .expect_err("unknown backend must fail");
        assert!(err.to_string().contains("unknown kernel backend"));
    }

    #[test]
    fn serializes_forced_policy() {
        let mut overrides = KernelOverrides::default();
        overrides.set("add", BackendPolicy::Force(KernelBackend::Primitive));
        let value = serde_json::to_value(&overrides).expect("serializable");
        assert_eq!(value, json!({ "add": "force=primitive" }));
    }
}
