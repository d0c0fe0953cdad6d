use std::env;
use std::sync::OnceLock;

pub const ENABLE_OPCHECK: &str = "VXGRAPH_ENABLE_OPCHECK";
pub const DISABLE_SHADER: &str = "VXGRAPH_DISABLE_SHADER";

static PROCESS_OVERRIDES: OnceLock<EnvOverrides> = OnceLock::new();

/// Graph settings taken from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `VXGRAPH_ENABLE_OPCHECK`, when set to a non-empty value.
    pub op_check: Option<bool>,
    pub disable_shader: bool,
}

impl EnvOverrides {
    /// Reads the variables now, bypassing the process snapshot.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        EnvOverrides {
            op_check: flag(ENABLE_OPCHECK).map(|value| parse_bool(&value)),
            disable_shader: flag(DISABLE_SHADER).is_some_and(|value| parse_bool(&value)),
        }
    }
}

/// Snapshot of the environment taken the first time a graph is built.
pub fn process_overrides() -> EnvOverrides {
    *PROCESS_OVERRIDES.get_or_init(|| {
        let overrides = EnvOverrides::from_env();
        if overrides != EnvOverrides::default() {
            tracing::info!(?overrides, "graph settings overridden from environment");
        }
        overrides
    })
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "On"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn empty_values_leave_settings_alone() {
        let overrides = EnvOverrides::from_lookup(|_| Some("  ".to_string()));
        assert_eq!(overrides, EnvOverrides::default());

        let overrides = EnvOverrides::from_lookup(|name| match name {
            ENABLE_OPCHECK => Some("off".to_string()),
            DISABLE_SHADER => Some("1".to_string()),
            _ => None,
        });
        assert_eq!(overrides.op_check, Some(false));
        assert!(overrides.disable_shader);
    }
}
