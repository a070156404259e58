//! Engine configuration from environment variables.
//!
//! Precedence: environment variable, then built-in default. Unrecognized
//! entries are skipped rather than rejected.

use tracing::warn;

use crate::backend::{BackendId, BackendRegistry};
use crate::logging::LogSeverity;

/// Id of the bundled reference CPU backend.
pub const REF_BACKEND: BackendId = BackendId("CpuRef");
/// Id of the bundled staged accelerator backend.
pub const ACCEL_BACKEND: BackendId = BackendId("Accel");

/// Comma-separated backend preference, e.g. `accel,ref`.
pub const BACKENDS_ENV: &str = "NX_BACKENDS";
/// Log severity name, e.g. `info`.
pub const LOG_ENV: &str = "NX_LOG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Backends in the order the loader should try them.
    pub backend_preference: Vec<BackendId>,
    pub log_severity: LogSeverity,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_preference: vec![ACCEL_BACKEND, REF_BACKEND],
            log_severity: LogSeverity::Warning,
        }
    }
}

impl EngineConfig {
    /// Read `NX_BACKENDS` and `NX_LOG` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup(BACKENDS_ENV) {
            let mut preference = Vec::new();
            for name in val.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match parse_backend(name) {
                    Some(id) if !preference.contains(&id) => preference.push(id),
                    Some(_) => {}
                    None => warn!(entry = name, "ignoring unknown backend in {BACKENDS_ENV}"),
                }
            }
            if !preference.is_empty() {
                config.backend_preference = preference;
            }
        }

        if let Some(val) = lookup(LOG_ENV) {
            match val.parse() {
                Ok(severity) => config.log_severity = severity,
                Err(_) => warn!(value = %val, "ignoring unknown severity in {LOG_ENV}"),
            }
        }

        config
    }

    /// Order `registry` by this configuration's backend preference.
    pub fn apply(&self, registry: &mut BackendRegistry) {
        registry.set_preference(&self.backend_preference);
    }
}

fn parse_backend(name: &str) -> Option<BackendId> {
    match name.to_ascii_lowercase().as_str() {
        "ref" | "cpuref" | "cpu" => Some(REF_BACKEND),
        "accel" | "acc" => Some(ACCEL_BACKEND),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.backend_preference, vec![ACCEL_BACKEND, REF_BACKEND]);
        assert_eq!(c.log_severity, LogSeverity::Warning);
    }

    #[test]
    fn test_backend_list_parsed() {
        let c = config(&[(BACKENDS_ENV, "Ref, gpu, ref,accel")]);
        assert_eq!(c.backend_preference, vec![REF_BACKEND, ACCEL_BACKEND]);
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let c = config(&[(BACKENDS_ENV, "tpu"), (LOG_ENV, "loud")]);
        assert_eq!(c, EngineConfig::default());

        let c = config(&[(LOG_ENV, "debug")]);
        assert_eq!(c.log_severity, LogSeverity::Debug);
    }
}
