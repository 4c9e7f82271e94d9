//! Settings handed to every plugin process at launch
//!
//! The host serializes a [`StartupConfig`] as JSON into [`STARTUP_CONFIG_ENV`] in the
//! child environment. The plugin server parses it back before serving so handlers can
//! set up their own tracing exporters and apply the host's IP anonymization policy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ConfigError, PluginError, Result};

/// Environment variable carrying the JSON-encoded startup config.
pub const STARTUP_CONFIG_ENV: &str = "PLUGIN_STARTUP_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryStartup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_anonymization: Option<IpAnonymization>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStartup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingStartup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingStartup {
    #[serde(default)]
    pub exporters: Vec<Exporter>,
    #[serde(default)]
    pub propagators: Vec<String>,
    /// Fraction of traces sampled, 0.0 to 1.0.
    #[serde(default = "default_sampler")]
    pub sampler: f64,
}

/// One span exporter the plugin should report to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exporter {
    #[serde(default = "default_exporter")]
    pub exporter: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAnonymization {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub method: String,
}

fn default_sampler() -> f64 {
    1.0
}

fn default_exporter() -> String {
    "http".to_string()
}

impl StartupConfig {
    /// Value placed in [`STARTUP_CONFIG_ENV`].
    pub fn to_env_value(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PluginError::Launch(format!("cannot encode startup config: {e}")))
    }

    /// Parse the variable's value. A missing variable means a host that sends nothing.
    pub fn from_env_value(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                PluginError::Config(ConfigError::Parse(format!("invalid {STARTUP_CONFIG_ENV}: {e}")))
            }),
        }
    }

    /// Read the config the host passed to this process.
    pub fn from_env() -> Result<Self> {
        Self::from_env_value(std::env::var(STARTUP_CONFIG_ENV).ok().as_deref())
    }

    pub fn tracing(&self) -> Option<&TracingStartup> {
        self.telemetry.as_ref().and_then(|t| t.tracing.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StartupConfig {
        StartupConfig {
            telemetry: Some(TelemetryStartup {
                tracing: Some(TracingStartup {
                    exporters: vec![Exporter {
                        exporter: "grpc".into(),
                        endpoint: "http://collector:4317".into(),
                        headers: BTreeMap::from([("authorization".to_string(), "Bearer t".to_string())]),
                        batch_timeout_ms: Some(5000),
                        ..Default::default()
                    }],
                    propagators: vec!["tracecontext".into()],
                    sampler: 0.25,
                }),
            }),
            ip_anonymization: Some(IpAnonymization {
                enabled: true,
                method: "redact".into(),
            }),
        }
    }

    #[test]
    fn test_missing_or_blank_value_is_empty_config() {
        assert_eq!(StartupConfig::from_env_value(None).unwrap(), StartupConfig::default());
        assert_eq!(StartupConfig::from_env_value(Some("  ")).unwrap(), StartupConfig::default());
        assert!(StartupConfig::default().tracing().is_none());
    }

    #[test]
    fn test_env_value_uses_camel_case_keys() {
        let value = sample().to_env_value().unwrap();
        let json: serde_json::Value = serde_json::from_str(&value).unwrap();

        assert_eq!(json["ipAnonymization"]["method"], "redact");
        let exporter = &json["telemetry"]["tracing"]["exporters"][0];
        assert_eq!(exporter["batchTimeoutMs"], 5000);
        assert!(exporter.get("httpPath").is_none());
        assert_eq!(StartupConfig::from_env_value(Some(&value)).unwrap(), sample());
    }

    #[test]
    fn test_defaults_fill_sparse_input() {
        let config =
            StartupConfig::from_env_value(Some(r#"{"telemetry":{"tracing":{"exporters":[{"endpoint":"http://c"}]}}}"#))
                .unwrap();
        let tracing = config.tracing().unwrap();
        assert_eq!(tracing.sampler, 1.0);
        assert_eq!(tracing.exporters[0].exporter, "http");
        assert!(config.ip_anonymization.is_none());
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let err = StartupConfig::from_env_value(Some("{not json")).unwrap_err();
        assert!(matches!(err, PluginError::Config(ConfigError::Parse(ref msg)) if msg.contains(STARTUP_CONFIG_ENV)));
    }
}
