use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plugin::descriptor::{resolve_plugin_path, PluginDescriptor};
use crate::plugin::startup::{Exporter, IpAnonymization, StartupConfig, TelemetryStartup, TracingStartup};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHostConfig {
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Tracing settings handed to every plugin at launch.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub ip_anonymization: Option<IpAnonymization>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    #[serde(default)]
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub exporters: Vec<ExporterConfig>,
    #[serde(default)]
    pub propagators: Vec<String>,
    #[serde(default = "default_sampler")]
    pub sampler: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(flatten)]
    pub exporter: Exporter,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exporters: Vec::new(),
            propagators: Vec::new(),
            sampler: default_sampler(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sampler() -> f64 {
    1.0
}

impl PluginHostConfig {
    /// What each plugin receives at launch. Tracing is left out when it is disabled
    /// or has no exporters; disabled exporters are dropped.
    pub fn startup_config(&self) -> StartupConfig {
        let tracing = &self.telemetry.tracing;
        let telemetry = (tracing.enabled && !tracing.exporters.is_empty()).then(|| TelemetryStartup {
            tracing: Some(TracingStartup {
                exporters: tracing
                    .exporters
                    .iter()
                    .filter(|e| !e.disabled)
                    .map(|e| e.exporter.clone())
                    .collect(),
                propagators: tracing.propagators.clone(),
                sampler: tracing.sampler,
            }),
        });

        StartupConfig {
            telemetry,
            ip_anonymization: self.ip_anonymization.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base directory for plugins without an explicit path.
    #[serde(default = "default_plugin_path")]
    pub path: PathBuf,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Inbound request headers forwarded to every plugin call.
    #[serde(default)]
    pub forward_headers: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_plugin_path(),
            handshake_timeout_ms: default_handshake_timeout(),
            forward_headers: Vec::new(),
            plugins: Vec::new(),
        }
    }
}

fn default_plugin_path() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_handshake_timeout() -> u64 {
    10_000
}

impl PluginsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Descriptor for one entry. Entries without a path use the conventional layout
    /// under `path`; relative paths resolve against `base_dir`.
    pub fn descriptor(&self, entry: &PluginEntry, base_dir: &Path) -> PluginDescriptor {
        let path = entry
            .path
            .clone()
            .unwrap_or_else(|| resolve_plugin_path(&self.path, &entry.name));

        let mut descriptor = PluginDescriptor::new(&entry.name, path).with_args(entry.args.iter().cloned());
        descriptor.env = entry.env.clone();
        descriptor.resolve(base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: PluginHostConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.plugins.enabled);
        assert_eq!(config.plugins.path, PathBuf::from("plugins"));
        assert_eq!(config.plugins.handshake_timeout(), Duration::from_secs(10));
        assert!(config.plugins.plugins.is_empty());
        assert!(config.telemetry.tracing.enabled);
        assert_eq!(config.startup_config(), StartupConfig::default());
    }

    #[test]
    fn test_startup_config_keeps_enabled_exporters_only() {
        let config: PluginHostConfig = serde_json::from_value(serde_json::json!({
            "telemetry": { "tracing": {
                "exporters": [
                    { "endpoint": "http://collector:4318", "httpPath": "/v1/traces" },
                    { "endpoint": "http://old:4318", "disabled": true }
                ],
                "propagators": ["tracecontext", "baggage"],
                "sampler": 0.5
            }},
            "ipAnonymization": { "enabled": true, "method": "hash" }
        }))
        .unwrap();

        let startup = config.startup_config();
        let tracing = startup.tracing().unwrap();
        assert_eq!(tracing.exporters.len(), 1);
        assert_eq!(tracing.exporters[0].endpoint, "http://collector:4318");
        assert_eq!(tracing.exporters[0].http_path.as_deref(), Some("/v1/traces"));
        assert_eq!(tracing.propagators, vec!["tracecontext".to_string(), "baggage".to_string()]);
        assert_eq!(tracing.sampler, 0.5);
        assert_eq!(startup.ip_anonymization.unwrap().method, "hash");
    }

    #[test]
    fn test_disabled_tracing_is_not_handed_over() {
        let config: PluginHostConfig = serde_json::from_value(serde_json::json!({
            "telemetry": { "tracing": {
                "enabled": false,
                "exporters": [{ "endpoint": "http://collector:4318" }]
            }}
        }))
        .unwrap();

        assert!(config.startup_config().telemetry.is_none());
    }

    #[test]
    fn test_descriptor_paths() {
        let config: PluginsConfig = serde_json::from_str(
            r#"{
                "enabled": true,
                "path": "plugins",
                "plugins": [
                    { "name": "projects" },
                    { "name": "users", "path": "/opt/users-plugin", "args": ["--fast"] }
                ]
            }"#,
        )
        .unwrap();
        let base = Path::new("/srv/router");

        let conventional = config.descriptor(&config.plugins[0], base);
        assert!(conventional.path.starts_with("/srv/router/plugins/projects/bin"));

        let explicit = config.descriptor(&config.plugins[1], base);
        assert_eq!(explicit.path, PathBuf::from("/opt/users-plugin"));
        assert_eq!(explicit.launch_command, vec!["--fast".to_string()]);
        assert_eq!(explicit.logical_name, "users");
    }
}
