use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{PluginEntry, PluginsConfig};
use crate::datasource::{select_data_source, DataSource};
use crate::error::Result;
use crate::plugin::{HostRegistry, Plugin, ProcessPlugin, ProcessPluginConfig, StartupConfig};
use crate::propagation::{ContextPropagationInterceptor, HeaderForwardingPolicy, Interceptor};

/// Outcome of starting the configured plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartSummary {
    pub started: Vec<String>,
    /// Plugins that failed to start. Their subgraphs use the disabled data source.
    pub failed: Vec<String>,
}

/// Owns the registry for one host process and wires plugins from configuration.
pub struct HostManager {
    config: PluginsConfig,
    base_dir: PathBuf,
    registry: Arc<HostRegistry>,
    interceptor: Arc<dyn Interceptor>,
    startup: StartupConfig,
}

impl HostManager {
    pub fn new(config: PluginsConfig, base_dir: impl Into<PathBuf>) -> Self {
        let policy = HeaderForwardingPolicy::new(&config.forward_headers);
        Self {
            interceptor: Arc::new(ContextPropagationInterceptor::with_policy(policy)),
            config,
            base_dir: base_dir.into(),
            registry: Arc::new(HostRegistry::new()),
            startup: StartupConfig::default(),
        }
    }

    /// Settings handed to every plugin this manager launches.
    pub fn with_startup(mut self, startup: StartupConfig) -> Self {
        self.startup = startup;
        self
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn plugin_config(&self, entry: &PluginEntry) -> ProcessPluginConfig {
        ProcessPluginConfig::new(self.config.descriptor(entry, &self.base_dir))
            .with_handshake_timeout(self.config.handshake_timeout())
            .with_interceptor(self.interceptor.clone())
            .with_startup(self.startup.clone())
    }

    /// Register and start every configured plugin. Nothing happens when plugins are
    /// disabled. A plugin that fails to start is removed again so only its own
    /// subgraph falls back.
    pub async fn start(&self, token: &CancellationToken) -> Result<StartSummary> {
        let mut summary = StartSummary::default();
        if !self.config.enabled {
            tracing::info!("Plugins disabled");
            return Ok(summary);
        }

        for entry in &self.config.plugins {
            let plugin: Arc<dyn Plugin> = Arc::new(ProcessPlugin::new(self.plugin_config(entry)));
            self.registry.register(entry.name.clone(), plugin.clone()).await?;

            match plugin.start(token.child_token()).await {
                Ok(()) => summary.started.push(entry.name.clone()),
                Err(e) => {
                    tracing::warn!(plugin = %entry.name, error = %e, "Plugin failed to start, using disabled data source");
                    if let Err(e) = self.registry.stop_one(&entry.name).await {
                        tracing::warn!(plugin = %entry.name, error = %e, "Failed to clean up plugin");
                    }
                    summary.failed.push(entry.name.clone());
                }
            }
        }

        tracing::info!(
            started = summary.started.len(),
            failed = summary.failed.len(),
            "Plugin host started"
        );
        Ok(summary)
    }

    /// Data source for the subgraph served by plugin `name`.
    pub async fn data_source(&self, name: &str, method: &str) -> Arc<dyn DataSource> {
        select_data_source(&self.registry, self.config.enabled, name, method).await
    }

    pub async fn stop(&self) {
        self.registry.stop_all().await;
        tracing::info!("Plugin host stopped");
    }

    /// Start everything, wait for `shutdown`, then stop everything.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.start(&shutdown).await?;
        shutdown.cancelled().await;
        self.stop().await;
        Ok(())
    }
}
