use crate::config::PluginHostConfig;
use crate::error::{ConfigError, PluginError, Result};
use crate::host::HostManager;
use crate::plugin::Plugin;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Validate the configuration and every plugin binary. With `start`, also launch each
/// plugin, complete the handshake and stop it again.
pub async fn run_config_check(config: PluginHostConfig, base_dir: &Path, start: bool) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    if !config.plugins.enabled {
        warn!("! Plugins are disabled; every plugin subgraph will use the disabled data source");
    }

    info!("Checking {} plugin(s)...", config.plugins.plugins.len());

    let manager = HostManager::new(config.plugins.clone(), base_dir).with_startup(config.startup_config());
    let mut all_ok = true;

    for entry in &config.plugins.plugins {
        let plugin_config = manager.plugin_config(entry);
        info!("\nChecking plugin: {}", entry.name);
        info!(
            "  Command: {} {}",
            plugin_config.descriptor.path.display(),
            plugin_config.descriptor.launch_command.join(" ")
        );

        if let Err(e) = plugin_config.descriptor.validate() {
            error!("  ✗ Invalid plugin binary: {}", e);
            all_ok = false;
            continue;
        }
        info!("  ✓ Plugin binary is valid");

        if start {
            match check_start(plugin_config).await {
                Ok(()) => info!("  ✓ Handshake succeeded"),
                Err(e) => {
                    error!("  ✗ Handshake failed: {}", e);
                    all_ok = false;
                }
            }
        }
    }

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(PluginError::Config(ConfigError::Validation(
            "One or more plugins failed checks".to_string(),
        )))
    }
}

async fn check_start(config: crate::plugin::ProcessPluginConfig) -> Result<()> {
    let plugin = crate::plugin::ProcessPlugin::new(config);
    let token = CancellationToken::new();
    let result = plugin.start(token.clone()).await;
    token.cancel();
    plugin.stop().await?;
    result
}
