//! Directory of running plugins, keyed by logical name

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Plugin;
use crate::error::{PluginError, Result};

#[derive(Default)]
pub struct HostRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = name.into();
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&name) {
            return Err(PluginError::AlreadyRegistered(name));
        }
        plugins.insert(name, plugin);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Remove a plugin and stop it. The stop runs after the lock is released.
    pub async fn stop_one(&self, name: &str) -> Result<()> {
        let plugin = self
            .plugins
            .write()
            .await
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        info!(plugin = %name, "stopping plugin");
        plugin.stop().await
    }

    /// Remove and stop every plugin. Failures are logged, not returned.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, Arc<dyn Plugin>)> = self.plugins.write().await.drain().collect();

        for (name, plugin) in drained {
            if let Err(e) = plugin.stop().await {
                warn!(plugin = %name, error = %e, "failed to stop plugin");
            }
        }
    }

    /// Start every registered plugin in name order, stopping at the first failure.
    pub async fn start_all(&self, token: &CancellationToken) -> Result<()> {
        let mut plugins: Vec<(String, Arc<dyn Plugin>)> = self
            .plugins
            .read()
            .await
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.clone()))
            .collect();
        plugins.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, plugin) in plugins {
            plugin
                .start(token.child_token())
                .await
                .map_err(|e| PluginError::StartFailed {
                    name,
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::MockPlugin;
    use mockall::Sequence;

    fn idle(name: &'static str) -> MockPlugin {
        let mut plugin = MockPlugin::new();
        plugin.expect_name().return_const(name.to_string());
        plugin
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = HostRegistry::new();
        registry.register("projects", Arc::new(idle("projects"))).await.unwrap();

        assert_eq!(registry.get("projects").await.unwrap().name(), "projects");
        assert!(matches!(registry.get("missing").await, Err(PluginError::NotFound(_))));
        assert_eq!(registry.names().await, vec!["projects".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let registry = HostRegistry::new();
        registry.register("projects", Arc::new(idle("projects"))).await.unwrap();

        let err = registry
            .register("projects", Arc::new(idle("projects")))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(name) if name == "projects"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stop_one_removes_and_stops() {
        let registry = HostRegistry::new();
        let mut plugin = idle("projects");
        plugin.expect_stop().times(1).returning(|| Ok(()));
        registry.register("projects", Arc::new(plugin)).await.unwrap();

        registry.stop_one("projects").await.unwrap();
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.stop_one("projects").await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_all_in_name_order_stops_at_first_failure() {
        let registry = HostRegistry::new();
        let mut seq = Sequence::new();

        let mut alpha = idle("alpha");
        alpha
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut beta = idle("beta");
        beta.expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(PluginError::HandshakeFailed("bad cookie".into())));
        let mut gamma = idle("gamma");
        gamma.expect_start().times(0);

        registry.register("gamma", Arc::new(gamma)).await.unwrap();
        registry.register("beta", Arc::new(beta)).await.unwrap();
        registry.register("alpha", Arc::new(alpha)).await.unwrap();

        let err = registry.start_all(&CancellationToken::new()).await.unwrap_err();
        match err {
            PluginError::StartFailed { name, source } => {
                assert_eq!(name, "beta");
                assert!(matches!(*source, PluginError::HandshakeFailed(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_all_continues_past_failures() {
        let registry = HostRegistry::new();

        let mut broken = idle("broken");
        broken
            .expect_stop()
            .times(1)
            .returning(|| Err(PluginError::Internal("kill failed".into())));
        let mut healthy = idle("healthy");
        healthy.expect_stop().times(1).returning(|| Ok(()));

        registry.register("broken", Arc::new(broken)).await.unwrap();
        registry.register("healthy", Arc::new(healthy)).await.unwrap();

        registry.stop_all().await;
        assert!(registry.is_empty().await);
    }
}
