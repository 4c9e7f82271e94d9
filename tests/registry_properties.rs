//! Property-based tests for HostRegistry under concurrent lookups and stops

use async_trait::async_trait;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use plugin_host::error::PluginError;
use plugin_host::plugin::{HostRegistry, Plugin};
use plugin_host::rpc::RpcClient;

#[derive(Default)]
struct CountingPlugin {
    name: String,
    stops: AtomicUsize,
}

#[async_trait]
impl Plugin for CountingPlugin {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self, _token: CancellationToken) -> plugin_host::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> plugin_host::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }

    fn client(&self) -> Option<Arc<dyn RpcClient>> {
        None
    }
}

fn same_instance(found: &Arc<dyn Plugin>, expected: &Arc<CountingPlugin>) -> bool {
    std::ptr::eq(Arc::as_ptr(found) as *const (), Arc::as_ptr(expected) as *const ())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Names come back sorted and unique; a second registration under a taken name fails
    #[test]
    fn names_are_sorted_and_unique(names in prop::collection::vec("[a-z]{1,8}", 1..12)) {
        let rt = runtime();
        rt.block_on(async {
            let registry = HostRegistry::new();
            let mut expected = BTreeSet::new();

            for name in &names {
                let plugin = Arc::new(CountingPlugin { name: name.clone(), ..Default::default() });
                let result = registry.register(name.clone(), plugin).await;
                if expected.insert(name.clone()) {
                    prop_assert!(result.is_ok());
                } else {
                    prop_assert!(matches!(result, Err(PluginError::AlreadyRegistered(_))));
                }
            }

            prop_assert_eq!(registry.names().await, expected.into_iter().collect::<Vec<_>>());
            Ok(())
        })?;
    }

    // Lookups racing a stop see either the registered instance or NotFound, and the plugin is
    // stopped once
    #[test]
    fn stop_races_lookups_cleanly(readers in 1usize..16, stoppers in 1usize..4) {
        let rt = runtime();
        rt.block_on(async {
            let registry = Arc::new(HostRegistry::new());
            let plugin = Arc::new(CountingPlugin { name: "projects".into(), ..Default::default() });
            registry.register("projects", plugin.clone()).await.unwrap();

            let mut tasks = Vec::new();
            for _ in 0..readers {
                let registry = registry.clone();
                let expected = plugin.clone();
                tasks.push(tokio::spawn(async move {
                    match registry.get("projects").await {
                        Ok(found) => same_instance(&found, &expected),
                        Err(PluginError::NotFound(_)) => true,
                        Err(_) => false,
                    }
                }));
            }
            let mut stops = Vec::new();
            for _ in 0..stoppers {
                let registry = registry.clone();
                stops.push(tokio::spawn(async move { registry.stop_one("projects").await.is_ok() }));
            }

            for task in tasks {
                prop_assert!(task.await.unwrap());
            }
            let succeeded = futures::future::join_all(stops)
                .await
                .into_iter()
                .filter(|r| matches!(r, Ok(true)))
                .count();

            prop_assert_eq!(succeeded, 1);
            prop_assert_eq!(plugin.stops.load(Ordering::SeqCst), 1);
            prop_assert!(matches!(registry.get("projects").await, Err(PluginError::NotFound(_))));
            prop_assert!(registry.is_empty().await);
            Ok(())
        })?;
    }

    // stop_all drains everything and stops each plugin exactly once
    #[test]
    fn stop_all_stops_each_plugin_once(count in 0usize..10) {
        let rt = runtime();
        rt.block_on(async {
            let registry = HostRegistry::new();
            let mut plugins = Vec::new();
            for i in 0..count {
                let plugin = Arc::new(CountingPlugin { name: format!("p{i}"), ..Default::default() });
                registry.register(format!("p{i}"), plugin.clone()).await.unwrap();
                plugins.push(plugin);
            }

            registry.stop_all().await;
            registry.stop_all().await;

            prop_assert!(registry.is_empty().await);
            for plugin in &plugins {
                prop_assert_eq!(plugin.stops.load(Ordering::SeqCst), 1);
            }
            Ok(())
        })?;
    }
}
