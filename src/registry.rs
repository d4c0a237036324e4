//! Maps inbound hostnames to the adapter that serves them

use crate::adapter::{Adapter, AdapterSnapshot};
use crate::config::{AdapterConfig, Config};
use crate::error::StopReason;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// All configured apps, keyed by their lowercased base hostname.
///
/// A request for `api.myapp.test` is served by the app registered for
/// `myapp.test` unless an exact entry exists.
pub struct AppRegistry {
    apps: BTreeMap<String, Arc<Adapter>>,
}

impl AppRegistry {
    pub fn new(configs: Vec<AdapterConfig>) -> Self {
        let apps = configs
            .into_iter()
            .map(|config| (config.host.clone(), Adapter::new(config)))
            .collect();
        Self { apps }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(config.adapter_configs()?))
    }

    /// Find the app for a request hostname: exact match first, then the
    /// longest registered host that `host` is a subdomain of.
    pub fn find(&self, host: &str) -> Option<Arc<Adapter>> {
        let host = host.split(':').next().unwrap_or(host).trim_end_matches('.');
        let host = host.to_lowercase();

        if let Some(app) = self.apps.get(&host) {
            return Some(Arc::clone(app));
        }

        self.apps
            .iter()
            .filter(|(base, _)| {
                host.len() > base.len()
                    && host.ends_with(base.as_str())
                    && host.as_bytes()[host.len() - base.len() - 1] == b'.'
            })
            .max_by_key(|(base, _)| base.len())
            .map(|(_, app)| Arc::clone(app))
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<Adapter>> {
        self.apps.values()
    }

    /// Snapshots of every app, ordered by host
    pub fn list(&self) -> Vec<AdapterSnapshot> {
        self.apps.values().map(|app| app.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Stop every app concurrently and wait for all of them
    pub async fn stop_all(&self) {
        info!(count = self.apps.len(), "Stopping all apps");

        let mut handles = Vec::new();
        for app in self.apps.values() {
            let app = Arc::clone(app);
            handles.push(tokio::spawn(async move {
                if let Err(e) = app.stop(StopReason::requested("shutdown")).await {
                    error!(host = %app.host(), error = %e, "Failed to stop app");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}
