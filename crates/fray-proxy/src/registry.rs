//! Name-keyed set of proxies.

use crate::proxy::{Proxy, ProxyOptions, ProxySpec};
use crate::toxics::ToxicSpec;
use crate::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Toxics to attach to one existing proxy during bulk population.
///
/// ```json
/// {"name": "redis", "toxics": [{"name": "slow", "type": "latency", "stream": "downstream"}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyToxics {
    /// Proxy name.
    pub name: String,
    #[serde(default)]
    pub toxics: Vec<ToxicSpec>,
}

/// All proxies of one process, owned by the entry point.
pub struct Registry {
    proxies: Mutex<HashMap<String, Arc<Proxy>>>,
    options: ProxyOptions,
}

impl Registry {
    /// Create an empty registry whose proxies use `options`.
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Create a proxy, optionally starting it.
    ///
    /// # Errors
    /// * `ProxyError::DuplicateName` - a proxy with this name exists
    /// * any error from [`Proxy::start`]; the proxy is then not registered
    pub async fn add(&self, spec: ProxySpec, start: bool) -> Result<Arc<Proxy>> {
        let mut proxies = self.proxies.lock().await;
        if proxies.contains_key(&spec.name) {
            return Err(ProxyError::DuplicateName { name: spec.name });
        }
        let proxy = self.create(&spec, start).await?;
        proxies.insert(spec.name, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Create or replace a proxy.
    ///
    /// An existing proxy with the same listen and upstream addresses is kept
    /// as is, along with its toxics and live links. Otherwise the old proxy
    /// is stopped and removed before the new one is created.
    ///
    /// # Errors
    /// * any error from [`Proxy::start`]; the old proxy stays removed
    pub async fn add_or_replace(&self, spec: ProxySpec, start: bool) -> Result<Arc<Proxy>> {
        let mut proxies = self.proxies.lock().await;
        if let Some(existing) = proxies.get(&spec.name) {
            if existing.listen() == spec.listen && existing.upstream() == spec.upstream {
                debug!(proxy = %spec.name, "Proxy unchanged, keeping it");
                return Ok(Arc::clone(existing));
            }
            if let Some(old) = proxies.remove(&spec.name) {
                info!(proxy = %spec.name, "Replacing proxy");
                old.stop().await;
            }
        }
        let proxy = self.create(&spec, start).await?;
        proxies.insert(spec.name, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Stop and remove a proxy.
    ///
    /// # Errors
    /// * `ProxyError::NotFound` - no proxy with this name
    pub async fn remove(&self, name: &str) -> Result<()> {
        let proxy = self
            .proxies
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| not_found(name))?;
        proxy.stop().await;
        Ok(())
    }

    /// Look up a proxy.
    ///
    /// # Errors
    /// * `ProxyError::NotFound` - no proxy with this name
    pub async fn get(&self, name: &str) -> Result<Arc<Proxy>> {
        self.proxies
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    /// Snapshot of every proxy, ordered by name.
    pub async fn list(&self) -> BTreeMap<String, Arc<Proxy>> {
        self.proxies
            .lock()
            .await
            .iter()
            .map(|(name, proxy)| (name.clone(), Arc::clone(proxy)))
            .collect()
    }

    /// Stop and remove every proxy.
    pub async fn clear_all(&self) {
        let drained: Vec<Arc<Proxy>> = self.proxies.lock().await.drain().map(|(_, p)| p).collect();
        for proxy in drained {
            proxy.stop().await;
        }
    }

    /// Create proxies in bulk.
    ///
    /// Every spec is validated before anything changes. After that, specs
    /// are applied in order with [`Registry::add_or_replace`]; a failure
    /// stops the batch and leaves the proxies created so far in place.
    /// Specs without `enabled` are started.
    ///
    /// # Errors
    /// * `ProxyError::Validation` - a spec is invalid; nothing was changed
    /// * any error from [`Registry::add_or_replace`]
    pub async fn populate(&self, specs: Vec<ProxySpec>) -> Result<Vec<Arc<Proxy>>> {
        for spec in &specs {
            spec.validate()?;
        }
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            let start = spec.enabled.unwrap_or(true);
            created.push(self.add_or_replace(spec, start).await?);
        }
        Ok(created)
    }

    /// Attach toxics to existing proxies, stopping at the first failure.
    ///
    /// # Errors
    /// * `ProxyError::NotFound` - an entry names an unknown proxy
    /// * any error from [`crate::ToxicCollection::add`]
    pub async fn populate_toxics(&self, entries: Vec<ProxyToxics>) -> Result<()> {
        for entry in entries {
            let proxy = self.get(&entry.name).await?;
            for toxic in entry.toxics {
                proxy.toxics().add(toxic)?;
            }
        }
        Ok(())
    }

    /// Remove every toxic from every proxy.
    pub async fn reset_toxics(&self) {
        for proxy in self.proxies.lock().await.values() {
            proxy.toxics().clear();
        }
    }

    async fn create(&self, spec: &ProxySpec, start: bool) -> Result<Arc<Proxy>> {
        let proxy = Arc::new(Proxy::new(spec, self.options.clone()));
        if start {
            proxy.start().await?;
        }
        Ok(proxy)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ProxyOptions::default())
    }
}

fn not_found(name: &str) -> ProxyError {
    ProxyError::NotFound {
        name: name.to_string(),
    }
}
