//! Per-proxy toxic chains.
//!
//! Each direction holds an immutable [`ToxicChain`] behind an `ArcSwap`.
//! Writers serialize on a mutex, build a new chain and publish it with a
//! higher version; streams load the current chain once per chunk without
//! taking any lock. A `watch` channel per direction carries the latest
//! version so idle streams can pick up a new chain without waiting for
//! traffic.
//!
//! ```text
//! add/remove/update/clear --lock--> build Vec --store--> ArcSwap<ToxicChain>
//!                                        |                    |
//!                                        +--> watch<u64>      |
//!                                               |             |
//! Stream read loop <------- changed() ----------+             |
//!                  <------------------------ load_full -------+
//! ```

use crate::toxics::{Attributes, Direction, ToxicSpec, ToxicWrapper};
use crate::{ProxyError, Result};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Immutable, versioned view of one direction's toxics.
#[derive(Debug, Default)]
pub struct ToxicChain {
    version: u64,
    toxics: Vec<Arc<ToxicWrapper>>,
}

impl ToxicChain {
    /// Monotonically increasing per collection; bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All toxics in application order, disabled ones included.
    pub fn toxics(&self) -> &[Arc<ToxicWrapper>] {
        &self.toxics
    }

    /// Look up a toxic by name.
    pub fn get(&self, name: &str) -> Option<&Arc<ToxicWrapper>> {
        self.toxics.iter().find(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.toxics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toxics.is_empty()
    }

    /// Toxics a stream should run, in application order.
    pub(crate) fn enabled(&self) -> impl DoubleEndedIterator<Item = &Arc<ToxicWrapper>> {
        self.toxics.iter().filter(|t| t.enabled())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.toxics.iter().position(|t| t.name() == name)
    }
}

/// Upstream and downstream toxic chains of one proxy.
pub struct ToxicCollection {
    chains: [ArcSwap<ToxicChain>; 2],
    changes: [watch::Sender<u64>; 2],
    /// Last published version. Held only while building a new chain.
    writer: Mutex<u64>,
}

impl ToxicCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            chains: [
                ArcSwap::from_pointee(ToxicChain::default()),
                ArcSwap::from_pointee(ToxicChain::default()),
            ],
            changes: [watch::Sender::new(0), watch::Sender::new(0)],
            writer: Mutex::new(0),
        }
    }

    /// Current chain for a direction.
    pub fn snapshot(&self, direction: Direction) -> Arc<ToxicChain> {
        self.chains[direction.index()].load_full()
    }

    /// Receiver that is notified with the new version after every mutation
    /// of `direction`.
    pub(crate) fn subscribe(&self, direction: Direction) -> watch::Receiver<u64> {
        self.changes[direction.index()].subscribe()
    }

    /// Ordered copy of a direction's toxics.
    pub fn list(&self, direction: Direction) -> Vec<ToxicWrapper> {
        self.snapshot(direction)
            .toxics()
            .iter()
            .map(|t| ToxicWrapper::clone(t))
            .collect()
    }

    /// Look up one toxic.
    ///
    /// # Errors
    /// * `ProxyError::ToxicNotFound` - no toxic with that name
    pub fn get(&self, direction: Direction, name: &str) -> Result<ToxicWrapper> {
        self.snapshot(direction)
            .get(name)
            .map(|t| ToxicWrapper::clone(t))
            .ok_or_else(|| not_found(direction, name))
    }

    /// Validate a spec and append it to the end of its direction's chain.
    ///
    /// # Errors
    /// * `ProxyError::UnknownKind` / `ProxyError::InvalidAttribute` - bad spec
    /// * `ProxyError::DuplicateName` - name already used in that direction
    pub fn add(&self, spec: ToxicSpec) -> Result<ToxicWrapper> {
        let toxic = ToxicWrapper::from_spec(spec)?;
        let direction = toxic.direction();

        let mut version = self.lock();
        let current = self.snapshot(direction);
        if current.get(toxic.name()).is_some() {
            return Err(ProxyError::DuplicateName {
                name: toxic.name().to_string(),
            });
        }
        // The version about to be published is unique, so it doubles as the serial.
        let toxic = toxic.with_serial(*version + 1);
        let mut toxics = current.toxics.clone();
        toxics.push(Arc::new(toxic.clone()));
        self.publish(&mut version, direction, toxics);
        Ok(toxic)
    }

    /// Remove a toxic.
    ///
    /// # Errors
    /// * `ProxyError::ToxicNotFound` - no toxic with that name
    pub fn remove(&self, direction: Direction, name: &str) -> Result<()> {
        let mut version = self.lock();
        let current = self.snapshot(direction);
        let index = current
            .position(name)
            .ok_or_else(|| not_found(direction, name))?;
        let mut toxics = current.toxics.clone();
        toxics.remove(index);
        self.publish(&mut version, direction, toxics);
        Ok(())
    }

    /// Replace a toxic's attributes and toxicity, keeping its position.
    ///
    /// # Errors
    /// * `ProxyError::ToxicNotFound` - no toxic with that name
    /// * `ProxyError::InvalidAttribute` - bad attribute or toxicity
    pub fn update(
        &self,
        direction: Direction,
        name: &str,
        attributes: Attributes,
        toxicity: f64,
    ) -> Result<ToxicWrapper> {
        let mut version = self.lock();
        let current = self.snapshot(direction);
        let index = current
            .position(name)
            .ok_or_else(|| not_found(direction, name))?;
        let updated = current.toxics[index].updated(attributes, toxicity)?;
        let mut toxics = current.toxics.clone();
        toxics[index] = Arc::new(updated.clone());
        self.publish(&mut version, direction, toxics);
        Ok(updated)
    }

    /// Remove every toxic in both directions.
    pub fn clear(&self) {
        let mut version = self.lock();
        for direction in Direction::ALL {
            if !self.snapshot(direction).is_empty() {
                self.publish(&mut version, direction, Vec::new());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        // Use unwrap_or_else to recover from poisoned lock - the chains are still valid
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, version: &mut u64, direction: Direction, toxics: Vec<Arc<ToxicWrapper>>) {
        *version += 1;
        self.chains[direction.index()].store(Arc::new(ToxicChain {
            version: *version,
            toxics,
        }));
        self.changes[direction.index()].send_replace(*version);
    }
}

impl Default for ToxicCollection {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(direction: Direction, name: &str) -> ProxyError {
    ProxyError::ToxicNotFound {
        name: name.to_string(),
        direction,
    }
}
