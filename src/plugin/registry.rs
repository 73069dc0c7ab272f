/*!
 * Backend Registry
 *
 * Maps a backend name to a factory. Built once at startup and read-only
 * afterwards, so lookups need no locking; pass it to whatever constructs
 * lock backends. Names are keyed by their first character.
 */

use super::pthread::PthreadBackend;
use super::traits::LockBackend;
use crate::core::config::LockConfig;
use crate::core::errors::{LockError, LockResult};
use ahash::RandomState;
use std::collections::HashMap;
use std::fmt;

/// Builds a backend from the shared configuration
pub type BackendFactory = fn(&LockConfig) -> Box<dyn LockBackend>;

/// Name of the pthread-style backend
pub const PTHREAD_BACKEND: &str = "plock";

/// Read-only backend registry
pub struct LockRegistry {
    factories: HashMap<char, (&'static str, BackendFactory), RandomState>,
    config: LockConfig,
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("backends", &self.names())
            .field("config", &self.config)
            .finish()
    }
}

impl LockRegistry {
    pub fn builder(config: LockConfig) -> RegistryBuilder {
        RegistryBuilder {
            factories: HashMap::with_hasher(RandomState::new()),
            config,
        }
    }

    /// Registry holding the pthread backend
    pub fn with_defaults(config: LockConfig) -> Self {
        Self::builder(config)
            .register(PTHREAD_BACKEND, |config| {
                Box::new(PthreadBackend::new(config.clone()))
            })
            .build()
    }

    /// Construct the backend registered under `name`
    pub fn create(&self, name: &str) -> LockResult<Box<dyn LockBackend>> {
        let key = name
            .chars()
            .next()
            .ok_or_else(|| LockError::NoSuchBackend(name.to_string()))?;
        let (_, factory) = self
            .factories
            .get(&key)
            .ok_or_else(|| LockError::NoSuchBackend(name.to_string()))?;
        Ok(factory(&self.config))
    }

    pub fn contains(&self, name: &str) -> bool {
        name.chars()
            .next()
            .map(|key| self.factories.contains_key(&key))
            .unwrap_or(false)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }
}

/// Collects factories before the registry is frozen
pub struct RegistryBuilder {
    factories: HashMap<char, (&'static str, BackendFactory), RandomState>,
    config: LockConfig,
}

impl RegistryBuilder {
    /// Register `factory` under the first character of `name`
    ///
    /// A later registration with the same first character replaces the
    /// earlier one.
    pub fn register(mut self, name: &'static str, factory: BackendFactory) -> Self {
        if let Some(key) = name.chars().next() {
            if let Some((previous, _)) = self.factories.insert(key, (name, factory)) {
                tracing::warn!(previous, name, "lock backend registration replaced");
            }
        }
        self
    }

    pub fn build(self) -> LockRegistry {
        LockRegistry {
            factories: self.factories,
            config: self.config,
        }
    }
}
