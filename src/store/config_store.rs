//! Atomically swapped configuration snapshot.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::GrayConfig;

/// One applied configuration and the version it was pushed with.
#[derive(Debug)]
pub struct Generation {
    pub config: GrayConfig,
    pub version: u64,
}

/// Thread-safe holder of the current [`Generation`].
///
/// Readers take an `Arc` snapshot at request start and keep it for the
/// whole request, so a concurrent update never changes a decision midway.
pub struct ConfigStore {
    current: ArcSwapOption<Generation>,
}

impl ConfigStore {
    /// Creates a store with no configuration loaded.
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// Replaces the active configuration. Returns the applied version.
    pub fn update(&self, config: GrayConfig, version: u64) -> u64 {
        self.current
            .store(Some(Arc::new(Generation { config, version })));
        version
    }

    /// The active generation, if any has been loaded.
    pub fn snapshot(&self) -> Option<Arc<Generation>> {
        self.current.load_full()
    }

    /// Version of the active generation, `0` before the first load.
    pub fn version(&self) -> u64 {
        self.current
            .load()
            .as_ref()
            .map(|generation| generation.version)
            .unwrap_or(0)
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
