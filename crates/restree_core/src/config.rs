//! Database configuration.

use std::time::Duration;

/// Configuration for opening a resource database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Period of the background flush.
    pub store_period: Duration,

    /// Superseded value bytes that trigger a compaction.
    pub compaction_start_size: u64,

    /// File name prefix of structure generations.
    pub structure_prefix: String,

    /// File name prefix of value generations.
    pub value_prefix: String,

    /// Soft bound on cached overlay nodes.
    pub node_cache_capacity: usize,

    /// Whether closing the database performs a final flush.
    pub flush_on_close: bool,

    /// Whether a background thread flushes every `store_period`.
    pub background_flush: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            store_period: Duration::from_secs(10),
            compaction_start_size: 1024 * 1024, // 1 MiB
            structure_prefix: "resMap".to_string(),
            value_prefix: "resData".to_string(),
            node_cache_capacity: 4096,
            flush_on_close: true,
            background_flush: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the background flush period.
    #[must_use]
    pub fn store_period(mut self, period: Duration) -> Self {
        self.store_period = period;
        self
    }

    /// Sets the garbage volume that triggers compaction.
    #[must_use]
    pub fn compaction_start_size(mut self, bytes: u64) -> Self {
        self.compaction_start_size = bytes;
        self
    }

    /// Sets the generation file prefixes.
    #[must_use]
    pub fn prefixes(mut self, structure: impl Into<String>, value: impl Into<String>) -> Self {
        self.structure_prefix = structure.into();
        self.value_prefix = value.into();
        self
    }

    /// Sets the overlay cache bound.
    #[must_use]
    pub fn node_cache_capacity(mut self, capacity: usize) -> Self {
        self.node_cache_capacity = capacity;
        self
    }

    /// Sets whether closing flushes.
    ///
    /// Turning this off makes dropping the database behave like a crash.
    #[must_use]
    pub fn flush_on_close(mut self, value: bool) -> Self {
        self.flush_on_close = value;
        self
    }

    /// Sets whether the background flush thread runs.
    #[must_use]
    pub fn background_flush(mut self, value: bool) -> Self {
        self.background_flush = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.flush_on_close);
        assert_eq!(config.structure_prefix, "resMap");
        assert_eq!(config.value_prefix, "resData");
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .store_period(Duration::from_millis(50))
            .compaction_start_size(100)
            .prefixes("map", "data")
            .background_flush(false);

        assert_eq!(config.store_period, Duration::from_millis(50));
        assert_eq!(config.compaction_start_size, 100);
        assert_eq!(config.structure_prefix, "map");
        assert!(!config.background_flush);
    }
}
