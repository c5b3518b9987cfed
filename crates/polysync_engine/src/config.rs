//! Configuration for the engine.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Archive file name inside the group's configuration directory.
    pub archive_file: String,
    /// Upper bound for each member to finish during `finalize`.
    pub finalize_timeout: Duration,
    /// Upper bound for a member to answer `discover_and_block`.
    pub discover_timeout: Duration,
    /// Poll interval of bounded waits.
    pub poll_interval: Duration,
    /// Convert changes to the internal format on read and back to the
    /// member's format on write.
    pub convert_formats: bool,
    /// Run the next session as a slow-sync when the previous one did not
    /// release the group lock.
    pub slow_sync_on_unclean: bool,
    /// Name of the engine thread.
    pub thread_name: String,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            archive_file: "archive.db".to_string(),
            finalize_timeout: Duration::from_millis(2000),
            discover_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(1),
            convert_formats: true,
            slow_sync_on_unclean: true,
            thread_name: "polysync-engine".to_string(),
        }
    }

    /// Sets the archive file name.
    pub fn with_archive_file(mut self, name: impl Into<String>) -> Self {
        self.archive_file = name.into();
        self
    }

    /// Sets the finalize timeout.
    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    /// Sets the discovery timeout.
    pub fn with_discover_timeout(mut self, timeout: Duration) -> Self {
        self.discover_timeout = timeout;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enables or disables format conversion.
    pub fn with_format_conversion(mut self, enabled: bool) -> Self {
        self.convert_formats = enabled;
        self
    }

    /// Enables or disables slow-sync after an unclean shutdown.
    pub fn with_slow_sync_on_unclean(mut self, enabled: bool) -> Self {
        self.slow_sync_on_unclean = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.archive_file, "archive.db");
        assert_eq!(config.finalize_timeout, Duration::from_secs(2));
        assert_eq!(config.discover_timeout, Duration::from_secs(2));
        assert!(config.convert_formats);
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .with_archive_file("group.db")
            .with_finalize_timeout(Duration::from_millis(50))
            .with_discover_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(5))
            .with_format_conversion(false)
            .with_slow_sync_on_unclean(false);

        assert_eq!(config.archive_file, "group.db");
        assert_eq!(config.finalize_timeout, Duration::from_millis(50));
        assert_eq!(config.discover_timeout, Duration::from_millis(20));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert!(!config.convert_formats);
        assert!(!config.slow_sync_on_unclean);
    }
}
