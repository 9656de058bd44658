//! Backfill configuration.
//!
//! Controls chunk sizing and the allowance window used for backpressure.
//! Allowance is counted in chunks: the receiver grants the backfiller
//! permission to have at most `allowance_window` unapplied chunks in flight.

use serde::{Deserialize, Serialize};

// ============================================================================
// Backfill Configuration
// ============================================================================

/// Configuration for backfill sessions on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Maximum key/value pairs carried by one chunk.
    pub max_chunk_entries: usize,

    /// Chunks the receiver allows in flight at once.
    ///
    /// Sent as the initial allowance in every backfill request.
    pub allowance_window: u32,

    /// Applied chunks after which the receiver sends a fresh grant.
    ///
    /// Must not exceed `allowance_window`, otherwise the backfiller would
    /// stall with no allowance while the receiver waits for more chunks.
    pub refill_threshold: u32,
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_chunk_entries must be positive")]
    ZeroChunkSize,

    #[error("allowance_window must be positive")]
    ZeroAllowance,

    #[error("refill_threshold {threshold} must be in 1..={window}")]
    RefillThreshold { threshold: u32, window: u32 },
}

impl BackfillConfig {
    /// Tiny chunks and a narrow window, so tests exercise many chunks and
    /// many allowance grants with little data.
    pub fn testing() -> Self {
        Self {
            max_chunk_entries: 2,
            allowance_window: 2,
            refill_threshold: 1,
        }
    }

    /// Moderate sizes for local development.
    pub fn development() -> Self {
        Self {
            max_chunk_entries: 64,
            allowance_window: 8,
            refill_threshold: 4,
        }
    }

    pub fn production() -> Self {
        Self {
            max_chunk_entries: 1024,
            allowance_window: 32,
            refill_threshold: 16,
        }
    }

    /// Sets the maximum entries per chunk.
    pub fn with_max_chunk_entries(mut self, entries: usize) -> Self {
        self.max_chunk_entries = entries;
        self
    }

    /// Sets the allowance window.
    pub fn with_allowance_window(mut self, window: u32) -> Self {
        self.allowance_window = window;
        self
    }

    /// Sets the refill threshold.
    pub fn with_refill_threshold(mut self, threshold: u32) -> Self {
        self.refill_threshold = threshold;
        self
    }

    /// Checks that the configuration can make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_entries == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.allowance_window == 0 {
            return Err(ConfigError::ZeroAllowance);
        }
        if self.refill_threshold == 0 || self.refill_threshold > self.allowance_window {
            return Err(ConfigError::RefillThreshold {
                threshold: self.refill_threshold,
                window: self.allowance_window,
            });
        }
        Ok(())
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self::production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert!(BackfillConfig::testing().validate().is_ok());
        assert!(BackfillConfig::development().validate().is_ok());
        assert!(BackfillConfig::production().validate().is_ok());
        assert_eq!(BackfillConfig::default(), BackfillConfig::production());
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = BackfillConfig::testing().with_allowance_window(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroAllowance));
    }

    #[test]
    fn threshold_above_window_is_rejected() {
        let config = BackfillConfig::testing()
            .with_allowance_window(4)
            .with_refill_threshold(5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RefillThreshold { .. })
        ));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = BackfillConfig::development().with_max_chunk_entries(7);
        let json = serde_json::to_string(&config).unwrap();
        let back: BackfillConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
