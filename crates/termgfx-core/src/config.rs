//! Configuration for the graphics core.
//!
//! Four independent budgets (image count, placement count, disk bytes, RAM
//! bytes) plus per-object limits. Enforcement triggers once a budget exceeds
//! `limit * (1 + excess_tolerance)`, so small overshoots do not cause
//! eviction churn on every command.

use std::time::Duration;

/// Configuration for a [`GraphicsContext`](crate::GraphicsContext).
#[derive(Debug, Clone)]
pub struct GraphicsConfig {
    /// Maximum size of a single uploaded image file in bytes.
    /// Default: 20 MiB.
    pub max_image_file_size: u64,

    /// Total budget for the on-disk frame cache in bytes.
    /// Default: 300 MiB.
    pub total_disk_budget: u64,

    /// Maximum RAM for a single decoded bitmap or scaled pixmap in bytes.
    /// Default: 100 MiB.
    pub max_image_ram_size: u64,

    /// Total RAM budget for decoded bitmaps and pixmaps in bytes.
    /// Default: 300 MiB.
    pub total_ram_budget: u64,

    /// Maximum number of stored images. Default: 1024.
    pub max_images: usize,

    /// Maximum number of placements across all images. Default: 4096.
    pub max_placements: usize,

    /// Budgets are enforced only above `limit * (1 + excess_tolerance)`.
    /// Default: 0.05.
    pub excess_tolerance: f64,

    /// Lower bound on the delay reported by
    /// [`finish_drawing`](crate::GraphicsContext::finish_drawing).
    /// Default: 20 ms.
    pub animation_min_delay: Duration,

    /// Prefix for the mkdtemp-style cache directory name.
    pub cache_dir_prefix: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_image_file_size: 20 * 1024 * 1024,
            total_disk_budget: 300 * 1024 * 1024,
            max_image_ram_size: 100 * 1024 * 1024,
            total_ram_budget: 300 * 1024 * 1024,
            max_images: 1024,
            max_placements: 4096,
            excess_tolerance: 0.05,
            animation_min_delay: Duration::from_millis(20),
            cache_dir_prefix: "termgfx-images-".to_string(),
        }
    }
}

impl GraphicsConfig {
    /// Create a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-file upload limit.
    #[must_use]
    pub fn with_max_image_file_size(mut self, bytes: u64) -> Self {
        self.max_image_file_size = bytes;
        self
    }

    /// Set the total disk cache budget.
    #[must_use]
    pub fn with_total_disk_budget(mut self, bytes: u64) -> Self {
        self.total_disk_budget = bytes;
        self
    }

    /// Set the per-object RAM limit.
    #[must_use]
    pub fn with_max_image_ram_size(mut self, bytes: u64) -> Self {
        self.max_image_ram_size = bytes;
        self
    }

    /// Set the total RAM budget.
    #[must_use]
    pub fn with_total_ram_budget(mut self, bytes: u64) -> Self {
        self.total_ram_budget = bytes;
        self
    }

    /// Set the image count budget.
    #[must_use]
    pub fn with_max_images(mut self, count: usize) -> Self {
        self.max_images = count;
        self
    }

    /// Set the placement count budget.
    #[must_use]
    pub fn with_max_placements(mut self, count: usize) -> Self {
        self.max_placements = count;
        self
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_image_file_size == 0 {
            return Err("max_image_file_size must be non-zero".to_string());
        }
        if self.max_image_ram_size == 0 {
            return Err("max_image_ram_size must be non-zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.excess_tolerance) {
            return Err("excess_tolerance must be within [0, 1]".to_string());
        }
        if self.max_images == 0 || self.max_placements == 0 {
            return Err("image and placement budgets must be non-zero".to_string());
        }
        Ok(())
    }

    /// A limit adjusted by the excess tolerance ratio.
    pub(crate) fn with_tolerance(&self, limit: u64) -> u64 {
        limit.saturating_add((limit as f64 * self.excess_tolerance) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(GraphicsConfig::default().validate().is_ok());
    }

    #[test]
    fn tolerance_applied() {
        let config = GraphicsConfig::default();
        assert_eq!(config.with_tolerance(100), 105);
        assert_eq!(config.with_tolerance(0), 0);
    }

    #[test]
    fn invalid_tolerance_rejected() {
        let mut config = GraphicsConfig::new();
        config.excess_tolerance = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builders_chain() {
        let config = GraphicsConfig::new()
            .with_max_image_file_size(16)
            .with_total_ram_budget(1024)
            .with_max_images(2);
        assert_eq!(config.max_image_file_size, 16);
        assert_eq!(config.total_ram_budget, 1024);
        assert_eq!(config.max_images, 2);
    }
}
