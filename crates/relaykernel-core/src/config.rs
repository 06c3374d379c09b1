//! Kernel launch configuration.

use serde::{Deserialize, Serialize};

use crate::error::{RelayKernelError, Result};

/// Index-range configuration for one kernel launch.
///
/// `dimensions` gives the global work size per dimension and fixes the
/// dimensionality of the launch. `offsets` and `local_dimensions` are
/// optional: an empty vector collapses to an absent argument at the device
/// boundary, letting the device pick its defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    dimensions: Vec<usize>,
    #[serde(default)]
    offsets: Vec<usize>,
    #[serde(default)]
    local_dimensions: Vec<usize>,
}

impl LaunchConfig {
    /// Create a configuration with the given global work sizes.
    pub fn new(dimensions: Vec<usize>) -> Self {
        Self {
            dimensions,
            offsets: Vec::new(),
            local_dimensions: Vec::new(),
        }
    }

    /// Set per-dimension global offsets.
    pub fn with_offsets(mut self, offsets: Vec<usize>) -> Self {
        self.offsets = offsets;
        self
    }

    /// Set per-dimension local work-group sizes.
    pub fn with_local_dimensions(mut self, local_dimensions: Vec<usize>) -> Self {
        self.local_dimensions = local_dimensions;
        self
    }

    /// Number of dimensions of the launch.
    pub fn work_dim(&self) -> usize {
        self.dimensions.len()
    }

    /// Global work sizes, one per dimension.
    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    /// Global offsets, or `None` when unset.
    pub fn offsets(&self) -> Option<&[usize]> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(&self.offsets)
        }
    }

    /// Local work-group sizes, or `None` when unset.
    pub fn local_dimensions(&self) -> Option<&[usize]> {
        if self.local_dimensions.is_empty() {
            None
        } else {
            Some(&self.local_dimensions)
        }
    }

    /// Total number of global work items.
    pub fn global_size(&self) -> usize {
        self.dimensions.iter().product()
    }

    /// Check structural validity: at least one dimension, no zero-sized
    /// dimension, and optional arrays either empty or matching the
    /// dimensionality.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(RelayKernelError::invalid_config(
                "launch requires at least one dimension",
            ));
        }
        if self.dimensions.iter().any(|&d| d == 0) {
            return Err(RelayKernelError::invalid_config(
                "global work size must be non-zero in every dimension",
            ));
        }
        if !self.offsets.is_empty() && self.offsets.len() != self.dimensions.len() {
            return Err(RelayKernelError::invalid_config(format!(
                "offsets rank {} does not match dimensionality {}",
                self.offsets.len(),
                self.dimensions.len()
            )));
        }
        if !self.local_dimensions.is_empty()
            && self.local_dimensions.len() != self.dimensions.len()
        {
            return Err(RelayKernelError::invalid_config(format!(
                "local dimensions rank {} does not match dimensionality {}",
                self.local_dimensions.len(),
                self.dimensions.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_optionals_collapse_to_none() {
        let config = LaunchConfig::new(vec![64, 64]);
        assert_eq!(config.work_dim(), 2);
        assert!(config.offsets().is_none());
        assert!(config.local_dimensions().is_none());
    }

    #[test]
    fn test_populated_optionals() {
        let config = LaunchConfig::new(vec![1024])
            .with_offsets(vec![128])
            .with_local_dimensions(vec![32]);
        assert_eq!(config.offsets(), Some(&[128usize][..]));
        assert_eq!(config.local_dimensions(), Some(&[32usize][..]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_global_size() {
        let config = LaunchConfig::new(vec![8, 4, 2]);
        assert_eq!(config.global_size(), 64);
    }

    #[test]
    fn test_validate_rejects_rank_mismatch() {
        let config = LaunchConfig::new(vec![64, 64]).with_offsets(vec![1]);
        assert!(config.validate().is_err());

        let config = LaunchConfig::new(vec![64]).with_local_dimensions(vec![8, 8]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_launches() {
        assert!(LaunchConfig::new(vec![]).validate().is_err());
        assert!(LaunchConfig::new(vec![16, 0]).validate().is_err());
    }
}
