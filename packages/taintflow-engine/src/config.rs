//! Analysis configuration
//!
//! One value drives a whole analysis run: worker allocation, the
//! iteration cap for the global fixpoint, and the precision limits
//! handed down to the abstract domains.

use serde::{Deserialize, Serialize};
use taintflow_domains::DomainLimits;

use crate::errors::{EngineError, Result};

/// Iteration cap applied when the caller does not override it. The
/// fixpoint reports `Capped` rather than erroring when it is reached.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Configuration for one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Worker threads for the scheduler. `0` means one per logical CPU.
    pub workers: usize,
    /// When false, every job runs inline on the calling thread.
    pub parallel: bool,
    /// Upper bound on global fixpoint iterations.
    pub max_iterations: usize,
    /// Precision limits enforced by widening.
    pub limits: DomainLimits,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            parallel: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            limits: DomainLimits::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_limits(mut self, limits: DomainLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Force every job to run inline on the calling thread.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Number of workers the scheduler will actually start.
    pub fn effective_workers(&self) -> usize {
        if !self.parallel {
            return 1;
        }
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(EngineError::config("max_iterations must be at least 1"));
        }
        if self.limits.max_set_width == 0 {
            return Err(EngineError::config("max_set_width must be at least 1"));
        }
        if self.limits.max_tree_depth_after_widening == 0 {
            return Err(EngineError::config(
                "max_tree_depth_after_widening must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.parallel);
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn test_builder_chain() {
        let config = AnalysisConfig::new()
            .with_workers(4)
            .with_max_iterations(10)
            .sequential();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_iterations, 10);
        assert!(!config.parallel);
        assert_eq!(config.effective_workers(), 1);
    }

    #[test]
    fn test_auto_workers_uses_all_cpus() {
        let config = AnalysisConfig::default();
        assert_eq!(config.effective_workers(), num_cpus::get());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = AnalysisConfig::new().with_max_iterations(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_degenerate_limits_rejected() {
        let config = AnalysisConfig::new()
            .with_limits(taintflow_domains::DomainLimits::default().with_max_set_width(0));
        assert!(config.validate().is_err());
    }
}
