//! Solver configuration.

use serde::{Deserialize, Serialize};

/// Parameters of the Newton-CG trust-region minimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustRegionConfig {
    /// Radius of the first trust region.
    pub initial_radius: f64,
    /// Upper bound on the trust-region radius.
    pub max_radius: f64,
    /// Minimum ratio of actual to predicted reduction for accepting a step.
    pub eta: f64,
    /// Converged once the infinity norm of the gradient is below this.
    pub gradient_tolerance: f64,
    /// Iteration cap. `None` means `200 * n` for `n` unknowns.
    pub max_iterations: Option<usize>,
}

impl Default for TrustRegionConfig {
    fn default() -> Self {
        Self {
            initial_radius: 1.0,
            max_radius: 1000.0,
            eta: 0.15,
            gradient_tolerance: 1e-8,
            max_iterations: None,
        }
    }
}

impl TrustRegionConfig {
    pub fn iteration_limit(&self, n: usize) -> usize {
        self.max_iterations.unwrap_or(200 * n.max(1))
    }
}

/// Configuration of one assembly solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub trust_region: TrustRegionConfig,
    /// Shift negative host rotation angles into `[0, 2*pi)` before solving.
    pub normalize_angles: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            trust_region: TrustRegionConfig::default(),
            normalize_angles: true,
        }
    }
}

impl SolverConfig {
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.trust_region.gradient_tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.trust_region.max_iterations = Some(max_iterations);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SolverConfig::default();
        assert_eq!(config.trust_region.gradient_tolerance, 1e-8);
        assert_eq!(config.trust_region.iteration_limit(3), 600);
        assert!(config.normalize_angles);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SolverConfig::from_json(r#"{ "trust_region": { "max_iterations": 50 } }"#).unwrap();
        assert_eq!(config.trust_region.iteration_limit(10), 50);
        assert_eq!(config.trust_region.initial_radius, 1.0);
        assert!(config.normalize_angles);
    }

    #[test]
    fn test_builders() {
        let config = SolverConfig::default()
            .with_gradient_tolerance(1e-6)
            .with_max_iterations(7);
        assert_eq!(config.trust_region.gradient_tolerance, 1e-6);
        assert_eq!(config.trust_region.max_iterations, Some(7));
    }
}
