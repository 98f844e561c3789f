//! Tuning constants for immature-point tracing and depth refinement.

/// Configuration for epipolar tracing and point-depth refinement.
///
/// Process-wide constants; built once and passed by reference. The defaults
/// are the tuning the rest of the pipeline (point activation thresholds in
/// particular) was calibrated against; change them together or not at all.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// Base per-pattern-offset energy budget before scaling (residual²
    /// units).
    pub outlier_energy: f32,
    /// Denominator constant in the per-sample robust weight
    /// √(C / (C + ‖∇I‖²)).
    pub outlier_sum_component: f32,
    /// Squared multiplier on the total energy threshold.
    pub energy_weight: f32,
    /// Cap on epipolar search length, as a fraction of (width + height).
    pub max_pix_search: f32,
    /// Discrete search step in pixels; also the Gauss-Newton step unit.
    pub step_size: f32,
    /// Max Gauss-Newton refinement iterations along the search direction.
    pub gn_iterations: usize,
    /// Stop Gauss-Newton once the accepted step falls below this.
    pub gn_threshold: f32,
    /// Multiplier on the energy threshold for the outlier cutoff.
    pub extra_slack: f32,
    /// Projected pixel interval below which the depth interval counts as
    /// already tight (trace skipped).
    pub slack_interval: f32,
    /// Minimum factor by which tracing must be able to shrink the interval
    /// to be worth running.
    pub min_improvement_factor: f32,
    /// Exclusion radius (in discrete steps) around the best sample when
    /// picking the second-best energy.
    pub min_test_radius: i32,
    /// Huber loss transition point (intensity units).
    pub huber_th: f32,
    /// Max damped Gauss-Newton iterations when refining a point's inverse
    /// depth from its accumulated residuals.
    pub activation_iterations: usize,
    /// Reject depth refinement when the idepth Hessian stays below this.
    pub min_idepth_hessian: f32,
    /// Minimum second-best/best quality ratio for a point to be considered
    /// for activation.
    pub min_trace_quality: f32,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            outlier_energy: 12.0 * 12.0,
            outlier_sum_component: 50.0 * 50.0,
            energy_weight: 1.0,
            max_pix_search: 0.027,
            step_size: 1.0,
            gn_iterations: 3,
            gn_threshold: 0.1,
            extra_slack: 1.2,
            slack_interval: 1.5,
            min_improvement_factor: 2.0,
            min_test_radius: 2,
            huber_th: 9.0,
            activation_iterations: 3,
            min_idepth_hessian: 100.0,
            min_trace_quality: 3.0,
        }
    }
}
