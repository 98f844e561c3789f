//! Short-lived residual binding between an immature point and one target
//! frame.
//!
//! The external depth optimizer evaluates residuals repeatedly at trial
//! inverse depths. Each evaluation writes a *pending* state and energy; the
//! optimizer commits them when it accepts the trial step and discards them
//! otherwise, so a rejected step never corrupts the accepted state.

use crate::frame::FrameId;

/// Categorical residual state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResState {
    /// Inlier: contributes to the depth system.
    In,
    /// Projection failed; sticky across evaluations.
    Oob,
    /// Energy above budget for this evaluation.
    Outlier,
}

/// Accumulated state of one (point, target-frame) pairing across
/// optimization iterations. Rebuilt per optimization round; owned by the
/// caller.
#[derive(Debug, Clone)]
pub struct CandidateResidual {
    pub target: FrameId,
    /// Committed state from the last accepted evaluation.
    pub state: ResState,
    /// Committed energy from the last accepted evaluation.
    pub energy: f32,
    /// State written by the most recent (not yet accepted) evaluation.
    pub new_state: ResState,
    /// Energy written by the most recent (not yet accepted) evaluation.
    pub new_energy: f32,
}

impl CandidateResidual {
    /// Fresh residual for one target frame. Starts as a pending outlier with
    /// an accepted inlier slot, mirroring how the depth optimizer seeds its
    /// first linearization pass.
    pub fn new(target: FrameId) -> Self {
        Self {
            target,
            state: ResState::In,
            energy: 0.0,
            new_state: ResState::Outlier,
            new_energy: 0.0,
        }
    }

    /// Accept the pending evaluation.
    pub fn commit(&mut self) {
        self.state = self.new_state;
        self.energy = self.new_energy;
    }
}
