//! Prior warping checkpoints
//!
//! The deformable registration itself is an external collaborator behind
//! [`PriorWarper`]. The controller decides when to call it, hands it the
//! current state of the run and checks what comes back before the priors are
//! replaced.

use std::error::Error;

use tracing::info;

use crate::config::WarpParams;
use crate::error::{AbcError, Result};
use crate::volume::{Geometry, Volume};

/// Dense displacement field on the subject grid
#[derive(Debug, Clone)]
pub struct DeformationField {
    /// One displacement (mm) per voxel, Fortran order
    pub vectors: Vec<[f64; 3]>,
    pub geometry: Geometry,
}

impl DeformationField {
    /// Identity (all-zero) deformation
    pub fn zeros(geometry: Geometry) -> Self {
        Self { vectors: vec![[0.0; 3]; geometry.len()], geometry }
    }

    /// Largest displacement magnitude
    pub fn max_displacement(&self) -> f64 {
        self.vectors
            .iter()
            .map(|v| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt())
            .fold(0.0, f64::max)
    }
}

/// Everything a registration collaborator gets at a checkpoint
#[derive(Debug)]
pub struct WarpRequest<'a> {
    /// EM iteration at which the warp runs
    pub iteration: usize,
    /// Atlas template image
    pub template: &'a Volume<f64>,
    /// Bias-corrected subject channels
    pub corrected: &'a [Volume<f64>],
    /// Current label estimate (0 outside the mask)
    pub labels: &'a Volume<u8>,
    /// Deformation returned by the previous checkpoint
    pub previous: Option<&'a DeformationField>,
    pub fluid_iterations: usize,
    pub fluid_max_step: f64,
    pub kernel_width: f64,
}

/// What a registration collaborator returns
#[derive(Debug, Clone)]
pub struct WarpOutcome {
    /// One resampled prior per class, on the subject grid
    pub priors: Vec<Volume<f64>>,
    pub warped_template: Option<Volume<f64>>,
    pub deformation: Option<DeformationField>,
}

/// Deformable registration of the atlas onto the subject
pub trait PriorWarper {
    fn warp_priors(
        &mut self,
        request: &WarpRequest<'_>,
    ) -> std::result::Result<WarpOutcome, Box<dyn Error + Send + Sync>>;
}

/// Schedules warp checkpoints and validates their results
#[derive(Debug, Clone)]
pub(crate) struct WarpController {
    params: WarpParams,
    warps: usize,
}

impl WarpController {
    pub(crate) fn new(params: &WarpParams) -> Self {
        Self { params: params.clone(), warps: 0 }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.params.enabled
    }

    /// Number of checkpoints run so far
    pub(crate) fn warps(&self) -> usize {
        self.warps
    }

    /// True when iteration `iteration` starts with a warp
    pub(crate) fn is_checkpoint(&self, iteration: usize) -> bool {
        self.params.enabled && iteration > 0 && iteration % self.params.interval == 0
    }

    /// Call `warper` and check the returned volumes against the subject grid
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run(
        &mut self,
        warper: &mut dyn PriorWarper,
        iteration: usize,
        template: &Volume<f64>,
        corrected: &[Volume<f64>],
        labels: &Volume<u8>,
        previous: Option<&DeformationField>,
        num_classes: usize,
    ) -> Result<WarpOutcome> {
        let request = WarpRequest {
            iteration,
            template,
            corrected,
            labels,
            previous,
            fluid_iterations: self.params.fluid_iterations,
            fluid_max_step: self.params.fluid_max_step,
            kernel_width: self.params.kernel_width,
        };
        info!(iteration, "warping priors");
        let outcome = warper
            .warp_priors(&request)
            .map_err(|e| AbcError::ExternalCollaborator(format!("prior warp failed: {}", e)))?;

        let geometry = &labels.geometry;
        if outcome.priors.len() != num_classes {
            return Err(AbcError::ExternalCollaborator(format!(
                "warp returned {} priors for {} classes",
                outcome.priors.len(),
                num_classes
            )));
        }
        for (k, prior) in outcome.priors.iter().enumerate() {
            if !geometry.matches(&prior.geometry) || prior.data.len() != geometry.len() {
                return Err(AbcError::ExternalCollaborator(format!(
                    "warped prior {} is not on the subject grid",
                    k
                )));
            }
        }
        if let Some(t) = &outcome.warped_template {
            if !geometry.matches(&t.geometry) || t.data.len() != geometry.len() {
                return Err(AbcError::ExternalCollaborator("warped template is not on the subject grid".into()));
            }
        }
        if let Some(d) = &outcome.deformation {
            if !geometry.matches(&d.geometry) || d.vectors.len() != geometry.len() {
                return Err(AbcError::ExternalCollaborator("deformation field is not on the subject grid".into()));
            }
            info!(iteration, max_displacement = d.max_displacement(), "deformation updated");
        }

        self.warps += 1;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Volume<f64>>);

    impl PriorWarper for Fixed {
        fn warp_priors(
            &mut self,
            _request: &WarpRequest<'_>,
        ) -> std::result::Result<WarpOutcome, Box<dyn Error + Send + Sync>> {
            Ok(WarpOutcome { priors: self.0.clone(), warped_template: None, deformation: None })
        }
    }

    struct Failing;

    impl PriorWarper for Failing {
        fn warp_priors(
            &mut self,
            _request: &WarpRequest<'_>,
        ) -> std::result::Result<WarpOutcome, Box<dyn Error + Send + Sync>> {
            Err("registration diverged".into())
        }
    }

    fn params(interval: usize) -> WarpParams {
        WarpParams { enabled: true, interval, ..WarpParams::default() }
    }

    #[test]
    fn test_checkpoint_schedule() {
        let controller = WarpController::new(&params(3));
        let hits: Vec<usize> = (0..10).filter(|&i| controller.is_checkpoint(i)).collect();
        assert_eq!(hits, vec![3, 6, 9]);

        let disabled = WarpController::new(&WarpParams::default());
        assert!(!(0..50).any(|i| disabled.is_checkpoint(i)));
    }

    #[test]
    fn test_validates_outcome() {
        let g = Geometry::new((2, 2, 2), (1.0, 1.0, 1.0));
        let template = Volume::filled(g.clone(), 1.0);
        let labels = Volume::filled(g.clone(), 1u8);
        let mut controller = WarpController::new(&params(2));

        let mut good = Fixed(vec![Volume::filled(g.clone(), 0.5); 2]);
        let outcome = controller.run(&mut good, 2, &template, &[], &labels, None, 2).unwrap();
        assert_eq!(outcome.priors.len(), 2);
        assert_eq!(controller.warps(), 1);

        let mut wrong_count = Fixed(vec![Volume::filled(g.clone(), 0.5); 3]);
        let err = controller.run(&mut wrong_count, 4, &template, &[], &labels, None, 2).unwrap_err();
        assert!(matches!(err, AbcError::ExternalCollaborator(_)));

        let other = Geometry::new((2, 2, 3), (1.0, 1.0, 1.0));
        let mut wrong_grid = Fixed(vec![Volume::filled(other, 0.5); 2]);
        let err = controller.run(&mut wrong_grid, 4, &template, &[], &labels, None, 2).unwrap_err();
        assert!(matches!(err, AbcError::ExternalCollaborator(_)));

        let err = controller.run(&mut Failing, 4, &template, &[], &labels, None, 2).unwrap_err();
        assert!(err.to_string().contains("registration diverged"));
        assert_eq!(controller.warps(), 1);
    }
}
