// boreas_core/src/methods/letkf.rs
//
// Local ensemble transform Kalman filter. Every state grid point is its own
// local domain: the ETKF ensemble-space analysis is repeated per point with
// the observation-error precision tapered by distance, so remote
// observations cannot inject spurious correlations. Domains share no
// mutable state and are processed in parallel.

use nalgebra::{DMatrix, DVector, RowDVector};
use rayon::prelude::*;
use serde::Deserialize;

use super::{obs_space, post_process, validate_inflation, AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::hmm::Hmm;
use crate::localize::{Localization, Taper};
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LetkfConfig {
    /// Localization length scale, in grid units.
    pub radius: f64,
    #[serde(default = "default_taper")]
    pub taper: Taper,
    #[serde(default = "default_infl")]
    pub infl: f64,
    #[serde(default)]
    pub rotate: bool,
}

fn default_taper() -> Taper {
    Taper::GaspariCohn
}

fn default_infl() -> f64 {
    1.0
}

impl LetkfConfig {
    fn localization(&self) -> Localization {
        Localization {
            radius: self.radius,
            taper: self.taper,
        }
    }

    pub fn validate(&self, hmm: &Hmm) -> Result<(), ConfigError> {
        validate_inflation(self.infl)?;
        self.localization().validate()?;
        if hmm.grid.is_none() {
            return Err(ConfigError::MethodRequirement {
                method: "LETKF",
                requirement: "a state grid on the HMM".to_string(),
            });
        }
        if hmm.observation.obs_sites().is_none() {
            return Err(ConfigError::MethodRequirement {
                method: "LETKF",
                requirement: "observation-site coordinates".to_string(),
            });
        }
        if !linalg::is_effectively_diagonal(hmm.r()) {
            return Err(ConfigError::MethodRequirement {
                method: "LETKF",
                requirement: "a diagonal observation-error covariance".to_string(),
            });
        }
        if hmm.r().diagonal().iter().any(|v| *v <= 0.0) {
            return Err(ConfigError::MethodRequirement {
                method: "LETKF",
                requirement: "strictly positive observation-error variances".to_string(),
            });
        }
        Ok(())
    }
}

pub(super) fn analyse(
    config: &LetkfConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let n = ens.num_members();
    let n1 = (n - 1).max(1) as f64;
    let nx = ens.state_dim();

    let space = obs_space(ens, obs, ctx.hmm, ctx.t);
    let (mean, anomalies) = ens.mean_and_anomalies();

    // Both validated at construction.
    let grid = ctx.hmm.grid.as_ref().expect("validated: state grid");
    let sites = ctx
        .hmm
        .observation
        .obs_sites()
        .expect("validated: obs sites");
    let r_diag = ctx.hmm.r().diagonal();
    let loc = config.localization();

    let updated_rows: Vec<RowDVector<f64>> = (0..nx)
        .into_par_iter()
        .map(|i| {
            let weights = loc.weights(grid, grid.coord(i), &sites);
            let active: Vec<usize> = weights
                .iter()
                .enumerate()
                .filter(|(_, w)| **w > 0.0)
                .map(|(j, _)| j)
                .collect();

            // No observation reaches this point: the forecast row survives.
            if active.is_empty() {
                let mut row = RowDVector::zeros(n);
                for j in 0..n {
                    row[j] = mean[i] + anomalies[(i, j)];
                }
                return row;
            }

            // Local obs-space quantities, tapered: each active row of Y and
            // the innovation are scaled by sqrt(weight / r_j).
            let mut s_loc = DMatrix::zeros(active.len(), n);
            let mut delta_loc = DVector::zeros(active.len());
            for (row, &j) in active.iter().enumerate() {
                let scale = (weights[j] / r_diag[j]).sqrt();
                for col in 0..n {
                    s_loc[(row, col)] = space.y_anom[(j, col)] * scale;
                }
                delta_loc[row] = space.innovation[j] * scale;
            }

            // ETKF in the local ensemble space.
            let sts = s_loc.transpose() * &s_loc;
            let (vals, vecs) = linalg::symmetric_eigen_clamped(&sts);
            let rhs = vecs.transpose() * (s_loc.transpose() * delta_loc);
            let scaled = DVector::from_fn(n, |e, _| rhs[e] / (n1 + vals[e]));
            let w_mean = &vecs * scaled;
            let sqrt_diag = DMatrix::from_diagonal(&vals.map(|l| (n1 / (n1 + l)).sqrt()));
            let transform = &vecs * sqrt_diag * vecs.transpose();

            let a_row = anomalies.row(i);
            let shift = (&a_row * &w_mean)[(0, 0)];
            let mut row = &a_row * transform;
            for j in 0..n {
                row[j] += mean[i] + shift;
            }
            row
        })
        .collect();

    let members = ens.members_mut();
    for (i, row) in updated_rows.iter().enumerate() {
        for j in 0..n {
            members[(i, j)] = row[j];
        }
    }

    post_process(ens, config.infl, config.rotate, ctx.rng);
    Ok(AnalysisOutcome::default())
}
