use crate::data::NeighbourGraph;
use crate::dist::{DistParams, Mvn, MvnError};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Precision floor keeping the posterior update SPD when a spatial prior has
/// no neighbours to draw on.
const MIN_PRIOR_PRECISION: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum PriorError {
    #[error("Invalid prior type code: {0:?}")]
    InvalidCode(char),

    #[error("Prior type string {spec:?} does not match parameter count {n_params}")]
    LengthMismatch { spec: String, n_params: usize },

    #[error("Image prior for parameter {0} has no volume loaded")]
    MissingImage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorKind {
    /// Fixed Gaussian from configuration.
    Normal,
    /// Voxelwise mean from an external volume.
    Image,
    /// Automatic relevance determination.
    Ard,
    /// Markov-random-field shrinkage toward first-order neighbour means.
    SpatialM,
    /// As M with the Dirichlet-boundary neighbour count at edges.
    SpatialMDirichlet,
    /// Evidence-optimised prior over the full K(delta) kernel.
    SpatialP,
    /// As P with K restricted to first-order neighbours.
    SpatialPFirstOrder,
}

impl PriorKind {
    pub fn from_code(code: char) -> Result<Self, PriorError> {
        match code {
            'N' => Ok(PriorKind::Normal),
            'I' => Ok(PriorKind::Image),
            'A' => Ok(PriorKind::Ard),
            'M' => Ok(PriorKind::SpatialM),
            'm' => Ok(PriorKind::SpatialMDirichlet),
            'P' => Ok(PriorKind::SpatialP),
            'p' => Ok(PriorKind::SpatialPFirstOrder),
            _ => Err(PriorError::InvalidCode(code)),
        }
    }

    pub fn code(self) -> char {
        match self {
            PriorKind::Normal => 'N',
            PriorKind::Image => 'I',
            PriorKind::Ard => 'A',
            PriorKind::SpatialM => 'M',
            PriorKind::SpatialMDirichlet => 'm',
            PriorKind::SpatialP => 'P',
            PriorKind::SpatialPFirstOrder => 'p',
        }
    }

    pub fn is_spatial(self) -> bool {
        matches!(
            self,
            PriorKind::SpatialM
                | PriorKind::SpatialMDirichlet
                | PriorKind::SpatialP
                | PriorKind::SpatialPFirstOrder
        )
    }

    /// Penny-style kinds whose hyper-parameters come from evidence
    /// optimisation over K(delta).
    pub fn uses_kernel(self) -> bool {
        matches!(self, PriorKind::SpatialP | PriorKind::SpatialPFirstOrder)
    }
}

/// Parse a prior-type string such as "NMA" or "M+". A trailing '+' repeats
/// the final character out to the parameter count; an empty string means
/// all-Normal.
pub fn parse_prior_types(spec: &str, n_params: usize) -> Result<Vec<PriorKind>, PriorError> {
    if spec.is_empty() {
        return Ok(vec![PriorKind::Normal; n_params]);
    }
    let mut chars: Vec<char> = spec.chars().collect();
    if chars.last() == Some(&'+') {
        chars.pop();
        let last = *chars.last().ok_or_else(|| PriorError::LengthMismatch {
            spec: spec.to_string(),
            n_params,
        })?;
        while chars.len() < n_params {
            chars.push(last);
        }
    }
    if chars.len() != n_params {
        return Err(PriorError::LengthMismatch {
            spec: spec.to_string(),
            n_params,
        });
    }
    chars.into_iter().map(PriorKind::from_code).collect()
}

/// Prior state for one model parameter. The base distribution is fixed at
/// setup; the spatial fields are derived state, rewritten between outer
/// sweeps from the current posteriors and the neighbour graph.
#[derive(Debug, Clone)]
pub struct ParamPrior {
    pub kind: PriorKind,
    /// Fabber-space base prior.
    pub base: DistParams,
    /// Per-voxel fabber-space means for image priors.
    pub image_means: Option<DVector<f64>>,
    pub rho: f64,
    pub delta: f64,
    spatial_mean: Option<DVector<f64>>,
    spatial_prec: Option<DVector<f64>>,
}

impl ParamPrior {
    pub fn new(kind: PriorKind, base: DistParams) -> Self {
        Self {
            kind,
            base,
            image_means: None,
            rho: 1.0,
            delta: 1.0,
            spatial_mean: None,
            spatial_prec: None,
        }
    }

    /// Effective (mean, precision) contribution for one voxel. ARD reads the
    /// current posterior marginal, so the contribution tracks the posterior
    /// as it shrinks.
    pub fn effective(
        &self,
        voxel: usize,
        posterior_mean: f64,
        posterior_var: f64,
    ) -> (f64, f64) {
        match self.kind {
            PriorKind::Normal => (self.base.mean, self.base.precision()),
            PriorKind::Image => {
                let mean = self
                    .image_means
                    .as_ref()
                    .map(|m| m[voxel])
                    .unwrap_or(self.base.mean);
                (mean, self.base.precision())
            }
            PriorKind::Ard => {
                let prec = 1.0 / (posterior_mean * posterior_mean + posterior_var);
                (0.0, prec.max(MIN_PRIOR_PRECISION))
            }
            _ => match (&self.spatial_mean, &self.spatial_prec) {
                (Some(mean), Some(prec)) => {
                    (mean[voxel], prec[voxel].max(MIN_PRIOR_PRECISION))
                }
                // Before the first derivation the spatial prior is vague.
                _ => (self.base.mean, MIN_PRIOR_PRECISION),
            },
        }
    }

    /// Rewrite the derived per-voxel state of an M/m prior from the current
    /// posterior means.
    pub fn update_spatial_mrf(&mut self, means: &DVector<f64>, graph: &NeighbourGraph) {
        let n = means.len();
        let mut mean = DVector::zeros(n);
        let mut prec = DVector::zeros(n);
        for v in 0..n {
            let neighbours = graph.first_order(v);
            if !neighbours.is_empty() {
                mean[v] = neighbours.iter().map(|&u| means[u]).sum::<f64>()
                    / neighbours.len() as f64;
            }
            let count = match self.kind {
                PriorKind::SpatialMDirichlet => graph.interior_count(),
                _ => neighbours.len(),
            };
            prec[v] = self.rho * count as f64;
        }
        self.spatial_mean = Some(mean);
        self.spatial_prec = Some(prec);
    }

    /// Rewrite the derived per-voxel state of a P/p prior from the kernel
    /// inverse: the conditional of the zero-mean field at each voxel given
    /// the current means elsewhere.
    pub fn update_spatial_kernel(&mut self, means: &DVector<f64>, kinv: &DMatrix<f64>) {
        let n = means.len();
        let mut mean = DVector::zeros(n);
        let mut prec = DVector::zeros(n);
        for v in 0..n {
            let diag = kinv[(v, v)];
            let mut cross = 0.0;
            for u in 0..n {
                if u != v {
                    cross += kinv[(v, u)] * means[u];
                }
            }
            prec[v] = self.rho * diag;
            mean[v] = if diag.abs() > 0.0 { -cross / diag } else { 0.0 };
        }
        self.spatial_mean = Some(mean);
        self.spatial_prec = Some(prec);
    }
}

/// Effective prior over all parameters at one voxel: precision-weighted
/// combination of each parameter's contributions, as consumed by the VB
/// update. Returns (mu0, diagonal of Lambda0).
pub fn assemble_voxel_prior(
    priors: &[ParamPrior],
    voxel: usize,
    posterior: &mut Mvn,
) -> Result<(DVector<f64>, DVector<f64>), MvnError> {
    let p = priors.len();
    let post_mean = posterior.mean().clone();
    let post_cov_diag = posterior.covariance()?.diagonal();

    let mut mu0 = DVector::zeros(p);
    let mut lambda0 = DVector::zeros(p);
    for (i, prior) in priors.iter().enumerate() {
        let (mean, prec) = prior.effective(voxel, post_mean[i], post_cov_diag[i]);
        mu0[i] = mean;
        lambda0[i] = prec;
    }
    Ok((mu0, lambda0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_plain_and_repeated() {
        let kinds = parse_prior_types("NMA", 3).unwrap();
        assert_eq!(
            kinds,
            vec![PriorKind::Normal, PriorKind::SpatialM, PriorKind::Ard]
        );

        let kinds = parse_prior_types("M+", 4).unwrap();
        assert!(kinds.iter().all(|k| *k == PriorKind::SpatialM));

        let kinds = parse_prior_types("", 2).unwrap();
        assert!(kinds.iter().all(|k| *k == PriorKind::Normal));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_prior_types("NX", 2),
            Err(PriorError::InvalidCode('X'))
        ));
        assert!(matches!(
            parse_prior_types("NN", 3),
            Err(PriorError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_normal_contribution() {
        let prior = ParamPrior::new(PriorKind::Normal, DistParams::new(2.0, 4.0));
        let (mean, prec) = prior.effective(0, 0.0, 1.0);
        assert_relative_eq!(mean, 2.0);
        assert_relative_eq!(prec, 0.25);
    }

    #[test]
    fn test_ard_tracks_posterior() {
        let prior = ParamPrior::new(PriorKind::Ard, DistParams::new(0.0, 1e6));
        let (mean, prec) = prior.effective(0, 2.0, 1.0);
        assert_relative_eq!(mean, 0.0);
        assert_relative_eq!(prec, 1.0 / 5.0);

        // Shrinking posterior drives the ARD precision up.
        let (_, prec_small) = prior.effective(0, 0.01, 0.01);
        assert!(prec_small > prec);
    }

    #[test]
    fn test_spatial_mrf_derivation() {
        let coords = vec![[0, 0, 0], [1, 0, 0], [2, 0, 0]];
        let graph = NeighbourGraph::build(&coords, 1).unwrap();
        let mut prior = ParamPrior::new(PriorKind::SpatialM, DistParams::new(0.0, 1e6));
        prior.rho = 2.0;
        prior.update_spatial_mrf(&DVector::from_vec(vec![1.0, 2.0, 7.0]), &graph);

        // Middle voxel averages its two neighbours; edge voxel sees one.
        let (mean1, prec1) = prior.effective(1, 0.0, 1.0);
        assert_relative_eq!(mean1, 4.0);
        assert_relative_eq!(prec1, 4.0);
        let (mean0, prec0) = prior.effective(0, 0.0, 1.0);
        assert_relative_eq!(mean0, 2.0);
        assert_relative_eq!(prec0, 2.0);
    }

    #[test]
    fn test_spatial_dirichlet_edge_count() {
        let coords = vec![[0, 0, 0], [1, 0, 0]];
        let graph = NeighbourGraph::build(&coords, 1).unwrap();
        let mut prior = ParamPrior::new(PriorKind::SpatialMDirichlet, DistParams::new(0.0, 1e6));
        prior.rho = 1.0;
        prior.update_spatial_mrf(&DVector::from_vec(vec![0.0, 0.0]), &graph);

        // Both voxels are edges; the Dirichlet variant uses the interior count.
        let (_, prec) = prior.effective(0, 0.0, 1.0);
        assert_relative_eq!(prec, 2.0);
    }

    #[test]
    fn test_spatial_kernel_conditional() {
        let mut prior = ParamPrior::new(PriorKind::SpatialP, DistParams::new(0.0, 1e6));
        prior.rho = 3.0;
        let kinv = DMatrix::from_row_slice(2, 2, &[2.0, -1.0, -1.0, 2.0]);
        prior.update_spatial_kernel(&DVector::from_vec(vec![0.0, 4.0]), &kinv);

        let (mean0, prec0) = prior.effective(0, 0.0, 1.0);
        assert_relative_eq!(prec0, 6.0);
        assert_relative_eq!(mean0, 2.0); // -(-1*4)/2
    }

    #[test]
    fn test_assemble_voxel_prior() {
        let priors = vec![
            ParamPrior::new(PriorKind::Normal, DistParams::new(1.0, 2.0)),
            ParamPrior::new(PriorKind::Ard, DistParams::new(0.0, 1e6)),
        ];
        let mut posterior = Mvn::from_mean_covariance(
            DVector::from_vec(vec![0.5, 3.0]),
            DMatrix::identity(2, 2),
        );
        let (mu0, lambda0) = assemble_voxel_prior(&priors, 0, &mut posterior).unwrap();
        assert_relative_eq!(mu0[0], 1.0);
        assert_relative_eq!(lambda0[0], 0.5);
        assert_relative_eq!(mu0[1], 0.0);
        assert_relative_eq!(lambda0[1], 0.1);
    }
}
