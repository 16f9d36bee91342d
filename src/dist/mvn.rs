use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MvnError {
    #[error("covariance matrix is not positive definite (dimension {0})")]
    NotPositiveDefinite(usize),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("marginalisation index {index} out of range for dimension {dim}")]
    IndexOutOfRange { index: usize, dim: usize },
}

/// Which of the two matrix representations currently holds authoritative
/// values. `Both` means the last conversion is still valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
    CovarianceCurrent,
    PrecisionCurrent,
    Both,
}

/// Multivariate Gaussian with dual covariance/precision storage.
///
/// One representation is authoritative at a time; requesting the other
/// triggers a Cholesky inversion whose result is cached until the next
/// mutation. Every matrix that enters or leaves an inversion is
/// symmetrised, so round-trips stay within Cholesky tolerance.
#[derive(Debug, Clone)]
pub struct Mvn {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    precision: DMatrix<f64>,
    repr: Repr,
}

fn symmetrise(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

fn invert_spd(m: &DMatrix<f64>) -> Result<(DMatrix<f64>, f64), MvnError> {
    let sym = symmetrise(m);
    let n = sym.nrows();
    let chol = Cholesky::new(sym).ok_or(MvnError::NotPositiveDefinite(n))?;
    let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    Ok((symmetrise(&chol.inverse()), log_det))
}

impl Mvn {
    /// Unit Gaussian of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            mean: DVector::zeros(dim),
            covariance: DMatrix::identity(dim, dim),
            precision: DMatrix::identity(dim, dim),
            repr: Repr::Both,
        }
    }

    pub fn from_mean_covariance(mean: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        let dim = mean.len();
        Self {
            mean,
            covariance: symmetrise(&covariance),
            precision: DMatrix::zeros(dim, dim),
            repr: Repr::CovarianceCurrent,
        }
    }

    pub fn from_mean_precision(mean: DVector<f64>, precision: DMatrix<f64>) -> Self {
        let dim = mean.len();
        Self {
            mean,
            covariance: DMatrix::zeros(dim, dim),
            precision: symmetrise(&precision),
            repr: Repr::PrecisionCurrent,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn set_mean(&mut self, mean: DVector<f64>) {
        assert_eq!(mean.len(), self.dim());
        self.mean = mean;
    }

    pub fn set_covariance(&mut self, covariance: DMatrix<f64>) {
        assert_eq!(covariance.nrows(), self.dim());
        self.covariance = symmetrise(&covariance);
        self.repr = Repr::CovarianceCurrent;
    }

    pub fn set_precision(&mut self, precision: DMatrix<f64>) {
        assert_eq!(precision.nrows(), self.dim());
        self.precision = symmetrise(&precision);
        self.repr = Repr::PrecisionCurrent;
    }

    /// Covariance matrix, inverting the stored precision if necessary.
    pub fn covariance(&mut self) -> Result<&DMatrix<f64>, MvnError> {
        if self.repr == Repr::PrecisionCurrent {
            let (cov, _) = invert_spd(&self.precision)?;
            self.covariance = cov;
            self.repr = Repr::Both;
        }
        Ok(&self.covariance)
    }

    /// Precision matrix, inverting the stored covariance if necessary.
    pub fn precision(&mut self) -> Result<&DMatrix<f64>, MvnError> {
        if self.repr == Repr::CovarianceCurrent {
            let (prec, _) = invert_spd(&self.covariance)?;
            self.precision = prec;
            self.repr = Repr::Both;
        }
        Ok(&self.precision)
    }

    pub fn log_det_covariance(&mut self) -> Result<f64, MvnError> {
        match self.repr {
            Repr::CovarianceCurrent | Repr::Both => {
                let sym = symmetrise(&self.covariance);
                let chol =
                    Cholesky::new(sym).ok_or(MvnError::NotPositiveDefinite(self.dim()))?;
                Ok(2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>())
            }
            Repr::PrecisionCurrent => {
                let (cov, log_det_prec) = invert_spd(&self.precision)?;
                self.covariance = cov;
                self.repr = Repr::Both;
                Ok(-log_det_prec)
            }
        }
    }

    /// Block-diagonal combination of two independent Gaussians.
    pub fn concatenate(a: &mut Mvn, b: &mut Mvn) -> Result<Mvn, MvnError> {
        let (na, nb) = (a.dim(), b.dim());
        let mut mean = DVector::zeros(na + nb);
        mean.rows_mut(0, na).copy_from(&a.mean);
        mean.rows_mut(na, nb).copy_from(&b.mean);

        let mut covariance = DMatrix::zeros(na + nb, na + nb);
        covariance
            .view_mut((0, 0), (na, na))
            .copy_from(a.covariance()?);
        covariance
            .view_mut((na, na), (nb, nb))
            .copy_from(b.covariance()?);

        Ok(Mvn::from_mean_covariance(mean, covariance))
    }

    /// Marginal distribution over the given parameter indices.
    pub fn marginalise(&mut self, indices: &[usize]) -> Result<Mvn, MvnError> {
        let dim = self.dim();
        for &i in indices {
            if i >= dim {
                return Err(MvnError::IndexOutOfRange { index: i, dim });
            }
        }
        let cov = self.covariance()?.clone();
        let mean = DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.mean[i]));
        let mut sub = DMatrix::zeros(indices.len(), indices.len());
        for (r, &i) in indices.iter().enumerate() {
            for (c, &j) in indices.iter().enumerate() {
                sub[(r, c)] = cov[(i, j)];
            }
        }
        Ok(Mvn::from_mean_covariance(mean, sub))
    }

    /// KL(self || other) for two Gaussians of the same dimension.
    pub fn kl_divergence(&mut self, other: &mut Mvn) -> Result<f64, MvnError> {
        let n = self.dim();
        if other.dim() != n {
            return Err(MvnError::DimensionMismatch {
                expected: n,
                actual: other.dim(),
            });
        }
        let log_det_q = self.log_det_covariance()?;
        let log_det_p = other.log_det_covariance()?;
        let prec_p = other.precision()?.clone();
        let cov_q = self.covariance()?;

        let trace = (&prec_p * cov_q).trace();
        let diff = &other.mean - &self.mean;
        let quad = (diff.transpose() * &prec_p * &diff)[(0, 0)];
        Ok(0.5 * (trace + quad - n as f64 + log_det_p - log_det_q))
    }

    /// Draw one sample. Test support only; inference never samples.
    pub fn sample<R: Rng>(&mut self, rng: &mut R) -> Result<DVector<f64>, MvnError> {
        let cov = symmetrise(self.covariance()?);
        let chol = Cholesky::new(cov).ok_or(MvnError::NotPositiveDefinite(self.dim()))?;
        let z = DVector::from_iterator(self.dim(), (0..self.dim()).map(|_| rng.sample(StandardNormal)));
        Ok(&self.mean + chol.l() * z)
    }
}
