use std::{error::Error, fmt::Debug};

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// The log density oracle of the target distribution.
///
/// This needs to be implemented by users of the library to define
/// what distribution they want to sample from.
pub trait CpuLogpFunc {
    type LogpError: Debug + Send + Sync + Error + LogpError + 'static;

    /// The dimension of the parameter space.
    fn dim(&self) -> usize;

    /// Compute the unnormalized log density at `position` and write its
    /// gradient into `gradient`.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

impl<F: CpuLogpFunc + ?Sized> CpuLogpFunc for &mut F {
    type LogpError = F::LogpError;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        (**self).logp(position, gradient)
    }
}

pub mod test_logps {
    //! Log densities used in tests, benchmarks and demos.

    use faer::{
        linalg::{matmul::matmul, solvers::DenseSolveCore},
        Accum, ColMut, ColRef, Mat, Par, Side,
    };
    use thiserror::Error;

    use super::{CpuLogpFunc, LogpError};

    /// An isotropic normal distribution with mean `mu` and unit variance.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        pub dim: usize,
        pub mu: f64,
    }

    impl NormalLogp {
        pub fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    #[derive(Error, Debug)]
    pub enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    impl CpuLogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = self.mu - p;
                logp -= val * val / 2.;
                *g = val;
            }
            Ok(logp)
        }
    }

    /// A normal distribution with independent coordinates and individual
    /// standard deviations.
    #[derive(Clone, Debug)]
    pub struct ScaledNormalLogp {
        pub mu: Box<[f64]>,
        pub sigma: Box<[f64]>,
    }

    impl ScaledNormalLogp {
        pub fn new(mu: &[f64], sigma: &[f64]) -> Self {
            assert!(mu.len() == sigma.len());
            Self {
                mu: mu.into(),
                sigma: sigma.into(),
            }
        }
    }

    impl CpuLogpFunc for ScaledNormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.mu.len()
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let mut logp = 0f64;
            for (((p, g), mu), sigma) in position
                .iter()
                .zip(gradient.iter_mut())
                .zip(self.mu.iter())
                .zip(self.sigma.iter())
            {
                let z = (p - mu) / sigma;
                logp -= z * z / 2.;
                *g = -z / sigma;
            }
            Ok(logp)
        }
    }

    /// A multivariate normal distribution with a full covariance matrix.
    #[derive(Clone, Debug)]
    pub struct CorrelatedNormalLogp {
        mu: Box<[f64]>,
        precision: Mat<f64>,
        diff: Box<[f64]>,
    }

    impl CorrelatedNormalLogp {
        /// Returns `None` unless `covariance` is a positive definite
        /// `mu.len() x mu.len()` matrix.
        pub fn new(mu: &[f64], covariance: &Mat<f64>) -> Option<Self> {
            if (covariance.nrows() != mu.len()) | (covariance.ncols() != mu.len()) {
                return None;
            }
            let precision = covariance.llt(Side::Lower).ok()?.inverse();
            Some(Self {
                mu: mu.into(),
                precision,
                diff: vec![0f64; mu.len()].into(),
            })
        }
    }

    impl CpuLogpFunc for CorrelatedNormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.mu.len()
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            for ((d, p), mu) in self.diff.iter_mut().zip(position).zip(self.mu.iter()) {
                *d = mu - p;
            }
            matmul(
                ColMut::from_slice_mut(gradient),
                Accum::Replace,
                &self.precision,
                ColRef::from_slice(&self.diff),
                1f64,
                Par::Seq,
            );
            let quad: f64 = self.diff.iter().zip(gradient.iter()).map(|(d, g)| d * g).sum();
            Ok(-quad / 2.)
        }
    }

    #[derive(Error, Debug)]
    pub enum BarrierError {
        #[error("position outside of the support: {0}")]
        OutOfSupport(f64),
        #[error("the model is broken")]
        Broken,
    }

    impl LogpError for BarrierError {
        fn is_recoverable(&self) -> bool {
            matches!(self, BarrierError::OutOfSupport(_))
        }
    }

    /// A standard normal restricted to `|x_i| < bound`.
    ///
    /// Positions outside of the bound report a recoverable error, which the
    /// sampler treats as a divergence. With `broken` set, every evaluation
    /// after the first `healthy_evals` fails with an unrecoverable error.
    #[derive(Clone, Debug)]
    pub struct BarrierLogp {
        pub dim: usize,
        pub bound: f64,
        pub broken: bool,
        pub healthy_evals: usize,
        pub evals: usize,
    }

    impl BarrierLogp {
        pub fn new(dim: usize, bound: f64) -> Self {
            Self {
                dim,
                bound,
                broken: false,
                healthy_evals: 0,
                evals: 0,
            }
        }

        pub fn broken_after(dim: usize, healthy_evals: usize) -> Self {
            Self {
                dim,
                bound: f64::INFINITY,
                broken: true,
                healthy_evals,
                evals: 0,
            }
        }
    }

    impl CpuLogpFunc for BarrierLogp {
        type LogpError = BarrierError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, BarrierError> {
            self.evals += 1;
            if self.broken & (self.evals > self.healthy_evals) {
                return Err(BarrierError::Broken);
            }
            if let Some(&x) = position.iter().find(|x| x.abs() >= self.bound) {
                return Err(BarrierError::OutOfSupport(x));
            }
            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                logp -= p * p / 2.;
                *g = -p;
            }
            Ok(logp)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    use super::{test_logps::CorrelatedNormalLogp, CpuLogpFunc};

    #[test]
    fn correlated_normal_gradient() {
        let covariance = Mat::from_fn(2, 2, |i, j| if i == j { 2. } else { 1. });
        let mut logp = CorrelatedNormalLogp::new(&[0., 0.], &covariance).unwrap();
        let mut grad = [0f64; 2];
        let value = logp.logp(&[1., 0.], &mut grad).unwrap();
        assert_abs_diff_eq!(value, -1. / 3., epsilon = 1e-12);
        assert_abs_diff_eq!(grad[0], -2. / 3., epsilon = 1e-12);
        assert_abs_diff_eq!(grad[1], 1. / 3., epsilon = 1e-12);

        let singular = Mat::from_fn(2, 2, |_, _| 1.);
        assert!(CorrelatedNormalLogp::new(&[0., 0.], &singular).is_none());
        assert!(CorrelatedNormalLogp::new(&[0.], &covariance).is_none());
    }
}
