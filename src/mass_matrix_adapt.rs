use std::fmt::Debug;

use faer::{linalg::matmul::matmul, Accum, ColRef, Mat, Par, Scale};
use itertools::izip;

use crate::{
    adapt_strategy::Adaptor,
    error::{AdaptError, Result, SamplerError},
    mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix, UnitMassMatrix},
};

/// Weight of the identity in the regularized estimate.
const REGULARIZATION_SCALE: f64 = 1e-3;
const REGULARIZATION_PRIOR_COUNT: f64 = 5.;

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassMatrixAdaptOptions {
    /// Shrink the estimate towards a small multiple of the identity.
    pub regularize: bool,
}

impl Default for MassMatrixAdaptOptions {
    fn default() -> Self {
        Self { regularize: true }
    }
}

fn shrinkage(count: u64) -> (f64, f64) {
    let n = count as f64;
    let weight = n / (n + REGULARIZATION_PRIOR_COUNT);
    let ridge = REGULARIZATION_SCALE * REGULARIZATION_PRIOR_COUNT / (n + REGULARIZATION_PRIOR_COUNT);
    (weight, ridge)
}

/// Online estimate of the posterior over a warmup window.
pub trait Estimator: Clone + Debug + Send {
    fn add_sample(&mut self, value: &[f64]);
    fn count(&self) -> u64;
    fn reset(&mut self);
}

/// Only counts samples. Used by metrics without free parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleCounter {
    count: u64,
}

impl Estimator for SampleCounter {
    fn add_sample(&mut self, _value: &[f64]) {
        self.count += 1;
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Welford estimate of the elementwise mean and variance.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// The unbiased variance estimate, optionally regularized.
    ///
    /// Returns `None` with fewer than two samples.
    pub fn variance(&self, regularize: bool) -> Option<Box<[f64]>> {
        if self.count < 2 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        let (weight, ridge) = if regularize {
            shrinkage(self.count)
        } else {
            (1., 0.)
        };
        Some(
            self.m2
                .iter()
                .map(|m2| weight * m2 * scale + ridge)
                .collect(),
        )
    }
}

impl Estimator for RunningVariance {
    fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let diff_scale = (self.count as f64).recip();
        pulp::Arch::new().dispatch(|| {
            izip!(self.mean.iter_mut(), self.m2.iter_mut(), value.iter()).for_each(
                |(mean, m2, &x)| {
                    let diff = x - *mean;
                    *mean += diff * diff_scale;
                    *m2 += diff * (x - *mean);
                },
            );
        })
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean.iter_mut().for_each(|x| *x = 0.);
        self.m2.iter_mut().for_each(|x| *x = 0.);
        self.count = 0;
    }
}

/// Welford estimate of the mean and the full covariance matrix.
#[derive(Debug, Clone)]
pub struct RunningCovariance {
    mean: Box<[f64]>,
    diff: Box<[f64]>,
    right: Box<[f64]>,
    m2: Mat<f64>,
    count: u64,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            diff: vec![0f64; dim].into(),
            right: vec![0f64; dim].into(),
            m2: Mat::zeros(dim, dim),
            count: 0,
        }
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// The unbiased covariance estimate, optionally regularized.
    ///
    /// Returns `None` with fewer than two samples.
    pub fn covariance(&self, regularize: bool) -> Option<Mat<f64>> {
        if self.count < 2 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        let (weight, ridge) = if regularize {
            shrinkage(self.count)
        } else {
            (1., 0.)
        };
        let mut cov = &self.m2 + self.m2.transpose();
        cov *= Scale(0.5 * weight * scale);
        cov.diagonal_mut()
            .column_vector_mut()
            .iter_mut()
            .for_each(|x| *x += ridge);
        Some(cov)
    }
}

impl Estimator for RunningCovariance {
    fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let diff_scale = (self.count as f64).recip();

        // diff holds x - mean_old, right holds x - mean_new
        pulp::Arch::new().dispatch(|| {
            izip!(
                self.diff.iter_mut(),
                self.right.iter_mut(),
                self.mean.iter_mut(),
                value.iter()
            )
            .for_each(|(diff, right, mean, &x)| {
                *diff = x - *mean;
                *mean += *diff * diff_scale;
                *right = x - *mean;
            });
        });
        matmul(
            &mut self.m2,
            Accum::Add,
            ColRef::from_slice(&self.diff),
            ColRef::from_slice(&self.right).transpose(),
            1f64,
            Par::Seq,
        );
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean.iter_mut().for_each(|x| *x = 0.);
        self.m2.as_mut().fill(0.);
        self.count = 0;
    }
}

/// A mass matrix that can be estimated from draws.
pub trait AdaptableMassMatrix: MassMatrix + 'static {
    type Estimator: Estimator;

    fn new_estimator(&self) -> Self::Estimator;

    /// Build the metric from the current estimate, or `None` if the
    /// estimate can not (yet) change the metric.
    fn updated(
        &self,
        estimator: &Self::Estimator,
        options: &MassMatrixAdaptOptions,
    ) -> Result<Option<Self>>;
}

impl AdaptableMassMatrix for UnitMassMatrix {
    type Estimator = SampleCounter;

    fn new_estimator(&self) -> SampleCounter {
        SampleCounter::default()
    }

    fn updated(&self, _: &SampleCounter, _: &MassMatrixAdaptOptions) -> Result<Option<Self>> {
        Ok(None)
    }
}

impl AdaptableMassMatrix for DiagMassMatrix {
    type Estimator = RunningVariance;

    fn new_estimator(&self) -> RunningVariance {
        RunningVariance::new(self.dim())
    }

    fn updated(
        &self,
        estimator: &RunningVariance,
        options: &MassMatrixAdaptOptions,
    ) -> Result<Option<Self>> {
        estimator
            .variance(options.regularize)
            .map(|var| DiagMassMatrix::from_variance(&var))
            .transpose()
    }
}

impl AdaptableMassMatrix for DenseMassMatrix {
    type Estimator = RunningCovariance;

    fn new_estimator(&self) -> RunningCovariance {
        RunningCovariance::new(self.dim())
    }

    fn updated(
        &self,
        estimator: &RunningCovariance,
        options: &MassMatrixAdaptOptions,
    ) -> Result<Option<Self>> {
        estimator
            .covariance(options.regularize)
            .map(DenseMassMatrix::from_covariance)
            .transpose()
    }
}

/// Estimates the mass matrix from warmup draws.
///
/// Used on its own, the estimate over all warmup draws replaces the metric
/// when the adaptor is finalized. Inside a staged adaptor the metric is
/// also replaced at the end of every estimation window, after which the
/// estimate starts over.
#[derive(Debug, Clone)]
pub struct MassMatrixAdaptor<Mass: AdaptableMassMatrix> {
    current: Mass,
    estimator: Mass::Estimator,
    options: MassMatrixAdaptOptions,
    pending: Option<Mass>,
    finalized: bool,
}

impl<Mass: AdaptableMassMatrix> MassMatrixAdaptor<Mass> {
    pub fn new(initial: Mass, options: MassMatrixAdaptOptions) -> Self {
        Self {
            estimator: initial.new_estimator(),
            current: initial,
            options,
            pending: None,
            finalized: false,
        }
    }

    /// The metric that was most recently produced by the adaptor.
    pub fn current(&self) -> &Mass {
        &self.current
    }

    pub fn estimator(&self) -> &Mass::Estimator {
        &self.estimator
    }

    fn replace_metric(&mut self) -> Result<bool> {
        let Some(mass) = self.current.updated(&self.estimator, &self.options)? else {
            return Ok(false);
        };
        log::debug!(
            "Replacing mass matrix after {} draws",
            self.estimator.count()
        );
        self.current = mass.clone();
        self.pending = Some(mass);
        self.estimator.reset();
        Ok(true)
    }
}

impl<Mass: AdaptableMassMatrix> Adaptor<Mass> for MassMatrixAdaptor<Mass> {
    fn adapt(&mut self, position: &[f64], _accept_prob: f64) -> Result<()> {
        if self.finalized {
            return Err(AdaptError::AdaptAfterFinalize.into());
        }
        if position.len() != self.current.dim() {
            return Err(SamplerError::ShapeMismatch {
                expected: self.current.dim(),
                found: position.len(),
            });
        }
        self.estimator.add_sample(position);
        Ok(())
    }

    fn end_window(&mut self) -> Result<bool> {
        if self.finalized {
            return Err(AdaptError::AdaptAfterFinalize.into());
        }
        self.replace_metric()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(AdaptError::AlreadyFinalized.into());
        }
        self.replace_metric()?;
        self.finalized = true;
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn take_mass_matrix(&mut self) -> Option<Mass> {
        self.pending.take()
    }

    fn dim(&self) -> Option<usize> {
        Some(self.current.dim())
    }
}
