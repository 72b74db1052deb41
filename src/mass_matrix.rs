use std::fmt::Debug;

use faer::{
    linalg::{matmul::matmul, triangular_solve::solve_upper_triangular_in_place},
    Accum, ColMut, ColRef, Mat, Par, Side,
};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    error::{Result, SamplerError},
    math::{multiply, vector_dot},
};

/// The metric of the euclidean phase space.
///
/// The mass matrix `M` defines the kinetic energy `p^T M^{-1} p / 2` and the
/// distribution `N(0, M)` that momenta are drawn from. Implementations store
/// the inverse mass matrix, which is what warmup estimates.
pub trait MassMatrix: Clone + Debug + Send {
    fn dim(&self) -> usize;

    /// Compute the velocity `M^{-1} p`.
    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]);

    fn kinetic_energy(&self, momentum: &[f64], velocity: &[f64]) -> f64 {
        0.5 * vector_dot(momentum, velocity)
    }

    /// Draw a momentum from `N(0, M)`.
    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]);

    /// The diagonal of the inverse mass matrix.
    fn inv_mass_diag(&self) -> Box<[f64]>;
}

/// The identity mass matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMassMatrix {
    dim: usize,
}

impl UnitMassMatrix {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl MassMatrix for UnitMassMatrix {
    fn dim(&self) -> usize {
        self.dim
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        velocity.copy_from_slice(momentum);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        momentum.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
    }

    fn inv_mass_diag(&self) -> Box<[f64]> {
        vec![1f64; self.dim].into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    /// A diagonal mass matrix that starts out as the identity.
    pub fn new(dim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    /// Construct the mass matrix from the diagonal of its inverse, the
    /// (estimated) posterior variances.
    pub fn from_variance(variance: &[f64]) -> Result<Self> {
        let mut mass_matrix = Self::new(variance.len());
        mass_matrix.update_diag(variance.iter().copied())?;
        Ok(mass_matrix)
    }

    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) -> Result<()> {
        let mut count = 0;
        for (var, inv_std, x) in izip!(
            self.variance.iter_mut(),
            self.inv_stds.iter_mut(),
            new_variance
        ) {
            if !(x.is_finite() & (x > 0f64)) {
                return Err(SamplerError::MassMatrix(format!(
                    "illegal variance on mass matrix diagonal: {}",
                    x
                )));
            }
            *var = x;
            *inv_std = x.recip().sqrt();
            count += 1;
        }
        if count != self.variance.len() {
            return Err(SamplerError::ShapeMismatch {
                expected: self.variance.len(),
                found: count,
            });
        }
        Ok(())
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }
}

impl MassMatrix for DiagMassMatrix {
    fn dim(&self) -> usize {
        self.variance.len()
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        multiply(&self.variance, momentum, velocity);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        momentum
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    fn inv_mass_diag(&self) -> Box<[f64]> {
        self.variance.clone()
    }
}

/// A dense mass matrix.
///
/// Stores the inverse mass matrix `Σ` and its lower cholesky factor `L`
/// with `Σ = L L^T`. Momenta are drawn as `L^{-T} z`.
#[derive(Debug, Clone)]
pub struct DenseMassMatrix {
    inv_mass: Mat<f64>,
    chol: Mat<f64>,
}

impl DenseMassMatrix {
    pub fn new(dim: usize) -> Self {
        Self {
            inv_mass: Mat::identity(dim, dim),
            chol: Mat::identity(dim, dim),
        }
    }

    /// Construct the mass matrix from its inverse, the (estimated) posterior
    /// covariance. Fails if that matrix is not symmetric positive definite.
    pub fn from_covariance(covariance: Mat<f64>) -> Result<Self> {
        let dim = covariance.nrows();
        if covariance.ncols() != dim {
            return Err(SamplerError::ShapeMismatch {
                expected: dim,
                found: covariance.ncols(),
            });
        }
        let asymmetry = (&covariance - covariance.transpose()).norm_max();
        if !(asymmetry <= 1e-10 * (1f64 + covariance.norm_max())) {
            return Err(SamplerError::MassMatrix(format!(
                "inverse mass matrix is not symmetric, max deviation {}",
                asymmetry
            )));
        }
        let chol = covariance
            .llt(Side::Lower)
            .map_err(|_| {
                SamplerError::MassMatrix("inverse mass matrix is not positive definite".into())
            })?
            .L()
            .to_owned();
        Ok(Self {
            inv_mass: covariance,
            chol,
        })
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.inv_mass
    }
}

impl PartialEq for DenseMassMatrix {
    fn eq(&self, other: &Self) -> bool {
        self.inv_mass == other.inv_mass
    }
}

impl MassMatrix for DenseMassMatrix {
    fn dim(&self) -> usize {
        self.inv_mass.nrows()
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        matmul(
            ColMut::from_slice_mut(velocity),
            Accum::Replace,
            &self.inv_mass,
            ColRef::from_slice(momentum),
            1f64,
            Par::Seq,
        );
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        assert!(momentum.len() == self.dim());
        momentum
            .iter_mut()
            .for_each(|p| *p = rng.sample(StandardNormal));
        solve_upper_triangular_in_place(
            self.chol.transpose(),
            ColMut::from_slice_mut(momentum).as_mat_mut(),
            Par::Seq,
        );
    }

    fn inv_mass_diag(&self) -> Box<[f64]> {
        self.inv_mass
            .diagonal()
            .column_vector()
            .iter()
            .copied()
            .collect()
    }
}
