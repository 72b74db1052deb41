use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, StandardUniform};

use crate::{
    cpu_math::CpuLogpFunc,
    error::{Result, SamplerError},
    mass_matrix::MassMatrix,
    math::{axpy, axpy_out, scalar_prods2, scalar_prods3, scalar_prods_of_diff},
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub(crate) fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// A point in phase space
///
/// Besides position and momentum this caches the log density gradient,
/// the velocity `M^{-1} p` and both energies, together with the location
/// of the point in the current trajectory. `p_sum` is the sum of the momenta
/// between the initial point of the trajectory and this point, which the
/// generalised turning criterion needs.
#[derive(Debug, Clone)]
pub struct Point {
    pub(crate) position: Box<[f64]>,
    pub(crate) momentum: Box<[f64]>,
    pub(crate) velocity: Box<[f64]>,
    pub(crate) gradient: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) potential_energy: f64,
    pub(crate) kinetic_energy: f64,
    pub(crate) index_in_trajectory: i64,
    pub(crate) initial_energy: f64,
}

impl Point {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            position: vec![0f64; dim].into(),
            momentum: vec![0f64; dim].into(),
            velocity: vec![0f64; dim].into(),
            gradient: vec![0f64; dim].into(),
            p_sum: vec![0f64; dim].into(),
            potential_energy: 0f64,
            kinetic_energy: 0f64,
            index_in_trajectory: 0,
            initial_energy: 0f64,
        }
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn momentum(&self) -> &[f64] {
        &self.momentum
    }

    /// The gradient of the log density at the position.
    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    pub fn velocity(&self) -> &[f64] {
        &self.velocity
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.kinetic_energy
    }

    /// The total energy (potential + kinetic)
    pub fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub fn initial_energy(&self) -> f64 {
        self.initial_energy
    }

    pub fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy
    }

    pub fn index_in_trajectory(&self) -> i64 {
        self.index_in_trajectory
    }

    /// Metropolis acceptance probability of this point as a proposal
    /// from the initial point of the trajectory.
    pub fn accept_prob(&self) -> f64 {
        let log_accept = (-self.energy_error()).min(0.);
        if log_accept.is_nan() {
            0f64
        } else {
            log_accept.exp()
        }
    }

    pub(crate) fn set_psum(&self, out: &mut Self) {
        assert!(out.index_in_trajectory != 0);

        if out.index_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    /// Mark this point as the start of a new trajectory.
    pub(crate) fn make_init_point(&mut self) {
        self.index_in_trajectory = 0;
        self.initial_energy = self.energy();
        self.p_sum.copy_from_slice(&self.momentum);
    }

    /// The turning criterion of the original No-U-Turn sampler.
    ///
    /// The trajectory between the two points turns if the difference of the
    /// positions has a negative inner product with the velocity at either end.
    pub(crate) fn is_turning_classic(&self, other: &Self) -> bool {
        let (start, end) = if self.index_in_trajectory < other.index_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let (turn1, turn2) = scalar_prods_of_diff(
            &end.position,
            &start.position,
            &end.velocity,
            &start.velocity,
        );

        (turn1 < 0.) | (turn2 < 0.)
    }

    /// The generalised turning criterion based on the sum of momenta.
    pub(crate) fn is_turning_generalised(&self, other: &Self) -> bool {
        let (start, end) = if self.index_in_trajectory < other.index_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.index_in_trajectory;
        let b = end.index_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(
                &end.p_sum,
                &start.p_sum,
                &start.momentum,
                &end.velocity,
                &start.velocity,
            )
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.velocity, &start.velocity)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(
                &start.p_sum,
                &end.p_sum,
                &end.momentum,
                &end.velocity,
                &start.velocity,
            )
        };

        (turn1 < 0.) | (turn2 < 0.)
    }
}

/// The hamiltonian defined by the potential energy and the kinetic energy
///
/// The potential energy is the negative log density of the target, the
/// kinetic energy is defined by the mass matrix. A hamiltonian is never
/// resized or re-targeted in place: a new mass matrix produces a new
/// hamiltonian through [`Hamiltonian::with_mass_matrix`].
#[derive(Debug)]
pub struct Hamiltonian<F: CpuLogpFunc, Mass: MassMatrix> {
    logp: F,
    mass_matrix: Mass,
}

impl<F: CpuLogpFunc, Mass: MassMatrix> Hamiltonian<F, Mass> {
    pub fn new(logp: F, mass_matrix: Mass) -> Result<Self> {
        if logp.dim() != mass_matrix.dim() {
            return Err(SamplerError::ShapeMismatch {
                expected: logp.dim(),
                found: mass_matrix.dim(),
            });
        }
        Ok(Self { logp, mass_matrix })
    }

    /// Replace the mass matrix, producing a new hamiltonian.
    pub fn with_mass_matrix(self, mass_matrix: Mass) -> Result<Self> {
        Self::new(self.logp, mass_matrix)
    }

    /// Swap in a new mass matrix of the same dimension and return the old one.
    ///
    /// Cached velocities and kinetic energies of existing points refer to
    /// the old metric until their momentum is refreshed.
    pub(crate) fn replace_mass_matrix(&mut self, mass_matrix: Mass) -> Result<Mass> {
        self.check_dim(mass_matrix.dim())?;
        Ok(std::mem::replace(&mut self.mass_matrix, mass_matrix))
    }

    pub fn into_parts(self) -> (F, Mass) {
        (self.logp, self.mass_matrix)
    }

    pub fn mass_matrix(&self) -> &Mass {
        &self.mass_matrix
    }

    /// The dimension of the hamiltonian (position only).
    pub fn dim(&self) -> usize {
        self.logp.dim()
    }

    pub(crate) fn logp_func(&mut self) -> &mut F {
        &mut self.logp
    }

    /// The negative log density at `position`.
    pub fn potential_energy(&mut self, position: &[f64]) -> Result<f64> {
        let mut gradient = vec![0f64; self.dim()];
        self.gradient(position, &mut gradient).map(|logp| -logp)
    }

    /// Write the gradient of the log density into `out` and return the log density.
    pub fn gradient(&mut self, position: &[f64], out: &mut [f64]) -> Result<f64> {
        self.check_dim(position.len())?;
        self.check_dim(out.len())?;
        self.logp
            .logp(position, out)
            .map_err(|e| SamplerError::LogpFailure(Box::new(e)))
    }

    pub fn kinetic_energy(&self, momentum: &[f64]) -> Result<f64> {
        self.check_dim(momentum.len())?;
        let mut velocity = vec![0f64; self.dim()];
        self.mass_matrix.update_velocity(momentum, &mut velocity);
        Ok(self.mass_matrix.kinetic_energy(momentum, &velocity))
    }

    pub fn sample_momentum<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) -> Result<()> {
        self.check_dim(out.len())?;
        self.mass_matrix.randomize_momentum(rng, out);
        Ok(())
    }

    /// Initialize a point at a new location.
    ///
    /// The momentum is zero, it will later be set using
    /// [`Hamiltonian::initialize_trajectory`].
    pub fn init_point(&mut self, position: &[f64]) -> Result<Point> {
        self.check_dim(position.len())?;
        let mut point = Point::new(self.dim());
        point.position.copy_from_slice(position);
        self.update_potential_gradient(&mut point)
            .map_err(|e| SamplerError::LogpFailure(Box::new(e)))?;
        if !point.potential_energy.is_finite() | !point.gradient.iter().all(|g| g.is_finite()) {
            return Err(SamplerError::BadInitGrad());
        }
        self.update_kinetic_energy(&mut point);
        Ok(point)
    }

    /// Randomize the momentum and make the point the start of a trajectory.
    pub fn initialize_trajectory<R: Rng + ?Sized>(&self, point: &mut Point, rng: &mut R) {
        self.mass_matrix.randomize_momentum(rng, &mut point.momentum);
        self.update_kinetic_energy(point);
        point.make_init_point();
    }

    pub(crate) fn update_potential_gradient(&mut self, point: &mut Point) -> std::result::Result<(), F::LogpError> {
        let logp = self.logp.logp(&point.position, &mut point.gradient)?;
        point.potential_energy = -logp;
        Ok(())
    }

    pub(crate) fn update_velocity(&self, point: &mut Point) {
        self.mass_matrix
            .update_velocity(&point.momentum, &mut point.velocity);
    }

    pub(crate) fn update_kinetic_energy(&self, point: &mut Point) {
        self.update_velocity(point);
        point.kinetic_energy = self
            .mass_matrix
            .kinetic_energy(&point.momentum, &point.velocity);
    }

    /// One kick-drift-kick leapfrog step of size `epsilon`, in place.
    ///
    /// Returns the potential and kinetic energy at the new position. If the
    /// logp function fails the slices are left in an intermediate state.
    pub(crate) fn leapfrog_in_place(
        &mut self,
        position: &mut [f64],
        momentum: &mut [f64],
        velocity: &mut [f64],
        gradient: &mut [f64],
        epsilon: f64,
    ) -> std::result::Result<(f64, f64), F::LogpError> {
        axpy(gradient, momentum, epsilon / 2.);
        self.mass_matrix.update_velocity(momentum, velocity);
        axpy(velocity, position, epsilon);
        let logp = self.logp.logp(position, gradient)?;
        axpy(gradient, momentum, epsilon / 2.);
        self.mass_matrix.update_velocity(momentum, velocity);
        let kinetic_energy = self.mass_matrix.kinetic_energy(momentum, velocity);
        Ok((-logp, kinetic_energy))
    }

    fn check_dim(&self, found: usize) -> Result<()> {
        if found != self.dim() {
            Err(SamplerError::ShapeMismatch {
                expected: self.dim(),
                found,
            })
        } else {
            Ok(())
        }
    }
}
