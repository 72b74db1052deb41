use std::{fmt::Debug, sync::Arc};

use rand::Rng;

use crate::{
    cpu_math::{CpuLogpFunc, LogpError},
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, Point},
    mass_matrix::MassMatrix,
};

/// The outcome of a single leapfrog step.
pub enum LeapfrogResult<E> {
    Ok(Point),
    Divergence(DivergenceInfo),
    Err(E),
}

/// Perform one leapfrog step of size `step_size` in direction `dir`.
///
/// A step diverges if the energy error is larger than `max_energy_error`
/// or not finite, or if the logp function returns a recoverable error.
/// Unrecoverable logp errors are returned as `LeapfrogResult::Err`.
pub fn leapfrog<F: CpuLogpFunc, M: MassMatrix>(
    hamiltonian: &mut Hamiltonian<F, M>,
    start: &Point,
    dir: Direction,
    step_size: f64,
    max_energy_error: f64,
) -> LeapfrogResult<F::LogpError> {
    let mut out = start.clone();

    let epsilon = match dir {
        Direction::Forward => step_size,
        Direction::Backward => -step_size,
    };

    let step = hamiltonian.leapfrog_in_place(
        &mut out.position,
        &mut out.momentum,
        &mut out.velocity,
        &mut out.gradient,
        epsilon,
    );
    match step {
        Ok((potential_energy, kinetic_energy)) => {
            out.potential_energy = potential_energy;
            out.kinetic_energy = kinetic_energy;
        }
        Err(logp_error) => {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(logp_error);
            }
            let info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.position.clone()),
                start_gradient: Some(start.gradient.clone()),
                start_momentum: Some(start.momentum.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            return LeapfrogResult::Divergence(info);
        }
    }
    out.index_in_trajectory = start.index_in_trajectory + dir.sign();
    start.set_psum(&mut out);

    let energy_error = out.energy_error();
    if (energy_error > max_energy_error) | !energy_error.is_finite() {
        let info = DivergenceInfo {
            logp_function_error: None,
            start_location: Some(start.position.clone()),
            start_gradient: Some(start.gradient.clone()),
            start_momentum: Some(start.momentum.clone()),
            end_location: Some(out.position.clone()),
            start_idx_in_trajectory: Some(start.index_in_trajectory),
            end_idx_in_trajectory: Some(out.index_in_trajectory),
            energy_error: Some(energy_error),
        };
        return LeapfrogResult::Divergence(info);
    }

    LeapfrogResult::Ok(out)
}

/// A symplectic integrator with a (possibly randomized) step size.
pub trait Integrator: Clone + Debug + Send {
    /// The step size used for the current transition.
    fn step_size(&self) -> f64;

    /// Set the step size that the integrator is centered around.
    fn set_step_size(&mut self, step_size: f64);

    /// Called once at the start of every transition.
    fn refresh<R: Rng + ?Sized>(&mut self, rng: &mut R);

    fn step<F: CpuLogpFunc, M: MassMatrix>(
        &self,
        hamiltonian: &mut Hamiltonian<F, M>,
        start: &Point,
        dir: Direction,
        max_energy_error: f64,
    ) -> LeapfrogResult<F::LogpError> {
        leapfrog(hamiltonian, start, dir, self.step_size(), max_energy_error)
    }
}

/// The leapfrog integrator with a fixed step size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leapfrog {
    step_size: f64,
}

impl Leapfrog {
    pub fn new(step_size: f64) -> Self {
        Self { step_size }
    }
}

impl Integrator for Leapfrog {
    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn set_step_size(&mut self, step_size: f64) {
        self.step_size = step_size;
    }

    fn refresh<R: Rng + ?Sized>(&mut self, _rng: &mut R) {}
}

/// Largest allowed relative jitter, keeps the drawn step size positive.
const MAX_JITTER: f64 = 0.95;

/// Leapfrog with a step size drawn uniformly from
/// `[ε (1 - jitter), ε (1 + jitter)]` at the start of every transition.
///
/// The jitter is clamped to `[0, 0.95]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitteredLeapfrog {
    nominal: f64,
    current: f64,
    jitter: f64,
}

impl JitteredLeapfrog {
    pub fn new(step_size: f64, jitter: f64) -> Self {
        Self {
            nominal: step_size,
            current: step_size,
            jitter: if jitter.is_nan() {
                0.
            } else {
                jitter.clamp(0., MAX_JITTER)
            },
        }
    }

    pub fn nominal_step_size(&self) -> f64 {
        self.nominal
    }
}

impl Integrator for JitteredLeapfrog {
    fn step_size(&self) -> f64 {
        self.current
    }

    fn set_step_size(&mut self, step_size: f64) {
        self.nominal = step_size;
        self.current = step_size;
    }

    fn refresh<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let u: f64 = rng.random();
        self.current = self.nominal * (1. + self.jitter * (2. * u - 1.));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu_math::test_logps::{BarrierLogp, NormalLogp},
        mass_matrix::DiagMassMatrix,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn unwrap_ok<E>(res: LeapfrogResult<E>) -> Point {
        match res {
            LeapfrogResult::Ok(point) => point,
            _ => panic!("leapfrog step failed"),
        }
    }

    #[test]
    fn reversible() {
        let mass = DiagMassMatrix::from_variance(&[1., 0.5, 2.]).unwrap();
        let mut hamiltonian = Hamiltonian::new(NormalLogp::new(3, 0.3), mass).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let mut start = hamiltonian.init_point(&[0.5, -1., 2.]).unwrap();
        hamiltonian.initialize_trajectory(&mut start, &mut rng);

        let integrator = Leapfrog::new(0.1);
        let mut point = start.clone();
        for _ in 0..10 {
            point = unwrap_ok(integrator.step(&mut hamiltonian, &point, Direction::Forward, 1000.));
        }
        assert_eq!(point.index_in_trajectory(), 10);
        assert!(point.energy_error().abs() < 0.1);

        point.make_init_point();
        for _ in 0..10 {
            point = unwrap_ok(integrator.step(&mut hamiltonian, &point, Direction::Backward, 1000.));
        }
        for (a, b) in point.position().iter().zip(start.position()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        for (a, b) in point.momentum().iter().zip(start.momentum()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn divergence_on_energy_error() {
        let mass = DiagMassMatrix::new(2);
        let mut hamiltonian = Hamiltonian::new(NormalLogp::new(2, 0.), mass).unwrap();
        let mut start = hamiltonian.init_point(&[1., 1.]).unwrap();
        hamiltonian.initialize_trajectory(&mut start, &mut StdRng::seed_from_u64(0));

        let integrator = Leapfrog::new(100.);
        match integrator.step(&mut hamiltonian, &start, Direction::Forward, 1000.) {
            LeapfrogResult::Divergence(info) => {
                assert!(info.energy_error.unwrap() > 1000.);
                assert!(info.logp_function_error.is_none());
            }
            _ => panic!("expected a divergence"),
        }
    }

    #[test]
    fn recoverable_error_is_divergence() {
        let mut hamiltonian =
            Hamiltonian::new(BarrierLogp::new(1, 1.), DiagMassMatrix::new(1)).unwrap();
        let mut start = hamiltonian.init_point(&[0.9]).unwrap();
        start.momentum[0] = 10.;
        hamiltonian.update_kinetic_energy(&mut start);
        start.make_init_point();

        let res = leapfrog(&mut hamiltonian, &start, Direction::Forward, 0.5, 1000.);
        match res {
            LeapfrogResult::Divergence(info) => assert!(info.logp_function_error.is_some()),
            _ => panic!("expected a divergence"),
        }

        let mut hamiltonian =
            Hamiltonian::new(BarrierLogp::broken_after(1, 1), DiagMassMatrix::new(1)).unwrap();
        let mut start = hamiltonian.init_point(&[0.]).unwrap();
        start.make_init_point();
        let res = leapfrog(&mut hamiltonian, &start, Direction::Forward, 0.5, 1000.);
        assert!(matches!(res, LeapfrogResult::Err(_)));
    }

    #[test]
    fn jitter_bounds() {
        let mut integrator = JitteredLeapfrog::new(0.5, 0.2);
        let mut rng = StdRng::seed_from_u64(10);
        for _ in 0..100 {
            integrator.refresh(&mut rng);
            let eps = integrator.step_size();
            assert!((0.4..=0.6).contains(&eps));
        }
        integrator.set_step_size(1.);
        assert_eq!(integrator.step_size(), 1.);
        assert_eq!(integrator.nominal_step_size(), 1.);

        let mut integrator = JitteredLeapfrog::new(0.5, 1.);
        for _ in 0..1000 {
            integrator.refresh(&mut rng);
            assert!(integrator.step_size() >= 0.5 * (1. - MAX_JITTER));
        }
        let mut integrator = JitteredLeapfrog::new(0.5, f64::NAN);
        integrator.refresh(&mut rng);
        assert_eq!(integrator.step_size(), 0.5);
    }
}
