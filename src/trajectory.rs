use rand::Rng;

use crate::{
    cpu_math::CpuLogpFunc,
    error::{Result, SamplerError},
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, Point},
    integrator::{Integrator, LeapfrogResult},
    mass_matrix::MassMatrix,
    nuts::{self, NutsOptions},
    stepsize::AcceptanceRateCollector,
};

/// A trajectory with a fixed number of leapfrog steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticOptions {
    pub n_steps: u64,
    pub max_energy_error: f64,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            n_steps: 10,
            max_energy_error: 1000.,
        }
    }
}

/// Upper bound on the number of leapfrog steps of a fixed length trajectory.
pub const MAX_FIXED_LENGTH_STEPS: u64 = 1 << 16;

/// A trajectory with a fixed integration time `trajectory_length`.
///
/// The number of steps follows the current step size and is capped at
/// [`MAX_FIXED_LENGTH_STEPS`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedLengthOptions {
    pub trajectory_length: f64,
    pub max_energy_error: f64,
}

impl Default for FixedLengthOptions {
    fn default() -> Self {
        Self {
            trajectory_length: 1.,
            max_energy_error: 1000.,
        }
    }
}

/// How one Markov transition is built from the current point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    Static(StaticOptions),
    FixedLength(FixedLengthOptions),
    Dynamic(NutsOptions),
}

impl Default for Proposal {
    fn default() -> Self {
        Proposal::Dynamic(NutsOptions::default())
    }
}

/// The outcome of one transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub point: Point,
    /// Metropolis acceptance probability for static trajectories, the mean
    /// acceptance probability over the trajectory for NUTS.
    pub accept_prob: f64,
    pub n_steps: u64,
    pub depth: Option<u64>,
    pub reached_maxdepth: bool,
    pub divergence_info: Option<DivergenceInfo>,
}

fn check_max_energy_error(max_energy_error: f64) -> Result<()> {
    if max_energy_error.is_nan() | (max_energy_error <= 0.) {
        return Err(SamplerError::InvalidConfig(format!(
            "max_energy_error must be positive, got {}",
            max_energy_error
        )));
    }
    Ok(())
}

impl Proposal {
    pub fn validate(&self) -> Result<()> {
        match self {
            Proposal::Static(options) => {
                if options.n_steps == 0 {
                    return Err(SamplerError::InvalidConfig(
                        "static trajectories need at least one step".into(),
                    ));
                }
                check_max_energy_error(options.max_energy_error)
            }
            Proposal::FixedLength(options) => {
                let length = options.trajectory_length;
                if !(length.is_finite() & (length > 0.)) {
                    return Err(SamplerError::InvalidConfig(format!(
                        "trajectory length must be positive and finite, got {}",
                        length
                    )));
                }
                check_max_energy_error(options.max_energy_error)
            }
            Proposal::Dynamic(options) => {
                if options.maxdepth == 0 {
                    return Err(SamplerError::InvalidConfig(
                        "maxdepth must be at least 1".into(),
                    ));
                }
                check_max_energy_error(options.max_energy_error)
            }
        }
    }

    /// Number of leapfrog steps and the divergence threshold of a static or
    /// fixed length trajectory.
    pub(crate) fn static_steps(&self, step_size: f64) -> Option<(u64, f64)> {
        match self {
            Proposal::Static(options) => Some((options.n_steps, options.max_energy_error)),
            Proposal::FixedLength(options) => {
                let n_steps = (options.trajectory_length / step_size)
                    .round()
                    .clamp(1., MAX_FIXED_LENGTH_STEPS as f64);
                // NaN casts to zero
                Some(((n_steps as u64).max(1), options.max_energy_error))
            }
            Proposal::Dynamic(_) => None,
        }
    }

    /// Refresh the momentum of `init` and run one transition.
    pub fn transition<F, M, I, R>(
        &self,
        hamiltonian: &mut Hamiltonian<F, M>,
        integrator: &I,
        init: &mut Point,
        rng: &mut R,
    ) -> std::result::Result<Transition, F::LogpError>
    where
        F: CpuLogpFunc,
        M: MassMatrix,
        I: Integrator,
        R: Rng + ?Sized,
    {
        match self {
            Proposal::Dynamic(options) => {
                let mut collector = AcceptanceRateCollector::new();
                let (point, info) =
                    nuts::draw(hamiltonian, integrator, init, rng, options, &mut collector)?;
                Ok(Transition {
                    point,
                    accept_prob: collector.accept_prob(),
                    n_steps: info.n_steps,
                    depth: Some(info.depth),
                    reached_maxdepth: info.reached_maxdepth,
                    divergence_info: info.divergence_info,
                })
            }
            _ => {
                let (n_steps, max_energy_error) = self
                    .static_steps(integrator.step_size())
                    .unwrap_or((1, f64::INFINITY));
                static_draw(hamiltonian, integrator, init, rng, n_steps, max_energy_error)
            }
        }
    }
}

/// Integrate `n_steps` leapfrog steps forward and accept the end point with
/// the Metropolis probability.
///
/// The momentum is drawn before the uniform of the acceptance test. A
/// divergence stops the integration and rejects the proposal without
/// drawing the uniform.
pub(crate) fn static_draw<F, M, I, R>(
    hamiltonian: &mut Hamiltonian<F, M>,
    integrator: &I,
    init: &mut Point,
    rng: &mut R,
    n_steps: u64,
    max_energy_error: f64,
) -> std::result::Result<Transition, F::LogpError>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    I: Integrator,
    R: Rng + ?Sized,
{
    hamiltonian.initialize_trajectory(init, rng);

    let mut point = init.clone();
    for step in 0..n_steps {
        match integrator.step(hamiltonian, &point, Direction::Forward, max_energy_error) {
            LeapfrogResult::Ok(next) => point = next,
            LeapfrogResult::Divergence(info) => {
                return Ok(Transition {
                    point: init.clone(),
                    accept_prob: 0.,
                    n_steps: step + 1,
                    depth: None,
                    reached_maxdepth: false,
                    divergence_info: Some(info),
                });
            }
            LeapfrogResult::Err(error) => return Err(error),
        }
    }

    let accept_prob = point.accept_prob();
    let uniform: f64 = rng.random();
    let point = if uniform < accept_prob {
        point
    } else {
        init.clone()
    };
    Ok(Transition {
        point,
        accept_prob,
        n_steps,
        depth: None,
        reached_maxdepth: false,
        divergence_info: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu_math::test_logps::{BarrierLogp, NormalLogp},
        integrator::Leapfrog,
        mass_matrix::UnitMassMatrix,
    };
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn validation() {
        assert!(Proposal::default().validate().is_ok());
        assert!(Proposal::Static(StaticOptions {
            n_steps: 0,
            ..Default::default()
        })
        .validate()
        .is_err());
        assert!(Proposal::FixedLength(FixedLengthOptions {
            trajectory_length: -1.,
            ..Default::default()
        })
        .validate()
        .is_err());
        assert!(Proposal::Dynamic(NutsOptions {
            maxdepth: 0,
            ..Default::default()
        })
        .validate()
        .is_err());
        assert!(Proposal::Dynamic(NutsOptions {
            max_energy_error: f64::NAN,
            ..Default::default()
        })
        .validate()
        .is_err());
    }

    #[test]
    fn fixed_length_steps() {
        let proposal = Proposal::FixedLength(FixedLengthOptions {
            trajectory_length: 1.,
            ..Default::default()
        });
        assert_eq!(proposal.static_steps(0.3).unwrap().0, 3);
        assert_eq!(proposal.static_steps(0.25).unwrap().0, 4);
        assert_eq!(proposal.static_steps(5.).unwrap().0, 1);
        assert_eq!(proposal.static_steps(0.).unwrap().0, MAX_FIXED_LENGTH_STEPS);
        assert_eq!(proposal.static_steps(1e-300).unwrap().0, MAX_FIXED_LENGTH_STEPS);
        assert_eq!(proposal.static_steps(f64::NAN).unwrap().0, 1);
        assert!(Proposal::default().static_steps(0.1).is_none());
    }

    #[test]
    fn static_accepts_small_steps() {
        let mut hamiltonian =
            Hamiltonian::new(NormalLogp::new(4, 0.), UnitMassMatrix::new(4)).unwrap();
        let mut point = hamiltonian.init_point(&[1., -1., 0.5, 0.]).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let proposal = Proposal::Static(StaticOptions {
            n_steps: 5,
            ..Default::default()
        });
        let integrator = Leapfrog::new(0.05);
        for _ in 0..20 {
            let transition = proposal
                .transition(&mut hamiltonian, &integrator, &mut point, &mut rng)
                .unwrap();
            assert_eq!(transition.n_steps, 5);
            assert!(transition.depth.is_none());
            assert!(transition.accept_prob > 0.9);
            point = transition.point;
        }
    }

    #[test]
    fn static_rejects_divergence() {
        let mut hamiltonian =
            Hamiltonian::new(BarrierLogp::new(1, 1.), UnitMassMatrix::new(1)).unwrap();
        let mut init = hamiltonian.init_point(&[0.5]).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let integrator = Leapfrog::new(1e3);
        let transition = static_draw(&mut hamiltonian, &integrator, &mut init, &mut rng, 10, 1000.).unwrap();
        assert_eq!(transition.accept_prob, 0.);
        assert_eq!(transition.n_steps, 1);
        assert!(transition.divergence_info.is_some());
        assert_eq!(transition.point.position(), &[0.5]);
    }
}
