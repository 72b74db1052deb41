use rand::Rng;

use crate::{
    cpu_math::CpuLogpFunc,
    error::{Result, SamplerError},
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, Point},
    integrator::{leapfrog, LeapfrogResult},
    mass_matrix::MassMatrix,
    nuts::Collector,
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSizeSettings {
    pub target_accept: f64,
    pub initial_step: f64,
    pub params: DualAverageOptions,
}

impl Default for StepSizeSettings {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            initial_step: 0.1,
            params: DualAverageOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Number of updates since the last reset.
    pub fn count(&self) -> u64 {
        self.count - 1
    }

    pub fn reset(&mut self, initial_step: f64, bias_factor: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (bias_factor * initial_step).ln();
        self.count = 1;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability over all leapfrog steps of a
/// trajectory, relative to its initial point. Divergent steps count as 0.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }

    /// The mean acceptance probability of the last trajectory, or 0 if
    /// the trajectory had no steps.
    pub fn accept_prob(&self) -> f64 {
        if self.mean.count() == 0 {
            0.
        } else {
            self.mean.current()
        }
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &Point,
        end: Option<&Point>,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match (divergence_info, end) {
            (None, Some(end)) => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
            _ => self.mean.add(0.),
        }
    }

    fn register_init(&mut self, point: &Point) {
        self.initial_energy = point.energy();
        self.mean.reset();
    }
}

/// Search for a step size with a one-step acceptance probability near 0.5.
///
/// Starting from `initial_step`, the step size is doubled while the
/// acceptance probability of a single leapfrog step stays above 0.5, or
/// halved while it stays below. The position of `point` is not changed.
pub fn find_reasonable_step_size<F, M, R>(
    hamiltonian: &mut Hamiltonian<F, M>,
    point: &Point,
    initial_step: f64,
    rng: &mut R,
) -> Result<f64>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    R: Rng + ?Sized,
{
    const MAX_ITER: usize = 100;

    if !(initial_step.is_finite() & (initial_step > 0.)) {
        return Err(SamplerError::InvalidConfig(format!(
            "initial step size must be positive and finite, got {}",
            initial_step
        )));
    }

    let mut start = point.clone();
    hamiltonian.initialize_trajectory(&mut start, rng);

    let accept_prob = |hamiltonian: &mut Hamiltonian<F, M>, step_size: f64| {
        match leapfrog(hamiltonian, &start, Direction::Forward, step_size, f64::INFINITY) {
            LeapfrogResult::Ok(end) => Ok(end.accept_prob()),
            LeapfrogResult::Divergence(_) => Ok(0.),
            LeapfrogResult::Err(e) => Err(SamplerError::LogpFailure(Box::new(e))),
        }
    };

    let mut step_size = initial_step;
    let increase = accept_prob(&mut *hamiltonian, step_size)? > 0.5;
    for _ in 0..MAX_ITER {
        let next = if increase { step_size * 2. } else { step_size / 2. };
        let prob = accept_prob(&mut *hamiltonian, next)?;
        if increase != (prob > 0.5) {
            return Ok(if increase { step_size } else { next });
        }
        step_size = next;
    }
    log::warn!(
        "Could not find a reasonable step size after {} iterations, using {}",
        MAX_ITER,
        step_size
    );
    Ok(step_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cpu_math::test_logps::ScaledNormalLogp, mass_matrix::UnitMassMatrix};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn dual_average_constant_accept() {
        let mut step = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..100 {
            step.advance(1., 0.8);
        }
        assert!(step.current_step_size_adapted() > 1.);

        let mut step = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..100 {
            step.advance(0.2, 0.8);
        }
        assert!(step.current_step_size_adapted() < 1.);
        assert_eq!(step.count(), 100);

        step.reset(0.5, 10.);
        assert_eq!(step.count(), 0);
        assert_relative_eq!(step.current_step_size(), 0.5);
        assert_relative_eq!(step.current_step_size_adapted(), 0.5);
    }

    #[test]
    fn first_update() {
        // count = 1: w = 1 / 11, mu = ln(1)
        let mut step = DualAverage::new(DualAverageOptions::default(), 0.1);
        step.advance(0.5, 0.8);
        let hbar = 0.3 / 11.;
        let log_step = 1f64.ln() - hbar / 0.05;
        assert_relative_eq!(step.current_step_size(), log_step.exp(), epsilon = 1e-12);
        assert_relative_eq!(step.current_step_size_adapted(), log_step.exp(), epsilon = 1e-12);
    }

    #[test]
    fn running_mean() {
        let mut mean = RunningMean::new();
        mean.add(1.);
        mean.add(2.);
        assert_eq!(mean.current(), 1.5);
        assert_eq!(mean.count(), 2);
        mean.reset();
        assert_eq!(mean.count(), 0);
    }

    #[test]
    fn reasonable_step_size_scales_with_target() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut narrow =
            Hamiltonian::new(ScaledNormalLogp::new(&[0.; 4], &[0.01; 4]), UnitMassMatrix::new(4))
                .unwrap();
        let point = narrow.init_point(&[0.; 4]).unwrap();
        let eps_narrow = find_reasonable_step_size(&mut narrow, &point, 1., &mut rng).unwrap();

        let mut wide =
            Hamiltonian::new(ScaledNormalLogp::new(&[0.; 4], &[10.; 4]), UnitMassMatrix::new(4))
                .unwrap();
        let point = wide.init_point(&[0.; 4]).unwrap();
        let eps_wide = find_reasonable_step_size(&mut wide, &point, 1., &mut rng).unwrap();

        assert!(eps_narrow < 0.1);
        assert!(eps_wide > 1.);

        let err = find_reasonable_step_size(&mut wide, &point, 0., &mut rng);
        assert!(err.is_err());
    }
}
