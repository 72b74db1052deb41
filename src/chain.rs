use rand::Rng;

use crate::{
    adapt_strategy::Adaptor,
    cpu_math::CpuLogpFunc,
    error::{Result, SamplerError},
    hamiltonian::{Hamiltonian, Point},
    integrator::Integrator,
    mass_matrix::MassMatrix,
    sampler_stats::TransitionStats,
    trajectory::Proposal,
};

/// A single Markov chain.
///
/// Owns everything a chain mutates: the hamiltonian, the integrator, the
/// adaptor and the random number generator. The first `num_adapts` draws
/// are warmup draws that are passed to the adaptor, which is finalized
/// after the last of them.
#[derive(Debug)]
pub struct HmcChain<F, M, I, A, R>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    I: Integrator,
    A: Adaptor<M>,
    R: Rng,
{
    hamiltonian: Hamiltonian<F, M>,
    proposal: Proposal,
    integrator: I,
    adaptor: A,
    rng: R,
    state: Option<Point>,
    chain: u64,
    draw_count: u64,
    num_adapts: u64,
}

impl<F, M, I, A, R> HmcChain<F, M, I, A, R>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    I: Integrator,
    A: Adaptor<M>,
    R: Rng,
{
    pub fn new(
        hamiltonian: Hamiltonian<F, M>,
        proposal: Proposal,
        mut integrator: I,
        adaptor: A,
        rng: R,
        num_adapts: u64,
        chain: u64,
    ) -> Result<Self> {
        proposal.validate()?;
        if let Some(dim) = adaptor.dim() {
            if dim != hamiltonian.dim() {
                return Err(SamplerError::ShapeMismatch {
                    expected: hamiltonian.dim(),
                    found: dim,
                });
            }
        }
        if let Some(scheduled) = adaptor.num_adapts() {
            if scheduled != num_adapts {
                return Err(SamplerError::InvalidConfig(format!(
                    "the adaptation schedule covers {} draws, but the chain has {} warmup draws",
                    scheduled, num_adapts
                )));
            }
        }
        if let Some(step_size) = adaptor.step_size() {
            integrator.set_step_size(step_size);
        }
        let step_size = integrator.step_size();
        if !(step_size.is_finite() & (step_size > 0.)) {
            return Err(SamplerError::InvalidConfig(format!(
                "step size must be positive and finite, got {}",
                step_size
            )));
        }
        Ok(Self {
            hamiltonian,
            proposal,
            integrator,
            adaptor,
            rng,
            state: None,
            chain,
            draw_count: 0,
            num_adapts,
        })
    }

    /// Initialize the chain at a position. This should be called
    /// before calling draw.
    ///
    /// Fails if the logp function returns an error or the log density
    /// or its gradient are not finite.
    pub fn set_position(&mut self, position: &[f64]) -> Result<()> {
        self.state = Some(self.hamiltonian.init_point(position)?);
        Ok(())
    }

    /// Draw a new sample and return the position and its statistics.
    pub fn draw(&mut self) -> Result<(Box<[f64]>, TransitionStats)> {
        let Some(state) = self.state.as_mut() else {
            return Err(SamplerError::InvalidConfig(
                "the chain position must be set before drawing".into(),
            ));
        };

        self.integrator.refresh(&mut self.rng);
        let step_size = self.integrator.step_size();
        let transition = self
            .proposal
            .transition(&mut self.hamiltonian, &self.integrator, state, &mut self.rng)
            .map_err(|e| SamplerError::LogpFailure(Box::new(e)))?;

        let point = transition.point;
        let tuning = self.draw_count < self.num_adapts;
        let stats = TransitionStats {
            chain: self.chain,
            draw: self.draw_count,
            tuning,
            accept_prob: transition.accept_prob,
            step_size,
            diverging: transition.divergence_info.is_some(),
            energy: point.energy(),
            energy_error: point.energy_error(),
            logp: point.logp(),
            depth: transition.depth,
            n_steps: transition.n_steps,
            maxdepth_reached: transition.reached_maxdepth,
            index_in_trajectory: point.index_in_trajectory(),
            divergence_info: transition.divergence_info,
        };
        let position: Box<[f64]> = point.position().into();
        self.state = Some(point);

        if tuning {
            self.adaptor.adapt(&position, stats.accept_prob)?;
            self.apply_adaptation()?;
            if self.draw_count + 1 == self.num_adapts {
                self.adaptor.finalize()?;
                self.apply_adaptation()?;
                log::debug!(
                    "Chain {} finished warmup with step size {}",
                    self.chain,
                    self.integrator.step_size()
                );
            }
        }
        self.draw_count += 1;
        Ok((position, stats))
    }

    fn apply_adaptation(&mut self) -> Result<()> {
        if let Some(mass_matrix) = self.adaptor.take_mass_matrix() {
            self.hamiltonian.replace_mass_matrix(mass_matrix)?;
        }
        if let Some(step_size) = self.adaptor.step_size() {
            self.integrator.set_step_size(step_size);
        }
        Ok(())
    }

    /// The dimensionality of the posterior.
    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn num_adapts(&self) -> u64 {
        self.num_adapts
    }

    pub fn hamiltonian(&self) -> &Hamiltonian<F, M> {
        &self.hamiltonian
    }

    pub fn integrator(&self) -> &I {
        &self.integrator
    }

    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    pub fn into_parts(self) -> (Hamiltonian<F, M>, I, A, R) {
        (self.hamiltonian, self.integrator, self.adaptor, self.rng)
    }
}
