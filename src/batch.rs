//! Several chains advanced together.
//!
//! Positions, momenta and gradients of all chains are stored as columns of
//! `dim × chains` matrices and every leapfrog step is one pass over all
//! active columns. Columns never read each other, and every column draws
//! from its own random number generator in exactly the order a single
//! chain with a static trajectory would, so column `j` reproduces
//! [`crate::sample`] run with `rngs[j]`.

use std::sync::Arc;

use faer::Mat;
use rand::Rng;

use crate::{
    cpu_math::{CpuLogpFunc, LogpError},
    error::{Result, SamplerError},
    hamiltonian::{DivergenceInfo, Hamiltonian},
    mass_matrix::{DiagMassMatrix, MassMatrix, UnitMassMatrix},
    sampler::SampleResult,
    sampler_stats::{RunDiagnostics, TransitionStats},
    trajectory::Proposal,
};

/// Mass matrices that act on each coordinate separately and can be shared
/// by all columns of a batch.
pub trait DiagonalMetric: MassMatrix {}

impl DiagonalMetric for UnitMassMatrix {}
impl DiagonalMetric for DiagMassMatrix {}

/// Phase space state of a batch, one column per chain.
#[derive(Debug, Clone)]
pub struct BatchState {
    position: Mat<f64>,
    momentum: Mat<f64>,
    velocity: Mat<f64>,
    gradient: Mat<f64>,
    potential_energy: Box<[f64]>,
    kinetic_energy: Box<[f64]>,
    initial_energy: Box<[f64]>,
}

impl BatchState {
    fn new(dim: usize, chains: usize) -> Self {
        Self {
            position: Mat::zeros(dim, chains),
            momentum: Mat::zeros(dim, chains),
            velocity: Mat::zeros(dim, chains),
            gradient: Mat::zeros(dim, chains),
            potential_energy: vec![0f64; chains].into(),
            kinetic_energy: vec![0f64; chains].into(),
            initial_energy: vec![0f64; chains].into(),
        }
    }

    pub fn positions(&self) -> &Mat<f64> {
        &self.position
    }

    pub fn gradients(&self) -> &Mat<f64> {
        &self.gradient
    }

    pub fn num_chains(&self) -> usize {
        self.position.ncols()
    }

    fn energy(&self, col: usize) -> f64 {
        self.potential_energy[col] + self.kinetic_energy[col]
    }

    fn energy_error(&self, col: usize) -> f64 {
        self.energy(col) - self.initial_energy[col]
    }

    fn copy_column(&mut self, other: &Self, col: usize) {
        self.position
            .col_as_slice_mut(col)
            .copy_from_slice(other.position.col_as_slice(col));
        self.momentum
            .col_as_slice_mut(col)
            .copy_from_slice(other.momentum.col_as_slice(col));
        self.velocity
            .col_as_slice_mut(col)
            .copy_from_slice(other.velocity.col_as_slice(col));
        self.gradient
            .col_as_slice_mut(col)
            .copy_from_slice(other.gradient.col_as_slice(col));
        self.potential_energy[col] = other.potential_energy[col];
        self.kinetic_energy[col] = other.kinetic_energy[col];
        self.initial_energy[col] = other.initial_energy[col];
    }
}

/// Static or fixed length HMC for a batch of chains with a shared
/// diagonal metric and a fixed step size.
#[derive(Debug)]
pub struct BatchSampler<F: CpuLogpFunc, M: DiagonalMetric> {
    hamiltonian: Hamiltonian<F, M>,
    proposal: Proposal,
    step_size: f64,
    state: BatchState,
    draw_count: u64,
}

impl<F: CpuLogpFunc, M: DiagonalMetric> BatchSampler<F, M> {
    /// Start one chain at every column of `init_positions`.
    pub fn new(
        mut hamiltonian: Hamiltonian<F, M>,
        proposal: Proposal,
        step_size: f64,
        init_positions: &Mat<f64>,
    ) -> Result<Self> {
        proposal.validate()?;
        if matches!(proposal, Proposal::Dynamic(_)) {
            return Err(SamplerError::InvalidConfig(
                "batched chains only support static and fixed length trajectories".into(),
            ));
        }
        if !(step_size.is_finite() & (step_size > 0.)) {
            return Err(SamplerError::InvalidConfig(format!(
                "step size must be positive and finite, got {}",
                step_size
            )));
        }
        let dim = hamiltonian.dim();
        if init_positions.nrows() != dim {
            return Err(SamplerError::ShapeMismatch {
                expected: dim,
                found: init_positions.nrows(),
            });
        }
        let chains = init_positions.ncols();
        if chains == 0 {
            return Err(SamplerError::InvalidConfig(
                "a batch needs at least one chain".into(),
            ));
        }

        let mut state = BatchState::new(dim, chains);
        state.position = init_positions.clone();
        for col in 0..chains {
            update_potential_gradient(&mut hamiltonian, &mut state, col)
                .map_err(|e| SamplerError::LogpFailure(Box::new(e)))?;
            let finite_grad = state.gradient.col_as_slice(col).iter().all(|g| g.is_finite());
            if !state.potential_energy[col].is_finite() | !finite_grad {
                return Err(SamplerError::BadInitGrad());
            }
            update_kinetic_energy(&hamiltonian, &mut state, col);
        }

        Ok(Self {
            hamiltonian,
            proposal,
            step_size,
            state,
            draw_count: 0,
        })
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn num_chains(&self) -> usize {
        self.state.num_chains()
    }

    /// Advance every chain by one transition.
    ///
    /// `rngs[j]` is used for column `j` only. A column that diverges stops
    /// integrating and stays at its current position while the other
    /// columns continue.
    pub fn draw<R: Rng>(&mut self, rngs: &mut [R]) -> Result<Vec<TransitionStats>> {
        let chains = self.num_chains();
        if rngs.len() != chains {
            return Err(SamplerError::ShapeMismatch {
                expected: chains,
                found: rngs.len(),
            });
        }
        let (n_steps, max_energy_error) = self
            .proposal
            .static_steps(self.step_size)
            .unwrap_or((1, f64::INFINITY));

        let state = &mut self.state;
        for (col, rng) in rngs.iter_mut().enumerate() {
            self.hamiltonian
                .mass_matrix()
                .randomize_momentum(rng, state.momentum.col_as_slice_mut(col));
            update_kinetic_energy(&self.hamiltonian, state, col);
            state.initial_energy[col] = state.energy(col);
        }

        let mut proposal = state.clone();
        let mut divergences: Vec<Option<DivergenceInfo>> = vec![None; chains];
        let mut steps_done = vec![n_steps; chains];

        for step in 0..n_steps {
            for col in 0..chains {
                if divergences[col].is_some() {
                    continue;
                }
                let end_idx = step as i64 + 1;
                if let Err(logp_error) = leapfrog_column(
                    &mut self.hamiltonian,
                    &mut proposal,
                    col,
                    self.step_size,
                ) {
                    if !logp_error.is_recoverable() {
                        return Err(SamplerError::LogpFailure(Box::new(logp_error)));
                    }
                    divergences[col] = Some(DivergenceInfo {
                        start_momentum: None,
                        start_location: None,
                        start_gradient: None,
                        end_location: None,
                        energy_error: None,
                        end_idx_in_trajectory: Some(end_idx),
                        start_idx_in_trajectory: Some(end_idx - 1),
                        logp_function_error: Some(Arc::new(logp_error)),
                    });
                    steps_done[col] = step + 1;
                    continue;
                }
                let energy_error = proposal.energy_error(col);
                if (energy_error > max_energy_error) | !energy_error.is_finite() {
                    divergences[col] = Some(DivergenceInfo {
                        start_momentum: None,
                        start_location: None,
                        start_gradient: None,
                        end_location: Some(proposal.position.col_as_slice(col).into()),
                        energy_error: Some(energy_error),
                        end_idx_in_trajectory: Some(end_idx),
                        start_idx_in_trajectory: Some(end_idx - 1),
                        logp_function_error: None,
                    });
                    steps_done[col] = step + 1;
                }
            }
        }

        let mut stats = Vec::with_capacity(chains);
        for (col, (rng, divergence_info)) in rngs.iter_mut().zip(divergences).enumerate() {
            let mut accept_prob = 0f64;
            let mut index_in_trajectory = 0;
            if divergence_info.is_none() {
                let log_accept = (-proposal.energy_error(col)).min(0.);
                accept_prob = if log_accept.is_nan() {
                    0f64
                } else {
                    log_accept.exp()
                };
                let uniform: f64 = rng.random();
                if uniform < accept_prob {
                    state.copy_column(&proposal, col);
                    index_in_trajectory = n_steps as i64;
                }
            }
            stats.push(TransitionStats {
                chain: col as u64,
                draw: self.draw_count,
                tuning: false,
                accept_prob,
                step_size: self.step_size,
                diverging: divergence_info.is_some(),
                energy: state.energy(col),
                energy_error: state.energy_error(col),
                logp: -state.potential_energy[col],
                depth: None,
                n_steps: steps_done[col],
                maxdepth_reached: false,
                index_in_trajectory,
                divergence_info,
            });
        }
        self.draw_count += 1;
        Ok(stats)
    }

    /// Run `num_samples` transitions and split the result by chain.
    pub fn sample<R: Rng>(&mut self, rngs: &mut [R], num_samples: u64) -> Result<Vec<SampleResult>> {
        let chains = self.num_chains();
        let dim = self.hamiltonian.dim();
        let mut draws: Vec<Vec<Box<[f64]>>> = vec![Vec::with_capacity(num_samples as usize); chains];
        let mut stats: Vec<Vec<TransitionStats>> = vec![Vec::with_capacity(num_samples as usize); chains];

        for _ in 0..num_samples {
            let draw_stats = self.draw(rngs)?;
            for (col, info) in draw_stats.into_iter().enumerate() {
                draws[col].push(self.state.position.col_as_slice(col).into());
                stats[col].push(info);
            }
        }

        let results = draws
            .into_iter()
            .zip(stats)
            .map(|(draws, stats)| {
                let diagnostics = RunDiagnostics::from_stats(&stats);
                SampleResult {
                    draws,
                    stats,
                    diagnostics,
                    final_step_size: self.step_size,
                    dim,
                }
            })
            .collect::<Vec<_>>();
        let divergences: u64 = results.iter().map(|r| r.diagnostics.num_divergences).sum();
        log::info!(
            "Finished {} draws on {} batched chains with {} divergences",
            num_samples,
            chains,
            divergences
        );
        Ok(results)
    }
}

fn update_potential_gradient<F: CpuLogpFunc, M: MassMatrix>(
    hamiltonian: &mut Hamiltonian<F, M>,
    state: &mut BatchState,
    col: usize,
) -> std::result::Result<(), F::LogpError> {
    let logp = hamiltonian.logp_func().logp(
        state.position.col_as_slice(col),
        state.gradient.col_as_slice_mut(col),
    )?;
    state.potential_energy[col] = -logp;
    Ok(())
}

fn update_kinetic_energy<F: CpuLogpFunc, M: MassMatrix>(
    hamiltonian: &Hamiltonian<F, M>,
    state: &mut BatchState,
    col: usize,
) {
    let mass_matrix = hamiltonian.mass_matrix();
    let momentum = state.momentum.col_as_slice(col);
    let velocity = state.velocity.col_as_slice_mut(col);
    mass_matrix.update_velocity(momentum, velocity);
    state.kinetic_energy[col] = mass_matrix.kinetic_energy(momentum, velocity);
}

/// One leapfrog step of column `col`, in place.
fn leapfrog_column<F: CpuLogpFunc, M: MassMatrix>(
    hamiltonian: &mut Hamiltonian<F, M>,
    state: &mut BatchState,
    col: usize,
    epsilon: f64,
) -> std::result::Result<(), F::LogpError> {
    let (potential_energy, kinetic_energy) = hamiltonian.leapfrog_in_place(
        state.position.col_as_slice_mut(col),
        state.momentum.col_as_slice_mut(col),
        state.velocity.col_as_slice_mut(col),
        state.gradient.col_as_slice_mut(col),
        epsilon,
    )?;
    state.potential_energy[col] = potential_energy;
    state.kinetic_energy[col] = kinetic_energy;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapt_strategy::NoAdaptation,
        cpu_math::test_logps::{BarrierLogp, NormalLogp},
        hamiltonian::Direction,
        integrator::{leapfrog, Leapfrog, LeapfrogResult},
        nuts::NutsOptions,
        sample,
        sampler::SamplerSettings,
        trajectory::{FixedLengthOptions, StaticOptions},
    };
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn inits() -> Mat<f64> {
        Mat::from_fn(3, 4, |i, j| (i as f64 - 1.) * 0.3 + j as f64 * 0.1)
    }

    #[test]
    fn rejects_bad_config() {
        let hamiltonian =
            Hamiltonian::new(NormalLogp::new(3, 0.), UnitMassMatrix::new(3)).unwrap();
        let dynamic = Proposal::Dynamic(NutsOptions::default());
        assert!(BatchSampler::new(hamiltonian, dynamic, 0.1, &inits()).is_err());

        let hamiltonian =
            Hamiltonian::new(NormalLogp::new(2, 0.), UnitMassMatrix::new(2)).unwrap();
        let proposal = Proposal::Static(StaticOptions::default());
        assert!(matches!(
            BatchSampler::new(hamiltonian, proposal, 0.1, &inits()),
            Err(SamplerError::ShapeMismatch { .. })
        ));

        let hamiltonian =
            Hamiltonian::new(NormalLogp::new(3, 0.), UnitMassMatrix::new(3)).unwrap();
        let mut sampler = BatchSampler::new(hamiltonian, proposal, 0.1, &inits()).unwrap();
        let mut rngs: Vec<StdRng> = (0..2).map(StdRng::seed_from_u64).collect();
        assert!(sampler.draw(&mut rngs).is_err());
    }

    #[test]
    fn columns_match_single_chains() {
        let mass = DiagMassMatrix::from_variance(&[1., 0.5, 2.]).unwrap();
        let proposal = Proposal::FixedLength(FixedLengthOptions {
            trajectory_length: 1.3,
            ..Default::default()
        });
        let init = inits();
        let hamiltonian = Hamiltonian::new(NormalLogp::new(3, 0.5), mass.clone()).unwrap();
        let mut sampler = BatchSampler::new(hamiltonian, proposal, 0.3, &init).unwrap();
        let mut rngs: Vec<StdRng> = (0..4).map(|i| StdRng::seed_from_u64(100 + i)).collect();
        let batched = sampler.sample(&mut rngs, 50).unwrap();

        let settings = SamplerSettings {
            num_samples: 50,
            num_adapts: 0,
            ..Default::default()
        };
        for (col, result) in batched.iter().enumerate() {
            let hamiltonian = Hamiltonian::new(NormalLogp::new(3, 0.5), mass.clone()).unwrap();
            let single = sample(
                hamiltonian,
                proposal,
                Leapfrog::new(0.3),
                NoAdaptation::new(),
                StdRng::seed_from_u64(100 + col as u64),
                init.col_as_slice(col),
                settings,
            )
            .unwrap();
            assert_eq!(result.draws, single.draws);
            for (a, b) in result.stats.iter().zip(single.stats.iter()) {
                assert_eq!(a.accept_prob, b.accept_prob);
                assert_eq!(a.energy, b.energy);
                assert_eq!(a.n_steps, b.n_steps);
                assert_eq!(a.index_in_trajectory, b.index_in_trajectory);
            }
        }
    }

    #[test]
    fn column_step_matches_leapfrog() {
        let mass = DiagMassMatrix::from_variance(&[2., 0.25, 1.5]).unwrap();
        let init = inits();
        let mut hamiltonian = Hamiltonian::new(NormalLogp::new(3, 0.5), mass).unwrap();
        let mut state = BatchState::new(3, init.ncols());
        state.position = init.clone();
        for col in 0..init.ncols() {
            update_potential_gradient(&mut hamiltonian, &mut state, col).unwrap();
            state.momentum[(0, col)] = 0.7 - col as f64;
            state.momentum[(2, col)] = -0.4 * col as f64;
            update_kinetic_energy(&hamiltonian, &mut state, col);
        }

        for col in 0..init.ncols() {
            let mut start = hamiltonian.init_point(init.col_as_slice(col)).unwrap();
            start.momentum.copy_from_slice(state.momentum.col_as_slice(col));
            hamiltonian.update_kinetic_energy(&mut start);
            let next = match leapfrog(&mut hamiltonian, &start, Direction::Backward, 0.3, 1000.) {
                LeapfrogResult::Ok(next) => next,
                _ => panic!("leapfrog step failed"),
            };

            leapfrog_column(&mut hamiltonian, &mut state, col, -0.3).unwrap();
            assert_eq!(state.position.col_as_slice(col), next.position());
            assert_eq!(state.momentum.col_as_slice(col), next.momentum());
            assert_eq!(state.gradient.col_as_slice(col), next.gradient());
            assert_eq!(state.velocity.col_as_slice(col), next.velocity());
            assert_eq!(state.potential_energy[col], next.potential_energy());
            assert_eq!(state.kinetic_energy[col], next.kinetic_energy());
        }
    }

    #[test]
    fn diverging_columns_stay() {
        let hamiltonian = Hamiltonian::new(BarrierLogp::new(1, 1.), UnitMassMatrix::new(1)).unwrap();
        let init = Mat::from_fn(1, 2, |_, j| 0.5 - j as f64);
        let proposal = Proposal::Static(StaticOptions {
            n_steps: 5,
            ..Default::default()
        });
        let mut sampler = BatchSampler::new(hamiltonian, proposal, 1e3, &init).unwrap();
        let mut rngs: Vec<StdRng> = (0..2).map(StdRng::seed_from_u64).collect();
        let stats = sampler.draw(&mut rngs).unwrap();
        assert_eq!(stats.len(), 2);
        for (col, stat) in stats.iter().enumerate() {
            assert!(stat.diverging);
            assert_eq!(stat.n_steps, 1);
            assert_eq!(stat.accept_prob, 0.);
            assert_eq!(sampler.state().positions()[(0, col)], init[(0, col)]);
        }
    }
}
