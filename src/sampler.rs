use std::sync::Arc;

use arrow::array::Array;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    adapt_strategy::Adaptor,
    chain::HmcChain,
    cpu_math::CpuLogpFunc,
    error::{Result, SamplerError},
    hamiltonian::Hamiltonian,
    integrator::Integrator,
    mass_matrix::MassMatrix,
    sampler_stats::{DrawsBuilder, RunDiagnostics, StatTraceBuilder, StatsBuilder, TransitionStats},
    trajectory::Proposal,
};

/// Settings of a sampling run.
///
/// `num_samples` counts all iterations including the `num_adapts` warmup
/// iterations at the start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub num_samples: u64,
    pub num_adapts: u64,
    /// Leave the warmup draws out of the result. They are still used to
    /// move the chain and to adapt.
    pub drop_warmup: bool,
    /// Identifier of the chain, reported in the statistics.
    pub chain: u64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_samples: 1000,
            num_adapts: 500,
            drop_warmup: false,
            chain: 0,
        }
    }
}

impl SamplerSettings {
    /// Reject settings that can not produce a meaningful run.
    ///
    /// Dropping warmup draws is only allowed if something is adapted
    /// during warmup.
    pub fn validate(&self, adaptor_is_noop: bool) -> Result<()> {
        if self.num_adapts > self.num_samples {
            return Err(SamplerError::InvalidConfig(format!(
                "num_adapts ({}) is larger than num_samples ({})",
                self.num_adapts, self.num_samples
            )));
        }
        if self.drop_warmup & adaptor_is_noop {
            return Err(SamplerError::InvalidConfig(
                "drop_warmup requires an adaptor".into(),
            ));
        }
        Ok(())
    }

    fn num_retained(&self) -> u64 {
        if self.drop_warmup {
            self.num_samples - self.num_adapts
        } else {
            self.num_samples
        }
    }
}

/// Passed to the progress callback after every iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub chain: u64,
    pub draw: u64,
    pub num_samples: u64,
    pub tuning: bool,
    pub diverging: bool,
    pub step_size: f64,
    pub n_steps: u64,
    pub accept_prob: f64,
}

impl Progress {
    fn from_stats(stats: &TransitionStats, num_samples: u64) -> Self {
        Self {
            chain: stats.chain,
            draw: stats.draw,
            num_samples,
            tuning: stats.tuning,
            diverging: stats.diverging,
            step_size: stats.step_size,
            n_steps: stats.n_steps,
            accept_prob: stats.accept_prob,
        }
    }
}

/// The retained draws of a run and their statistics.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<TransitionStats>,
    pub diagnostics: RunDiagnostics,
    /// The step size at the end of the run.
    pub final_step_size: f64,
    pub dim: usize,
}

impl SampleResult {
    /// Coordinate wise mean of the retained draws.
    pub fn mean(&self) -> Box<[f64]> {
        let mut mean = vec![0f64; self.dim];
        for draw in self.draws.iter() {
            mean.iter_mut().zip(draw.iter()).for_each(|(m, x)| *m += x);
        }
        let n = self.draws.len() as f64;
        mean.iter_mut().for_each(|m| *m /= n);
        mean.into()
    }

    pub fn draws_array(&self) -> Result<Arc<dyn Array>> {
        let mut builder = DrawsBuilder::new(self.dim);
        for draw in self.draws.iter() {
            builder.append_value(draw)?;
        }
        Ok(builder.finalize())
    }

    pub fn stats_array(&self) -> Result<Arc<dyn Array>> {
        let mut builder = StatsBuilder::with_capacity(self.stats.len());
        for stats in self.stats.iter() {
            builder.append_value(stats)?;
        }
        Ok(builder.finalize())
    }
}

/// Run a single chain from `init_position`.
pub fn sample<F, M, I, A, R>(
    hamiltonian: Hamiltonian<F, M>,
    proposal: Proposal,
    integrator: I,
    adaptor: A,
    rng: R,
    init_position: &[f64],
    settings: SamplerSettings,
) -> Result<SampleResult>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    I: Integrator,
    A: Adaptor<M>,
    R: Rng,
{
    sample_with_progress(
        hamiltonian,
        proposal,
        integrator,
        adaptor,
        rng,
        init_position,
        settings,
        &mut |_| {},
    )
}

/// Like [`sample`], but calls `progress` after every iteration.
#[allow(clippy::too_many_arguments)]
pub fn sample_with_progress<F, M, I, A, R>(
    hamiltonian: Hamiltonian<F, M>,
    proposal: Proposal,
    integrator: I,
    adaptor: A,
    rng: R,
    init_position: &[f64],
    settings: SamplerSettings,
    progress: &mut dyn FnMut(&Progress),
) -> Result<SampleResult>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    I: Integrator,
    A: Adaptor<M>,
    R: Rng,
{
    settings.validate(adaptor.is_noop())?;

    let dim = hamiltonian.dim();
    let mut chain = HmcChain::new(
        hamiltonian,
        proposal,
        integrator,
        adaptor,
        rng,
        settings.num_adapts,
        settings.chain,
    )?;
    chain.set_position(init_position)?;

    let capacity = settings.num_retained() as usize;
    let mut draws = Vec::with_capacity(capacity);
    let mut stats = Vec::with_capacity(capacity);

    for _ in 0..settings.num_samples {
        let (position, info) = chain.draw()?;
        progress(&Progress::from_stats(&info, settings.num_samples));
        if settings.drop_warmup & info.tuning {
            continue;
        }
        draws.push(position);
        stats.push(info);
    }

    let diagnostics = RunDiagnostics::from_stats(&stats);
    log::info!(
        "Chain {} finished {} draws: mean acceptance {:.3}, {} divergences, E-BFMI {:.3}",
        settings.chain,
        diagnostics.num_draws,
        diagnostics.mean_accept,
        diagnostics.num_divergences,
        diagnostics.ebfmi,
    );
    if diagnostics.num_divergences_sampling > 0 {
        log::warn!(
            "Chain {} had {} divergent transitions after warmup",
            settings.chain,
            diagnostics.num_divergences_sampling
        );
    }
    if diagnostics.ebfmi < 0.3 {
        log::warn!(
            "Chain {} has a low E-BFMI of {:.3}",
            settings.chain,
            diagnostics.ebfmi
        );
    }

    Ok(SampleResult {
        draws,
        stats,
        diagnostics,
        final_step_size: chain.integrator().step_size(),
        dim,
    })
}

/// Run one chain per initial position on the rayon thread pool.
///
/// `build` creates the hamiltonian, integrator and adaptor of chain `i`,
/// so that no chain shares mutable state with another. Chain `i` uses
/// stream `settings.chain + i` of a `ChaCha8Rng` seeded with `seed`.
pub fn sample_parallel<F, M, I, A, P, B>(
    build: B,
    proposal: Proposal,
    init_positions: &[P],
    seed: u64,
    settings: SamplerSettings,
) -> Result<Vec<SampleResult>>
where
    F: CpuLogpFunc + Send,
    M: MassMatrix,
    I: Integrator,
    A: Adaptor<M>,
    P: AsRef<[f64]> + Sync,
    B: Fn(u64) -> Result<(Hamiltonian<F, M>, I, A)> + Sync,
{
    init_positions
        .par_iter()
        .enumerate()
        .map(|(i, init)| {
            let chain = settings.chain + i as u64;
            let (hamiltonian, integrator, adaptor) = build(chain)?;
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(chain);
            let settings = SamplerSettings { chain, ..settings };
            sample(
                hamiltonian,
                proposal,
                integrator,
                adaptor,
                rng,
                init.as_ref(),
                settings,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapt_strategy::{NoAdaptation, StagedAdaptor, StepSizeAdaptor},
        cpu_math::test_logps::NormalLogp,
        integrator::Leapfrog,
        mass_matrix::{DiagMassMatrix, UnitMassMatrix},
        mass_matrix_adapt::MassMatrixAdaptor,
        stepsize::StepSizeSettings,
    };
    use arrow::array::StructArray;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;

    fn normal(dim: usize) -> Hamiltonian<NormalLogp, UnitMassMatrix> {
        Hamiltonian::new(NormalLogp::new(dim, 0.), UnitMassMatrix::new(dim)).unwrap()
    }

    #[test]
    fn settings_validation() {
        assert!(SamplerSettings::default().validate(false).is_ok());
        assert!(SamplerSettings::default().validate(true).is_ok());
        let settings = SamplerSettings {
            drop_warmup: true,
            ..Default::default()
        };
        assert!(settings.validate(false).is_ok());
        assert!(matches!(
            settings.validate(true),
            Err(SamplerError::InvalidConfig(_))
        ));
        let settings = SamplerSettings {
            num_samples: 10,
            num_adapts: 20,
            ..Default::default()
        };
        assert!(settings.validate(false).is_err());
    }

    #[test]
    fn retention_and_progress() {
        let settings = SamplerSettings {
            num_samples: 30,
            num_adapts: 10,
            drop_warmup: true,
            chain: 3,
        };
        let mut calls = Vec::new();
        let result = sample_with_progress(
            normal(2),
            Proposal::default(),
            Leapfrog::new(0.5),
            StepSizeAdaptor::new(StepSizeSettings::default()),
            StdRng::seed_from_u64(0),
            &[0.1, 0.2],
            settings,
            &mut |progress: &Progress| calls.push((progress.draw, progress.tuning)),
        )
        .unwrap();

        assert_eq!(calls.len(), 30);
        assert_eq!(calls[9], (9, true));
        assert_eq!(calls[10], (10, false));
        assert_eq!(result.draws.len(), 20);
        assert_eq!(result.stats.len(), 20);
        assert!(result.stats.iter().all(|s| !s.tuning & (s.chain == 3)));
        assert_eq!(result.stats[0].draw, 10);
        assert_eq!(result.diagnostics.num_draws, 20);

        let draws = result.draws_array().unwrap();
        assert_eq!(draws.len(), 20);
        let stats = result.stats_array().unwrap();
        let stats = stats.as_any().downcast_ref::<StructArray>().unwrap();
        assert_eq!(stats.len(), 20);
    }

    #[test]
    fn keeps_warmup_by_default() {
        let settings = SamplerSettings {
            num_samples: 15,
            num_adapts: 5,
            ..Default::default()
        };
        let result = sample(
            normal(2),
            Proposal::default(),
            Leapfrog::new(0.5),
            NoAdaptation::new(),
            StdRng::seed_from_u64(0),
            &[0.1, 0.2],
            settings,
        )
        .unwrap();
        assert_eq!(result.draws.len(), 15);
        assert_eq!(result.stats.iter().filter(|s| s.tuning).count(), 5);
        assert_eq!(result.final_step_size, 0.5);
    }

    #[test]
    fn drop_warmup_without_adaptation_fails_early() {
        let settings = SamplerSettings {
            drop_warmup: true,
            ..Default::default()
        };
        let mut calls = 0;
        let result = sample_with_progress(
            normal(2),
            Proposal::default(),
            Leapfrog::new(0.5),
            NoAdaptation::new(),
            StdRng::seed_from_u64(0),
            &[0.1, 0.2],
            settings,
            &mut |_| calls += 1,
        );
        assert!(matches!(result, Err(SamplerError::InvalidConfig(_))));
        assert_eq!(calls, 0);
    }

    #[test]
    fn adaptor_mismatch_fails_before_sampling() {
        let staged = |schedule_len: u64, dim: usize| {
            StagedAdaptor::stan(
                StepSizeAdaptor::new(StepSizeSettings::default()),
                MassMatrixAdaptor::new(DiagMassMatrix::new(dim), Default::default()),
                schedule_len,
            )
        };
        let run = |adaptor: StagedAdaptor<DiagMassMatrix>, calls: &mut u64| {
            let hamiltonian =
                Hamiltonian::new(NormalLogp::new(2, 0.), DiagMassMatrix::new(2)).unwrap();
            sample_with_progress(
                hamiltonian,
                Proposal::default(),
                Leapfrog::new(0.5),
                adaptor,
                StdRng::seed_from_u64(0),
                &[0.1, 0.2],
                SamplerSettings {
                    num_samples: 300,
                    num_adapts: 200,
                    ..Default::default()
                },
                &mut |_| *calls += 1,
            )
        };

        let mut calls = 0;
        let short = run(staged(100, 2), &mut calls);
        assert!(matches!(short, Err(SamplerError::InvalidConfig(_))));
        let long = run(staged(250, 2), &mut calls);
        assert!(matches!(long, Err(SamplerError::InvalidConfig(_))));
        let wrong_dim = run(staged(200, 5), &mut calls);
        assert!(matches!(
            wrong_dim,
            Err(SamplerError::ShapeMismatch {
                expected: 2,
                found: 5
            })
        ));
        assert_eq!(calls, 0);

        assert!(run(staged(200, 2), &mut calls).is_ok());
        assert_eq!(calls, 300);
    }

    #[test]
    fn parallel_chains_match_sequential() {
        let settings = SamplerSettings {
            num_samples: 20,
            num_adapts: 10,
            ..Default::default()
        };
        let build = |_chain: u64| -> Result<_> {
            Ok((
                normal(3),
                Leapfrog::new(0.5),
                StepSizeAdaptor::new(StepSizeSettings::default()),
            ))
        };
        let inits = vec![vec![0.1, 0.2, 0.3], vec![-1., 0., 1.]];
        let results = sample_parallel(build, Proposal::default(), &inits, 42, settings).unwrap();
        assert_eq!(results.len(), 2);

        for (i, (result, init)) in results.iter().zip(inits.iter()).enumerate() {
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            rng.set_stream(i as u64);
            let expected = sample(
                normal(3),
                Proposal::default(),
                Leapfrog::new(0.5),
                StepSizeAdaptor::new(StepSizeSettings::default()),
                rng,
                init,
                SamplerSettings {
                    chain: i as u64,
                    ..settings
                },
            )
            .unwrap();
            assert_eq!(result.draws, expected.draws);
            assert_eq!(result.stats[0].chain, i as u64);
        }
    }
}
