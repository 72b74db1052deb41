//! Hamiltonian Monte Carlo and the No-U-Turn sampler.
//!
//! The user provides the log density of the target and its gradient through
//! [`CpuLogpFunc`]. A [`Hamiltonian`] pairs it with a mass matrix, an
//! [`Integrator`] moves points through phase space and a [`Proposal`] turns
//! integration steps into one Markov transition. During warmup an
//! [`Adaptor`] tunes the step size and the mass matrix.
//!
//! ```
//! use hmc_nuts::{
//!     sample, Hamiltonian, CpuLogpFunc, LogpError, Leapfrog, DiagMassMatrix,
//!     MassMatrixAdaptor, StepSizeAdaptor, StagedAdaptor, Proposal, SamplerSettings,
//! };
//! use rand::{rngs::StdRng, SeedableRng};
//! use thiserror::Error;
//!
//! #[derive(Debug)]
//! struct PosteriorDensity {}
//!
//! #[derive(Debug, Error)]
//! enum PosteriorLogpError {}
//!
//! impl LogpError for PosteriorLogpError {
//!     fn is_recoverable(&self) -> bool { false }
//! }
//!
//! impl CpuLogpFunc for PosteriorDensity {
//!     type LogpError = PosteriorLogpError;
//!
//!     fn dim(&self) -> usize { 10 }
//!
//!     fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
//!         let mu = 3f64;
//!         let logp = position
//!             .iter()
//!             .copied()
//!             .zip(grad.iter_mut())
//!             .map(|(x, grad)| {
//!                 let diff = x - mu;
//!                 *grad = -diff;
//!                 -diff * diff / 2f64
//!             })
//!             .sum();
//!         Ok(logp)
//!     }
//! }
//!
//! let hamiltonian = Hamiltonian::new(PosteriorDensity {}, DiagMassMatrix::new(10)).unwrap();
//! let settings = SamplerSettings { num_samples: 500, num_adapts: 200, ..Default::default() };
//! let adaptor = StagedAdaptor::stan(
//!     StepSizeAdaptor::new(Default::default()),
//!     MassMatrixAdaptor::new(DiagMassMatrix::new(10), Default::default()),
//!     settings.num_adapts,
//! );
//! let result = sample(
//!     hamiltonian,
//!     Proposal::default(),
//!     Leapfrog::new(0.1),
//!     adaptor,
//!     StdRng::seed_from_u64(42),
//!     &vec![0f64; 10],
//!     settings,
//! ).unwrap();
//! assert_eq!(result.draws.len(), 500);
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod batch;
pub(crate) mod chain;
pub(crate) mod cpu_math;
pub(crate) mod error;
pub(crate) mod hamiltonian;
pub(crate) mod integrator;
pub(crate) mod mass_matrix;
pub(crate) mod mass_matrix_adapt;
pub(crate) mod math;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod sampler_stats;
pub(crate) mod stepsize;
pub(crate) mod trajectory;

pub use adapt_strategy::{
    AdaptWindow, Adaptor, CompositeAdaptor, NoAdaptation, StagedAdaptor, StanWindowOptions,
    StepSizeAdaptor, WindowSchedule,
};
pub use batch::{BatchSampler, BatchState, DiagonalMetric};
pub use chain::HmcChain;
pub use cpu_math::{test_logps, CpuLogpFunc, LogpError};
pub use error::{AdaptError, Result, SamplerError};
pub use hamiltonian::{Direction, DivergenceInfo, Hamiltonian, Point};
pub use integrator::{leapfrog, Integrator, JitteredLeapfrog, Leapfrog, LeapfrogResult};
pub use mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix, UnitMassMatrix};
pub use mass_matrix_adapt::{
    AdaptableMassMatrix, Estimator, MassMatrixAdaptOptions, MassMatrixAdaptor, RunningCovariance,
    RunningVariance, SampleCounter,
};
pub use nuts::{Collector, NutsOptions, SampleInfo, TurningCriterion};
pub use sampler::{
    sample, sample_parallel, sample_with_progress, Progress, SampleResult, SamplerSettings,
};
pub use sampler_stats::{
    ebfmi, DrawsBuilder, RunDiagnostics, StatTraceBuilder, StatsBuilder, TransitionStats,
};
pub use stepsize::{
    find_reasonable_step_size, AcceptanceRateCollector, DualAverage, DualAverageOptions,
    StepSizeSettings,
};
pub use trajectory::{
    FixedLengthOptions, Proposal, StaticOptions, Transition, MAX_FIXED_LENGTH_STEPS,
};
