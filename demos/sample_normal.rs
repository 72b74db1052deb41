//! Sample a ten dimensional normal distribution with NUTS and windowed
//! step size and mass matrix adaptation.

use anyhow::Result;
use hmc_nuts::{
    sample_with_progress, CpuLogpFunc, DiagMassMatrix, Hamiltonian, Leapfrog, LogpError,
    MassMatrixAdaptor, Progress, Proposal, SamplerSettings, StagedAdaptor, StepSizeAdaptor,
};
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

#[derive(Debug)]
struct PosteriorDensity {
    mu: Vec<f64>,
}

#[derive(Debug, Error)]
enum PosteriorLogpError {}

impl LogpError for PosteriorLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl CpuLogpFunc for PosteriorDensity {
    type LogpError = PosteriorLogpError;

    fn dim(&self) -> usize {
        self.mu.len()
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        let logp = position
            .iter()
            .zip(self.mu.iter())
            .zip(grad.iter_mut())
            .map(|((x, mu), grad)| {
                let diff = x - mu;
                *grad = -diff;
                -diff * diff / 2f64
            })
            .sum();
        Ok(logp)
    }
}

fn main() -> Result<()> {
    let dim = 10;
    let logp = PosteriorDensity {
        mu: (0..dim).map(|i| i as f64).collect(),
    };
    let hamiltonian = Hamiltonian::new(logp, DiagMassMatrix::new(dim))?;
    let settings = SamplerSettings {
        num_samples: 2000,
        num_adapts: 1000,
        drop_warmup: true,
        ..Default::default()
    };
    let adaptor = StagedAdaptor::stan(
        StepSizeAdaptor::new(Default::default()),
        MassMatrixAdaptor::new(DiagMassMatrix::new(dim), Default::default()),
        settings.num_adapts,
    );

    let mut report = |progress: &Progress| {
        if (progress.draw + 1) % 500 == 0 {
            println!(
                "draw {}/{}: step size {:.3}, {} leapfrog steps",
                progress.draw + 1,
                progress.num_samples,
                progress.step_size,
                progress.n_steps
            );
        }
    };
    let result = sample_with_progress(
        hamiltonian,
        Proposal::default(),
        Leapfrog::new(0.1),
        adaptor,
        StdRng::seed_from_u64(42),
        &vec![0f64; dim],
        settings,
        &mut report,
    )?;

    println!("mean: {:?}", result.mean());
    println!("{:?}", result.diagnostics);
    Ok(())
}
