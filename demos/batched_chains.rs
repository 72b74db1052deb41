//! Run several static HMC chains in one batch.

use anyhow::Result;
use faer::Mat;
use hmc_nuts::{
    test_logps::NormalLogp, BatchSampler, FixedLengthOptions, Hamiltonian, Proposal,
    UnitMassMatrix,
};
use rand::{rngs::StdRng, SeedableRng};

fn main() -> Result<()> {
    let dim = 5;
    let chains = 8;
    let hamiltonian = Hamiltonian::new(NormalLogp::new(dim, 1.), UnitMassMatrix::new(dim))?;
    let init = Mat::from_fn(dim, chains, |i, j| (i + j) as f64 * 0.1 - 0.5);
    let proposal = Proposal::FixedLength(FixedLengthOptions {
        trajectory_length: 1.5,
        ..Default::default()
    });
    let mut sampler = BatchSampler::new(hamiltonian, proposal, 0.25, &init)?;
    let mut rngs: Vec<StdRng> = (0..chains as u64).map(StdRng::seed_from_u64).collect();

    let results = sampler.sample(&mut rngs, 1000)?;
    for (chain, result) in results.iter().enumerate() {
        println!(
            "chain {}: mean {:?}, acceptance {:.3}",
            chain,
            result.mean(),
            result.diagnostics.mean_accept
        );
    }
    Ok(())
}
