//! Build an explicit warmup schedule and watch the metric adapt to a
//! badly scaled target.

use anyhow::Result;
use hmc_nuts::{
    find_reasonable_step_size, test_logps::ScaledNormalLogp, AdaptWindow, DenseMassMatrix,
    Hamiltonian, HmcChain, Leapfrog, MassMatrixAdaptor, Proposal, StagedAdaptor, StepSizeAdaptor,
    StepSizeSettings, WindowSchedule,
};
use rand::{rngs::StdRng, SeedableRng};

fn main() -> Result<()> {
    let sigma = [0.1, 1., 10.];
    let logp = ScaledNormalLogp::new(&[0.; 3], &sigma);
    let mut hamiltonian = Hamiltonian::new(logp, DenseMassMatrix::new(3))?;
    let mut rng = StdRng::seed_from_u64(1);

    let init = [0.05, 0.5, 5.];
    let point = hamiltonian.init_point(&init)?;
    let initial_step = find_reasonable_step_size(&mut hamiltonian, &point, 1., &mut rng)?;
    println!("initial step size: {:.4}", initial_step);

    let step = WindowSchedule::STEP_SIZE;
    let mass = WindowSchedule::MASS_MATRIX;
    let schedule = WindowSchedule::new(vec![
        AdaptWindow {
            start: 0,
            end: 50,
            adaptors: vec![step],
            update_metric: false,
        },
        AdaptWindow {
            start: 50,
            end: 150,
            adaptors: vec![step, mass],
            update_metric: true,
        },
        AdaptWindow {
            start: 150,
            end: 350,
            adaptors: vec![step, mass],
            update_metric: true,
        },
        AdaptWindow {
            start: 350,
            end: 400,
            adaptors: vec![step],
            update_metric: false,
        },
    ])?;
    let num_adapts = schedule.num_adapts();
    let adaptor: StagedAdaptor<DenseMassMatrix> = StagedAdaptor::new(
        vec![
            Box::new(StepSizeAdaptor::new(StepSizeSettings {
                initial_step,
                ..Default::default()
            })),
            Box::new(MassMatrixAdaptor::new(DenseMassMatrix::new(3), Default::default())),
        ],
        schedule,
    )?;

    let mut chain = HmcChain::new(
        hamiltonian,
        Proposal::default(),
        Leapfrog::new(initial_step),
        adaptor,
        rng,
        num_adapts,
        0,
    )?;
    chain.set_position(&init)?;

    for _ in 0..600 {
        let (_, stats) = chain.draw()?;
        if [49, 149, 349, 399, 599].contains(&stats.draw) {
            println!(
                "draw {}: step size {:.4}, depth {:?}",
                stats.draw, stats.step_size, stats.depth
            );
        }
    }
    let covariance = chain.hamiltonian().mass_matrix().covariance();
    for i in 0..3 {
        println!(
            "estimated sd {:.3}, true sd {}",
            covariance[(i, i)].sqrt(),
            sigma[i]
        );
    }
    Ok(())
}
