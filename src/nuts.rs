use rand::Rng;

use crate::{
    cpu_math::CpuLogpFunc,
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, Point},
    integrator::{Integrator, LeapfrogResult},
    mass_matrix::MassMatrix,
    math::logaddexp,
};

/// Callbacks for various events during a sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for adaptation.
pub trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &Point,
        _end: Option<&Point>,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _point: &Point, _info: &SampleInfo) {}
    fn register_init(&mut self, _point: &Point) {}
}

impl Collector for () {}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug, Clone)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// The number of leapfrog steps, including a diverging one.
    pub n_steps: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurningCriterion {
    /// Stop when the position difference of the outermost points of a
    /// (sub)tree points against the velocity at either end.
    #[default]
    Classic,
    /// The momentum-sum criterion, with additional checks across the
    /// two merged subtrees.
    Generalised,
}

impl TurningCriterion {
    fn is_turning(self, a: &Point, b: &Point) -> bool {
        match self {
            TurningCriterion::Classic => a.is_turning_classic(b),
            TurningCriterion::Generalised => a.is_turning_generalised(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NutsOptions {
    pub maxdepth: u64,
    pub max_energy_error: f64,
    pub criterion: TurningCriterion,
}

impl Default for NutsOptions {
    fn default() -> Self {
        Self {
            maxdepth: 10,
            max_energy_error: 1000.,
            criterion: TurningCriterion::Classic,
        }
    }
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: Point,
    right: Point,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: Point,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult<E> {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(E),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

/// Everything a tree extension needs besides the tree itself.
struct Walker<'a, F: CpuLogpFunc, M: MassMatrix, I: Integrator, C: Collector> {
    hamiltonian: &'a mut Hamiltonian<F, M>,
    integrator: &'a I,
    options: &'a NutsOptions,
    collector: &'a mut C,
    n_steps: u64,
}

impl NutsTree {
    fn new(point: Point) -> NutsTree {
        let initial_energy = point.energy();
        NutsTree {
            right: point.clone(),
            left: point.clone(),
            draw: point,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    fn extend<F, M, I, C, R>(
        mut self,
        walker: &mut Walker<F, M, I, C>,
        rng: &mut R,
        direction: Direction,
    ) -> ExtendResult<F::LogpError>
    where
        F: CpuLogpFunc,
        M: MassMatrix,
        I: Integrator,
        C: Collector,
        R: Rng + ?Sized,
    {
        let mut other = match self.single_step(walker, direction) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(walker, rng, direction) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let criterion = walker.options.criterion;
        let mut turning = criterion.is_turning(first, last);
        if (criterion == TurningCriterion::Generalised) & (self.depth > 0) {
            if !turning {
                turning = criterion.is_turning(&self.right, &other.right);
            }
            if !turning {
                turning = criterion.is_turning(&self.left, &other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    fn merge_into<R: Rng + ?Sized>(&mut self, other: NutsTree, rng: &mut R, direction: Direction) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        // The main tree proposes from the new subtree with a bias, inner
        // subtrees use plain multinomial weights.
        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if other.log_size >= self_log_size {
            self.draw = other.draw;
        } else if rng.random_bool((other.log_size - self_log_size).exp()) {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    fn single_step<F, M, I, C>(
        &self,
        walker: &mut Walker<F, M, I, C>,
        direction: Direction,
    ) -> Result<Result<NutsTree, DivergenceInfo>, F::LogpError>
    where
        F: CpuLogpFunc,
        M: MassMatrix,
        I: Integrator,
        C: Collector,
    {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        walker.n_steps += 1;
        let end = match walker.integrator.step(
            &mut *walker.hamiltonian,
            start,
            direction,
            walker.options.max_energy_error,
        ) {
            LeapfrogResult::Ok(end) => end,
            LeapfrogResult::Divergence(info) => {
                walker.collector.register_leapfrog(start, None, Some(&info));
                return Ok(Err(info));
            }
            LeapfrogResult::Err(error) => return Err(error),
        };
        walker.collector.register_leapfrog(start, Some(&end), None);

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, n_steps: u64, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            n_steps,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

/// Draw the next point of the chain with the No-U-Turn sampler.
///
/// `init` gets a fresh momentum and becomes the start of the trajectory.
/// Returns the selected point, or the unrecoverable error of the logp
/// function.
pub(crate) fn draw<F, M, I, R, C>(
    hamiltonian: &mut Hamiltonian<F, M>,
    integrator: &I,
    init: &mut Point,
    rng: &mut R,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(Point, SampleInfo), F::LogpError>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    I: Integrator,
    R: Rng + ?Sized,
    C: Collector,
{
    hamiltonian.initialize_trajectory(init, rng);
    collector.register_init(init);

    let mut walker = Walker {
        hamiltonian,
        integrator,
        options,
        collector,
        n_steps: 0,
    };

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(&mut walker, rng, direction) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, walker.n_steps, None);
                walker.collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, walker.n_steps, Some(info));
                walker.collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, walker.n_steps, None);
    walker.collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu_math::test_logps::{BarrierLogp, NormalLogp},
        integrator::Leapfrog,
        mass_matrix::{DiagMassMatrix, UnitMassMatrix},
        stepsize::AcceptanceRateCollector,
    };
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn respects_maxdepth() {
        let mut hamiltonian =
            Hamiltonian::new(NormalLogp::new(5, 0.), DiagMassMatrix::new(5)).unwrap();
        let mut init = hamiltonian.init_point(&[1., 2., -1., 0.5, 0.]).unwrap();
        let options = NutsOptions {
            maxdepth: 3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(42);

        // A tiny step size never turns within 7 steps
        let integrator = Leapfrog::new(1e-4);
        let (point, info) = draw(&mut hamiltonian, &integrator, &mut init, &mut rng, &options, &mut ()).unwrap();
        assert_eq!(info.depth, 3);
        assert!(info.reached_maxdepth);
        assert_eq!(info.n_steps, 7);
        assert!(info.divergence_info.is_none());
        assert!(point.index_in_trajectory().abs() <= 7);
    }

    #[test]
    fn terminates_on_u_turn() {
        for criterion in [TurningCriterion::Classic, TurningCriterion::Generalised] {
            let mut hamiltonian =
                Hamiltonian::new(NormalLogp::new(10, 3.), UnitMassMatrix::new(10)).unwrap();
            let mut point = hamiltonian.init_point(&[3.; 10]).unwrap();
            let options = NutsOptions {
                criterion,
                ..Default::default()
            };
            let mut rng = StdRng::seed_from_u64(1);
            let integrator = Leapfrog::new(0.3);
            for _ in 0..200 {
                let (next, info) =
                    draw(&mut hamiltonian, &integrator, &mut point, &mut rng, &options, &mut ()).unwrap();
                assert!(!info.reached_maxdepth);
                assert!(info.depth <= 6);
                assert!(info.divergence_info.is_none());
                point = next;
            }
        }
    }

    #[test]
    fn diverging_first_step_stays() {
        let mut hamiltonian =
            Hamiltonian::new(NormalLogp::new(3, 0.), UnitMassMatrix::new(3)).unwrap();
        let mut init = hamiltonian.init_point(&[1., 1., 1.]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut collector = AcceptanceRateCollector::new();
        let integrator = Leapfrog::new(1e3);

        let (point, info) = draw(
            &mut hamiltonian,
            &integrator,
            &mut init,
            &mut rng,
            &NutsOptions::default(),
            &mut collector,
        )
        .unwrap();
        assert_eq!(info.depth, 0);
        assert_eq!(info.n_steps, 1);
        assert!(info.divergence_info.is_some());
        assert_eq!(point.position(), init.position());
        assert_eq!(collector.mean.current(), 0.);
    }

    #[test]
    fn unrecoverable_error() {
        let mut hamiltonian =
            Hamiltonian::new(BarrierLogp::broken_after(2, 5), UnitMassMatrix::new(2)).unwrap();
        let mut init = hamiltonian.init_point(&[0., 0.]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let integrator = Leapfrog::new(1e-3);
        let res = draw(
            &mut hamiltonian,
            &integrator,
            &mut init,
            &mut rng,
            &NutsOptions::default(),
            &mut (),
        );
        assert!(res.is_err());
    }
}
