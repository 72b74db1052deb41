use std::fmt::Debug;

use crate::{
    error::{AdaptError, Result, SamplerError},
    mass_matrix::MassMatrix,
    mass_matrix_adapt::{AdaptableMassMatrix, MassMatrixAdaptor},
    stepsize::{DualAverage, StepSizeSettings},
};

/// Online tuning of the integrator step size and the mass matrix.
///
/// The driver calls [`Adaptor::adapt`] once for every warmup draw and
/// [`Adaptor::finalize`] exactly once at the end of warmup. After each call
/// it reads the step size and a replacement metric, if the adaptor provides
/// them.
pub trait Adaptor<Mass: MassMatrix>: Debug + Send {
    fn adapt(&mut self, position: &[f64], accept_prob: f64) -> Result<()>;

    /// End an estimation window. Returns whether a new metric was produced.
    fn end_window(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// The metric changed, state that was tuned for the old one starts over.
    fn restart(&mut self) {}

    fn finalize(&mut self) -> Result<()>;

    fn is_finalized(&self) -> bool;

    /// The step size the integrator should use from now on.
    fn step_size(&self) -> Option<f64> {
        None
    }

    /// A new metric that should replace the current one, if there is one.
    fn take_mass_matrix(&mut self) -> Option<Mass> {
        None
    }

    /// Whether this adaptor never changes anything.
    fn is_noop(&self) -> bool {
        false
    }

    /// The number of warmup draws the adaptor was scheduled for, if it
    /// follows a fixed schedule.
    fn num_adapts(&self) -> Option<u64> {
        None
    }

    /// The dimension of the metric the adaptor estimates.
    fn dim(&self) -> Option<usize> {
        None
    }
}

impl<Mass: MassMatrix, A: Adaptor<Mass> + ?Sized> Adaptor<Mass> for Box<A> {
    fn adapt(&mut self, position: &[f64], accept_prob: f64) -> Result<()> {
        (**self).adapt(position, accept_prob)
    }

    fn end_window(&mut self) -> Result<bool> {
        (**self).end_window()
    }

    fn restart(&mut self) {
        (**self).restart()
    }

    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }

    fn is_finalized(&self) -> bool {
        (**self).is_finalized()
    }

    fn step_size(&self) -> Option<f64> {
        (**self).step_size()
    }

    fn take_mass_matrix(&mut self) -> Option<Mass> {
        (**self).take_mass_matrix()
    }

    fn is_noop(&self) -> bool {
        (**self).is_noop()
    }

    fn num_adapts(&self) -> Option<u64> {
        (**self).num_adapts()
    }

    fn dim(&self) -> Option<usize> {
        (**self).dim()
    }
}

fn check_not_finalized(finalized: bool) -> Result<()> {
    if finalized {
        Err(AdaptError::AdaptAfterFinalize.into())
    } else {
        Ok(())
    }
}

fn mark_finalized(finalized: &mut bool) -> Result<()> {
    if *finalized {
        return Err(AdaptError::AlreadyFinalized.into());
    }
    *finalized = true;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct NoAdaptation {
    finalized: bool,
}

impl NoAdaptation {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Mass: MassMatrix> Adaptor<Mass> for NoAdaptation {
    fn adapt(&mut self, _position: &[f64], _accept_prob: f64) -> Result<()> {
        check_not_finalized(self.finalized)
    }

    fn finalize(&mut self) -> Result<()> {
        mark_finalized(&mut self.finalized)
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Dual averaging of the step size towards a target acceptance rate.
#[derive(Debug, Clone)]
pub struct StepSizeAdaptor {
    dual_average: DualAverage,
    settings: StepSizeSettings,
    finalized: bool,
}

impl StepSizeAdaptor {
    pub fn new(settings: StepSizeSettings) -> Self {
        Self {
            dual_average: DualAverage::new(settings.params, settings.initial_step),
            settings,
            finalized: false,
        }
    }

    pub fn settings(&self) -> &StepSizeSettings {
        &self.settings
    }

    /// The averaged step size, which becomes the final one.
    pub fn step_size_adapted(&self) -> f64 {
        self.dual_average.current_step_size_adapted()
    }
}

impl<Mass: MassMatrix> Adaptor<Mass> for StepSizeAdaptor {
    fn adapt(&mut self, _position: &[f64], accept_prob: f64) -> Result<()> {
        check_not_finalized(self.finalized)?;
        let accept_prob = if accept_prob.is_nan() {
            0.
        } else {
            accept_prob.clamp(0., 1.)
        };
        self.dual_average
            .advance(accept_prob, self.settings.target_accept);
        Ok(())
    }

    fn restart(&mut self) {
        let step_size = self.dual_average.current_step_size();
        log::debug!("Restarting step size adaptation at {}", step_size);
        self.dual_average.reset(step_size, 10.);
    }

    fn finalize(&mut self) -> Result<()> {
        mark_finalized(&mut self.finalized)?;
        log::debug!(
            "Final step size after {} adaptation draws: {}",
            self.dual_average.count(),
            self.step_size_adapted()
        );
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn step_size(&self) -> Option<f64> {
        if self.finalized {
            Some(self.dual_average.current_step_size_adapted())
        } else {
            Some(self.dual_average.current_step_size())
        }
    }
}

/// Runs several adaptors on every draw, in order.
///
/// The adaptors do not see each other. If more than one of them provides
/// a step size or a metric, the last one wins.
#[derive(Debug)]
pub struct CompositeAdaptor<Mass: MassMatrix> {
    adaptors: Vec<Box<dyn Adaptor<Mass>>>,
    finalized: bool,
}

impl<Mass: MassMatrix> CompositeAdaptor<Mass> {
    pub fn new(adaptors: Vec<Box<dyn Adaptor<Mass>>>) -> Self {
        Self {
            adaptors,
            finalized: false,
        }
    }

    pub fn adaptors(&self) -> &[Box<dyn Adaptor<Mass>>] {
        &self.adaptors
    }
}

fn last_step_size<Mass: MassMatrix>(adaptors: &[Box<dyn Adaptor<Mass>>]) -> Option<f64> {
    adaptors.iter().rev().find_map(|adaptor| adaptor.step_size())
}

fn scheduled_num_adapts<Mass: MassMatrix>(adaptors: &[Box<dyn Adaptor<Mass>>]) -> Option<u64> {
    adaptors.iter().find_map(|adaptor| adaptor.num_adapts())
}

fn metric_dim<Mass: MassMatrix>(adaptors: &[Box<dyn Adaptor<Mass>>]) -> Option<usize> {
    adaptors.iter().find_map(|adaptor| adaptor.dim())
}

fn take_last_mass_matrix<Mass: MassMatrix>(
    adaptors: &mut [Box<dyn Adaptor<Mass>>],
) -> Option<Mass> {
    adaptors
        .iter_mut()
        .fold(None, |found, adaptor| adaptor.take_mass_matrix().or(found))
}

impl<Mass: MassMatrix> Adaptor<Mass> for CompositeAdaptor<Mass> {
    fn adapt(&mut self, position: &[f64], accept_prob: f64) -> Result<()> {
        check_not_finalized(self.finalized)?;
        for adaptor in self.adaptors.iter_mut() {
            adaptor.adapt(position, accept_prob)?;
        }
        Ok(())
    }

    fn end_window(&mut self) -> Result<bool> {
        check_not_finalized(self.finalized)?;
        let mut changed = false;
        for adaptor in self.adaptors.iter_mut() {
            changed |= adaptor.end_window()?;
        }
        Ok(changed)
    }

    fn restart(&mut self) {
        self.adaptors.iter_mut().for_each(|adaptor| adaptor.restart());
    }

    fn finalize(&mut self) -> Result<()> {
        mark_finalized(&mut self.finalized)?;
        for adaptor in self.adaptors.iter_mut() {
            adaptor.finalize()?;
        }
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn step_size(&self) -> Option<f64> {
        last_step_size(&self.adaptors)
    }

    fn take_mass_matrix(&mut self) -> Option<Mass> {
        take_last_mass_matrix(&mut self.adaptors)
    }

    fn is_noop(&self) -> bool {
        self.adaptors.iter().all(|adaptor| adaptor.is_noop())
    }

    fn num_adapts(&self) -> Option<u64> {
        scheduled_num_adapts(&self.adaptors)
    }

    fn dim(&self) -> Option<usize> {
        metric_dim(&self.adaptors)
    }
}

/// A contiguous range of warmup draws `[start, end)` and the adaptors
/// (by index) that see those draws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptWindow {
    pub start: u64,
    pub end: u64,
    pub adaptors: Vec<usize>,
    /// End the estimation window of the adaptors at the last draw.
    pub update_metric: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StanWindowOptions {
    pub init_buffer: u64,
    pub term_buffer: u64,
    pub base_window: u64,
}

impl Default for StanWindowOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WindowSchedule {
    windows: Vec<AdaptWindow>,
}

impl WindowSchedule {
    /// The step size adaptor in [`WindowSchedule::stan`] schedules.
    pub const STEP_SIZE: usize = 0;
    /// The mass matrix adaptor in [`WindowSchedule::stan`] schedules.
    pub const MASS_MATRIX: usize = 1;

    /// Windows must be non-empty and cover `[0, num_adapts)` without gaps.
    pub fn new(windows: Vec<AdaptWindow>) -> Result<Self> {
        let mut expected_start = 0;
        for window in windows.iter() {
            if window.start != expected_start {
                return Err(SamplerError::InvalidConfig(format!(
                    "adaptation window starts at {}, expected {}",
                    window.start, expected_start
                )));
            }
            if window.end <= window.start {
                return Err(SamplerError::InvalidConfig(format!(
                    "empty adaptation window at {}",
                    window.start
                )));
            }
            expected_start = window.end;
        }
        Ok(Self { windows })
    }

    pub fn stan(num_adapts: u64) -> Self {
        Self::stan_with(num_adapts, StanWindowOptions::default())
    }

    /// An initial window that tunes the step size, slow windows of doubling
    /// size that tune step size and metric, and a terminal step size window.
    pub fn stan_with(num_adapts: u64, options: StanWindowOptions) -> Self {
        let StanWindowOptions {
            mut init_buffer,
            mut term_buffer,
            mut base_window,
        } = options;

        if init_buffer + term_buffer + base_window > num_adapts {
            init_buffer = (0.15 * num_adapts as f64) as u64;
            term_buffer = (0.1 * num_adapts as f64) as u64;
            base_window = num_adapts - init_buffer - term_buffer;
            log::debug!(
                "Too few adaptation draws for the default windows, using {} / {} / {}",
                init_buffer,
                base_window,
                term_buffer
            );
        }

        let step = Self::STEP_SIZE;
        let mass = Self::MASS_MATRIX;
        let mut windows = vec![];
        if init_buffer > 0 {
            windows.push(AdaptWindow {
                start: 0,
                end: init_buffer,
                adaptors: vec![step],
                update_metric: false,
            });
        }

        let slow_end = num_adapts - term_buffer;
        let mut start = init_buffer;
        let mut size = base_window.max(1);
        let mut end = (start + size).min(slow_end);
        while start < slow_end {
            windows.push(AdaptWindow {
                start,
                end,
                adaptors: vec![step, mass],
                update_metric: true,
            });
            start = end;
            size *= 2;
            end = start + size;
            if end + 2 * size > slow_end {
                end = slow_end;
            }
        }

        if term_buffer > 0 {
            windows.push(AdaptWindow {
                start: slow_end,
                end: num_adapts,
                adaptors: vec![step],
                update_metric: false,
            });
        }
        Self { windows }
    }

    pub fn windows(&self) -> &[AdaptWindow] {
        &self.windows
    }

    pub fn num_adapts(&self) -> u64 {
        self.windows.last().map(|w| w.end).unwrap_or(0)
    }

    fn window_of(&self, draw: u64) -> Option<&AdaptWindow> {
        self.windows
            .iter()
            .find(|w| (w.start <= draw) & (draw < w.end))
    }
}

/// Applies its adaptors according to a window schedule.
///
/// Every time an estimation window that updates the metric ends and one of
/// the adaptors produced a new metric, all adaptors are restarted.
#[derive(Debug)]
pub struct StagedAdaptor<Mass: MassMatrix> {
    adaptors: Vec<Box<dyn Adaptor<Mass>>>,
    schedule: WindowSchedule,
    draw: u64,
    finalized: bool,
}

impl<Mass: MassMatrix> StagedAdaptor<Mass> {
    pub fn new(adaptors: Vec<Box<dyn Adaptor<Mass>>>, schedule: WindowSchedule) -> Result<Self> {
        let max_index = schedule
            .windows()
            .iter()
            .flat_map(|w| w.adaptors.iter().copied())
            .max();
        if let Some(idx) = max_index {
            if idx >= adaptors.len() {
                return Err(SamplerError::InvalidConfig(format!(
                    "adaptation window refers to adaptor {}, but there are only {}",
                    idx,
                    adaptors.len()
                )));
            }
        }
        Ok(Self {
            adaptors,
            schedule,
            draw: 0,
            finalized: false,
        })
    }

    pub fn schedule(&self) -> &WindowSchedule {
        &self.schedule
    }
}

impl<Mass: AdaptableMassMatrix> StagedAdaptor<Mass> {
    /// Step size and mass matrix adaptation in the windows of
    /// [`WindowSchedule::stan`].
    pub fn stan(
        step_size: StepSizeAdaptor,
        mass_matrix: MassMatrixAdaptor<Mass>,
        num_adapts: u64,
    ) -> Self {
        Self {
            adaptors: vec![Box::new(step_size), Box::new(mass_matrix)],
            schedule: WindowSchedule::stan(num_adapts),
            draw: 0,
            finalized: false,
        }
    }
}

impl<Mass: MassMatrix> Adaptor<Mass> for StagedAdaptor<Mass> {
    fn adapt(&mut self, position: &[f64], accept_prob: f64) -> Result<()> {
        check_not_finalized(self.finalized)?;
        let Some(window) = self.schedule.window_of(self.draw) else {
            return Err(AdaptError::WindowExceeded {
                draw: self.draw,
                num_adapts: self.schedule.num_adapts(),
            }
            .into());
        };

        for &idx in window.adaptors.iter() {
            self.adaptors[idx].adapt(position, accept_prob)?;
        }

        if window.update_metric & (self.draw + 1 == window.end) {
            let mut changed = false;
            for &idx in window.adaptors.iter() {
                changed |= self.adaptors[idx].end_window()?;
            }
            if changed {
                log::debug!("Metric changed at the end of warmup window {}..{}", window.start, window.end);
                self.adaptors.iter_mut().for_each(|adaptor| adaptor.restart());
            }
        }

        self.draw += 1;
        Ok(())
    }

    fn restart(&mut self) {
        self.adaptors.iter_mut().for_each(|adaptor| adaptor.restart());
    }

    fn finalize(&mut self) -> Result<()> {
        mark_finalized(&mut self.finalized)?;
        for adaptor in self.adaptors.iter_mut() {
            adaptor.finalize()?;
        }
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn step_size(&self) -> Option<f64> {
        last_step_size(&self.adaptors)
    }

    fn take_mass_matrix(&mut self) -> Option<Mass> {
        take_last_mass_matrix(&mut self.adaptors)
    }

    fn is_noop(&self) -> bool {
        self.adaptors.iter().all(|adaptor| adaptor.is_noop())
    }

    fn num_adapts(&self) -> Option<u64> {
        Some(self.schedule.num_adapts())
    }

    fn dim(&self) -> Option<usize> {
        metric_dim(&self.adaptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_matrix::{DiagMassMatrix, UnitMassMatrix};
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn ranges(schedule: &WindowSchedule) -> Vec<(u64, u64)> {
        schedule.windows().iter().map(|w| (w.start, w.end)).collect()
    }

    #[test]
    fn stan_windows() {
        let schedule = WindowSchedule::stan(1000);
        assert_eq!(
            ranges(&schedule),
            vec![
                (0, 75),
                (75, 100),
                (100, 150),
                (150, 250),
                (250, 450),
                (450, 950),
                (950, 1000)
            ]
        );
        assert_eq!(schedule.windows()[0].adaptors, vec![WindowSchedule::STEP_SIZE]);
        assert!(schedule.windows()[1..6].iter().all(|w| w.update_metric));
        assert_eq!(schedule.num_adapts(), 1000);

        assert_eq!(ranges(&WindowSchedule::stan(100)), vec![(0, 15), (15, 90), (90, 100)]);
        assert_eq!(ranges(&WindowSchedule::stan(150)), vec![(0, 75), (75, 100), (100, 150)]);
        assert_eq!(ranges(&WindowSchedule::stan(5)), vec![(0, 5)]);
        assert!(WindowSchedule::stan(0).windows().is_empty());
    }

    #[test]
    fn schedule_validation() {
        let window = |start, end| AdaptWindow {
            start,
            end,
            adaptors: vec![0],
            update_metric: false,
        };
        assert!(WindowSchedule::new(vec![window(0, 5), window(5, 10)]).is_ok());
        assert!(WindowSchedule::new(vec![window(0, 5), window(6, 10)]).is_err());
        assert!(WindowSchedule::new(vec![window(0, 0)]).is_err());

        let schedule = WindowSchedule::new(vec![AdaptWindow {
            start: 0,
            end: 3,
            adaptors: vec![2],
            update_metric: false,
        }])
        .unwrap();
        let staged = StagedAdaptor::<UnitMassMatrix>::new(vec![Box::new(NoAdaptation::new())], schedule);
        assert!(staged.is_err());
    }

    #[test]
    fn finalize_contract() {
        let mut adaptors: Vec<Box<dyn Adaptor<DiagMassMatrix>>> = vec![
            Box::new(NoAdaptation::new()),
            Box::new(StepSizeAdaptor::new(Default::default())),
            Box::new(MassMatrixAdaptor::new(DiagMassMatrix::new(1), Default::default())),
            Box::new(CompositeAdaptor::new(vec![])),
        ];
        for adaptor in adaptors.iter_mut() {
            adaptor.adapt(&[0.], 0.5).unwrap();
            adaptor.finalize().unwrap();
            assert!(adaptor.is_finalized());
            assert!(matches!(
                adaptor.finalize(),
                Err(SamplerError::Adapt(AdaptError::AlreadyFinalized))
            ));
            assert!(matches!(
                adaptor.adapt(&[0.], 0.5),
                Err(SamplerError::Adapt(AdaptError::AdaptAfterFinalize))
            ));
        }
    }

    #[test]
    fn step_size_sanitizes_accept_prob() {
        let mut nan = StepSizeAdaptor::new(Default::default());
        let mut zero = StepSizeAdaptor::new(Default::default());
        Adaptor::<UnitMassMatrix>::adapt(&mut nan, &[], f64::NAN).unwrap();
        Adaptor::<UnitMassMatrix>::adapt(&mut zero, &[], 0.).unwrap();
        assert_eq!(
            Adaptor::<UnitMassMatrix>::step_size(&nan),
            Adaptor::<UnitMassMatrix>::step_size(&zero)
        );

        let mut big = StepSizeAdaptor::new(Default::default());
        let mut one = StepSizeAdaptor::new(Default::default());
        Adaptor::<UnitMassMatrix>::adapt(&mut big, &[], 1.5).unwrap();
        Adaptor::<UnitMassMatrix>::adapt(&mut one, &[], 1.).unwrap();
        assert_eq!(
            Adaptor::<UnitMassMatrix>::step_size(&big),
            Adaptor::<UnitMassMatrix>::step_size(&one)
        );
        Adaptor::<UnitMassMatrix>::finalize(&mut one).unwrap();
        assert_eq!(
            Adaptor::<UnitMassMatrix>::step_size(&one),
            Some(one.step_size_adapted())
        );
    }

    #[test]
    fn noop_detection() {
        let none: Box<dyn Adaptor<UnitMassMatrix>> = Box::new(NoAdaptation::new());
        assert!(none.is_noop());
        let composite = CompositeAdaptor::<UnitMassMatrix>::new(vec![
            Box::new(NoAdaptation::new()),
            Box::new(NoAdaptation::new()),
        ]);
        assert!(composite.is_noop());
        let composite = CompositeAdaptor::<UnitMassMatrix>::new(vec![
            Box::new(NoAdaptation::new()),
            Box::new(StepSizeAdaptor::new(Default::default())),
        ]);
        assert!(!composite.is_noop());
    }

    #[test]
    fn staged_stan_replaces_metric_and_restarts() {
        let num_adapts = 200;
        let mut staged = StagedAdaptor::stan(
            StepSizeAdaptor::new(Default::default()),
            MassMatrixAdaptor::new(DiagMassMatrix::new(2), Default::default()),
            num_adapts,
        );
        let mut rng = StdRng::seed_from_u64(0);
        let mut replaced = vec![];
        for draw in 0..num_adapts {
            let x: f64 = rng.sample(StandardNormal);
            let y: f64 = rng.sample(StandardNormal);
            staged.adapt(&[x, 3. * y], 0.9).unwrap();
            if staged.take_mass_matrix().is_some() {
                replaced.push(draw);
            }
        }
        // Windows 75..100 and 100..150 end slow adaptation
        assert_eq!(replaced, vec![99, 149]);
        assert!(matches!(
            staged.adapt(&[0., 0.], 0.9),
            Err(SamplerError::Adapt(AdaptError::WindowExceeded {
                draw: 200,
                num_adapts: 200
            }))
        ));
        staged.finalize().unwrap();
        assert!(staged.take_mass_matrix().is_none());
        assert!(staged.step_size().is_some());
    }
}
