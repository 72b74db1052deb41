use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayBuilder, BooleanBuilder, FixedSizeListBuilder, Float64Builder, Int64Builder,
        StructArray, UInt64Builder,
    },
    datatypes::{DataType, Field},
};

use crate::{
    error::{Result, SamplerError},
    hamiltonian::DivergenceInfo,
};

/// Statistics of a single transition.
#[derive(Debug, Clone)]
pub struct TransitionStats {
    pub chain: u64,
    pub draw: u64,
    /// Whether the draw was part of warmup.
    pub tuning: bool,
    pub accept_prob: f64,
    /// The step size used for this transition.
    pub step_size: f64,
    pub diverging: bool,
    /// Total energy of the selected point.
    pub energy: f64,
    pub energy_error: f64,
    pub logp: f64,
    /// Tree depth, only for NUTS transitions.
    pub depth: Option<u64>,
    pub n_steps: u64,
    pub maxdepth_reached: bool,
    pub index_in_trajectory: i64,
    pub divergence_info: Option<DivergenceInfo>,
}

/// Energy based fraction of missing information.
///
/// `NaN` for fewer than two energies or if the energies do not vary.
pub fn ebfmi(energies: &[f64]) -> f64 {
    if energies.len() < 2 {
        return f64::NAN;
    }
    let n = energies.len() as f64;
    let mean = energies.iter().sum::<f64>() / n;
    let denom: f64 = energies.iter().map(|e| (e - mean).powi(2)).sum();
    if denom == 0. {
        return f64::NAN;
    }
    let numer: f64 = energies
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).powi(2))
        .sum();
    numer / denom
}

/// Summary of a run, computed over the returned draws.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDiagnostics {
    pub num_draws: u64,
    pub ebfmi: f64,
    pub mean_accept: f64,
    pub num_divergences: u64,
    /// Divergences after warmup.
    pub num_divergences_sampling: u64,
    pub mean_depth: Option<f64>,
    pub num_grad_evals: u64,
}

impl RunDiagnostics {
    pub fn from_stats(stats: &[TransitionStats]) -> Self {
        let energies: Vec<f64> = stats.iter().map(|s| s.energy).collect();
        let num_draws = stats.len() as u64;
        let mean_accept = if stats.is_empty() {
            f64::NAN
        } else {
            stats.iter().map(|s| s.accept_prob).sum::<f64>() / stats.len() as f64
        };
        let depths: Vec<u64> = stats.iter().filter_map(|s| s.depth).collect();
        let mean_depth = if depths.is_empty() {
            None
        } else {
            Some(depths.iter().sum::<u64>() as f64 / depths.len() as f64)
        };
        Self {
            num_draws,
            ebfmi: ebfmi(&energies),
            mean_accept,
            num_divergences: stats.iter().filter(|s| s.diverging).count() as u64,
            num_divergences_sampling: stats
                .iter()
                .filter(|s| s.diverging & !s.tuning)
                .count() as u64,
            mean_depth,
            num_grad_evals: stats.iter().map(|s| s.n_steps).sum(),
        }
    }
}

/// Collect values into an arrow array.
pub trait StatTraceBuilder<T: ?Sized>: Send {
    fn append_value(&mut self, value: &T) -> Result<()>;
    fn finalize(self) -> Arc<dyn Array>;
    fn inspect(&self) -> Arc<dyn Array>;
}

pub struct StatsBuilder {
    chain: UInt64Builder,
    draw: UInt64Builder,
    tuning: BooleanBuilder,
    accept_prob: Float64Builder,
    step_size: Float64Builder,
    diverging: BooleanBuilder,
    energy: Float64Builder,
    energy_error: Float64Builder,
    logp: Float64Builder,
    depth: UInt64Builder,
    n_steps: UInt64Builder,
    maxdepth_reached: BooleanBuilder,
    index_in_trajectory: Int64Builder,
}

impl StatsBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chain: UInt64Builder::with_capacity(capacity),
            draw: UInt64Builder::with_capacity(capacity),
            tuning: BooleanBuilder::with_capacity(capacity),
            accept_prob: Float64Builder::with_capacity(capacity),
            step_size: Float64Builder::with_capacity(capacity),
            diverging: BooleanBuilder::with_capacity(capacity),
            energy: Float64Builder::with_capacity(capacity),
            energy_error: Float64Builder::with_capacity(capacity),
            logp: Float64Builder::with_capacity(capacity),
            depth: UInt64Builder::with_capacity(capacity),
            n_steps: UInt64Builder::with_capacity(capacity),
            maxdepth_reached: BooleanBuilder::with_capacity(capacity),
            index_in_trajectory: Int64Builder::with_capacity(capacity),
        }
    }

    fn fields() -> Vec<Field> {
        vec![
            Field::new("chain", DataType::UInt64, false),
            Field::new("draw", DataType::UInt64, false),
            Field::new("tuning", DataType::Boolean, false),
            Field::new("accept_prob", DataType::Float64, false),
            Field::new("step_size", DataType::Float64, false),
            Field::new("diverging", DataType::Boolean, false),
            Field::new("energy", DataType::Float64, false),
            Field::new("energy_error", DataType::Float64, false),
            Field::new("logp", DataType::Float64, false),
            Field::new("depth", DataType::UInt64, true),
            Field::new("n_steps", DataType::UInt64, false),
            Field::new("maxdepth_reached", DataType::Boolean, false),
            Field::new("index_in_trajectory", DataType::Int64, false),
        ]
    }
}

impl StatTraceBuilder<TransitionStats> for StatsBuilder {
    fn append_value(&mut self, value: &TransitionStats) -> Result<()> {
        self.chain.append_value(value.chain);
        self.draw.append_value(value.draw);
        self.tuning.append_value(value.tuning);
        self.accept_prob.append_value(value.accept_prob);
        self.step_size.append_value(value.step_size);
        self.diverging.append_value(value.diverging);
        self.energy.append_value(value.energy);
        self.energy_error.append_value(value.energy_error);
        self.logp.append_value(value.logp);
        self.depth.append_option(value.depth);
        self.n_steps.append_value(value.n_steps);
        self.maxdepth_reached.append_value(value.maxdepth_reached);
        self.index_in_trajectory
            .append_value(value.index_in_trajectory);
        Ok(())
    }

    fn finalize(self) -> Arc<dyn Array> {
        let Self {
            mut chain,
            mut draw,
            mut tuning,
            mut accept_prob,
            mut step_size,
            mut diverging,
            mut energy,
            mut energy_error,
            mut logp,
            mut depth,
            mut n_steps,
            mut maxdepth_reached,
            mut index_in_trajectory,
        } = self;

        let arrays = vec![
            ArrayBuilder::finish(&mut chain),
            ArrayBuilder::finish(&mut draw),
            ArrayBuilder::finish(&mut tuning),
            ArrayBuilder::finish(&mut accept_prob),
            ArrayBuilder::finish(&mut step_size),
            ArrayBuilder::finish(&mut diverging),
            ArrayBuilder::finish(&mut energy),
            ArrayBuilder::finish(&mut energy_error),
            ArrayBuilder::finish(&mut logp),
            ArrayBuilder::finish(&mut depth),
            ArrayBuilder::finish(&mut n_steps),
            ArrayBuilder::finish(&mut maxdepth_reached),
            ArrayBuilder::finish(&mut index_in_trajectory),
        ];

        Arc::new(StructArray::new(Self::fields().into(), arrays, None))
    }

    fn inspect(&self) -> Arc<dyn Array> {
        let arrays = vec![
            ArrayBuilder::finish_cloned(&self.chain),
            ArrayBuilder::finish_cloned(&self.draw),
            ArrayBuilder::finish_cloned(&self.tuning),
            ArrayBuilder::finish_cloned(&self.accept_prob),
            ArrayBuilder::finish_cloned(&self.step_size),
            ArrayBuilder::finish_cloned(&self.diverging),
            ArrayBuilder::finish_cloned(&self.energy),
            ArrayBuilder::finish_cloned(&self.energy_error),
            ArrayBuilder::finish_cloned(&self.logp),
            ArrayBuilder::finish_cloned(&self.depth),
            ArrayBuilder::finish_cloned(&self.n_steps),
            ArrayBuilder::finish_cloned(&self.maxdepth_reached),
            ArrayBuilder::finish_cloned(&self.index_in_trajectory),
        ];

        Arc::new(StructArray::new(Self::fields().into(), arrays, None))
    }
}

/// Draws as a fixed size list array with one entry per draw.
pub struct DrawsBuilder {
    dim: usize,
    draws: FixedSizeListBuilder<Float64Builder>,
}

impl DrawsBuilder {
    pub fn new(dim: usize) -> Self {
        let items = Float64Builder::new();
        let draws = FixedSizeListBuilder::new(items, dim as _);
        Self { dim, draws }
    }
}

impl StatTraceBuilder<[f64]> for DrawsBuilder {
    fn append_value(&mut self, point: &[f64]) -> Result<()> {
        if point.len() != self.dim {
            return Err(SamplerError::ShapeMismatch {
                expected: self.dim,
                found: point.len(),
            });
        }
        self.draws.values().append_slice(point);
        self.draws.append(true);
        Ok(())
    }

    fn finalize(mut self) -> Arc<dyn Array> {
        ArrayBuilder::finish(&mut self.draws)
    }

    fn inspect(&self) -> Arc<dyn Array> {
        ArrayBuilder::finish_cloned(&self.draws)
    }
}
