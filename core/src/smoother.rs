//! Forward/backward particle smoother.
//!
//! The [`ParticleSmoother`] runs a bootstrap particle filter forward over all periods and then
//! walks backward selecting the most probable predecessor particle of every observation.
//!
//! Forward pass, for every period $t = 1, \dots, P$:
//! 1. propagate the resampled population of period $t-1$ with the transition equations and the
//!    shocks of period $t$;
//! 2. weight each particle by the product of the measurement likelihoods of the factor types that
//!    are informative in period $t$ (every factor type in period 1, only non-constant types
//!    afterwards). The product is accumulated in log space and normalized per observation;
//! 3. draw multinomial counts from the weights and rebuild the population.
//!
//! Backward pass: the estimate for period $P$ is the highest-weight propagated particle of the
//! last forward step. For $t = P-1, \dots, 1$ the resampled population of period $t$ is weighted by
//! the probability of transitioning into the estimate of period $t+1$, and its most probable
//! particle becomes the estimate of period $t$. Ties go to the lowest particle index.
//!
//! The backward step selects a single particle rather than simulating backward trajectories, so the
//! output is a point estimate of each path and not a sample from the smoothing distribution.
use crate::measurements::MeasurementModel;
use crate::particle::{
    ParticleResampler, draw_counts, effective_sample_sizes, most_probable_particles,
};
use crate::transition::{TransitionErrors, TransitionModel};
use crate::{
    FactorPopulation, ModelKind, NUM_FACTOR_TYPES, Result, SmootherError, Stage,
};

use log::{debug, info, warn};
use nalgebra::{DMatrix, Vector3};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// Default seed value for reproducible runs
pub fn default_seed() -> u64 {
    42
}

const RESAMPLING_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Generator used for resampling in [`ParticleSmoother::run`].
///
/// Derived from `seed` so that it never replays the stream that draws priors and shocks from the
/// same seed.
pub fn resampling_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ RESAMPLING_STREAM)
}

/// Size and seed of one smoothing run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmootherConfig {
    /// Number of independent observation units
    pub observations: usize,
    /// Number of periods to smooth
    pub periods: usize,
    /// Number of particles per observation
    pub particles: usize,
    /// Seed of the random number generator used for resampling
    #[serde(default = "default_seed")]
    pub seed: u64,
}
impl Default for SmootherConfig {
    fn default() -> Self {
        SmootherConfig {
            observations: 1,
            periods: 1,
            particles: 100,
            seed: default_seed(),
        }
    }
}
impl SmootherConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("observations", self.observations),
            ("periods", self.periods),
            ("particles", self.particles),
        ] {
            if value == 0 {
                return Err(SmootherError::InvalidParameter {
                    name,
                    value: 0.0,
                    reason: "must be at least 1",
                });
            }
        }
        Ok(())
    }
}

/// One row of a factor table: the three factor values of one observation in one period.
///
/// Used for smoothed estimates as well as for true factors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorRecord {
    pub caseid: u64,
    pub period: usize,
    pub fac1: f64,
    pub fac2: f64,
    pub fac3: f64,
}
impl FactorRecord {
    pub fn values(&self) -> Vector3<f64> {
        Vector3::new(self.fac1, self.fac2, self.fac3)
    }
}

/// Factor values keyed by (observation, period).
#[derive(Clone, Debug, PartialEq)]
pub struct EstimateTable {
    /// Observation identifiers, in the order of the particle arrays
    observations: Vec<u64>,
    /// One `3 × obs` matrix per period
    estimates: Vec<DMatrix<f64>>,
}
impl EstimateTable {
    /// Empty table (all zeros) for the given observation identifiers and number of periods.
    pub fn new(observations: Vec<u64>, periods: usize) -> Self {
        let n = observations.len();
        EstimateTable {
            observations,
            estimates: vec![DMatrix::zeros(NUM_FACTOR_TYPES, n); periods],
        }
    }
    pub fn observations(&self) -> &[u64] {
        &self.observations
    }
    pub fn periods(&self) -> usize {
        self.estimates.len()
    }
    /// Estimates of one period (1-based) as a `3 × obs` matrix.
    pub fn period(&self, period: usize) -> Option<&DMatrix<f64>> {
        period.checked_sub(1).and_then(|p| self.estimates.get(p))
    }
    pub fn set_period(&mut self, period: usize, values: DMatrix<f64>) -> Result<()> {
        let expected = (NUM_FACTOR_TYPES, self.observations.len());
        if values.shape() != expected {
            return Err(SmootherError::ShapeMismatch {
                what: "period estimates",
                expected,
                found: values.shape(),
            });
        }
        let periods = self.periods();
        let slot = period
            .checked_sub(1)
            .and_then(|p| self.estimates.get_mut(p))
            .ok_or(SmootherError::RecordCountMismatch {
                what: "periods in the estimate table",
                expected: periods,
                found: period,
            })?;
        *slot = values;
        Ok(())
    }
    /// Factor values of the observation at position `observation` in `period`.
    pub fn get(&self, observation: usize, period: usize) -> Option<Vector3<f64>> {
        let values = self.period(period)?;
        if observation >= values.ncols() {
            return None;
        }
        Some(Vector3::new(
            values[(0, observation)],
            values[(1, observation)],
            values[(2, observation)],
        ))
    }
    /// Factor values of the observation with identifier `caseid` in `period`.
    pub fn get_by_id(&self, caseid: u64, period: usize) -> Option<Vector3<f64>> {
        let position = self.observations.iter().position(|&id| id == caseid)?;
        self.get(position, period)
    }
    /// Rows ordered by observation, then period.
    pub fn records(&self) -> Vec<FactorRecord> {
        let mut records = Vec::with_capacity(self.observations.len() * self.periods());
        for (i, &caseid) in self.observations.iter().enumerate() {
            for (p, values) in self.estimates.iter().enumerate() {
                records.push(FactorRecord {
                    caseid,
                    period: p + 1,
                    fac1: values[(0, i)],
                    fac2: values[(1, i)],
                    fac3: values[(2, i)],
                });
            }
        }
        records
    }
    /// Build a table from rows. Every (observation, period) pair up to the largest period must be
    /// present exactly once.
    pub fn from_records(records: &[FactorRecord]) -> Result<Self> {
        let mut observations: Vec<u64> = records.iter().map(|r| r.caseid).collect();
        observations.sort_unstable();
        observations.dedup();
        let periods = records.iter().map(|r| r.period).max().unwrap_or(0);
        let expected = observations.len() * periods;
        if records.len() != expected || records.iter().any(|r| r.period == 0) {
            return Err(SmootherError::RecordCountMismatch {
                what: "rows in the factor table (observations x periods)",
                expected,
                found: records.len(),
            });
        }
        let mut table = EstimateTable::new(observations, periods);
        let mut seen = vec![false; expected];
        for (index, record) in records.iter().enumerate() {
            // observations is sorted, so the search cannot miss
            let i = table
                .observations
                .binary_search(&record.caseid)
                .unwrap_or_default();
            let key = i * periods + record.period - 1;
            if seen[key] {
                return Err(SmootherError::InvalidRecord {
                    line: index as u64 + 2,
                    reason: format!(
                        "duplicate row for caseid {} in period {}",
                        record.caseid, record.period
                    ),
                });
            }
            seen[key] = true;
            let values = &mut table.estimates[record.period - 1];
            values[(0, i)] = record.fac1;
            values[(1, i)] = record.fac2;
            values[(2, i)] = record.fac3;
        }
        Ok(table)
    }
    /// Writes the table as CSV with columns `caseid,period,fac1,fac2,fac3`.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in self.records() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Reads a table written by [`EstimateTable::to_csv`] (or a true-factor table of the same layout).
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: FactorRecord = result?;
            records.push(record);
        }
        Self::from_records(&records)
    }
}

/// State left behind by the forward pass.
#[derive(Clone, Debug)]
pub struct ForwardPass {
    /// Resampled populations, index 0 is the prior
    history: Vec<FactorPopulation>,
    /// Propagated population of the last period, before resampling
    last_propagated: FactorPopulation,
    /// Normalized weights of `last_propagated`
    last_weights: DMatrix<f64>,
}
impl ForwardPass {
    pub fn history(&self) -> &[FactorPopulation] {
        &self.history
    }
    pub fn last_propagated(&self) -> &FactorPopulation {
        &self.last_propagated
    }
    pub fn last_weights(&self) -> &DMatrix<f64> {
        &self.last_weights
    }
}

/// Particle smoother for the three-factor model.
#[derive(Clone, Debug)]
pub struct ParticleSmoother {
    config: SmootherConfig,
    transition: TransitionModel,
    measurements: [MeasurementModel; NUM_FACTOR_TYPES],
    resampler: ParticleResampler,
    observation_ids: Vec<u64>,
}
impl ParticleSmoother {
    /// Create a smoother. Observations are identified as `1..=observations` unless
    /// [`ParticleSmoother::with_observation_ids`] is used.
    pub fn new(
        config: SmootherConfig,
        transition: TransitionModel,
        measurements: [MeasurementModel; NUM_FACTOR_TYPES],
    ) -> Result<Self> {
        config.validate()?;
        let observation_ids = (1..=config.observations as u64).collect();
        Ok(ParticleSmoother {
            config,
            transition,
            measurements,
            resampler: ParticleResampler,
            observation_ids,
        })
    }
    /// Label the observations (in particle-array order) with the given identifiers.
    pub fn with_observation_ids(mut self, ids: Vec<u64>) -> Result<Self> {
        if ids.len() != self.config.observations {
            return Err(SmootherError::RecordCountMismatch {
                what: "observation identifiers",
                expected: self.config.observations,
                found: ids.len(),
            });
        }
        self.observation_ids = ids;
        Ok(self)
    }
    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }
    pub fn observation_ids(&self) -> &[u64] {
        &self.observation_ids
    }
    pub fn transition(&self) -> &TransitionModel {
        &self.transition
    }
    /// Run both passes with the resampling generator of the configured seed.
    ///
    /// Identical inputs and seed give identical tables.
    pub fn run(
        &self,
        prior: &FactorPopulation,
        shocks: &TransitionErrors,
    ) -> Result<EstimateTable> {
        let mut rng = resampling_rng(self.config.seed);
        self.run_with_rng(prior, shocks, &mut rng)
    }
    /// Run both passes drawing all randomness from `rng`.
    pub fn run_with_rng<R: Rng + ?Sized>(
        &self,
        prior: &FactorPopulation,
        shocks: &TransitionErrors,
        rng: &mut R,
    ) -> Result<EstimateTable> {
        info!(
            "Smoothing {} observations over {} periods with {} particles (factor setting {})",
            self.config.observations,
            self.config.periods,
            self.config.particles,
            self.transition.setting()
        );
        let forward = self.forward(prior, shocks, rng)?;
        let estimates = self.backward(&forward)?;
        info!("Smoothing finished");
        Ok(estimates)
    }
    /// Filter forward over all periods.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        prior: &FactorPopulation,
        shocks: &TransitionErrors,
        rng: &mut R,
    ) -> Result<ForwardPass> {
        self.check_inputs(prior, shocks)?;
        let periods = self.config.periods;
        let mut history = Vec::with_capacity(periods + 1);
        history.push(prior.clone());
        let mut last_propagated = prior.clone();
        let mut last_weights = DMatrix::<f64>::zeros(prior.observations(), prior.particles());

        for period in 1..=periods {
            let stage = Stage::Forward { period };
            let period_shocks = shocks.period(period).ok_or_else(|| {
                SmootherError::RecordCountMismatch {
                    what: "shock periods",
                    expected: periods,
                    found: shocks.periods(),
                }
                .at(stage, ModelKind::Transition)
            })?;
            let propagated = self
                .transition
                .next_state(&history[period - 1], period_shocks)
                .map_err(|e| e.at(stage, ModelKind::Transition))?;
            let weights = self.weights(&propagated, period)?;
            let counts = draw_counts(&weights, rng);
            let resampled = self
                .resampler
                .construct(&counts, &propagated)
                .map_err(|e| e.at(stage, ModelKind::Resampler))?;
            if log::log_enabled!(log::Level::Debug) {
                let ess = effective_sample_sizes(&weights);
                let min_ess = ess.iter().copied().fold(f64::INFINITY, f64::min);
                let mean_ess = ess.iter().sum::<f64>() / ess.len() as f64;
                debug!(
                    "Forward period {}: effective sample size mean {:.1}, min {:.1}",
                    period, mean_ess, min_ess
                );
            }
            history.push(resampled);
            last_propagated = propagated;
            last_weights = weights;
        }
        Ok(ForwardPass {
            history,
            last_propagated,
            last_weights,
        })
    }
    /// Select the most probable particle path backward from the last period.
    pub fn backward(&self, forward: &ForwardPass) -> Result<EstimateTable> {
        let periods = self.config.periods;
        let mut table = EstimateTable::new(self.observation_ids.clone(), periods);
        let mut estimate = most_probable_particles(&forward.last_weights, &forward.last_propagated);
        table.set_period(periods, estimate.clone())?;

        for period in (1..periods).rev() {
            let stage = Stage::Backward { period };
            let candidates = &forward.history[period];
            let probabilities = self
                .transition
                .marginal_probability(&estimate, candidates)
                .map_err(|e| e.at(stage, ModelKind::Transition))?;
            let unreachable = probabilities
                .row_iter()
                .filter(|row| row.iter().all(|&p| p == 0.0))
                .count();
            if unreachable > 0 {
                warn!(
                    "Backward period {}: {} observation(s) have no particle that can reach the next estimate; using particle 0",
                    period, unreachable
                );
            }
            estimate = most_probable_particles(&probabilities, candidates);
            table.set_period(period, estimate.clone())?;
            debug!("Backward period {} done", period);
        }
        Ok(table)
    }
    /// Normalized particle weights of a propagated population.
    fn weights(&self, propagated: &FactorPopulation, period: usize) -> Result<DMatrix<f64>> {
        let stage = Stage::Forward { period };
        let setting = self.transition.setting();
        let mut log_likelihood =
            DMatrix::<f64>::zeros(propagated.observations(), propagated.particles());
        for factor in 0..NUM_FACTOR_TYPES {
            if period > 1 && setting.is_constant(factor) {
                continue;
            }
            let likelihood = self.measurements[factor]
                .marginal_probability(propagated.slot(factor), period)
                .map_err(|e| e.at(stage, ModelKind::Measurement { factor }))?;
            log_likelihood += likelihood.map(f64::ln);
        }
        normalize_log_weights(log_likelihood).map_err(|e| e.at(stage, ModelKind::Weighting))
    }
    fn check_inputs(&self, prior: &FactorPopulation, shocks: &TransitionErrors) -> Result<()> {
        let expected = (self.config.observations, self.config.particles);
        let found = (prior.observations(), prior.particles());
        if found != expected {
            return Err(SmootherError::ShapeMismatch {
                what: "prior population",
                expected,
                found,
            });
        }
        let found = (shocks.observations(), shocks.particles());
        if found != expected {
            return Err(SmootherError::ShapeMismatch {
                what: "transition shocks",
                expected,
                found,
            });
        }
        if shocks.periods() < self.config.periods {
            return Err(SmootherError::RecordCountMismatch {
                what: "shock periods",
                expected: self.config.periods,
                found: shocks.periods(),
            });
        }
        Ok(())
    }
}

/// Turn per-particle log-likelihoods into weights that sum to one per observation.
///
/// The row maximum is subtracted before exponentiating so that very small likelihoods do not
/// underflow to zero together.
pub fn normalize_log_weights(mut log_weights: DMatrix<f64>) -> Result<DMatrix<f64>> {
    for i in 0..log_weights.nrows() {
        let mut row = log_weights.row_mut(i);
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() || row.iter().any(|v| v.is_nan()) {
            return Err(SmootherError::DegenerateWeights { observation: i });
        }
        row.apply(|v| *v = (*v - max).exp());
        let sum: f64 = row.iter().sum();
        row /= sum;
    }
    Ok(log_weights)
}
