//! Inputs and outputs around a smoothing run.
//!
//! This module draws the random inputs of the smoother (prior particle populations and transition
//! shocks), persists them as long-format CSV files so that a run can be repeated from disk, and
//! compares smoothed estimates with the true factors of a simulated data set.
//!
//! Two kinds of prior are supported:
//! - [`degenerate_prior`]: every particle of an observation starts at the observation's true
//!   factor values of period 1. Useful to isolate the effect of the filter from the prior.
//! - [`draw_prior`]: particles are the Cartesian product of joint draws of the non-constant
//!   factor types and independent draws of the constant factor types.
//!
//! [`run_from_config`] ties everything together for a configured run.
use crate::config::{PriorSource, RunConfig};
use crate::measurements::{MeasurementModel, MeasurementTable};
use crate::smoother::{EstimateTable, ParticleSmoother};
use crate::transition::{TransitionErrors, TransitionModel};
use crate::{FactorPopulation, FactorSetting, NUM_FACTOR_TYPES, Result, SmootherError};

use log::info;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs::File;
use std::path::Path;

/// Normal prior of one factor type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorParameters {
    /// Prior mean
    #[serde(default)]
    pub mean: f64,
    /// Prior variance
    pub var_p: f64,
}
impl Display for PriorParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N({}, {})", self.mean, self.var_p)
    }
}
impl PriorParameters {
    pub fn validate(&self) -> Result<()> {
        if !self.mean.is_finite() {
            return Err(SmootherError::InvalidParameter {
                name: "mean",
                value: self.mean,
                reason: "must be finite",
            });
        }
        if !(self.var_p.is_finite() && self.var_p >= 0.0) {
            return Err(SmootherError::InvalidParameter {
                name: "var_p",
                value: self.var_p,
                reason: "must be a finite non-negative variance",
            });
        }
        Ok(())
    }
    fn distribution(&self) -> Result<Normal<f64>> {
        self.validate()?;
        Normal::new(self.mean, self.var_p.sqrt()).map_err(|_| SmootherError::InvalidParameter {
            name: "var_p",
            value: self.var_p,
            reason: "must be a finite non-negative variance",
        })
    }
}

/// Prior in which every particle equals the observation's true factors of period 1.
///
/// The observations of the returned population follow the order of `truth.observations()`.
pub fn degenerate_prior(truth: &EstimateTable, particles: usize) -> Result<FactorPopulation> {
    let first = truth.period(1).ok_or(SmootherError::RecordCountMismatch {
        what: "periods in the true factor table",
        expected: 1,
        found: 0,
    })?;
    Ok(FactorPopulation::from_fn(
        first.ncols(),
        particles,
        |factor, i, _| first[(factor, i)],
    ))
}

/// Draw a prior population from independent normal priors.
///
/// For every observation, `draws_varying` draws of the non-constant factor types are combined with
/// each of `draws_constant` draws of the constant factor types. Particle `v * draws_constant + c`
/// holds varying draw `v` and constant draw `c`, so the population has
/// `draws_varying * draws_constant` particles.
///
/// # Arguments
/// * `priors` - one prior per factor type
/// * `setting` - which factor types are constant
/// * `observations` - number of observations
/// * `draws_varying` - draws of the non-constant factor types per observation
/// * `draws_constant` - draws of the constant factor types per observation
/// * `rng` - random number generator
pub fn draw_prior<R: Rng + ?Sized>(
    priors: &[PriorParameters],
    setting: &FactorSetting,
    observations: usize,
    draws_varying: usize,
    draws_constant: usize,
    rng: &mut R,
) -> Result<FactorPopulation> {
    if priors.len() != NUM_FACTOR_TYPES {
        return Err(SmootherError::FactorSettingMismatch {
            what: "prior distributions",
            expected: NUM_FACTOR_TYPES,
            found: priors.len(),
        });
    }
    let distributions = priors
        .iter()
        .map(PriorParameters::distribution)
        .collect::<Result<Vec<_>>>()?;
    let varying = setting.non_constant_slots();
    let constant = setting.constant_slots();
    let particles = draws_varying * draws_constant;

    let mut population = FactorPopulation::filled(observations, particles, 0.0);
    for i in 0..observations {
        let varying_draws: Vec<Vec<f64>> = (0..draws_varying)
            .map(|_| varying.iter().map(|&f| distributions[f].sample(&mut *rng)).collect())
            .collect();
        let constant_draws: Vec<Vec<f64>> = (0..draws_constant)
            .map(|_| constant.iter().map(|&f| distributions[f].sample(&mut *rng)).collect())
            .collect();
        for (v, varying_values) in varying_draws.iter().enumerate() {
            for (c, constant_values) in constant_draws.iter().enumerate() {
                let j = v * draws_constant + c;
                for (&factor, &value) in varying.iter().zip(varying_values) {
                    population.slot_mut(factor)[(i, j)] = value;
                }
                for (&factor, &value) in constant.iter().zip(constant_values) {
                    population.slot_mut(factor)[(i, j)] = value;
                }
            }
        }
    }
    Ok(population)
}

/// Standard normal transition shocks for `non_constant` factor types.
pub fn draw_transition_errors<R: Rng + ?Sized>(
    non_constant: usize,
    observations: usize,
    periods: usize,
    particles: usize,
    rng: &mut R,
) -> Result<TransitionErrors> {
    let shocks = (0..periods)
        .map(|_| {
            (0..non_constant)
                .map(|_| {
                    DMatrix::from_fn(observations, particles, |_, _| -> f64 {
                        StandardNormal.sample(&mut *rng)
                    })
                })
                .collect()
        })
        .collect();
    let errors = TransitionErrors::from_periods(shocks)?;
    if errors.observations() == 0 && observations > 0 {
        // no slices to infer the shape from
        return Ok(TransitionErrors::zeros(
            non_constant,
            observations,
            periods,
            particles,
        ));
    }
    Ok(errors)
}

fn write_records<T: Serialize, P: AsRef<Path>>(records: &[T], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_records<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>> {
    let file = File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result?;
        records.push(record);
    }
    Ok(records)
}

/// Marks each cell of a dense array as filled, rejecting duplicates.
fn claim(
    seen: &mut [bool],
    key: usize,
    index: usize,
    describe: impl FnOnce() -> String,
) -> Result<()> {
    if seen[key] {
        return Err(SmootherError::InvalidRecord {
            // header is line 1
            line: index as u64 + 2,
            reason: format!("duplicate entry for {}", describe()),
        });
    }
    seen[key] = true;
    Ok(())
}

/// One particle of a population in long format. Indices are 0-based.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PopulationRecord {
    pub observation: usize,
    pub particle: usize,
    pub fac1: f64,
    pub fac2: f64,
    pub fac3: f64,
}
impl PopulationRecord {
    pub fn from_population(population: &FactorPopulation) -> Vec<Self> {
        let mut records = Vec::with_capacity(population.observations() * population.particles());
        for observation in 0..population.observations() {
            for particle in 0..population.particles() {
                let values = population.particle(observation, particle);
                records.push(PopulationRecord {
                    observation,
                    particle,
                    fac1: values[0],
                    fac2: values[1],
                    fac3: values[2],
                });
            }
        }
        records
    }
    /// Rebuild a population. The shape is taken from the largest indices and every cell must be
    /// present exactly once.
    pub fn to_population(records: &[Self]) -> Result<FactorPopulation> {
        let observations = records.iter().map(|r| r.observation + 1).max().unwrap_or(0);
        let particles = records.iter().map(|r| r.particle + 1).max().unwrap_or(0);
        if records.len() != observations * particles {
            return Err(SmootherError::RecordCountMismatch {
                what: "population rows (observations x particles)",
                expected: observations * particles,
                found: records.len(),
            });
        }
        let mut population = FactorPopulation::filled(observations, particles, 0.0);
        let mut seen = vec![false; observations * particles];
        for (index, r) in records.iter().enumerate() {
            claim(&mut seen, r.observation * particles + r.particle, index, || {
                format!("observation {}, particle {}", r.observation, r.particle)
            })?;
            population.slot_mut(0)[(r.observation, r.particle)] = r.fac1;
            population.slot_mut(1)[(r.observation, r.particle)] = r.fac2;
            population.slot_mut(2)[(r.observation, r.particle)] = r.fac3;
        }
        Ok(population)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        write_records(records, path)
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        read_records(path)
    }
}

/// Write a particle population as CSV.
pub fn write_population<P: AsRef<Path>>(population: &FactorPopulation, path: P) -> Result<()> {
    PopulationRecord::to_csv(&PopulationRecord::from_population(population), path)
}

/// Read a particle population written by [`write_population`].
pub fn read_population<P: AsRef<Path>>(path: P) -> Result<FactorPopulation> {
    PopulationRecord::to_population(&PopulationRecord::from_csv(path)?)
}

/// One transition shock in long format. `slot` indexes the non-constant factor types (0-based),
/// `period` starts at 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShockRecord {
    pub slot: usize,
    pub observation: usize,
    pub period: usize,
    pub particle: usize,
    pub value: f64,
}
impl ShockRecord {
    pub fn from_errors(errors: &TransitionErrors) -> Vec<Self> {
        let mut records = Vec::new();
        for slot in 0..errors.non_constant() {
            for observation in 0..errors.observations() {
                for period in 1..=errors.periods() {
                    for particle in 0..errors.particles() {
                        records.push(ShockRecord {
                            slot,
                            observation,
                            period,
                            particle,
                            value: errors.get(slot, observation, period, particle),
                        });
                    }
                }
            }
        }
        records
    }
    pub fn to_errors(records: &[Self]) -> Result<TransitionErrors> {
        if records.iter().any(|r| r.period == 0) {
            return Err(SmootherError::InvalidRecord {
                line: 0,
                reason: "shock periods start at 1".to_string(),
            });
        }
        let slots = records.iter().map(|r| r.slot + 1).max().unwrap_or(0);
        let observations = records.iter().map(|r| r.observation + 1).max().unwrap_or(0);
        let periods = records.iter().map(|r| r.period).max().unwrap_or(0);
        let particles = records.iter().map(|r| r.particle + 1).max().unwrap_or(0);
        let cells = slots * observations * periods * particles;
        if records.len() != cells {
            return Err(SmootherError::RecordCountMismatch {
                what: "shock rows (slots x observations x periods x particles)",
                expected: cells,
                found: records.len(),
            });
        }
        let mut errors = TransitionErrors::zeros(slots, observations, periods, particles);
        let mut seen = vec![false; cells];
        for (index, r) in records.iter().enumerate() {
            let key = ((r.slot * observations + r.observation) * periods + r.period - 1)
                * particles
                + r.particle;
            claim(&mut seen, key, index, || {
                format!(
                    "slot {}, observation {}, period {}, particle {}",
                    r.slot, r.observation, r.period, r.particle
                )
            })?;
            errors.set(r.slot, r.observation, r.period, r.particle, r.value);
        }
        Ok(errors)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        write_records(records, path)
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        read_records(path)
    }
}

/// Write transition shocks as CSV.
pub fn write_shocks<P: AsRef<Path>>(errors: &TransitionErrors, path: P) -> Result<()> {
    ShockRecord::to_csv(&ShockRecord::from_errors(errors), path)
}

/// Read transition shocks written by [`write_shocks`].
pub fn read_shocks<P: AsRef<Path>>(path: P) -> Result<TransitionErrors> {
    ShockRecord::to_errors(&ShockRecord::from_csv(path)?)
}

/// Estimation error statistics of one factor type in one period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummaryRecord {
    pub period: usize,
    /// Column name of the factor type (`fac1`, `fac2`, `fac3`)
    pub factor: String,
    /// Number of observations compared
    pub observations: usize,
    /// Mean of estimate minus truth
    pub bias: f64,
    /// Population standard deviation of estimate minus truth
    pub std_dev: f64,
    /// Root mean squared error
    pub rmse: f64,
}
impl ErrorSummaryRecord {
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        write_records(records, path)
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        read_records(path)
    }
}

/// Compare smoothed estimates with true factors.
///
/// Statistics are computed per period and factor type over the observations that appear in both
/// tables, for the periods both tables cover.
pub fn summarize_errors(
    estimates: &EstimateTable,
    truth: &EstimateTable,
) -> Result<Vec<ErrorSummaryRecord>> {
    let pairs: Vec<(usize, usize)> = estimates
        .observations()
        .iter()
        .enumerate()
        .filter_map(|(i, id)| {
            truth
                .observations()
                .iter()
                .position(|t| t == id)
                .map(|k| (i, k))
        })
        .collect();
    if pairs.is_empty() {
        return Err(SmootherError::RecordCountMismatch {
            what: "observations shared by estimates and true factors",
            expected: estimates.observations().len(),
            found: 0,
        });
    }
    let periods = estimates.periods().min(truth.periods());
    let n = pairs.len() as f64;
    let mut summary = Vec::with_capacity(periods * NUM_FACTOR_TYPES);
    for period in 1..=periods {
        let (Some(est), Some(tru)) = (estimates.period(period), truth.period(period)) else {
            continue;
        };
        for factor in 0..NUM_FACTOR_TYPES {
            let diffs: Vec<f64> = pairs
                .iter()
                .map(|&(i, k)| est[(factor, i)] - tru[(factor, k)])
                .collect();
            let bias = diffs.iter().sum::<f64>() / n;
            let variance = diffs.iter().map(|d| (d - bias).powi(2)).sum::<f64>() / n;
            let mean_square = diffs.iter().map(|d| d * d).sum::<f64>() / n;
            summary.push(ErrorSummaryRecord {
                period,
                factor: format!("fac{}", factor + 1),
                observations: pairs.len(),
                bias,
                std_dev: variance.sqrt(),
                rmse: mean_square.sqrt(),
            });
        }
    }
    Ok(summary)
}

/// Prior population as configured. `truth` is needed for the degenerate prior.
pub fn prepare_prior<R: Rng + ?Sized>(
    config: &RunConfig,
    truth: Option<&EstimateTable>,
    rng: &mut R,
) -> Result<FactorPopulation> {
    match &config.prior {
        PriorSource::File { path } => {
            info!("Reading prior from {}", path.display());
            read_population(path)
        }
        PriorSource::Degenerate => {
            let truth = truth.ok_or_else(|| {
                SmootherError::Config("a degenerate prior needs `data.true_factors`".to_string())
            })?;
            info!("Using the true factors of period 1 as a degenerate prior");
            degenerate_prior(truth, config.smoother.particles)
        }
        PriorSource::Drawn {
            draws_varying,
            draws_constant,
            priors,
        } => {
            info!(
                "Drawing prior: {} varying x {} constant draws per observation",
                draws_varying, draws_constant
            );
            draw_prior(
                priors,
                &config.factor_setting,
                config.smoother.observations,
                *draws_varying,
                *draws_constant,
                rng,
            )
        }
    }
}

/// Transition shocks as configured: read from `data.shocks` or drawn from `rng`.
pub fn prepare_shocks<R: Rng + ?Sized>(
    config: &RunConfig,
    rng: &mut R,
) -> Result<TransitionErrors> {
    let smoother = &config.smoother;
    match &config.data.shocks {
        Some(path) => {
            info!("Reading transition shocks from {}", path.display());
            let shocks = read_shocks(path)?;
            if shocks.non_constant() == 0 && config.factor_setting.non_constant_count() == 0 {
                // no rows are written without non-constant factor types
                return Ok(TransitionErrors::zeros(
                    0,
                    smoother.observations,
                    smoother.periods,
                    smoother.particles,
                ));
            }
            Ok(shocks)
        }
        None => {
            info!("Drawing transition shocks");
            draw_transition_errors(
                config.factor_setting.non_constant_count(),
                smoother.observations,
                smoother.periods,
                smoother.particles,
                rng,
            )
        }
    }
}

/// Read the true factor table if one is configured.
pub fn load_truth(config: &RunConfig) -> Result<Option<EstimateTable>> {
    config
        .data
        .true_factors
        .as_ref()
        .map(|path| {
            info!("Reading true factors from {}", path.display());
            EstimateTable::from_csv(path)
        })
        .transpose()
}

/// Random inputs of a configured run, drawn from a generator seeded with the configured seed.
///
/// The prior is drawn before the shocks, so a run that reads back the files written from these
/// inputs reproduces a run that draws them.
pub fn prepare_inputs(
    config: &RunConfig,
    truth: Option<&EstimateTable>,
) -> Result<(FactorPopulation, TransitionErrors)> {
    let mut rng = StdRng::seed_from_u64(config.smoother.seed);
    let prior = prepare_prior(config, truth, &mut rng)?;
    let shocks = prepare_shocks(config, &mut rng)?;
    Ok((prior, shocks))
}

/// Build the smoother of a configuration, reading its measurement tables.
pub fn build_smoother(config: &RunConfig) -> Result<ParticleSmoother> {
    config.validate()?;
    let transition = TransitionModel::new(config.transitions.clone(), config.factor_setting)?;
    let mut observation_ids: Option<Vec<u64>> = None;
    let mut models = Vec::with_capacity(NUM_FACTOR_TYPES);
    for (factor, path) in config.data.measurement_tables.iter().enumerate() {
        info!("Reading measurements of factor type {} from {}", factor, path.display());
        let table = MeasurementTable::from_csv(path)?;
        let ids = table.observations();
        match &observation_ids {
            Some(first) if *first != ids => {
                return Err(SmootherError::Config(format!(
                    "measurement table {} covers different observations than the first table",
                    path.display()
                )));
            }
            Some(_) => {}
            None => observation_ids = Some(ids),
        }
        models.push(MeasurementModel::new(&config.measurements_of(factor), &table)?);
    }
    let measurements: [MeasurementModel; NUM_FACTOR_TYPES] =
        models.try_into().map_err(|rejected: Vec<MeasurementModel>| {
            SmootherError::FactorSettingMismatch {
                what: "measurement tables",
                expected: NUM_FACTOR_TYPES,
                found: rejected.len(),
            }
        })?;
    let smoother = ParticleSmoother::new(config.smoother.clone(), transition, measurements)?;
    smoother.with_observation_ids(observation_ids.unwrap_or_default())
}

/// Run a configured smoothing job end to end.
///
/// Writes the estimates to `data.estimates` and, when true factors and `data.summary` are both
/// configured, the error summary to `data.summary`.
pub fn run_from_config(config: &RunConfig) -> Result<EstimateTable> {
    let smoother = build_smoother(config)?;
    let truth = load_truth(config)?;
    if let (PriorSource::Degenerate, Some(truth)) = (&config.prior, &truth) {
        if truth.observations() != smoother.observation_ids() {
            return Err(SmootherError::Config(
                "true factors and measurement tables cover different observations".to_string(),
            ));
        }
    }
    let (prior, shocks) = prepare_inputs(config, truth.as_ref())?;
    let estimates = smoother.run(&prior, &shocks)?;

    ensure_parent(&config.data.estimates)?;
    estimates.to_csv(&config.data.estimates)?;
    info!("Estimates written to {}", config.data.estimates.display());

    if let (Some(truth), Some(path)) = (&truth, &config.data.summary) {
        let summary = summarize_errors(&estimates, truth)?;
        ensure_parent(path)?;
        ErrorSummaryRecord::to_csv(&summary, path)?;
        info!("Error summary written to {}", path.display());
    }
    Ok(estimates)
}

/// Create the parent directory of an output file.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn table(ids: Vec<u64>, periods: &[&[f64]]) -> EstimateTable {
        let n = ids.len();
        let mut table = EstimateTable::new(ids, periods.len());
        for (p, values) in periods.iter().enumerate() {
            table
                .set_period(p + 1, DMatrix::from_row_slice(3, n, values))
                .unwrap();
        }
        table
    }

    #[test]
    fn degenerate_prior_repeats_first_period() {
        let truth = table(
            vec![1, 2],
            &[&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0]],
        );
        let prior = degenerate_prior(&truth, 4).unwrap();
        assert_eq!(prior.observations(), 2);
        assert_eq!(prior.particles(), 4);
        for j in 0..4 {
            assert_eq!(prior.particle(0, j), nalgebra::Vector3::new(1.0, 3.0, 5.0));
            assert_eq!(prior.particle(1, j), nalgebra::Vector3::new(2.0, 4.0, 6.0));
        }
    }
    #[test]
    fn degenerate_prior_needs_a_period() {
        let truth = EstimateTable::new(vec![1], 0);
        assert!(degenerate_prior(&truth, 3).is_err());
    }
    #[test]
    fn drawn_prior_is_cartesian_product() {
        let priors = vec![
            PriorParameters { mean: 1.0, var_p: 0.5 },
            PriorParameters { mean: 2.0, var_p: 0.5 },
            PriorParameters { mean: 3.0, var_p: 0.5 },
        ];
        let setting = FactorSetting::default();
        let mut rng = StdRng::seed_from_u64(5);
        let prior = draw_prior(&priors, &setting, 3, 4, 2, &mut rng).unwrap();
        assert_eq!(prior.particles(), 8);
        for i in 0..3 {
            for v in 0..4 {
                // constant draws cycle within each varying draw
                assert_eq!(prior.slot(0)[(i, 2 * v)], prior.slot(0)[(i, 2 * v + 1)]);
                assert_eq!(prior.slot(1)[(i, 2 * v)], prior.slot(1)[(i, 2 * v + 1)]);
                assert_eq!(prior.slot(2)[(i, 2 * v)], prior.slot(2)[(i, 0)]);
                assert_eq!(prior.slot(2)[(i, 2 * v + 1)], prior.slot(2)[(i, 1)]);
            }
        }
    }
    #[test]
    fn drawn_prior_with_zero_variance_is_the_mean() {
        let priors = vec![
            PriorParameters { mean: 1.5, var_p: 0.0 },
            PriorParameters { mean: 2.5, var_p: 0.0 },
            PriorParameters { mean: 3.5, var_p: 0.0 },
        ];
        let mut rng = StdRng::seed_from_u64(5);
        let prior = draw_prior(&priors, &FactorSetting::default(), 2, 2, 2, &mut rng).unwrap();
        assert!(prior.slot(0).iter().all(|&v| v == 1.5));
        assert!(prior.slot(2).iter().all(|&v| v == 3.5));
    }
    #[test]
    fn drawn_prior_rejects_bad_inputs() {
        let mut rng = StdRng::seed_from_u64(5);
        let two = vec![PriorParameters { mean: 0.0, var_p: 1.0 }; 2];
        assert!(draw_prior(&two, &FactorSetting::default(), 1, 1, 1, &mut rng).is_err());
        let negative = vec![PriorParameters { mean: 0.0, var_p: -1.0 }; 3];
        assert!(draw_prior(&negative, &FactorSetting::default(), 1, 1, 1, &mut rng).is_err());
    }
    #[test]
    fn transition_errors_are_standard_normal() {
        let mut rng = StdRng::seed_from_u64(8);
        let errors = draw_transition_errors(2, 50, 3, 40, &mut rng).unwrap();
        assert_eq!(errors.non_constant(), 2);
        assert_eq!(errors.observations(), 50);
        assert_eq!(errors.periods(), 3);
        assert_eq!(errors.particles(), 40);
        let values: Vec<f64> = errors.period(2).unwrap()[1].iter().copied().collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        assert!(mean.abs() < 0.1);
        assert!((var - 1.0).abs() < 0.15);
    }
    #[test]
    fn transition_errors_without_slices_keep_shape() {
        let mut rng = StdRng::seed_from_u64(8);
        let errors = draw_transition_errors(0, 4, 2, 3, &mut rng).unwrap();
        assert_eq!(errors.observations(), 4);
        assert_eq!(errors.periods(), 2);
        assert_eq!(errors.non_constant(), 0);
    }
    #[test]
    fn population_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prior.csv");
        let population =
            FactorPopulation::from_fn(3, 4, |f, i, j| 0.5 + f as f64 + 0.1 * i as f64 + 0.01 * j as f64);
        write_population(&population, &path).unwrap();
        assert_eq!(read_population(&path).unwrap(), population);
    }
    #[test]
    fn population_records_must_be_complete() {
        let mut records = PopulationRecord::from_population(&FactorPopulation::filled(2, 2, 1.0));
        records.pop();
        assert!(matches!(
            PopulationRecord::to_population(&records),
            Err(SmootherError::RecordCountMismatch {
                expected: 4,
                found: 3,
                ..
            })
        ));
        let mut records = PopulationRecord::from_population(&FactorPopulation::filled(2, 2, 1.0));
        records[3].particle = 0;
        records[3].observation = 0;
        records.push(records[3].clone());
        records.remove(0);
        assert!(PopulationRecord::to_population(&records).is_err());
    }
    #[test]
    fn shock_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shocks.csv");
        let mut rng = StdRng::seed_from_u64(21);
        let errors = draw_transition_errors(2, 3, 2, 5, &mut rng).unwrap();
        write_shocks(&errors, &path).unwrap();
        let loaded = read_shocks(&path).unwrap();
        assert_eq!(loaded.non_constant(), 2);
        for slot in 0..2 {
            for i in 0..3 {
                for t in 1..=2 {
                    for j in 0..5 {
                        assert_approx_eq!(loaded.get(slot, i, t, j), errors.get(slot, i, t, j));
                    }
                }
            }
        }
    }
    #[test]
    fn shock_records_reject_period_zero() {
        let records = vec![ShockRecord {
            slot: 0,
            observation: 0,
            period: 0,
            particle: 0,
            value: 1.0,
        }];
        assert!(ShockRecord::to_errors(&records).is_err());
    }
    #[test]
    fn error_summary_statistics() {
        // errors of fac1 in period 1 are 1 and 3
        let truth = table(vec![1, 2], &[&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]]);
        let estimates = table(vec![1, 2], &[&[2.0, 4.0, 2.0, 2.0, 3.0, 3.0]]);
        let summary = summarize_errors(&estimates, &truth).unwrap();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].factor, "fac1");
        assert_eq!(summary[0].observations, 2);
        assert_approx_eq!(summary[0].bias, 2.0);
        assert_approx_eq!(summary[0].std_dev, 1.0);
        assert_approx_eq!(summary[0].rmse, 5.0f64.sqrt());
        assert_approx_eq!(summary[1].rmse, 0.0);
    }
    #[test]
    fn error_summary_matches_observations_by_id() {
        let truth = table(vec![7, 3], &[&[1.0, 10.0, 1.0, 10.0, 1.0, 10.0]]);
        let estimates = table(vec![3], &[&[10.5, 10.0, 10.0]]);
        let summary = summarize_errors(&estimates, &truth).unwrap();
        assert_eq!(summary[0].observations, 1);
        assert_approx_eq!(summary[0].bias, 0.5);
        let disjoint = table(vec![99], &[&[1.0, 1.0, 1.0]]);
        assert!(matches!(
            summarize_errors(&disjoint, &truth),
            Err(SmootherError::RecordCountMismatch { found: 0, .. })
        ));
    }
    #[test]
    fn error_summary_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let truth = table(vec![1, 2], &[&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]]);
        let summary = summarize_errors(&truth, &truth).unwrap();
        ErrorSummaryRecord::to_csv(&summary, &path).unwrap();
        assert_eq!(ErrorSummaryRecord::from_csv(&path).unwrap(), summary);
    }
}
