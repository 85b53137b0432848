//! Particle resampling and selection.
//!
//! Resampling is split in two steps. First, [`multinomial_counts`] draws, for one observation, how
//! often each particle index is selected when sampling the particle count with replacement
//! according to the normalized weights. Second, [`ParticleResampler::construct`] copies every old
//! particle as many times as it was drawn into the new population.
//!
//! The backward pass of the smoother does not resample. It picks the single most probable particle
//! of every observation with [`most_probable_indices`].
use crate::{FactorPopulation, NUM_FACTOR_TYPES, Result, SmootherError};

use nalgebra::{DMatrix, DVector, RowDVector};
use rand::Rng;
use rand_distr::{Binomial, Distribution};

/// Out-of-domain marker for slots of a new population that received no particle.
pub const UNFILLED_SENTINEL: f64 = 5.0;

/// Reconstructs a particle population from multinomial draw counts.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParticleResampler;

impl ParticleResampler {
    /// Build the resampled population.
    ///
    /// # Arguments
    /// * `draw_counts` - `obs × particles`; entry `(i, j)` is how often old particle `j` of
    ///   observation `i` was drawn
    /// * `old_particles` - the population that was sampled from
    ///
    /// # Returns
    /// A population of the same shape where, per observation, old particle `j` occupies
    /// `draw_counts[(i, j)]` consecutive slots, in ascending order of `j`.
    pub fn construct(
        &self,
        draw_counts: &DMatrix<usize>,
        old_particles: &FactorPopulation,
    ) -> Result<FactorPopulation> {
        let observations = old_particles.observations();
        let particles = old_particles.particles();
        if draw_counts.shape() != (observations, particles) {
            return Err(SmootherError::ShapeMismatch {
                what: "draw counts",
                expected: (observations, particles),
                found: draw_counts.shape(),
            });
        }
        let mut new_particles =
            FactorPopulation::filled(observations, particles, UNFILLED_SENTINEL);
        for i in 0..observations {
            let total: usize = draw_counts.row(i).iter().sum();
            if total != particles {
                return Err(SmootherError::DrawCountMismatch {
                    observation: i,
                    expected: particles,
                    found: total,
                });
            }
            let mut slot = 0;
            for j in 0..particles {
                for _ in 0..draw_counts[(i, j)] {
                    for factor in 0..NUM_FACTOR_TYPES {
                        new_particles.slot_mut(factor)[(i, slot)] =
                            old_particles.slot(factor)[(i, j)];
                    }
                    slot += 1;
                }
            }
        }
        Ok(new_particles)
    }
}

/// Draw `draws` samples with replacement from the categorical distribution `weights`.
///
/// Uses sequential conditional binomial draws: category `j` receives
/// `Binomial(remaining draws, w_j / remaining mass)` samples and the last category receives the
/// rest, so the counts always sum to `draws`. `weights` must be non-negative with a positive sum;
/// it does not need to be normalized.
pub fn multinomial_counts<R: Rng + ?Sized>(
    draws: usize,
    weights: &[f64],
    rng: &mut R,
) -> Vec<usize> {
    let mut counts = vec![0usize; weights.len()];
    let mut remaining_draws = draws as u64;
    let mut remaining_mass: f64 = weights.iter().sum();
    let last = weights.len().saturating_sub(1);
    for (j, &w) in weights.iter().enumerate() {
        if remaining_draws == 0 {
            break;
        }
        if j == last {
            counts[j] = remaining_draws as usize;
            break;
        }
        let p = if remaining_mass > 0.0 {
            (w / remaining_mass).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let drawn = match Binomial::new(remaining_draws, p) {
            Ok(binomial) => binomial.sample(rng),
            Err(_) => 0,
        };
        counts[j] = drawn as usize;
        remaining_draws -= drawn;
        remaining_mass -= w;
    }
    counts
}

/// Multinomial draw counts for every observation (row) of a weight matrix.
pub fn draw_counts<R: Rng + ?Sized>(weights: &DMatrix<f64>, rng: &mut R) -> DMatrix<usize> {
    let (observations, particles) = weights.shape();
    let mut counts = DMatrix::<usize>::zeros(observations, particles);
    for i in 0..observations {
        let row: Vec<f64> = weights.row(i).iter().copied().collect();
        let drawn = multinomial_counts(particles, &row, rng);
        counts.set_row(i, &RowDVector::from_vec(drawn));
    }
    counts
}

/// Per-observation index of the largest weight. The first index wins ties.
pub fn most_probable_indices(weights: &DMatrix<f64>) -> Vec<usize> {
    (0..weights.nrows())
        .map(|i| {
            let mut best = 0;
            for j in 1..weights.ncols() {
                if weights[(i, j)] > weights[(i, best)] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// The most probable particle of every observation as a `3 × obs` matrix.
pub fn most_probable_particles(
    weights: &DMatrix<f64>,
    particles: &FactorPopulation,
) -> DMatrix<f64> {
    let indices = most_probable_indices(weights);
    let mut selected = DMatrix::<f64>::zeros(NUM_FACTOR_TYPES, indices.len());
    for (i, &j) in indices.iter().enumerate() {
        let particle: DVector<f64> = DVector::from_column_slice(particles.particle(i, j).as_slice());
        selected.set_column(i, &particle);
    }
    selected
}

/// Effective sample size of each observation's normalized weights.
pub fn effective_sample_sizes(weights: &DMatrix<f64>) -> Vec<f64> {
    weights
        .row_iter()
        .map(|row| {
            let sum_of_squares: f64 = row.iter().map(|w| w * w).sum();
            if sum_of_squares > 0.0 {
                1.0 / sum_of_squares
            } else {
                0.0
            }
        })
        .collect()
}
