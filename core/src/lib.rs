//! Particle smoothing of latent factor trajectories
//!
//! This crate estimates the unobserved trajectories of three latent "factors" from noisy panel
//! measurements. Many independent observation units (subjects) are followed over several periods.
//! In every period each subject contributes a set of noisy proxies for each factor, and the
//! factors evolve according to a nonlinear CES-style law of motion with additive Gaussian shocks.
//! The estimator is a bootstrap particle filter followed by a backward pass that selects, period
//! by period, the most probable predecessor particle. The result is a point estimate of each
//! subject's factor path which can then be compared with the true factors to assess bias.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): matrices for particle populations and weights.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   seeded random number generation for multinomial resampling and for drawing priors and shocks.
//!
//! All other functionality (CSV tables, configuration files, the command line tool) is auxiliary.
//!
//! ## Crate overview
//!
//! - [transition]: the law of motion and the backward transition likelihood.
//! - [measurements]: linear-in-controls measurement equations and their likelihood.
//! - [particle]: multinomial draws, particle reconstruction and most-probable-particle selection.
//! - [smoother]: the forward/backward smoothing engine and the estimate table.
//! - [config]: run configuration files (JSON/YAML/TOML).
//! - [sim]: prior and shock generation, CSV persistence of arrays, and error summaries.
//! - [errors]: the crate-wide error type.
//!
//! ## State definition
//!
//! Each particle holds one value for each of the three factor types:
//!
//! $$
//! x = [a_1, a_2, a_3]
//! $$
//!
//! A factor type is either *non-constant* (it evolves with the transition equation) or *constant*
//! (it keeps its initial value over the whole horizon). The classification is given by a
//! [`FactorSetting`]; the standard configuration is `[1, 1, 0]`, two evolving factors and one
//! fixed factor.
//!
//! ## Transition equation
//!
//! For a non-constant factor type $i$ with coefficients $(\phi, \lambda, \gamma_1, \gamma_2,
//! \gamma_3, \sigma^2_u)$ the next state is
//!
//! $$
//! a_i' = \frac{1}{\phi\lambda} \log\left( \gamma_1 a_1^{\phi\lambda} + \gamma_2 a_2^{\phi} + \gamma_3 a_3^{\phi} \right) + \sigma_u \varepsilon
//! $$
//!
//! with $\varepsilon$ a standard normal shock. All factor values entering the equation must be
//! strictly positive.
//!
//! ## Measurement equations
//!
//! Each factor type has one or more measurement equations
//!
//! $$
//! y = \beta_1 c_1 + \beta_2 c_2 + z a + \eta, \quad \eta \sim N(0, \sigma^2)
//! $$
//!
//! where $c_1$ and $c_2$ are observed controls. Equations of one factor are conditionally
//! independent given the factor, so their densities multiply.
pub mod config;
pub mod errors;
pub mod measurements;
pub mod particle;
pub mod sim;
pub mod smoother;
pub mod transition;

pub use errors::{ModelKind, Result, SmootherError, Stage};

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt::{self, Display};

/// Number of factor types tracked by the model.
pub const NUM_FACTOR_TYPES: usize = 3;

/// Zero-mean normal density with the given variance evaluated at `x`.
pub fn gaussian_density(x: f64, variance: f64) -> f64 {
    (-x * x / (2.0 * variance)).exp() / (2.0 * std::f64::consts::PI * variance).sqrt()
}

/// Classification of the three factor types into non-constant and constant slots.
///
/// Serialized as a list of three binaries where `1` marks a non-constant factor type:
///
/// ```
/// use factor_smoother::FactorSetting;
///
/// let setting: FactorSetting = serde_json::from_str("[1, 1, 0]").unwrap();
/// assert_eq!(setting.non_constant_slots(), vec![0, 1]);
/// assert!(setting.is_constant(2));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct FactorSetting {
    non_constant: [bool; NUM_FACTOR_TYPES],
}
impl Default for FactorSetting {
    fn default() -> Self {
        FactorSetting::new([true, true, false])
    }
}
impl Display for FactorSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags: Vec<u8> = (*self).into();
        write!(f, "{:?}", flags)
    }
}
impl FactorSetting {
    pub fn new(non_constant: [bool; NUM_FACTOR_TYPES]) -> Self {
        FactorSetting { non_constant }
    }
    pub fn is_constant(&self, factor: usize) -> bool {
        !self.non_constant[factor]
    }
    /// Indices of the non-constant factor types in ascending order.
    pub fn non_constant_slots(&self) -> Vec<usize> {
        (0..NUM_FACTOR_TYPES)
            .filter(|&i| self.non_constant[i])
            .collect()
    }
    /// Indices of the constant factor types in ascending order.
    pub fn constant_slots(&self) -> Vec<usize> {
        (0..NUM_FACTOR_TYPES)
            .filter(|&i| !self.non_constant[i])
            .collect()
    }
    pub fn non_constant_count(&self) -> usize {
        self.non_constant.iter().filter(|&&flag| flag).count()
    }
}
impl TryFrom<Vec<u8>> for FactorSetting {
    type Error = SmootherError;

    fn try_from(flags: Vec<u8>) -> Result<Self> {
        if flags.len() != NUM_FACTOR_TYPES {
            return Err(SmootherError::FactorSettingMismatch {
                what: "factor types in the setting",
                expected: NUM_FACTOR_TYPES,
                found: flags.len(),
            });
        }
        let mut non_constant = [false; NUM_FACTOR_TYPES];
        for (i, &flag) in flags.iter().enumerate() {
            non_constant[i] = match flag {
                0 => false,
                1 => true,
                _ => {
                    return Err(SmootherError::InvalidParameter {
                        name: "factor_setting",
                        value: flag as f64,
                        reason: "flags must be 0 (constant) or 1 (non-constant)",
                    });
                }
            };
        }
        Ok(FactorSetting::new(non_constant))
    }
}
impl From<FactorSetting> for Vec<u8> {
    fn from(setting: FactorSetting) -> Self {
        setting.non_constant.iter().map(|&f| f as u8).collect()
    }
}

/// Particle population for one period: a `3 × observations × particles` array.
///
/// Stored as one `observations × particles` matrix per factor type.
#[derive(Clone, Debug, PartialEq)]
pub struct FactorPopulation {
    slots: [DMatrix<f64>; NUM_FACTOR_TYPES],
}
impl Display for FactorPopulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactorPopulation")
            .field("observations", &self.observations())
            .field("particles", &self.particles())
            .finish()
    }
}
impl FactorPopulation {
    /// Build a population from three equally shaped `observations × particles` matrices.
    pub fn new(slots: [DMatrix<f64>; NUM_FACTOR_TYPES]) -> Result<Self> {
        let expected = slots[0].shape();
        for slot in slots.iter().skip(1) {
            if slot.shape() != expected {
                return Err(SmootherError::ShapeMismatch {
                    what: "factor slot of the particle population",
                    expected,
                    found: slot.shape(),
                });
            }
        }
        Ok(FactorPopulation { slots })
    }
    /// Population with every value set to `value`.
    pub fn filled(observations: usize, particles: usize, value: f64) -> Self {
        FactorPopulation {
            slots: std::array::from_fn(|_| {
                DMatrix::from_element(observations, particles, value)
            }),
        }
    }
    /// Population built from a function of (factor type, observation, particle).
    pub fn from_fn<F>(observations: usize, particles: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> f64,
    {
        FactorPopulation {
            slots: std::array::from_fn(|factor| {
                DMatrix::from_fn(observations, particles, |i, j| f(factor, i, j))
            }),
        }
    }
    pub fn observations(&self) -> usize {
        self.slots[0].nrows()
    }
    pub fn particles(&self) -> usize {
        self.slots[0].ncols()
    }
    pub fn slot(&self, factor: usize) -> &DMatrix<f64> {
        &self.slots[factor]
    }
    pub fn slot_mut(&mut self, factor: usize) -> &mut DMatrix<f64> {
        &mut self.slots[factor]
    }
    pub fn slots(&self) -> &[DMatrix<f64>; NUM_FACTOR_TYPES] {
        &self.slots
    }
    /// The three factor values of one particle.
    pub fn particle(&self, observation: usize, particle: usize) -> Vector3<f64> {
        Vector3::new(
            self.slots[0][(observation, particle)],
            self.slots[1][(observation, particle)],
            self.slots[2][(observation, particle)],
        )
    }
}
impl TryFrom<Vec<DMatrix<f64>>> for FactorPopulation {
    type Error = SmootherError;

    fn try_from(slots: Vec<DMatrix<f64>>) -> Result<Self> {
        let slots: [DMatrix<f64>; NUM_FACTOR_TYPES] =
            slots
                .try_into()
                .map_err(|rejected: Vec<DMatrix<f64>>| {
                    SmootherError::FactorSettingMismatch {
                        what: "factor types in the particle population",
                        expected: NUM_FACTOR_TYPES,
                        found: rejected.len(),
                    }
                })?;
        FactorPopulation::new(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    #[test]
    fn gaussian_density_at_zero() {
        assert_approx_eq!(gaussian_density(0.0, 1.0 / (2.0 * std::f64::consts::PI)), 1.0);
        assert_approx_eq!(
            gaussian_density(0.1, 0.01),
            (-0.5_f64).exp() / (0.02 * std::f64::consts::PI).sqrt()
        );
    }
    #[test]
    fn factor_setting_from_flags() {
        let setting = FactorSetting::try_from(vec![1, 0, 1]).unwrap();
        assert_eq!(setting.non_constant_slots(), vec![0, 2]);
        assert_eq!(setting.constant_slots(), vec![1]);
        assert_eq!(setting.non_constant_count(), 2);
        let flags: Vec<u8> = setting.into();
        assert_eq!(flags, vec![1, 0, 1]);
    }
    #[test]
    fn factor_setting_rejects_wrong_length() {
        let result = FactorSetting::try_from(vec![1, 1]);
        assert!(matches!(
            result,
            Err(SmootherError::FactorSettingMismatch {
                expected: 3,
                found: 2,
                ..
            })
        ));
        assert!(FactorSetting::try_from(vec![1, 2, 0]).is_err());
    }
    #[test]
    fn factor_setting_serde() {
        let setting: FactorSetting = serde_json::from_str("[0, 1, 0]").unwrap();
        assert!(setting.is_constant(0));
        assert_eq!(serde_json::to_string(&setting).unwrap(), "[0,1,0]");
        assert!(serde_json::from_str::<FactorSetting>("[1, 1, 0, 0]").is_err());
    }
    #[test]
    fn population_accessors() {
        let population = FactorPopulation::from_fn(2, 3, |f, i, j| (100 * f + 10 * i + j) as f64);
        assert_eq!(population.observations(), 2);
        assert_eq!(population.particles(), 3);
        assert_eq!(population.particle(1, 2), Vector3::new(12.0, 112.0, 212.0));
    }
    #[test]
    fn population_requires_three_equal_slots() {
        let two = vec![DMatrix::zeros(2, 2), DMatrix::zeros(2, 2)];
        assert!(matches!(
            FactorPopulation::try_from(two),
            Err(SmootherError::FactorSettingMismatch { found: 2, .. })
        ));
        let ragged = vec![DMatrix::zeros(2, 2), DMatrix::zeros(2, 3), DMatrix::zeros(2, 2)];
        assert!(matches!(
            FactorPopulation::try_from(ragged),
            Err(SmootherError::ShapeMismatch { .. })
        ));
    }
}
