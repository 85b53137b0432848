//! Law of motion for the latent factors.
//!
//! This module provides the transition model used by both passes of the smoother. In the forward
//! pass, [`TransitionModel::next_state`] propagates a particle population one period ahead using
//! pre-drawn standard normal shocks. In the backward pass, [`TransitionModel::marginal_probability`]
//! scores how likely each particle of an earlier population is to have produced a given next
//! state.
//!
//! Non-constant factor types evolve with a CES aggregator of all three factor values plus an
//! additive Gaussian shock. Constant factor types keep their value, so a candidate predecessor is
//! only admissible if its constant factors match the next state exactly.
use crate::{FactorPopulation, FactorSetting, NUM_FACTOR_TYPES, Result, SmootherError};
use crate::gaussian_density;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Coefficients of one transition equation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionParameters {
    /// Substitution parameter of the CES aggregator
    pub phi: f64,
    /// Scale applied to the own-factor term and to the aggregate
    pub lambda: f64,
    /// Weight of factor type 0
    pub gamma1: f64,
    /// Weight of factor type 1
    pub gamma2: f64,
    /// Weight of factor type 2
    pub gamma3: f64,
    /// Variance of the additive shock
    pub var_u: f64,
}
impl Display for TransitionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransitionParameters(phi: {}, lambda: {}, gamma: [{}, {}, {}], var_u: {})",
            self.phi, self.lambda, self.gamma1, self.gamma2, self.gamma3, self.var_u
        )
    }
}
impl TransitionParameters {
    /// Check that the coefficients describe a usable equation.
    pub fn validate(&self) -> Result<()> {
        let coefficients = [
            ("phi", self.phi),
            ("lambda", self.lambda),
            ("gamma1", self.gamma1),
            ("gamma2", self.gamma2),
            ("gamma3", self.gamma3),
        ];
        for (name, value) in coefficients {
            if !value.is_finite() {
                return Err(SmootherError::InvalidParameter {
                    name,
                    value,
                    reason: "coefficient must be finite",
                });
            }
        }
        if self.phi * self.lambda == 0.0 {
            return Err(SmootherError::InvalidParameter {
                name: "phi",
                value: self.phi,
                reason: "phi * lambda must be non-zero",
            });
        }
        if !(self.var_u > 0.0 && self.var_u.is_finite()) {
            return Err(SmootherError::InvalidParameter {
                name: "var_u",
                value: self.var_u,
                reason: "shock variance must be positive and finite",
            });
        }
        Ok(())
    }
    /// Expected next value of the factor given the current values of all three factor types.
    pub fn ces(&self, a1: f64, a2: f64, a3: f64) -> f64 {
        let exponent = self.phi * self.lambda;
        (self.gamma1 * (exponent * a1.ln()).exp()
            + self.gamma2 * (self.phi * a2.ln()).exp()
            + self.gamma3 * (self.phi * a3.ln()).exp())
        .ln()
            / exponent
    }
    pub fn shock_std(&self) -> f64 {
        self.var_u.sqrt()
    }
}

/// Transition model for the three factor types.
#[derive(Clone, Debug)]
pub struct TransitionModel {
    setting: FactorSetting,
    /// Coefficients per factor type, `None` for constant types
    equations: [Option<TransitionParameters>; NUM_FACTOR_TYPES],
}
impl TransitionModel {
    /// Build the model from one coefficient record per non-constant factor type.
    ///
    /// The records are matched to the non-constant slots of `setting` in ascending slot order.
    pub fn new(parameters: Vec<TransitionParameters>, setting: FactorSetting) -> Result<Self> {
        let slots = setting.non_constant_slots();
        if parameters.len() != slots.len() {
            return Err(SmootherError::FactorSettingMismatch {
                what: "transition equations",
                expected: slots.len(),
                found: parameters.len(),
            });
        }
        let mut equations: [Option<TransitionParameters>; NUM_FACTOR_TYPES] = Default::default();
        for (slot, params) in slots.into_iter().zip(parameters) {
            params.validate()?;
            equations[slot] = Some(params);
        }
        Ok(TransitionModel { setting, equations })
    }
    pub fn setting(&self) -> &FactorSetting {
        &self.setting
    }
    /// Coefficients of the transition equation of `factor`, if it is non-constant.
    pub fn equation(&self, factor: usize) -> Option<&TransitionParameters> {
        self.equations[factor].as_ref()
    }
    /// Propagate a population one period ahead.
    ///
    /// # Arguments
    /// * `state` - current population, `3 × obs × particles`
    /// * `errors` - one `obs × particles` matrix of standard normal shocks per non-constant
    ///   factor type, in ascending slot order
    ///
    /// # Returns
    /// The next population. Constant factor types are copied unchanged.
    pub fn next_state(
        &self,
        state: &FactorPopulation,
        errors: &[DMatrix<f64>],
    ) -> Result<FactorPopulation> {
        let expected = self.setting.non_constant_count();
        if errors.len() != expected {
            return Err(SmootherError::FactorSettingMismatch {
                what: "shock slices",
                expected,
                found: errors.len(),
            });
        }
        let shape = (state.observations(), state.particles());
        for slice in errors {
            if slice.shape() != shape {
                return Err(SmootherError::ShapeMismatch {
                    what: "shock slice",
                    expected: shape,
                    found: slice.shape(),
                });
            }
        }
        ensure_positive(state)?;

        let mut next = state.clone();
        for (shock_index, slot) in self.setting.non_constant_slots().into_iter().enumerate() {
            if let Some(params) = &self.equations[slot] {
                let sd = params.shock_std();
                let shocks = &errors[shock_index];
                *next.slot_mut(slot) = DMatrix::from_fn(shape.0, shape.1, |i, j| {
                    params.ces(
                        state.slot(0)[(i, j)],
                        state.slot(1)[(i, j)],
                        state.slot(2)[(i, j)],
                    ) + sd * shocks[(i, j)]
                });
            }
        }
        Ok(next)
    }
    /// Probability of each particle in `state` evolving into `next_state`.
    ///
    /// # Arguments
    /// * `next_state` - `3 × obs` matrix holding one target value per factor type and observation
    /// * `state` - candidate predecessors, `3 × obs × particles`
    ///
    /// # Returns
    /// An `obs × particles` matrix. Particles whose constant factors differ from the target get
    /// probability 0; the others get the product of the shock densities of the non-constant
    /// factor types.
    pub fn marginal_probability(
        &self,
        next_state: &DMatrix<f64>,
        state: &FactorPopulation,
    ) -> Result<DMatrix<f64>> {
        let observations = state.observations();
        let particles = state.particles();
        if next_state.shape() != (NUM_FACTOR_TYPES, observations) {
            return Err(SmootherError::ShapeMismatch {
                what: "next state",
                expected: (NUM_FACTOR_TYPES, observations),
                found: next_state.shape(),
            });
        }
        let constant = self.setting.constant_slots();
        let non_constant = self.setting.non_constant_slots();

        let mut probabilities = DMatrix::<f64>::zeros(observations, particles);
        for i in 0..observations {
            for j in 0..particles {
                let fits = constant
                    .iter()
                    .all(|&c| state.slot(c)[(i, j)] == next_state[(c, i)]);
                if !fits {
                    continue;
                }
                let values = state.particle(i, j);
                if let Some(factor) = (0..NUM_FACTOR_TYPES).find(|&f| !(values[f] > 0.0)) {
                    return Err(SmootherError::NonPositiveFactorValue {
                        factor,
                        observation: i,
                        particle: j,
                        value: values[factor],
                    });
                }
                let mut probability = 1.0;
                for &slot in &non_constant {
                    if let Some(params) = &self.equations[slot] {
                        let expected = params.ces(values[0], values[1], values[2]);
                        probability *=
                            gaussian_density(next_state[(slot, i)] - expected, params.var_u);
                    }
                }
                probabilities[(i, j)] = probability;
            }
        }
        Ok(probabilities)
    }
}

/// Fails on the first factor value that is not strictly positive.
fn ensure_positive(state: &FactorPopulation) -> Result<()> {
    for (factor, slot) in state.slots().iter().enumerate() {
        for j in 0..slot.ncols() {
            for i in 0..slot.nrows() {
                let value = slot[(i, j)];
                if !(value > 0.0) {
                    return Err(SmootherError::NonPositiveFactorValue {
                        factor,
                        observation: i,
                        particle: j,
                        value,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Standard normal transition shocks, shaped `non-constant types × obs × periods × particles`.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionErrors {
    /// Indexed by period (0-based), then by non-constant slot
    periods: Vec<Vec<DMatrix<f64>>>,
    observations: usize,
    particles: usize,
}
impl TransitionErrors {
    pub fn zeros(
        non_constant: usize,
        observations: usize,
        periods: usize,
        particles: usize,
    ) -> Self {
        TransitionErrors {
            periods: vec![vec![DMatrix::zeros(observations, particles); non_constant]; periods],
            observations,
            particles,
        }
    }
    /// Build from per-period lists of `obs × particles` shock slices.
    pub fn from_periods(periods: Vec<Vec<DMatrix<f64>>>) -> Result<Self> {
        let (non_constant, shape) = match periods.first() {
            Some(first) => (first.len(), first.first().map(|m| m.shape()).unwrap_or((0, 0))),
            None => (0, (0, 0)),
        };
        for slices in &periods {
            if slices.len() != non_constant {
                return Err(SmootherError::FactorSettingMismatch {
                    what: "shock slices per period",
                    expected: non_constant,
                    found: slices.len(),
                });
            }
            for slice in slices {
                if slice.shape() != shape {
                    return Err(SmootherError::ShapeMismatch {
                        what: "shock slice",
                        expected: shape,
                        found: slice.shape(),
                    });
                }
            }
        }
        Ok(TransitionErrors {
            periods,
            observations: shape.0,
            particles: shape.1,
        })
    }
    pub fn non_constant(&self) -> usize {
        self.periods.first().map(|p| p.len()).unwrap_or(0)
    }
    pub fn observations(&self) -> usize {
        self.observations
    }
    pub fn periods(&self) -> usize {
        self.periods.len()
    }
    pub fn particles(&self) -> usize {
        self.particles
    }
    /// Shock slices of a period (1-based), one per non-constant factor type.
    pub fn period(&self, period: usize) -> Option<&[DMatrix<f64>]> {
        period
            .checked_sub(1)
            .and_then(|p| self.periods.get(p))
            .map(|slices| slices.as_slice())
    }
    pub fn get(&self, slot: usize, observation: usize, period: usize, particle: usize) -> f64 {
        self.periods[period - 1][slot][(observation, particle)]
    }
    pub fn set(
        &mut self,
        slot: usize,
        observation: usize,
        period: usize,
        particle: usize,
        value: f64,
    ) {
        self.periods[period - 1][slot][(observation, particle)] = value;
    }
}
