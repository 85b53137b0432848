//! Run configuration files.
//!
//! A [`RunConfig`] bundles everything a command line run needs: the smoother size and seed, the
//! factor setting, the coefficients of all model equations, where the prior and the shocks come
//! from, and the input and output file locations. It can be stored as JSON, YAML or TOML, chosen
//! by file extension.
use crate::measurements::MeasurementParameters;
use crate::sim::PriorParameters;
use crate::smoother::SmootherConfig;
use crate::transition::TransitionParameters;
use crate::{FactorSetting, NUM_FACTOR_TYPES, Result, SmootherError};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Where the initial particle population comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorSource {
    /// Read from a population CSV file
    File { path: PathBuf },
    /// Every particle starts at the true factors of period 1 (needs `data.true_factors`)
    Degenerate,
    /// Drawn from independent normal priors, one per factor type
    Drawn {
        draws_varying: usize,
        draws_constant: usize,
        priors: Vec<PriorParameters>,
    },
}

/// Input and output locations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPaths {
    /// One measurement table per factor type
    pub measurement_tables: Vec<PathBuf>,
    /// True factors, used for the degenerate prior and the error summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_factors: Option<PathBuf>,
    /// Transition shocks; drawn from the seed when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shocks: Option<PathBuf>,
    /// Output file for the smoothed estimates
    pub estimates: PathBuf,
    /// Output file for the error summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PathBuf>,
}
impl Default for DataPaths {
    fn default() -> Self {
        DataPaths {
            measurement_tables: (1..=NUM_FACTOR_TYPES)
                .map(|k| PathBuf::from(format!("data/meas_fac{k}.csv")))
                .collect(),
            true_factors: Some(PathBuf::from("data/true_factors.csv")),
            shocks: None,
            estimates: PathBuf::from("output/estimates.csv"),
            summary: Some(PathBuf::from("output/error_summary.csv")),
        }
    }
}

/// Complete configuration of a smoothing run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub factor_setting: FactorSetting,
    pub smoother: SmootherConfig,
    /// One record per non-constant factor type, in ascending slot order
    pub transitions: Vec<TransitionParameters>,
    /// Measurement equations of all factor types, tagged by `factor`
    pub measurements: Vec<MeasurementParameters>,
    pub prior: PriorSource,
    pub data: DataPaths,
}
impl Default for RunConfig {
    /// A template with two evolving factors and one constant factor.
    fn default() -> Self {
        let transition = TransitionParameters {
            phi: 1.0,
            lambda: 1.0,
            gamma1: 1.4,
            gamma2: 1.3,
            gamma3: 0.0,
            var_u: 0.01,
        };
        let measurements = (0..NUM_FACTOR_TYPES)
            .flat_map(|factor| {
                [1.0, 0.8].into_iter().map(move |z| MeasurementParameters {
                    factor,
                    beta1: 0.5,
                    beta2: 0.25,
                    z,
                    var: 0.2,
                })
            })
            .collect();
        RunConfig {
            factor_setting: FactorSetting::default(),
            smoother: SmootherConfig {
                observations: 500,
                periods: 8,
                particles: 100,
                ..SmootherConfig::default()
            },
            transitions: vec![transition.clone(), transition],
            measurements,
            prior: PriorSource::Degenerate,
            data: DataPaths::default(),
        }
    }
}
impl RunConfig {
    /// Check that the parts of the configuration fit together.
    pub fn validate(&self) -> Result<()> {
        self.smoother.validate()?;
        let expected = self.factor_setting.non_constant_count();
        if self.transitions.len() != expected {
            return Err(SmootherError::FactorSettingMismatch {
                what: "transition equations",
                expected,
                found: self.transitions.len(),
            });
        }
        for params in &self.transitions {
            params.validate()?;
        }
        for params in &self.measurements {
            if params.factor >= NUM_FACTOR_TYPES {
                return Err(SmootherError::Config(format!(
                    "measurement equation {params} refers to factor type {}, expected 0..{}",
                    params.factor, NUM_FACTOR_TYPES
                )));
            }
            params.validate()?;
        }
        if self.data.measurement_tables.len() != NUM_FACTOR_TYPES {
            return Err(SmootherError::FactorSettingMismatch {
                what: "measurement tables",
                expected: NUM_FACTOR_TYPES,
                found: self.data.measurement_tables.len(),
            });
        }
        match &self.prior {
            PriorSource::File { .. } => {}
            PriorSource::Degenerate => {
                if self.data.true_factors.is_none() {
                    return Err(SmootherError::Config(
                        "a degenerate prior needs `data.true_factors`".to_string(),
                    ));
                }
            }
            PriorSource::Drawn {
                priors,
                draws_varying,
                draws_constant,
            } => {
                if priors.len() != NUM_FACTOR_TYPES {
                    return Err(SmootherError::FactorSettingMismatch {
                        what: "prior distributions",
                        expected: NUM_FACTOR_TYPES,
                        found: priors.len(),
                    });
                }
                for prior in priors {
                    prior.validate()?;
                }
                let drawn = draws_varying * draws_constant;
                if drawn != self.smoother.particles {
                    return Err(SmootherError::Config(format!(
                        "drawn prior has {} particles (draws_varying x draws_constant), expected {}",
                        drawn, self.smoother.particles
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write the configuration as pretty JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| SmootherError::Config(e.to_string()))
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| SmootherError::Config(e.to_string()))
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(|e| SmootherError::Config(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| SmootherError::Config(e.to_string()))
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| SmootherError::Config(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| SmootherError::Config(e.to_string()))
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Equations of each factor type, in the order they appear in `measurements`.
    pub fn measurements_of(&self, factor: usize) -> Vec<MeasurementParameters> {
        self.measurements
            .iter()
            .filter(|p| p.factor == factor)
            .cloned()
            .collect()
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> SmootherError {
    SmootherError::Config(format!(
        "unsupported file extension for {} (use .json, .yaml, .yml or .toml)",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn drawn_config() -> RunConfig {
        RunConfig {
            smoother: SmootherConfig {
                observations: 10,
                periods: 3,
                particles: 6,
                seed: 7,
            },
            prior: PriorSource::Drawn {
                priors: vec![
                    PriorParameters { mean: 1.0, var_p: 0.1 },
                    PriorParameters { mean: 1.0, var_p: 0.1 },
                    PriorParameters { mean: 2.0, var_p: 0.2 },
                ],
                draws_varying: 3,
                draws_constant: 2,
            },
            data: DataPaths {
                shocks: Some(PathBuf::from("shocks.csv")),
                summary: None,
                ..DataPaths::default()
            },
            ..RunConfig::default()
        }
    }

    #[test]
    fn template_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.measurements_of(2).len(), 2);
    }
    #[test]
    fn round_trip_every_format() {
        let dir = tempdir().unwrap();
        for config in [RunConfig::default(), drawn_config()] {
            for name in ["run.json", "run.yaml", "run.yml", "run.toml"] {
                let path = dir.path().join(name);
                config.to_file(&path).unwrap();
                let loaded = RunConfig::from_file(&path).unwrap();
                assert_eq!(loaded, config, "format {name}");
            }
        }
    }
    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.ini");
        assert!(matches!(
            RunConfig::default().to_file(&path),
            Err(SmootherError::Config(_))
        ));
        assert!(RunConfig::from_file(&path).is_err());
    }
    #[test]
    fn seed_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut value = serde_json::to_value(RunConfig::default()).unwrap();
        value["smoother"].as_object_mut().unwrap().remove("seed");
        std::fs::write(&path, value.to_string()).unwrap();
        let loaded = RunConfig::from_file(&path).unwrap();
        assert_eq!(loaded.smoother.seed, 42);
    }
    #[test]
    fn validate_checks_transition_count() {
        let config = RunConfig {
            factor_setting: FactorSetting::new([true, true, true]),
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SmootherError::FactorSettingMismatch {
                expected: 3,
                found: 2,
                ..
            })
        ));
    }
    #[test]
    fn validate_checks_drawn_particle_count() {
        let mut config = drawn_config();
        assert!(config.validate().is_ok());
        config.smoother.particles = 5;
        assert!(config.validate().is_err());
    }
    #[test]
    fn validate_checks_measurement_factor() {
        let mut config = RunConfig::default();
        config.measurements[0].factor = 3;
        assert!(matches!(config.validate(), Err(SmootherError::Config(_))));
    }
    #[test]
    fn degenerate_prior_needs_truth() {
        let mut config = RunConfig::default();
        config.data.true_factors = None;
        assert!(config.validate().is_err());
    }
}
