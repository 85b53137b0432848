//! Measurement equations for the latent factors.
//!
//! Every factor type is observed through one or more noisy proxies. Each proxy follows a linear
//! measurement equation in two observed controls and the factor:
//!
//! $$
//! y = \beta_1 c_1 + \beta_2 c_2 + z a + \eta, \quad \eta \sim N(0, \sigma^2)
//! $$
//!
//! A [`MeasurementModel`] holds all equations of one factor type together with the residuals
//! $y - \beta_1 c_1 - \beta_2 c_2$ of the measurement table, so that the likelihood of a candidate
//! factor value only needs the factor term. The measurement table itself ([`MeasurementTable`]) is
//! keyed by observation unit (`caseid`) and period and can be loaded from CSV.
use crate::{Result, SmootherError, gaussian_density};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Coefficients of one measurement equation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementParameters {
    /// Factor type (0-based) the equation belongs to
    pub factor: usize,
    /// Coefficient of the first control
    pub beta1: f64,
    /// Coefficient of the second control
    pub beta2: f64,
    /// Factor loading
    pub z: f64,
    /// Variance of the measurement error
    pub var: f64,
}
impl Display for MeasurementParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MeasurementParameters(factor: {}, beta1: {}, beta2: {}, z: {}, var: {})",
            self.factor, self.beta1, self.beta2, self.z, self.var
        )
    }
}
impl MeasurementParameters {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("beta1", self.beta1), ("beta2", self.beta2), ("z", self.z)] {
            if !value.is_finite() {
                return Err(SmootherError::InvalidParameter {
                    name,
                    value,
                    reason: "coefficient must be finite",
                });
            }
        }
        if !(self.var > 0.0 && self.var.is_finite()) {
            return Err(SmootherError::InvalidParameter {
                name: "var",
                value: self.var,
                reason: "measurement variance must be positive and finite",
            });
        }
        if self.factor >= crate::NUM_FACTOR_TYPES {
            return Err(SmootherError::InvalidParameter {
                name: "factor",
                value: self.factor as f64,
                reason: "factor type must be 0, 1 or 2",
            });
        }
        Ok(())
    }
}

/// One row of a measurement table.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRow {
    /// Observation unit identifier
    pub caseid: u64,
    /// Period, starting at 1
    pub period: usize,
    pub control: f64,
    pub control_2: f64,
    /// Raw measurements, one per measurement equation of the factor
    pub measurements: Vec<f64>,
}

/// Controls and raw measurements of one factor type, keyed by (observation, period).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasurementTable {
    rows: Vec<MeasurementRow>,
}
impl MeasurementTable {
    pub fn new(rows: Vec<MeasurementRow>) -> Self {
        MeasurementTable { rows }
    }
    pub fn rows(&self) -> &[MeasurementRow] {
        &self.rows
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    /// Distinct observation identifiers in ascending order.
    pub fn observations(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.rows.iter().map(|r| r.caseid).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
    /// Reads a measurement table from a CSV file.
    ///
    /// The header must contain `caseid`, `period` (or `t`), `control` and `control_2`. Every column
    /// whose name starts with `meas` is a raw measurement; measurement columns are numbered in the
    /// order they appear in the file.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use factor_smoother::measurements::MeasurementTable;
    ///
    /// let table = MeasurementTable::from_csv("./data/meas_fac1.csv")
    ///     .expect("Failed to read measurements");
    /// println!("Loaded {} rows", table.len());
    /// ```
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }
    /// Reads a measurement table from any CSV source. See [`MeasurementTable::from_csv`].
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let column = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.contains(&h))
                .ok_or_else(|| SmootherError::InvalidRecord {
                    line: 1,
                    reason: format!("missing column `{}`", names[0]),
                })
        };
        let caseid_col = column(&["caseid"])?;
        let period_col = column(&["period", "t"])?;
        let control_col = column(&["control"])?;
        let control_2_col = column(&["control_2"])?;
        let measurement_cols: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.starts_with("meas"))
            .map(|(i, _)| i)
            .collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let caseid = field(&record, caseid_col, line)?
                .parse::<u64>()
                .map_err(|e| SmootherError::InvalidRecord {
                    line,
                    reason: format!("caseid: {}", e),
                })?;
            let period = field(&record, period_col, line)?
                .parse::<usize>()
                .map_err(|e| SmootherError::InvalidRecord {
                    line,
                    reason: format!("period: {}", e),
                })?;
            let measurements = measurement_cols
                .iter()
                .map(|&i| number(&record, i, line))
                .collect::<Result<Vec<f64>>>()?;
            rows.push(MeasurementRow {
                caseid,
                period,
                control: number(&record, control_col, line)?,
                control_2: number(&record, control_2_col, line)?,
                measurements,
            });
        }
        Ok(MeasurementTable { rows })
    }
    /// Writes the table as CSV with columns `caseid,period,control,control_2,meas1,...`.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let width = self
            .rows
            .iter()
            .map(|r| r.measurements.len())
            .max()
            .unwrap_or(0);
        let mut header = String::from("caseid,period,control,control_2");
        for i in 1..=width {
            header.push_str(&format!(",meas{}", i));
        }
        writeln!(file, "{}", header)?;
        for row in &self.rows {
            let mut line = format!("{},{},{},{}", row.caseid, row.period, row.control, row.control_2);
            for value in &row.measurements {
                line.push_str(&format!(",{}", value));
            }
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

fn field(record: &csv::StringRecord, index: usize, line: u64) -> Result<&str> {
    record.get(index).ok_or_else(|| SmootherError::InvalidRecord {
        line,
        reason: format!("record has only {} fields", record.len()),
    })
}

fn number(record: &csv::StringRecord, index: usize, line: u64) -> Result<f64> {
    let raw = field(record, index, line)?;
    raw.parse::<f64>().map_err(|_| SmootherError::InvalidRecord {
        line,
        reason: format!("`{}` is not a number", raw),
    })
}

/// Residuals are stored by position, so each period must list the observations exactly once.
fn check_coverage(ordered: &[&MeasurementRow], observations: &[u64]) -> Result<()> {
    let mut by_period: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for row in ordered {
        by_period.entry(row.period).or_default().push(row.caseid);
    }
    for (period, ids) in by_period {
        if ids != observations {
            let found = observations
                .iter()
                .filter(|&&id| ids.iter().filter(|&&other| other == id).count() == 1)
                .count();
            return Err(SmootherError::MeasurementDimensionMismatch {
                period,
                expected: observations.len(),
                found,
            });
        }
    }
    Ok(())
}

/// One measurement equation with its precomputed residual series.
#[derive(Clone, Debug)]
struct MeasurementEquation {
    /// Residuals per period, ordered by ascending observation identifier
    residuals: BTreeMap<usize, DVector<f64>>,
    loading: f64,
    variance: f64,
}

/// Measurement equations of one factor type.
#[derive(Clone, Debug)]
pub struct MeasurementModel {
    equations: Vec<MeasurementEquation>,
}
impl MeasurementModel {
    /// Build the model from the equations of one factor type and its measurement table.
    ///
    /// Equation `k` (0-based) of `parameters` reads measurement column `k` of the table.
    ///
    /// Every period present in the table must hold exactly one row per observation of the table.
    /// A period may be absent altogether.
    pub fn new(parameters: &[MeasurementParameters], table: &MeasurementTable) -> Result<Self> {
        let mut ordered: Vec<&MeasurementRow> = table.rows().iter().collect();
        ordered.sort_by_key(|r| (r.period, r.caseid));
        check_coverage(&ordered, &table.observations())?;

        let mut equations = Vec::with_capacity(parameters.len());
        for (column, params) in parameters.iter().enumerate() {
            params.validate()?;
            let mut by_period: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
            for row in &ordered {
                let measurement = row.measurements.get(column).copied().ok_or(
                    SmootherError::MissingMeasurement {
                        column: column + 1,
                        observation: row.caseid,
                        period: row.period,
                    },
                )?;
                let residual =
                    measurement - (params.beta1 * row.control + params.beta2 * row.control_2);
                by_period.entry(row.period).or_default().push(residual);
            }
            equations.push(MeasurementEquation {
                residuals: by_period
                    .into_iter()
                    .map(|(period, values)| (period, DVector::from_vec(values)))
                    .collect(),
                loading: params.z,
                variance: params.var,
            });
        }
        Ok(MeasurementModel { equations })
    }
    pub fn num_equations(&self) -> usize {
        self.equations.len()
    }
    /// Likelihood of candidate factor values given the measurements of one period.
    ///
    /// # Arguments
    /// * `factor_values` - `obs × particles` candidate values of the factor
    /// * `period` - period of the measurements, starting at 1
    ///
    /// # Returns
    /// An `obs × particles` matrix of products of the per-equation Gaussian densities.
    pub fn marginal_probability(
        &self,
        factor_values: &DMatrix<f64>,
        period: usize,
    ) -> Result<DMatrix<f64>> {
        let (observations, particles) = factor_values.shape();
        let mut marginals = DMatrix::<f64>::from_element(observations, particles, 1.0);
        for equation in &self.equations {
            let residuals = equation.residuals.get(&period).ok_or(
                SmootherError::MeasurementDimensionMismatch {
                    period,
                    expected: observations,
                    found: 0,
                },
            )?;
            if residuals.len() != observations {
                return Err(SmootherError::MeasurementDimensionMismatch {
                    period,
                    expected: observations,
                    found: residuals.len(),
                });
            }
            for j in 0..particles {
                for i in 0..observations {
                    let x = residuals[i] - equation.loading * factor_values[(i, j)];
                    marginals[(i, j)] *= gaussian_density(x, equation.variance);
                }
            }
        }
        Ok(marginals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn unit_parameters() -> MeasurementParameters {
        MeasurementParameters {
            factor: 0,
            beta1: 1.0,
            beta2: 1.0,
            z: 1.0,
            var: 1.0 / (2.0 * PI),
        }
    }
    fn two_observation_table() -> MeasurementTable {
        MeasurementTable::new(vec![
            MeasurementRow {
                caseid: 1,
                period: 1,
                control: 1.0,
                control_2: 1.0,
                measurements: vec![-1.0, 0.0, -1.0],
            },
            MeasurementRow {
                caseid: 2,
                period: 1,
                control: 2.0,
                control_2: 1.0,
                measurements: vec![5.0, 5.0, 6.0],
            },
        ])
    }
    fn candidates() -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[-3.0, -2.0, 2.0, 3.0])
    }

    #[test]
    fn product_of_two_equal_equations() {
        let params = unit_parameters();
        let model = MeasurementModel::new(&[params.clone(), params], &two_observation_table())
            .unwrap();
        let probabilities = model.marginal_probability(&candidates(), 1).unwrap();
        let variance = 1.0 / (2.0 * PI);
        // residuals: equation 1 -> [-3, 2], equation 2 -> [-2, 2]
        let expected = |x1: f64, x2: f64| {
            (-x1 * x1 / (2.0 * variance)).exp() / (2.0 * PI * variance).sqrt()
                * (-x2 * x2 / (2.0 * variance)).exp()
                / (2.0 * PI * variance).sqrt()
        };
        assert_approx_eq!(probabilities[(0, 0)], expected(0.0, 1.0));
        assert_approx_eq!(probabilities[(0, 1)], expected(-1.0, 0.0));
        assert_approx_eq!(probabilities[(1, 0)], expected(0.0, 0.0));
        assert_approx_eq!(probabilities[(1, 1)], expected(-1.0, -1.0));
    }
    #[test]
    fn product_of_three_equal_equations() {
        let params = unit_parameters();
        let model = MeasurementModel::new(
            &[params.clone(), params.clone(), params],
            &two_observation_table(),
        )
        .unwrap();
        let probabilities = model.marginal_probability(&candidates(), 1).unwrap();
        let density = |x: f64| gaussian_density(x, 1.0 / (2.0 * PI));
        let d1 = [[0.0, 1.0], [0.0, 1.0]];
        let d2 = [[1.0, 0.0], [0.0, 1.0]];
        let d3 = [[0.0, 1.0], [1.0, 0.0]];
        for i in 0..2 {
            for j in 0..2 {
                let expected = density(d1[i][j]) * density(d2[i][j]) * density(d3[i][j]);
                assert_approx_eq!(probabilities[(i, j)], expected);
            }
        }
    }
    #[test]
    fn no_equations_gives_unit_likelihood() {
        let model = MeasurementModel::new(&[], &two_observation_table()).unwrap();
        let probabilities = model.marginal_probability(&candidates(), 7).unwrap();
        assert!(probabilities.iter().all(|&p| p == 1.0));
    }
    #[test]
    fn missing_period_is_dimension_error() {
        let model = MeasurementModel::new(&[unit_parameters()], &two_observation_table()).unwrap();
        let result = model.marginal_probability(&candidates(), 2);
        assert!(matches!(
            result,
            Err(SmootherError::MeasurementDimensionMismatch {
                period: 2,
                found: 0,
                ..
            })
        ));
    }
    #[test]
    fn observation_count_mismatch_is_dimension_error() {
        let model = MeasurementModel::new(&[unit_parameters()], &two_observation_table()).unwrap();
        let three_observations = DMatrix::from_element(3, 2, 1.0);
        let result = model.marginal_probability(&three_observations, 1);
        assert!(matches!(
            result,
            Err(SmootherError::MeasurementDimensionMismatch {
                expected: 3,
                found: 2,
                ..
            })
        ));
    }
    #[test]
    fn rows_are_ordered_by_observation() {
        let mut rows = two_observation_table().rows().to_vec();
        rows.reverse();
        let model = MeasurementModel::new(&[unit_parameters()], &MeasurementTable::new(rows)).unwrap();
        let probabilities = model.marginal_probability(&candidates(), 1).unwrap();
        assert_approx_eq!(probabilities[(0, 0)], 1.0);
        assert_approx_eq!(probabilities[(1, 0)], 1.0);
    }
    #[test]
    fn period_with_other_observations_is_rejected() {
        let mut rows = two_observation_table().rows().to_vec();
        let (first, second) = (rows[0].clone(), rows[1].clone());
        rows.extend([
            MeasurementRow { caseid: 1, period: 2, ..first.clone() },
            MeasurementRow { caseid: 3, period: 2, measurements: vec![30.0; 3], ..second.clone() },
        ]);
        let result = MeasurementModel::new(&[unit_parameters()], &MeasurementTable::new(rows));
        assert!(matches!(
            result,
            Err(SmootherError::MeasurementDimensionMismatch {
                period: 1,
                expected: 3,
                found: 2,
            })
        ));
    }
    #[test]
    fn duplicated_row_next_to_missing_one_is_rejected() {
        let mut rows = two_observation_table().rows().to_vec();
        let (first, second) = (rows[0].clone(), rows[1].clone());
        rows.extend([
            MeasurementRow { caseid: 1, period: 2, ..first.clone() },
            MeasurementRow { caseid: 2, period: 2, ..second.clone() },
            MeasurementRow { caseid: 3, period: 1, ..second.clone() },
            MeasurementRow { caseid: 3, period: 2, ..second.clone() },
            MeasurementRow { caseid: 3, period: 3, ..second.clone() },
            MeasurementRow { caseid: 3, period: 3, ..second.clone() },
            MeasurementRow { caseid: 1, period: 3, ..first.clone() },
        ]);
        let result = MeasurementModel::new(&[unit_parameters()], &MeasurementTable::new(rows));
        assert!(matches!(
            result,
            Err(SmootherError::MeasurementDimensionMismatch {
                period: 3,
                expected: 3,
                found: 1,
            })
        ));
    }
    #[test]
    fn absent_period_is_allowed() {
        let mut rows = two_observation_table().rows().to_vec();
        let (first, second) = (rows[0].clone(), rows[1].clone());
        rows.extend([
            MeasurementRow { caseid: 1, period: 3, ..first.clone() },
            MeasurementRow { caseid: 2, period: 3, ..second.clone() },
        ]);
        let model =
            MeasurementModel::new(&[unit_parameters()], &MeasurementTable::new(rows)).unwrap();
        assert!(model.marginal_probability(&candidates(), 3).is_ok());
        assert!(model.marginal_probability(&candidates(), 2).is_err());
    }
    #[test]
    fn missing_measurement_column() {
        let params = unit_parameters();
        let result = MeasurementModel::new(
            &[params.clone(), params.clone(), params.clone(), params],
            &two_observation_table(),
        );
        assert!(matches!(
            result,
            Err(SmootherError::MissingMeasurement { column: 4, .. })
        ));
    }
    #[test]
    fn invalid_variance_rejected() {
        let mut params = unit_parameters();
        params.var = -1.0;
        assert!(matches!(
            MeasurementModel::new(&[params], &two_observation_table()),
            Err(SmootherError::InvalidParameter { name: "var", .. })
        ));
    }
    #[test]
    fn table_from_csv_reader() {
        let data = "caseid,t,control,control_2,meas1,meas2\n2,1,2,1,5,5\n1,1,1,1,-1,0\n";
        let table = MeasurementTable::from_reader(data.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.observations(), vec![1, 2]);
        assert_eq!(table.rows()[0].measurements, vec![5.0, 5.0]);
        assert_eq!(table.rows()[1].period, 1);
    }
    #[test]
    fn table_from_csv_rejects_bad_numbers() {
        let data = "caseid,period,control,control_2,meas1\n1,1,abc,1,2\n";
        assert!(matches!(
            MeasurementTable::from_reader(data.as_bytes()),
            Err(SmootherError::InvalidRecord { .. })
        ));
        let missing = "caseid,control,control_2,meas1\n1,1,1,2\n";
        assert!(MeasurementTable::from_reader(missing.as_bytes()).is_err());
    }
    #[test]
    fn table_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meas.csv");
        let table = two_observation_table();
        table.to_csv(&path).unwrap();
        let loaded = MeasurementTable::from_csv(&path).unwrap();
        assert_eq!(loaded, table);
    }
}
