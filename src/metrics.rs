//! Statistics comparing a test field against a reference field on the same grid.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3, Axis};
use serde::Serialize;

use crate::error::LoadError;
use crate::field::Field;
use crate::variable::VariableId;

/// `statistic -> season -> value`
pub type StatValues = BTreeMap<String, BTreeMap<String, f64>>;

pub const ANNUAL: &str = "ann";
pub const CONTACT: &str = "pcmdi-metrics@llnl.gov";

/// Month indices making up each season of a 12-month climatology.
pub const SEASONS: [(&str, [usize; 3]); 4] = [
    ("djf", [11, 0, 1]),
    ("mam", [2, 3, 4]),
    ("jja", [5, 6, 7]),
    ("son", [8, 9, 10]),
];

const MONTH_DAYS: [f64; 12] = [31.0, 28.25, 31.0, 30.0, 31.0, 30.0, 31.0, 31.0, 30.0, 31.0, 30.0, 31.0];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatDoc {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Abstract")]
    pub abstract_: String,
    #[serde(rename = "Contact")]
    pub contact: String,
}

impl StatDoc {
    pub fn new(name: &str, abstract_: &str) -> Self {
        Self { name: name.to_owned(), abstract_: abstract_.to_owned(), contact: CONTACT.to_owned() }
    }
}

/// Documentation for one entry of the `METRICS` block.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricDoc {
    Stat(StatDoc),
    Text(String),
}

/// Computes statistics for one (test, reference) pair. The two fields are already on the
/// same grid, masked and subset to the region.
pub trait MetricsAdapter: Send + Sync {
    fn compute(&self, var: &VariableId, model: &Field, obs: &Field) -> Result<StatValues, LoadError>;

    /// Documentation of each statistic `compute` returns. An error means the adapter cannot
    /// describe itself; callers then fall back on `description`.
    fn describe(&self, var: &VariableId) -> Result<BTreeMap<String, MetricDoc>, String>;

    /// Free-text description of the adapter.
    fn description(&self) -> String;
}

/// The standard mean climate statistics, area weighted by cos(latitude). Seasonal values
/// are added when the fields hold a 12-month climatology.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanClimateMetrics;

impl MetricsAdapter for MeanClimateMetrics {
    fn compute(&self, _var: &VariableId, model: &Field, obs: &Field) -> Result<StatValues, LoadError> {
        if model.shape() != obs.shape() {
            return Err(LoadError::ShapeMismatch { reference: obs.shape().to_vec(), test: model.shape().to_vec() });
        }

        let dm = as_time_series(model)?;
        let d_o = as_time_series(obs)?;
        let w = area_weights(&model.lat, model.lon.len());

        let mut stats = StatValues::new();
        let mut put = |stat: &str, season: &str, value: f64| {
            if value.is_finite() {
                stats.entry(stat.to_owned()).or_default().insert(season.to_owned(), value);
            } else {
                log::debug!("{stat} ({season}) of {} has no valid points, leaving it out", model.name);
            }
        };

        let xyt = SpaceTime::new(&dm, &d_o, &w);
        put("rms_xyt", ANNUAL, xyt.rms());
        put("std_xyt", ANNUAL, xyt.std_model());
        put("std-obs_xyt", ANNUAL, xyt.std_obs());

        let mut periods = vec![(ANNUAL, annual_mean(&dm), annual_mean(&d_o))];
        if dm.len_of(Axis(0)) == 12 {
            for (season, months) in SEASONS {
                periods.push((season, seasonal_mean(&dm, &months), seasonal_mean(&d_o, &months)));
            }
        }

        for (season, m, o) in periods {
            let xy = SpaceTime::new(&m.insert_axis(Axis(0)), &o.insert_axis(Axis(0)), &w);
            put("bias_xy", season, xy.bias());
            put("mae_xy", season, xy.mae());
            put("rms_xy", season, xy.rms());
            put("rmsc_xy", season, xy.rmsc());
            put("cor_xy", season, xy.cor());
            put("mean_xy", season, xy.mean_model());
            put("mean-obs_xy", season, xy.mean_obs());
            put("std_xy", season, xy.std_model());
            put("std-obs_xy", season, xy.std_obs());
        }

        Ok(stats)
    }

    fn describe(&self, _var: &VariableId) -> Result<BTreeMap<String, MetricDoc>, String> {
        let docs = [
            ("rms_xyt", "Spatio-Temporal Root Mean Square", "Compute Spatial and Temporal Root Mean Square"),
            ("rms_xy", "Spatial Root Mean Square", "Compute Spatial Root Mean Square"),
            ("rmsc_xy", "Spatial Root Mean Square", "Compute Centered Spatial Root Mean Square"),
            ("bias_xy", "Bias", "Compute Full Average of Model - Observation"),
            ("mae_xy", "Mean Absolute Error", "Compute Full Average of Absolute Difference Between Model And Observation"),
            ("cor_xy", "Spatial Correlation", "Compute Spatial Correlation"),
            ("mean_xy", "Mean", "Area Mean (area weighted)"),
            ("std_xy", "Spatial Standard Deviation", "Compute Spatial Standard Deviation"),
            ("std_xyt", "Spatial-temporal Standard Deviation", "Compute Space-Time Standard Deviation"),
            ("seasonal_mean", "Seasonal Mean", "Compute Seasonal Mean"),
            ("annual_mean", "Annual Mean", "Compute Annual Mean"),
        ];
        Ok(docs.into_iter()
            .map(|(k, name, abs)| (k.to_owned(), MetricDoc::Stat(StatDoc::new(name, abs))))
            .collect())
    }

    fn description(&self) -> String {
        "Area-weighted mean climate statistics of a model against an observed climatology".to_owned()
    }
}

/// Wraps a closure as a metrics adapter, for user-supplied statistics.
pub struct FnMetrics<F> {
    func: F,
    description: String,
    docs: Option<BTreeMap<String, MetricDoc>>,
}

impl<F> FnMetrics<F>
where F: Fn(&VariableId, &Field, &Field) -> Result<StatValues, LoadError> + Send + Sync
{
    pub fn new(description: &str, func: F) -> Self {
        Self { func, description: description.to_owned(), docs: None }
    }

    pub fn with_docs(mut self, docs: BTreeMap<String, MetricDoc>) -> Self {
        self.docs = Some(docs);
        self
    }
}

impl<F> MetricsAdapter for FnMetrics<F>
where F: Fn(&VariableId, &Field, &Field) -> Result<StatValues, LoadError> + Send + Sync
{
    fn compute(&self, var: &VariableId, model: &Field, obs: &Field) -> Result<StatValues, LoadError> {
        (self.func)(var, model, obs)
    }

    fn describe(&self, _var: &VariableId) -> Result<BTreeMap<String, MetricDoc>, String> {
        self.docs.clone().ok_or_else(|| "no statistic documentation was provided".to_owned())
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

fn as_time_series(field: &Field) -> Result<Array3<f64>, LoadError> {
    let shape = (field.n_leading(), field.lat.len(), field.lon.len());
    field.data.as_standard_layout().into_owned()
        .into_shape(shape)
        .map_err(|e| LoadError::from_shape_error(e, "(metrics)".into(), &field.name))
}

fn area_weights(lat: &Array1<f64>, nlon: usize) -> Array2<f64> {
    Array2::from_shape_fn((lat.len(), nlon), |(i, _)| lat[i].to_radians().cos().max(0.0))
}

/// Time mean at each point, weighted by month length for a 12-month climatology.
fn annual_mean(d: &Array3<f64>) -> Array2<f64> {
    let nt = d.len_of(Axis(0));
    let weights: Vec<f64> = if nt == 12 { MONTH_DAYS.to_vec() } else { vec![1.0; nt] };
    let indices: Vec<usize> = (0..nt).collect();
    weighted_time_mean(d, &indices, &weights)
}

fn seasonal_mean(d: &Array3<f64>, months: &[usize; 3]) -> Array2<f64> {
    let weights: Vec<f64> = months.iter().map(|&m| MONTH_DAYS[m]).collect();
    weighted_time_mean(d, months, &weights)
}

fn weighted_time_mean(d: &Array3<f64>, indices: &[usize], weights: &[f64]) -> Array2<f64> {
    let (_, ny, nx) = d.dim();
    Array2::from_shape_fn((ny, nx), |(j, i)| {
        let (num, den) = indices.iter().zip(weights)
            .map(|(&t, &w)| (d[[t, j, i]], w))
            .filter(|(v, _)| !v.is_nan())
            .fold((0.0, 0.0), |(n, s), (v, w)| (n + v * w, s + w));
        if den > 0.0 { num / den } else { f64::NAN }
    })
}

/// Weighted sums over every point valid in both arrays.
struct SpaceTime {
    pairs: Vec<(f64, f64, f64)>,
    wsum: f64,
}

impl SpaceTime {
    fn new(m: &Array3<f64>, o: &Array3<f64>, w: &Array2<f64>) -> Self {
        let mut pairs = Vec::new();
        for ((idx, &mv), &ov) in m.indexed_iter().zip(o.iter()) {
            let wv = w[[idx.1, idx.2]];
            if mv.is_finite() && ov.is_finite() && wv > 0.0 {
                pairs.push((mv, ov, wv));
            }
        }
        let wsum = pairs.iter().map(|p| p.2).sum();
        Self { pairs, wsum }
    }

    fn average<G: Fn(f64, f64) -> f64>(&self, g: G) -> f64 {
        if self.wsum <= 0.0 {
            return f64::NAN;
        }
        self.pairs.iter().map(|&(m, o, w)| g(m, o) * w).sum::<f64>() / self.wsum
    }

    fn mean_model(&self) -> f64 { self.average(|m, _| m) }
    fn mean_obs(&self) -> f64 { self.average(|_, o| o) }
    fn bias(&self) -> f64 { self.average(|m, o| m - o) }
    fn mae(&self) -> f64 { self.average(|m, o| (m - o).abs()) }
    fn rms(&self) -> f64 { self.average(|m, o| (m - o).powi(2)).sqrt() }

    fn rmsc(&self) -> f64 {
        let (mm, mo) = (self.mean_model(), self.mean_obs());
        self.average(|m, o| ((m - mm) - (o - mo)).powi(2)).sqrt()
    }

    fn std_model(&self) -> f64 {
        let mm = self.mean_model();
        self.average(|m, _| (m - mm).powi(2)).sqrt()
    }

    fn std_obs(&self) -> f64 {
        let mo = self.mean_obs();
        self.average(|_, o| (o - mo).powi(2)).sqrt()
    }

    fn cor(&self) -> f64 {
        let (mm, mo) = (self.mean_model(), self.mean_obs());
        let cov = self.average(|m, o| (m - mm) * (o - mo));
        let denom = (self.std_model() * self.std_obs()).max(0.0);
        if denom == 0.0 { f64::NAN } else { cov / denom }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};

    fn var() -> VariableId {
        VariableId::parse("tas").unwrap()
    }

    fn field(data: ndarray::ArrayD<f64>) -> Field {
        let nd = data.ndim();
        let (ny, nx) = (data.shape()[nd - 2], data.shape()[nd - 1]);
        let lat = Array::linspace(-30.0, 30.0, ny);
        let lon = Array::linspace(0.0, 360.0 - 360.0 / nx as f64, nx);
        Field::new("tas", data, lat, lon, Some("K".to_owned())).unwrap()
    }

    #[test]
    fn test_constant_offset() {
        let obs = field(array![[[280.0, 281.0, 282.0], [283.0, 284.0, 285.0]]].into_dyn());
        let model = field(obs.data.mapv(|v| v + 1.5));
        let stats = MeanClimateMetrics.compute(&var(), &model, &obs).unwrap();
        assert_abs_diff_eq!(stats["bias_xy"][ANNUAL], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(stats["rms_xy"][ANNUAL], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(stats["mae_xy"][ANNUAL], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(stats["rmsc_xy"][ANNUAL], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats["cor_xy"][ANNUAL], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats["rms_xyt"][ANNUAL], 1.5, epsilon = 1e-12);
        assert!(!stats["bias_xy"].contains_key("djf"));
    }

    #[test]
    fn test_seasons_for_annual_cycle() {
        let obs = field(Array::from_shape_fn(IxDyn(&[12, 2, 2]), |ix| ix[0] as f64));
        let model = field(Array::zeros(IxDyn(&[12, 2, 2])));
        let stats = MeanClimateMetrics.compute(&var(), &model, &obs).unwrap();
        // djf = (11*31 + 0*31 + 1*28.25) / (31+31+28.25)
        let djf_obs = (11.0 * 31.0 + 28.25) / 90.25;
        assert_abs_diff_eq!(stats["bias_xy"]["djf"], -djf_obs, epsilon = 1e-9);
        assert_abs_diff_eq!(stats["mean-obs_xy"]["jja"], 6.0 + (31.0 - 30.0) / 92.0, epsilon = 1e-9);
        assert_eq!(stats["std_xyt"].keys().collect::<Vec<_>>(), vec![ANNUAL]);
    }

    #[test]
    fn test_nan_points_ignored() {
        let obs = field(array![[[1.0, f64::NAN], [1.0, 1.0]]].into_dyn());
        let model = field(array![[[2.0, 100.0], [f64::NAN, 2.0]]].into_dyn());
        let stats = MeanClimateMetrics.compute(&var(), &model, &obs).unwrap();
        assert_abs_diff_eq!(stats["bias_xy"][ANNUAL], 1.0, epsilon = 1e-12);
        // zero variance leaves the correlation undefined
        assert!(!stats.contains_key("cor_xy"));
    }

    #[test]
    fn test_shape_mismatch() {
        let obs = field(Array::zeros(IxDyn(&[1, 2, 3])));
        let model = field(Array::zeros(IxDyn(&[1, 3, 2])));
        let err = MeanClimateMetrics.compute(&var(), &model, &obs).unwrap_err();
        assert!(matches!(err, LoadError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_fn_metrics_describe_falls_back() {
        let custom = FnMetrics::new("my statistics", |_v: &VariableId, _m: &Field, _o: &Field| Ok(StatValues::new()));
        assert!(custom.describe(&var()).is_err());
        assert_eq!(custom.description(), "my statistics");
        assert!(MeanClimateMetrics.describe(&var()).unwrap().contains_key("bias_xy"));
    }
}
