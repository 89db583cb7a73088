//! The common target grid and horizontal regridding onto it.

use ndarray::{Array1, Array3, IxDyn};
use serde::Deserialize;

use crate::error::{LoadError, PmpError};
use crate::field::Field;
use crate::utils::normalize_lon;

/// Name of the built-in 2.5 degree global grid.
pub const GRID_2P5: &str = "2.5x2.5";

const COORD_TOLERANCE: f64 = 1e-6;

/// How the target grid is given in the parameter file: either the name of a built-in grid
/// or the parameters of a uniform grid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum GridSpec {
    Named(String),
    Uniform {
        name: Option<String>,
        lat_start: f64,
        nlat: usize,
        dlat: f64,
        lon_start: f64,
        nlon: usize,
        dlon: f64,
    },
}

impl GridSpec {
    /// The grid name used in output file names and `GridInfo`.
    pub fn name(&self) -> String {
        match self {
            GridSpec::Named(n) => n.clone(),
            GridSpec::Uniform { name: Some(n), .. } => n.clone(),
            GridSpec::Uniform { name: None, dlat, dlon, .. } => format!("{dlat}x{dlon}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub name: String,
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
}

impl Grid {
    pub fn uniform(name: &str, lat_start: f64, nlat: usize, dlat: f64, lon_start: f64, nlon: usize, dlon: f64) -> Self {
        Self {
            name: name.to_owned(),
            lat: Array1::from_shape_fn(nlat, |i| lat_start + i as f64 * dlat),
            lon: Array1::from_shape_fn(nlon, |i| lon_start + i as f64 * dlon),
        }
    }

    pub fn from_spec(spec: &GridSpec) -> Result<Self, PmpError> {
        match spec {
            GridSpec::Named(n) if n == GRID_2P5 => Ok(Self::uniform(GRID_2P5, -88.875, 72, 2.5, 0.0, 144, 2.5)),
            GridSpec::Named(n) => Err(PmpError::UnknownTargetGrid(n.clone())),
            &GridSpec::Uniform { lat_start, nlat, dlat, lon_start, nlon, dlon, .. } => {
                if nlat == 0 || nlon == 0 {
                    return Err(PmpError::invalid_config("target_grid", "a uniform grid needs at least one point in each direction"));
                }
                Ok(Self::uniform(&spec.name(), lat_start, nlat, dlat, lon_start, nlon, dlon))
            }
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }

    /// True if `lat`/`lon` describe this grid (longitudes compared modulo 360).
    pub fn matches(&self, lat: &Array1<f64>, lon: &Array1<f64>) -> bool {
        lat.len() == self.lat.len() && lon.len() == self.lon.len()
            && lat.iter().zip(self.lat.iter()).all(|(a, b)| (a - b).abs() < COORD_TOLERANCE)
            && lon.iter().zip(self.lon.iter()).all(|(a, b)| {
                let d = (normalize_lon(*a) - normalize_lon(*b)).abs();
                d < COORD_TOLERANCE || (360.0 - d) < COORD_TOLERANCE
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegridMethod {
    Nearest,
    Linear,
}

impl RegridMethod {
    /// Methods this crate does not implement (e.g. "conservative") fall back to linear.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "nearest" | "nearest_s2d" | "nearest_d2s" => Self::Nearest,
            "linear" | "bilinear" => Self::Linear,
            other => {
                log::debug!("Regrid method '{other}' is not available, using linear interpolation");
                Self::Linear
            }
        }
    }
}

/// Horizontal regridding onto the target grid. `tool` and `method` are the configured
/// names; implementations may ignore the tool.
pub trait Regridder: Send + Sync {
    fn regrid(&self, field: &Field, target: &Grid, tool: &str, method: &str) -> Result<Field, LoadError>;
}

/// Interpolates each (lat, lon) slice independently. Longitude is periodic, latitudes beyond
/// the source range take the nearest edge row, and NaN inputs are excluded from the weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridRegridder;

impl Regridder for GridRegridder {
    fn regrid(&self, field: &Field, target: &Grid, _tool: &str, method: &str) -> Result<Field, LoadError> {
        if target.matches(&field.lat, &field.lon) {
            return Ok(field.clone());
        }

        let method = RegridMethod::from_name(method);
        let reshape_err = |e: ndarray::ShapeError| LoadError::Unreadable {
            file: "(regrid)".into(), varname: field.name.clone(), reason: e.to_string()
        };

        let nlead = field.n_leading();
        let (nlat, nlon) = (field.lat.len(), field.lon.len());
        let src = field.data.as_standard_layout().into_owned()
            .into_shape((nlead, nlat, nlon))
            .map_err(reshape_err)?;

        let src_lat = field.lat.to_vec();
        let src_lon = field.lon.to_vec();
        let lat_w: Vec<Vec<(usize, f64)>> = target.lat.iter()
            .map(|&y| pick(lat_weights(&src_lat, y), method))
            .collect();
        let lon_w: Vec<Vec<(usize, f64)>> = target.lon.iter()
            .map(|&x| pick(lon_weights(&src_lon, x), method))
            .collect();

        let (tlat, tlon) = target.shape();
        let mut out = Array3::from_elem((nlead, tlat, tlon), f64::NAN);
        for t in 0..nlead {
            for (i, wi) in lat_w.iter().enumerate() {
                for (j, wj) in lon_w.iter().enumerate() {
                    let mut num = 0.0;
                    let mut den = 0.0;
                    for &(si, a) in wi {
                        for &(sj, b) in wj {
                            let v = src[[t, si, sj]];
                            if !v.is_nan() {
                                num += a * b * v;
                                den += a * b;
                            }
                        }
                    }
                    if den > 0.0 {
                        out[[t, i, j]] = num / den;
                    }
                }
            }
        }

        let mut shape = field.leading_shape().to_vec();
        shape.extend([tlat, tlon]);
        let data = out.into_shape(IxDyn(&shape)).map_err(reshape_err)?;
        Field::new(&field.name, data, target.lat.clone(), target.lon.clone(), field.units.clone())
    }
}

fn pick(weights: Vec<(usize, f64)>, method: RegridMethod) -> Vec<(usize, f64)> {
    match method {
        RegridMethod::Linear => weights,
        RegridMethod::Nearest => weights.into_iter()
            .fold(None, |best: Option<(usize, f64)>, w| match best {
                Some(b) if b.1 >= w.1 => Some(b),
                _ => Some(w),
            })
            .map(|(i, _)| vec![(i, 1.0)])
            .unwrap_or_default(),
    }
}

/// Linear interpolation weights for `y` on a monotonic (either direction) axis.
fn lat_weights(src: &[f64], y: f64) -> Vec<(usize, f64)> {
    let mut order: Vec<usize> = (0..src.len()).collect();
    order.sort_by(|&a, &b| src[a].total_cmp(&src[b]));
    let (first, last) = match (order.first(), order.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return Vec::new(),
    };

    if y <= src[first] {
        return vec![(first, 1.0)];
    }
    if y >= src[last] {
        return vec![(last, 1.0)];
    }
    for k in 0..order.len() - 1 {
        let (a, b) = (order[k], order[k + 1]);
        if y >= src[a] && y <= src[b] {
            let span = src[b] - src[a];
            let w = if span > 0.0 { (y - src[a]) / span } else { 0.0 };
            return vec![(a, 1.0 - w), (b, w)];
        }
    }
    vec![(last, 1.0)]
}

/// Like `lat_weights`, but treating the axis as periodic over 360 degrees.
fn lon_weights(src: &[f64], x: f64) -> Vec<(usize, f64)> {
    let norm: Vec<f64> = src.iter().map(|&l| normalize_lon(l)).collect();
    let mut order: Vec<usize> = (0..norm.len()).collect();
    order.sort_by(|&a, &b| norm[a].total_cmp(&norm[b]));
    let x = normalize_lon(x);

    let n = order.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![(order[0], 1.0)];
    }

    for k in 0..n {
        let a = order[k];
        let b = order[(k + 1) % n];
        let lo = norm[a];
        let mut hi = norm[b];
        let mut xx = x;
        if k == n - 1 {
            // the segment that crosses 360
            hi += 360.0;
            if xx < lo {
                xx += 360.0;
            }
        }
        if xx >= lo && xx <= hi {
            let span = hi - lo;
            let w = if span > 0.0 { (xx - lo) / span } else { 0.0 };
            return vec![(a, 1.0 - w), (b, w)];
        }
    }
    vec![(order[0], 1.0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_2p5_grid() {
        let g = Grid::from_spec(&GridSpec::Named("2.5x2.5".to_owned())).unwrap();
        assert_eq!(g.shape(), (72, 144));
        assert_abs_diff_eq!(g.lat[0], -88.875);
        assert_abs_diff_eq!(g.lat[71], 88.625);
        assert_abs_diff_eq!(g.lon[143], 357.5);
    }

    #[test]
    fn test_unknown_grid() {
        let err = Grid::from_spec(&GridSpec::Named("1x1".to_owned())).unwrap_err();
        assert!(matches!(err, PmpError::UnknownTargetGrid(_)));
    }

    #[test]
    fn test_uniform_spec_from_toml() {
        #[derive(Deserialize)]
        struct T { target_grid: GridSpec }
        let t: T = toml::from_str("target_grid = {lat_start = -45.0, nlat = 4, dlat = 30.0, lon_start = 0.0, nlon = 4, dlon = 90.0}").unwrap();
        let g = Grid::from_spec(&t.target_grid).unwrap();
        assert_eq!(g.name, "30x90");
        assert_eq!(g.shape(), (4, 4));
    }

    #[test]
    fn test_same_grid_passes_through() {
        let g = Grid::uniform("g", -45.0, 4, 30.0, 0.0, 4, 90.0);
        let data = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as f64).into_dyn();
        let f = Field::new("x", data, g.lat.clone(), g.lon.clone(), None).unwrap();
        let r = GridRegridder.regrid(&f, &g, "regrid2", "linear").unwrap();
        assert_eq!(r, f);
    }

    #[test]
    fn test_linear_regrid_periodic_and_nan_aware() {
        let data = array![[0.0, 10.0, 20.0, 30.0], [f64::NAN, 10.0, 20.0, 30.0]].into_dyn();
        let f = Field::new("x", data, array![0.0, 10.0], array![0.0, 90.0, 180.0, 270.0], None).unwrap();
        let target = Grid { name: "t".to_owned(), lat: array![0.0, 5.0], lon: array![45.0, 315.0] };
        let r = GridRegridder.regrid(&f, &target, "", "linear").unwrap();
        assert_abs_diff_eq!(r.data[[0, 0]], 5.0);
        // between 270 (30) and 360 (0)
        assert_abs_diff_eq!(r.data[[0, 1]], 15.0);
        // the NaN at (10, 0) is dropped, leaving the other three corners
        assert_abs_diff_eq!(r.data[[1, 0]], (0.25 * 0.0 + 0.25 * 10.0 + 0.25 * 10.0) / 0.75);
    }

    #[test]
    fn test_nearest_regrid() {
        let data = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let f = Field::new("x", data, array![-10.0, 10.0], array![0.0, 180.0], None).unwrap();
        let target = Grid { name: "t".to_owned(), lat: array![8.0], lon: array![170.0, 350.0] };
        let r = GridRegridder.regrid(&f, &target, "", "nearest").unwrap();
        assert_eq!(r.data.as_slice().unwrap(), &[4.0, 3.0]);
    }
}
