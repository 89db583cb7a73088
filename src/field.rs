//! In-memory gridded fields and the I/O layer that reads and writes them.

use std::path::Path;

use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use netcdf::extent::Extents;

use crate::config::RuntimeConfig;
use crate::error::{LoadError, PmpError};
use crate::region::Domain;
use crate::utils::{self, attr_value_to_f64, attr_value_to_string, file_sha256, get_str_attr, load_nc_var, write_nc_var};

/// Values at or above this magnitude are treated as missing on read; missing values are
/// written out as this.
pub const MISSING_VALUE: f64 = 1e20;

const LAT_NAMES: [&str; 3] = ["lat", "latitude", "nav_lat"];
const LON_NAMES: [&str; 3] = ["lon", "longitude", "nav_lon"];
const LEVEL_NAMES: [&str; 4] = ["plev", "lev", "level", "pressure"];

/// A variable on a latitude/longitude grid. Latitude and longitude are always the last two
/// axes of `data`; any leading axes (usually time) are kept as-is. Missing values are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data: ArrayD<f64>,
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
    pub units: Option<String>,
}

impl Field {
    pub fn new(name: &str, data: ArrayD<f64>, lat: Array1<f64>, lon: Array1<f64>, units: Option<String>) -> Result<Self, LoadError> {
        let shape = data.shape();
        let n = shape.len();
        if n < 2 || shape[n-2] != lat.len() || shape[n-1] != lon.len() {
            return Err(LoadError::Unreadable {
                file: "(in memory)".into(),
                varname: name.to_owned(),
                reason: format!("data shape {shape:?} does not end in (lat, lon) = ({}, {})", lat.len(), lon.len())
            });
        }
        Ok(Self { name: name.to_owned(), data, lat, lon, units })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Shape of the axes in front of (lat, lon)
    pub fn leading_shape(&self) -> &[usize] {
        let s = self.data.shape();
        &s[..s.len() - 2]
    }

    pub fn n_leading(&self) -> usize {
        self.leading_shape().iter().product()
    }

    /// Set every point where `mask` is true to NaN. `mask` must be on this field's (lat, lon)
    /// grid and applies to every leading index.
    pub fn mask_where(&mut self, mask: &Array2<bool>) -> Result<(), LoadError> {
        let grid_shape = [self.lat.len(), self.lon.len()];
        if mask.shape() != &grid_shape[..] {
            return Err(LoadError::MaskUnavailable {
                source_name: self.name.clone(),
                reason: format!("mask shape {:?} does not match the grid {:?}", mask.shape(), grid_shape),
            });
        }

        let nd = self.data.ndim();
        for (idx, v) in self.data.indexed_iter_mut() {
            if mask[[idx[nd-2], idx[nd-1]]] {
                *v = f64::NAN;
            }
        }
        Ok(())
    }

    /// Keep only the grid points inside `domain`.
    pub fn subset(&self, domain: &Domain) -> Field {
        let ilat: Vec<usize> = (0..self.lat.len()).filter(|&i| domain.contains_lat(self.lat[i])).collect();
        let ilon: Vec<usize> = (0..self.lon.len()).filter(|&i| domain.contains_lon(self.lon[i])).collect();
        let nd = self.data.ndim();
        let data = self.data
            .select(Axis(nd - 2), &ilat)
            .select(Axis(nd - 1), &ilon);
        Field {
            name: self.name.clone(),
            data,
            lat: self.lat.select(Axis(0), &ilat),
            lon: self.lon.select(Axis(0), &ilon),
            units: self.units.clone(),
        }
    }
}

/// Everything the pipeline needs from the file system. `NetcdfIo` is the real
/// implementation; anything else (e.g. an in-memory store) can be plugged into the orchestrator.
pub trait FieldIo: Send + Sync {
    /// Read `varname` from `path`, selecting a single pressure level (in Pa) if given.
    fn read_field(&self, path: &Path, varname: &str, level: Option<f64>) -> Result<Field, LoadError>;

    /// A global attribute of the file as a string, if the file and attribute exist.
    fn global_attribute(&self, path: &Path, name: &str) -> Option<String>;

    fn checksum(&self, path: &Path) -> Result<String, LoadError> {
        file_sha256(path).map_err(|e| LoadError::Unreadable {
            file: path.to_owned(), varname: String::new(), reason: e.to_string()
        })
    }

    fn write_field(&self, path: &Path, field: &Field) -> Result<(), PmpError>;
}

#[derive(Debug, Clone, Default)]
pub struct NetcdfIo {
    runtime: RuntimeConfig,
}

impl NetcdfIo {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }
}

impl FieldIo for NetcdfIo {
    fn read_field(&self, path: &Path, varname: &str, level: Option<f64>) -> Result<Field, LoadError> {
        if !path.exists() {
            return Err(LoadError::FileNotFound { path: path.to_owned() });
        }

        let ds = netcdf::open(path)
            .map_err(|e| LoadError::from_nc_error(e, path.to_owned(), varname))?;
        let var = ds.variable(varname)
            .ok_or_else(|| LoadError::VariableMissing { file: path.to_owned(), varname: varname.to_owned() })?;

        let dim_names: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
        let find_dim = |names: &[&str]| dim_names.iter().position(|d| names.contains(&d.to_lowercase().as_str()));
        let unreadable = |reason: String| LoadError::Unreadable { file: path.to_owned(), varname: varname.to_owned(), reason };

        let ilat = find_dim(&LAT_NAMES[..])
            .ok_or_else(|| unreadable(format!("no latitude dimension among {dim_names:?}")))?;
        let ilon = find_dim(&LON_NAMES[..])
            .ok_or_else(|| unreadable(format!("no longitude dimension among {dim_names:?}")))?;

        let mut data = var.values_arr::<f64, _>(Extents::All)
            .map_err(|e| LoadError::from_nc_error(e, path.to_owned(), varname))?;

        let fill = var.fill_value::<f64>().ok().flatten();
        let missing = var.attribute("missing_value")
            .and_then(|a| a.value().ok())
            .and_then(attr_value_to_f64);
        data.mapv_inplace(|v| {
            if Some(v) == fill || Some(v) == missing || v.abs() >= MISSING_VALUE {
                f64::NAN
            } else {
                v
            }
        });

        // Select the level before reordering, tracking where lat/lon end up
        let mut axes: Vec<usize> = (0..dim_names.len()).collect();
        if let Some(level) = level {
            let ilev = find_dim(&LEVEL_NAMES[..])
                .ok_or_else(|| unreadable(format!("a level of {level} Pa was requested but no level dimension is among {dim_names:?}")))?;
            let coord = load_nc_var(&ds, &dim_names[ilev])?;
            let idx = find_level_index(&coord, level)
                .ok_or_else(|| unreadable(format!("level {level} Pa not found in {} (values {coord})", dim_names[ilev])))?;
            data = data.index_axis_move(Axis(ilev), idx);
            axes.remove(ilev);
        }

        let pos_lat = axes.iter().position(|&a| a == ilat).unwrap_or(0);
        let pos_lon = axes.iter().position(|&a| a == ilon).unwrap_or(0);
        let mut order: Vec<usize> = (0..axes.len()).filter(|&i| i != pos_lat && i != pos_lon).collect();
        order.push(pos_lat);
        order.push(pos_lon);
        let data = data.permuted_axes(IxDyn(&order)).as_standard_layout().into_owned();

        let lat = load_nc_var(&ds, &dim_names[ilat])?;
        let lon = load_nc_var(&ds, &dim_names[ilon])?;
        let units = get_str_attr(&var, "units");
        log::debug!("Read {varname} with shape {:?} from {}", data.shape(), path.display());

        Field::new(varname, data, lat, lon, units)
            .map_err(|_| unreadable("coordinate lengths do not match the data shape".to_owned()))
    }

    fn global_attribute(&self, path: &Path, name: &str) -> Option<String> {
        let ds = netcdf::open(path).ok()?;
        let attr = ds.attribute(name)?;
        attr.value().ok().and_then(attr_value_to_string)
    }

    fn write_field(&self, path: &Path, field: &Field) -> Result<(), PmpError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PmpError::from_io_error(e, parent.to_owned()))?;
        }

        let nc_err = |e| PmpError::from_nc_error(e, path.to_owned());
        let mut ds = netcdf::create(path).map_err(nc_err)?;
        let lead_names: Vec<String> = match field.leading_shape().len() {
            1 => vec!["time".to_owned()],
            n => (0..n).map(|i| format!("dim{i}")).collect(),
        };
        for (name, &len) in lead_names.iter().zip(field.leading_shape()) {
            ds.add_dimension(name, len).map_err(nc_err)?;
        }
        ds.add_dimension("lat", field.lat.len()).map_err(nc_err)?;
        ds.add_dimension("lon", field.lon.len()).map_err(nc_err)?;

        let compression = self.runtime.netcdf.compression();
        write_nc_var(&mut ds, &field.lat.clone().into_dyn(), "lat", &["lat"], Some("degrees_north"), None, None)
            .map_err(nc_err)?;
        write_nc_var(&mut ds, &field.lon.clone().into_dyn(), "lon", &["lon"], Some("degrees_east"), None, None)
            .map_err(nc_err)?;

        let mut dims: Vec<&str> = lead_names.iter().map(|s| s.as_str()).collect();
        dims.extend(["lat", "lon"]);
        let filled = field.data.mapv(|v| if v.is_nan() { MISSING_VALUE } else { v });
        write_nc_var(&mut ds, &filled, &field.name, &dims, field.units.as_deref(), Some(MISSING_VALUE), compression)
            .map_err(nc_err)?;

        log::debug!("Wrote {} to {}", field.name, utils::nc_file(&ds).display());
        Ok(())
    }
}

/// Index of `level` (Pa) in a level coordinate given either in Pa or in hPa.
fn find_level_index(coord: &Array1<f64>, level: f64) -> Option<usize> {
    let tol = 1e-3 * level.abs().max(1.0);
    coord.iter().position(|&c| (c - level).abs() < tol)
        .or_else(|| coord.iter().position(|&c| (c * 100.0 - level).abs() < tol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn small_field() -> Field {
        let data = Array3::from_shape_fn((2, 3, 4), |(t, i, j)| (t * 100 + i * 10 + j) as f64).into_dyn();
        Field::new("tas", data, array![-45.0, 0.0, 45.0], array![0.0, 90.0, 180.0, 270.0], Some("K".to_owned())).unwrap()
    }

    #[test]
    fn test_field_shape_checked() {
        let data = ArrayD::zeros(IxDyn(&[3, 4]));
        assert!(Field::new("x", data, array![0.0, 1.0], array![0.0, 1.0, 2.0, 3.0], None).is_err());
    }

    #[test]
    fn test_mask_where_applies_to_all_times() {
        let mut f = small_field();
        let mut mask = Array2::from_elem((3, 4), false);
        mask[[1, 2]] = true;
        f.mask_where(&mask).unwrap();
        assert!(f.data[[0, 1, 2]].is_nan());
        assert!(f.data[[1, 1, 2]].is_nan());
        assert_eq!(f.data[[1, 1, 1]], 111.0);
    }

    #[test]
    fn test_mask_where_rejects_other_grid() {
        let mut f = small_field();
        let mask = Array2::from_elem((4, 3), true);
        let err = f.mask_where(&mask).unwrap_err();
        assert!(matches!(err, LoadError::MaskUnavailable { .. }));
        assert!(!err.is_fatal());
        assert!(f.data.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_subset_wrapping_domain() {
        let f = small_field();
        let d = Domain::lat_lon([0.0, 90.0], [260.0, 10.0]);
        let s = f.subset(&d);
        assert_eq!(s.shape(), &[2, 2, 2]);
        assert_eq!(s.lat.to_vec(), vec![0.0, 45.0]);
        assert_eq!(s.lon.to_vec(), vec![0.0, 270.0]);
        assert_eq!(s.data[[1, 0, 1]], 113.0);
    }

    #[test]
    fn test_level_index_pa_or_hpa() {
        assert_eq!(find_level_index(&array![100000.0, 85000.0, 50000.0], 85000.0), Some(1));
        assert_eq!(find_level_index(&array![1000.0, 850.0, 500.0], 50000.0), Some(2));
        assert_eq!(find_level_index(&array![1000.0, 850.0], 20000.0), None);
    }

    #[test]
    fn test_netcdf_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sub").join("tas.nc");
        let mut f = small_field();
        f.data[[0, 0, 0]] = f64::NAN;

        let io = NetcdfIo::default();
        io.write_field(&p, &f).unwrap();
        let back = io.read_field(&p, "tas", None).unwrap();
        assert_eq!(back.shape(), f.shape());
        assert!(back.data[[0, 0, 0]].is_nan());
        assert_eq!(back.data[[1, 2, 3]], 123.0);
        assert_eq!(back.units.as_deref(), Some("K"));
        assert_eq!(back.lon, f.lon);

        assert!(matches!(io.read_field(&p, "pr", None), Err(LoadError::VariableMissing { .. })));
        assert!(matches!(io.read_field(&dir.path().join("nope.nc"), "tas", None), Err(LoadError::FileNotFound { .. })));
        assert_eq!(io.checksum(&p).unwrap().len(), 64);
    }
}
