//! Land/sea fraction masks, shared by every data source in a run.
//!
//! Each source (model or observation) gets at most one land fraction array. It is either read
//! from the source's own `sftlf` file when the registry is built, or generated the first time
//! a masked region needs it. Failed generations are remembered too, so a source that has no
//! mask is only tried once.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{Array1, Array2, Axis, Ix2};

use crate::error::LoadError;
use crate::field::{Field, FieldIo};
use crate::grid::{Grid, GridRegridder, Regridder};

/// Variable name of land fraction in mask files.
pub const SFTLF: &str = "sftlf";

/// A land fraction (percent; 0 = ocean, 100 = land) on a lat/lon grid.
#[derive(Debug, Clone, PartialEq)]
pub struct LandFraction {
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
    pub sftlf: Array2<f64>,
}

impl LandFraction {
    /// Take the first (lat, lon) slice of a field, rescaling 0-1 fractions to percent.
    /// Missing points count as land.
    pub fn from_field(field: &Field) -> Result<Self, LoadError> {
        let mut data = field.data.clone();
        while data.ndim() > 2 {
            data = data.index_axis_move(Axis(0), 0);
        }
        let mut sftlf = data.into_dimensionality::<Ix2>()
            .map_err(|e| LoadError::from_shape_error(e, "(land fraction)".into(), &field.name))?;

        let max = sftlf.iter().copied().filter(|v| !v.is_nan()).fold(f64::NEG_INFINITY, f64::max);
        let scale = if max <= 1.0 { 100.0 } else { 1.0 };
        sftlf.mapv_inplace(|v| if v.is_nan() { 100.0 } else { v * scale });

        Ok(Self { lat: field.lat.clone(), lon: field.lon.clone(), sftlf })
    }

    /// This land fraction on another grid, using nearest-neighbour values if the grids differ.
    pub fn on_grid(&self, lat: &Array1<f64>, lon: &Array1<f64>) -> Result<Array2<f64>, LoadError> {
        let grid = Grid { name: String::new(), lat: lat.clone(), lon: lon.clone() };
        if grid.matches(&self.lat, &self.lon) {
            return Ok(self.sftlf.clone());
        }

        let field = Field::new(SFTLF, self.sftlf.clone().into_dyn(), self.lat.clone(), self.lon.clone(), None)?;
        let regridded = GridRegridder.regrid(&field, &grid, "", "nearest")?;
        regridded.data
            .into_dimensionality::<Ix2>()
            .map_err(|e| LoadError::from_shape_error(e, "(land fraction)".into(), SFTLF))
    }
}

/// Points to exclude for a region with masking value `value`: everywhere the land fraction
/// differs from it.
pub fn region_mask(sftlf: &Array2<f64>, value: f64) -> Array2<bool> {
    sftlf.mapv(|v| v != value)
}

/// Something that can produce a land fraction for an arbitrary grid when a data source does
/// not ship one.
pub trait LandSeaClassifier: Send + Sync {
    fn land_fraction(&self, lat: &Array1<f64>, lon: &Array1<f64>) -> Result<Array2<f64>, String>;
}

/// Used when no classifier is configured: masked regions are skipped for sources without
/// their own land fraction file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClassifier;

impl LandSeaClassifier for NoClassifier {
    fn land_fraction(&self, _lat: &Array1<f64>, _lon: &Array1<f64>) -> Result<Array2<f64>, String> {
        Err("no land/sea classifier is configured (set land_sea_mask_file in the parameter file)".to_owned())
    }
}

/// Classifies any grid by interpolating a reference land fraction file onto it.
#[derive(Debug, Clone)]
pub struct LandFractionFile {
    reference: LandFraction,
}

impl LandFractionFile {
    pub fn open(io: &dyn FieldIo, path: &Path) -> Result<Self, LoadError> {
        let field = io.read_field(path, SFTLF, None)?;
        Ok(Self { reference: LandFraction::from_field(&field)? })
    }
}

impl LandSeaClassifier for LandFractionFile {
    fn land_fraction(&self, lat: &Array1<f64>, lon: &Array1<f64>) -> Result<Array2<f64>, String> {
        self.reference.on_grid(lat, lon).map_err(|e| e.to_string())
    }
}

#[derive(Debug)]
pub struct SourceMask {
    name: String,
    /// Base name of the land fraction file, if one was read
    pub filename: Option<String>,
    pub checksum: Option<String>,
    raw: OnceCell<Result<LandFraction, String>>,
}

impl SourceMask {
    pub(crate) fn empty(name: &str) -> Self {
        Self { name: name.to_owned(), filename: None, checksum: None, raw: OnceCell::new() }
    }

    /// Try to read `name`'s land fraction from `path`. On failure the mask has no file name or
    /// checksum, and will be generated on first use.
    pub fn read(name: &str, path: &Path, io: &dyn FieldIo) -> Self {
        let mut entry = Self::empty(name);
        let loaded = io.read_field(path, SFTLF, None)
            .and_then(|f| LandFraction::from_field(&f))
            .and_then(|lf| io.checksum(path).map(|c| (lf, c)));

        match loaded {
            Ok((lf, checksum)) => {
                log::debug!("Read land fraction for {name} from {}", path.display());
                entry.filename = path.file_name().map(|f| f.to_string_lossy().into_owned());
                entry.checksum = Some(checksum);
                // a fresh cell cannot already be set
                let _ = entry.raw.set(Ok(lf));
            },
            Err(e) => log::debug!("No land fraction file for {name}: {e}"),
        }
        entry
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.raw.get(), Some(Ok(_)))
    }

    /// The cached land fraction, running `generate` if this is the first time it is needed.
    pub fn get_or_generate<F>(&self, generate: F) -> Result<&LandFraction, LoadError>
    where F: FnOnce() -> Result<LandFraction, String>
    {
        self.raw.get_or_init(|| {
            log::info!("Generating land fraction for {}", self.name);
            generate()
        })
        .as_ref()
        .map_err(|reason| LoadError::MaskUnavailable { source_name: self.name.clone(), reason: reason.clone() })
    }
}

/// All land fraction masks of a run, plus the one on the target grid.
///
/// The target grid's land fraction comes from the classifier. Without one, the first land
/// fraction file read for any source is put on the target grid instead.
#[derive(Debug)]
pub struct MaskRegistry {
    sources: BTreeMap<String, SourceMask>,
    grid: Grid,
    target: Result<Array2<f64>, String>,
}

impl MaskRegistry {
    pub fn new(target_grid: &Grid, classifier: &dyn LandSeaClassifier) -> Self {
        let target = classifier.land_fraction(&target_grid.lat, &target_grid.lon);
        if let Err(e) = &target {
            log::info!("No classifier land/sea mask for the target grid, will use a data set's land fraction: {e}");
        }
        Self { sources: BTreeMap::new(), grid: target_grid.clone(), target }
    }

    /// Register `name`'s land fraction file. A file that cannot be read still registers the
    /// source, with a mask to be generated on first use.
    pub fn load_source(&mut self, name: &str, path: &Path, io: &dyn FieldIo) {
        self.insert(SourceMask::read(name, path, io));
    }

    /// Register a mask read elsewhere, replacing any previous one of the same source.
    pub fn insert(&mut self, mask: SourceMask) {
        if self.target.is_err() {
            if let Some(Ok(lf)) = mask.raw.get() {
                match lf.on_grid(&self.grid.lat, &self.grid.lon) {
                    Ok(sftlf) => {
                        log::info!("Target grid land fraction taken from {}", mask.name);
                        self.target = Ok(sftlf);
                    },
                    Err(e) => log::debug!("Cannot put the land fraction of {} on the target grid: {e}", mask.name),
                }
            }
        }
        self.sources.insert(mask.name.clone(), mask);
    }

    pub fn get(&self, name: &str) -> Option<&SourceMask> {
        self.sources.get(name)
    }

    /// The mask entry for `name`, registering an empty one if needed.
    pub fn source(&mut self, name: &str) -> &SourceMask {
        self.sources.entry(name.to_owned()).or_insert_with(|| SourceMask::empty(name))
    }

    pub fn has_target_land_fraction(&self) -> bool {
        self.target.is_ok()
    }

    pub fn target_land_fraction(&self) -> Result<&Array2<f64>, LoadError> {
        self.target.as_ref()
            .map_err(|reason| LoadError::MaskUnavailable { source_name: "target_grid".to_owned(), reason: reason.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ndarray::array;

    /// Land north of the equator
    struct Hemispheres {
        calls: AtomicUsize,
    }

    impl LandSeaClassifier for Hemispheres {
        fn land_fraction(&self, lat: &Array1<f64>, lon: &Array1<f64>) -> Result<Array2<f64>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Array2::from_shape_fn((lat.len(), lon.len()), |(i, _)| if lat[i] > 0.0 { 100.0 } else { 0.0 }))
        }
    }

    #[test]
    fn test_region_mask() {
        let m = region_mask(&array![[0.0, 100.0], [50.0, 100.0]], 100.0);
        assert_eq!(m, array![[true, false], [true, false]]);
    }

    #[test]
    fn test_generation_happens_once() {
        let grid = Grid::uniform("g", -45.0, 4, 30.0, 0.0, 4, 90.0);
        let classifier = Hemispheres { calls: AtomicUsize::new(0) };
        let mut reg = MaskRegistry::new(&grid, &classifier);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

        let generate = || {
            let sftlf = classifier.land_fraction(&grid.lat, &grid.lon)?;
            Ok(LandFraction { lat: grid.lat.clone(), lon: grid.lon.clone(), sftlf })
        };
        let first = reg.source("ModelA").get_or_generate(generate).unwrap().clone();
        let second = reg.source("ModelA").get_or_generate(generate).unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_generation_is_cached() {
        let grid = Grid::uniform("g", -45.0, 4, 30.0, 0.0, 4, 90.0);
        let mut reg = MaskRegistry::new(&grid, &NoClassifier);
        assert!(reg.target_land_fraction().is_err());

        let err = reg.source("obs").get_or_generate(|| Err("nope".to_owned())).unwrap_err();
        assert!(matches!(err, LoadError::MaskUnavailable { .. }));
        let again = reg.source("obs").get_or_generate(|| panic!("should not be called again"));
        assert!(again.is_err());
    }

    #[test]
    fn test_fraction_rescaled_and_regridded() {
        let field = Field::new(SFTLF, array![[0.0, 1.0], [f64::NAN, 0.5]].into_dyn(), array![-10.0, 10.0], array![0.0, 180.0], None).unwrap();
        let lf = LandFraction::from_field(&field).unwrap();
        assert_eq!(lf.sftlf, array![[0.0, 100.0], [100.0, 50.0]]);

        let on_other = lf.on_grid(&array![9.0], &array![10.0, 175.0]).unwrap();
        assert_eq!(on_other, array![[100.0, 50.0]]);
    }

    #[test]
    fn test_target_taken_from_first_source_file() {
        let grid = Grid::uniform("g", -45.0, 4, 30.0, 0.0, 4, 90.0);
        let mut reg = MaskRegistry::new(&grid, &NoClassifier);
        assert!(!reg.has_target_land_fraction());

        reg.insert(SourceMask::empty("ModelA"));
        assert!(!reg.has_target_land_fraction());

        let obs = SourceMask::empty("ERA5");
        let sftlf = Array2::from_shape_fn((2, 2), |(i, _)| if i == 1 { 100.0 } else { 0.0 });
        let _ = obs.raw.set(Ok(LandFraction { lat: array![-45.0, 45.0], lon: array![0.0, 180.0], sftlf }));
        reg.insert(obs);

        let target = reg.target_land_fraction().unwrap();
        assert_eq!(target.dim(), (4, 4));
        assert_eq!(target.row(0).to_vec(), vec![0.0; 4]);
        assert_eq!(target.row(3).to_vec(), vec![100.0; 4]);
    }
}
