//! Named regions: a land-fraction masking value, a lat/lon domain, or both.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::utils::normalize_lon;

/// Written in the `regions` table in place of a region name to mean "the default regions".
pub const DEFAULT_REGIONS_MARKER: &str = "*";

pub const DEFAULT_REGION_LIST: [&str; 4] = ["global", "NHEX", "SHEX", "TROPICS"];

pub const LAND_VALUE: f64 = 100.0;
pub const OCEAN_VALUE: f64 = 0.0;

/// A latitude/longitude bounding box. Bounds are inclusive and may be given in either order;
/// a longitude range whose start is east of its end wraps through the prime meridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Domain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<[f64; 2]>,
}

impl Domain {
    pub fn lat_band(lat0: f64, lat1: f64) -> Self {
        Self { latitude: Some([lat0, lat1]), longitude: None }
    }

    pub fn lat_lon(lat: [f64; 2], lon: [f64; 2]) -> Self {
        Self { latitude: Some(lat), longitude: Some(lon) }
    }

    pub fn contains_lat(&self, lat: f64) -> bool {
        match self.latitude {
            Some([a, b]) => lat >= a.min(b) && lat <= a.max(b),
            None => true,
        }
    }

    pub fn contains_lon(&self, lon: f64) -> bool {
        let [a, b] = match self.longitude {
            Some(r) => r,
            None => return true,
        };
        if (b - a).abs() >= 360.0 {
            return true;
        }

        let lon = normalize_lon(lon);
        let start = normalize_lon(a);
        let end = normalize_lon(b);
        if start <= end {
            lon >= start && lon <= end
        } else {
            lon >= start || lon <= end
        }
    }
}

/// How a domain may be written in the parameter file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DomainSpec {
    /// `{latitude = [30, 90], longitude = [0, 360]}`
    Keywords {
        latitude: Option<[f64; 2]>,
        longitude: Option<[f64; 2]>,
    },
    /// `[[30, 90], [0, 360]]`, latitude first
    Positional(Vec<[f64; 2]>),
    /// The name of another region whose domain should be reused, e.g. `"NHEX"`
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct RegionSpec {
    pub value: Option<f64>,
    pub domain: Option<DomainSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,
}

impl Region {
    pub fn global() -> Self {
        Self { id: "global".to_owned(), value: None, domain: None }
    }
}

#[derive(Debug, Clone)]
pub struct RegionRegistry {
    specs: BTreeMap<String, Region>,
    per_variable: BTreeMap<String, Vec<String>>,
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self { specs: default_region_specs(), per_variable: BTreeMap::new() }
    }
}

impl RegionRegistry {
    /// Build the registry from the parameter file's `regions`, `regions_values` and
    /// `regions_specs` tables layered over the built-in regions.
    pub fn new(
        per_variable: BTreeMap<String, Vec<String>>,
        values: &BTreeMap<String, f64>,
        specs: &BTreeMap<String, RegionSpec>
    ) -> Result<Self, LoadError> {
        let mut registry = Self { specs: default_region_specs(), per_variable };

        // Specs first so that named domains may refer to built-in regions only
        for (name, spec) in specs {
            let domain = spec.domain.as_ref()
                .map(|d| registry.resolve_domain(name, d))
                .transpose()?;
            registry.specs.insert(name.clone(), Region { id: name.clone(), value: spec.value, domain });
        }

        for (name, &value) in values {
            registry.specs.entry(name.clone())
                .and_modify(|r| r.value = Some(value))
                .or_insert_with(|| Region { id: name.clone(), value: Some(value), domain: None });
        }

        Ok(registry)
    }

    fn resolve_domain(&self, region: &str, spec: &DomainSpec) -> Result<Domain, LoadError> {
        match spec {
            DomainSpec::Keywords { latitude, longitude } => Ok(Domain { latitude: *latitude, longitude: *longitude }),
            DomainSpec::Positional(ranges) => match ranges.as_slice() {
                [lat] => Ok(Domain { latitude: Some(*lat), longitude: None }),
                [lat, lon] => Ok(Domain::lat_lon(*lat, *lon)),
                _ => Err(LoadError::ConfigInvalid(format!(
                    "positional domain for region '{region}' must have one or two ranges, got {}", ranges.len()
                ))),
            },
            DomainSpec::Named(other) => self.specs.get(other)
                .and_then(|r| r.domain)
                .ok_or_else(|| LoadError::ConfigInvalid(format!(
                    "region '{region}' refers to '{other}', which is not a region with a domain"
                ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Region> {
        self.specs.get(name)
    }

    /// The regions to compute for a variable, in configured order. Variables without an entry
    /// get the default list; a `"*"` entry expands to the default list in place.
    pub fn regions_for(&self, var: &str) -> Result<Vec<Region>, LoadError> {
        let default_names = || DEFAULT_REGION_LIST.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let names = match self.per_variable.get(var) {
            Some(names) => names.iter()
                .flat_map(|n| if n == DEFAULT_REGIONS_MARKER { default_names() } else { vec![n.clone()] })
                .collect::<Vec<_>>(),
            None => default_names(),
        };

        let mut regions: Vec<Region> = Vec::with_capacity(names.len());
        for name in names {
            if regions.iter().any(|r| r.id == name) {
                continue;
            }
            let region = self.specs.get(&name)
                .ok_or_else(|| LoadError::ConfigInvalid(format!("unknown region '{name}' requested for variable '{var}'")))?;
            regions.push(region.clone());
        }
        Ok(regions)
    }
}

fn default_region_specs() -> BTreeMap<String, Region> {
    let band = |lat0, lat1| Some(Domain::lat_band(lat0, lat1));
    let boxed = |lat: [f64; 2], lon: [f64; 2]| Some(Domain::lat_lon(lat, lon));
    let land = Some(LAND_VALUE);
    let ocean = Some(OCEAN_VALUE);

    let regions: Vec<(&str, Option<f64>, Option<Domain>)> = vec![
        ("global", None, None),
        ("NHEX", None, band(30.0, 90.0)),
        ("SHEX", None, band(-90.0, -30.0)),
        ("TROPICS", None, band(-30.0, 30.0)),
        ("90S50S", None, band(-90.0, -50.0)),
        ("50S20S", None, band(-50.0, -20.0)),
        ("20S20N", None, band(-20.0, 20.0)),
        ("20N50N", None, band(20.0, 50.0)),
        ("50N90N", None, band(50.0, 90.0)),
        ("land", land, None),
        ("land_NHEX", land, band(30.0, 90.0)),
        ("land_SHEX", land, band(-90.0, -30.0)),
        ("land_TROPICS", land, band(-30.0, 30.0)),
        ("ocean", ocean, None),
        ("ocean_NHEX", ocean, band(30.0, 90.0)),
        ("ocean_SHEX", ocean, band(-90.0, -30.0)),
        ("ocean_TROPICS", ocean, band(-30.0, 30.0)),
        // modes of variability
        ("NAO", None, boxed([20.0, 80.0], [-90.0, 40.0])),
        ("PNA", None, boxed([20.0, 85.0], [120.0, 240.0])),
        ("PDO", None, boxed([20.0, 70.0], [110.0, 260.0])),
        // monsoon domains (NAM and SAM are the monsoon definitions, not the annular modes)
        ("AllM", None, boxed([-45.0, 45.0], [0.0, 360.0])),
        ("NAM", None, boxed([0.0, 45.0], [210.0, 310.0])),
        ("SAM", None, boxed([-45.0, 0.0], [240.0, 330.0])),
        ("NAFM", None, boxed([0.0, 45.0], [310.0, 60.0])),
        ("SAFM", None, boxed([-45.0, 0.0], [0.0, 90.0])),
        ("ASM", None, boxed([0.0, 45.0], [60.0, 180.0])),
        ("AUSM", None, boxed([-45.0, 0.0], [90.0, 160.0])),
    ];

    regions.into_iter()
        .map(|(id, value, domain)| (id.to_owned(), Region { id: id.to_owned(), value, domain }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_regions_for_unconfigured_variable() {
        let reg = RegionRegistry::default();
        let ids: Vec<_> = reg.regions_for("tas").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["global", "NHEX", "SHEX", "TROPICS"]);
    }

    #[test]
    fn test_marker_expands_and_values_override() {
        let mut per_var = BTreeMap::new();
        per_var.insert("tas".to_owned(), vec!["land".to_owned(), "*".to_owned(), "terre".to_owned()]);
        let mut values = BTreeMap::new();
        values.insert("land".to_owned(), 1.0);
        values.insert("terre".to_owned(), 100.0);
        let reg = RegionRegistry::new(per_var, &values, &BTreeMap::new()).unwrap();

        let regions = reg.regions_for("tas").unwrap();
        let ids: Vec<_> = regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["land", "global", "NHEX", "SHEX", "TROPICS", "terre"]);
        assert_eq!(regions[0].value, Some(1.0));
        assert_eq!(regions[5].value, Some(100.0));
    }

    #[test]
    fn test_unknown_region_is_config_error() {
        let mut per_var = BTreeMap::new();
        per_var.insert("pr".to_owned(), vec!["atlantis".to_owned()]);
        let reg = RegionRegistry::new(per_var, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert!(reg.regions_for("pr").unwrap_err().is_fatal());
    }

    #[test]
    fn test_domain_specs() {
        let toml_str = r#"
            [box]
            domain = {latitude = [-10.0, 10.0], longitude = [300.0, 20.0]}
            [pos]
            value = 0.0
            domain = [[-10.0, 10.0]]
            [alias]
            domain = "NHEX"
        "#;
        let specs: BTreeMap<String, RegionSpec> = toml::from_str(toml_str).unwrap();
        let reg = RegionRegistry::new(BTreeMap::new(), &BTreeMap::new(), &specs).unwrap();

        let b = reg.get("box").unwrap().domain.unwrap();
        assert!(b.contains_lon(350.0));
        assert!(b.contains_lon(10.0));
        assert!(!b.contains_lon(100.0));

        assert_eq!(reg.get("pos").unwrap().domain, Some(Domain::lat_band(-10.0, 10.0)));
        assert_eq!(reg.get("alias").unwrap().domain, Some(Domain::lat_band(30.0, 90.0)));
    }

    #[test]
    fn test_wrapping_longitudes() {
        let nao = RegionRegistry::default().get("NAO").unwrap().domain.unwrap();
        assert!(nao.contains_lon(-45.0));
        assert!(nao.contains_lon(315.0));
        assert!(nao.contains_lon(30.0));
        assert!(!nao.contains_lon(180.0));

        let allm = RegionRegistry::default().get("AllM").unwrap().domain.unwrap();
        assert!(allm.contains_lon(359.0));
        assert!(allm.contains_lat(-45.0));
        assert!(!allm.contains_lat(46.0));
    }
}
