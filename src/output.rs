//! The in-memory results document for one variable.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::config::{DescriptionSource, RunConfig};
use crate::dataset::DataSource;
use crate::field::FieldIo;
use crate::metrics::{MetricDoc, StatValues};
use crate::region::Region;
use crate::variable::VariableId;

pub const DISCLAIMER: &str = include_str!("../share/disclaimer.txt");
pub const NOT_AVAILABLE: &str = "N/A";

/// `SimulationDescription` entries filled in unless the parameter file overrides them.
pub const DEFAULT_DESCRIPTION_MAPPING: [(&str, &str); 6] = [
    ("ModelActivity", "project_id"),
    ("ModellingGroup", "institute_id"),
    ("Experiment", "experiment"),
    ("ModelFreeSpace", "ModelFreeSpace"),
    ("Realization", "realization"),
    ("creation_date", "creation_date"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridInfo {
    #[serde(rename = "RegridMethod")]
    pub regrid_method: String,
    #[serde(rename = "RegridTool")]
    pub regrid_tool: String,
    #[serde(rename = "GridName")]
    pub grid_name: String,
    #[serde(rename = "GridResolution")]
    pub grid_resolution: Vec<usize>,
}

/// `realization -> region -> statistics`
pub type RealizationResults = BTreeMap<String, BTreeMap<String, StatValues>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferenceResults {
    pub source: Value,
    #[serde(flatten)]
    pub realizations: RealizationResults,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(rename = "SimulationDescription", skip_serializing_if = "Option::is_none")]
    pub simulation_description: Option<BTreeMap<String, String>>,
    #[serde(rename = "InputClimatologyFileName", skip_serializing_if = "Option::is_none")]
    pub input_climatology_file_name: Option<String>,
    #[serde(rename = "InputClimatologyMD5", skip_serializing_if = "Option::is_none")]
    pub input_climatology_md5: Option<String>,
    #[serde(rename = "InputRegionFileName")]
    pub input_region_file_name: Option<String>,
    #[serde(rename = "InputRegionMD5")]
    pub input_region_md5: Option<String>,
    #[serde(flatten)]
    pub references: BTreeMap<String, ReferenceResults>,
}

impl TestResults {
    pub fn is_described(&self) -> bool {
        self.simulation_description.is_some()
    }
}

/// Everything written for one variable except the version, structure and provenance
/// blocks, which the result store adds.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsDocument {
    #[serde(rename = "DISCLAIMER")]
    pub disclaimer: String,
    #[serde(rename = "Variable")]
    pub variable: VariableId,
    #[serde(rename = "References")]
    pub references: BTreeMap<String, Value>,
    #[serde(rename = "RegionalMasking")]
    pub regional_masking: BTreeMap<String, Region>,
    #[serde(rename = "RESULTS")]
    pub results: BTreeMap<String, TestResults>,
    #[serde(rename = "METRICS")]
    pub metrics: BTreeMap<String, MetricDoc>,
    #[serde(rename = "GridInfo", skip_serializing_if = "Option::is_none")]
    pub grid_info: Option<GridInfo>,
}

impl MetricsDocument {
    pub fn new(variable: &VariableId) -> Self {
        Self {
            disclaimer: DISCLAIMER.to_owned(),
            variable: variable.clone(),
            references: BTreeMap::new(),
            regional_masking: BTreeMap::new(),
            results: BTreeMap::new(),
            metrics: BTreeMap::new(),
            grid_info: None,
        }
    }

    pub fn add_region(&mut self, region: &Region) {
        self.regional_masking.insert(region.id.clone(), region.clone());
    }

    pub fn add_reference(&mut self, name: &str, metadata: Value) {
        self.references.insert(name.to_owned(), metadata);
    }

    pub fn test_entry(&mut self, test: &str) -> &mut TestResults {
        self.results.entry(test.to_owned()).or_default()
    }

    /// The entry for `reference` under `test`, created with `source` the first time.
    pub fn reference_entry(&mut self, test: &str, reference: &str, source: &Value) -> &mut ReferenceResults {
        self.test_entry(test).references
            .entry(reference.to_owned())
            .or_insert_with(|| ReferenceResults { source: source.clone(), realizations: BTreeMap::new() })
    }

    pub fn set_region_results(&mut self, test: &str, reference: &str, source: &Value, realization: &str, region: &str, stats: StatValues) {
        self.reference_entry(test, reference, source)
            .realizations
            .entry(realization.to_owned())
            .or_default()
            .insert(region.to_owned(), stats);
    }

    /// Number of (test, reference, realization, region) cells with statistics.
    pub fn n_results(&self) -> usize {
        self.results.values()
            .flat_map(|t| t.references.values())
            .flat_map(|r| r.realizations.values())
            .map(|regions| regions.len())
            .sum()
    }
}

/// Build the `SimulationDescription` block of a test data set. Each entry is taken from the
/// run parameters, else from a global attribute of the test file, else "N/A".
pub fn simulation_description(
    cfg: &RunConfig,
    io: &dyn FieldIo,
    test: &DataSource,
    mip_table: &str,
) -> BTreeMap<String, String> {
    let mut mapping: BTreeMap<String, DescriptionSource> = DEFAULT_DESCRIPTION_MAPPING.iter()
        .map(|(k, v)| (k.to_string(), DescriptionSource::Attribute(v.to_string())))
        .collect();
    mapping.extend(cfg.simulation_description_mapping.clone());

    let lookup = |name: &str| -> String {
        cfg.attribute(name)
            .or_else(|| io.global_attribute(&test.file_path, name))
            .unwrap_or_else(|| NOT_AVAILABLE.to_owned())
    };

    let mut descr = BTreeMap::new();
    descr.insert("MIPTable".to_owned(), mip_table.to_owned());
    descr.insert("Model".to_owned(), test.name.clone());
    for (key, source) in mapping {
        let value = match source {
            DescriptionSource::Attribute(name) => lookup(&name),
            DescriptionSource::Formatted(parts) => match parts.split_first() {
                Some((fmt, names)) => format_description(fmt, names.iter().map(|n| lookup(n))),
                None => NOT_AVAILABLE.to_owned(),
            },
        };
        descr.insert(key, value);
    }
    descr
}

/// Replace each `%s` in `fmt` with the next value.
fn format_description<I: Iterator<Item = String>>(fmt: &str, mut values: I) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut pieces = fmt.split("%s");
    if let Some(first) = pieces.next() {
        out.push_str(first);
    }
    for piece in pieces {
        out.push_str(&values.next().unwrap_or_default());
        out.push_str(piece);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_description() {
        let s = format_description("%s (%s)", vec!["CMIP6".to_owned(), "NCAR".to_owned()].into_iter());
        assert_eq!(s, "CMIP6 (NCAR)");
        assert_eq!(format_description("plain", std::iter::empty()), "plain");
    }

    #[test]
    fn test_document_layout() {
        let var = VariableId::parse("ua_850").unwrap();
        let mut doc = MetricsDocument::new(&var);
        doc.add_region(&Region::global());
        let source = json!({"CMIP_CMOR_TABLE": "Amon", "filename": "ua_ERA5.nc"});
        doc.add_reference("default", source.clone());

        let mut stats = StatValues::new();
        stats.entry("bias_xy".to_owned()).or_default().insert("ann".to_owned(), 0.5);
        doc.set_region_results("ModelA", "default", &source, "r1i1p1", "global", stats);
        doc.test_entry("ModelA").units = Some("m s-1".to_owned());
        assert_eq!(doc.n_results(), 1);

        let v = serde_json::to_value(&doc).unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["DISCLAIMER", "Variable", "References", "RegionalMasking", "RESULTS", "METRICS"]);
        assert_eq!(v["Variable"], json!({"id": "ua", "level": 85000.0}));
        assert_eq!(v["RESULTS"]["ModelA"]["default"]["r1i1p1"]["global"]["bias_xy"]["ann"], json!(0.5));
        assert_eq!(v["RESULTS"]["ModelA"]["default"]["source"], source);
        assert_eq!(v["RESULTS"]["ModelA"]["InputRegionFileName"], Value::Null);
        assert_eq!(v["RegionalMasking"]["global"], json!({"id": "global"}));
    }
}
