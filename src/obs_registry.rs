//! The observation catalogue (`obs_info_dictionary.json`): for each variable, the available
//! reference data sets and the aliases ("default", "alternate1", ...) pointing at them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LoadError, PmpError};

/// Top-level keys of the catalogue that are not variables.
pub const RESERVED_KEYS: [&str; 5] = ["GridInfo", "References", "RegionalMasking", "metrics_git_sha1", "uvcdat_version"];

/// The alias consulted to decide a variable's realm.
pub const DEFAULT_REFERENCE: &str = "default";

const OCEAN_TABLE: &str = "Omon";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsDataset {
    #[serde(rename = "CMIP_CMOR_TABLE")]
    pub cmor_table: String,
    pub filename: String,
    #[serde(rename = "RefName", default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    /// Everything else in the entry (period, shape, MD5, ...), carried into the output as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObsEntry {
    /// Name of another entry for the same variable
    Alias(String),
    Dataset(ObsDataset),
}

/// A reference name resolved to an actual data set.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObs<'a> {
    /// The data set's key in the catalogue, e.g. "ERA5" for the alias "default"
    pub name: &'a str,
    pub dataset: &'a ObsDataset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObsRegistry {
    vars: BTreeMap<String, BTreeMap<String, ObsEntry>>,
}

impl ObsRegistry {
    pub fn from_json_file(path: &Path) -> Result<Self, PmpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PmpError::from_io_error(e, path.to_owned()))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| PmpError::from_json_error(e, path.to_owned()))?;
        Self::from_value(value)
            .map_err(|reason| PmpError::invalid_config(path.display(), reason))
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        let top = match value {
            Value::Object(m) => m,
            _ => return Err("the observation catalogue must be a JSON object".to_owned()),
        };

        let mut vars = BTreeMap::new();
        for (var, entries) in top {
            if RESERVED_KEYS.contains(&var.as_str()) {
                continue;
            }
            let entries = match entries {
                Value::Object(m) => m,
                _ => {
                    log::debug!("Skipping non-object entry '{var}' in the observation catalogue");
                    continue;
                }
            };

            let mut parsed = BTreeMap::new();
            for (name, entry) in entries {
                match serde_json::from_value::<ObsEntry>(entry) {
                    Ok(e) => { parsed.insert(name, e); },
                    Err(e) => log::debug!("Skipping '{var}/{name}' in the observation catalogue: {e}"),
                }
            }
            vars.insert(var, parsed);
        }

        Ok(Self { vars })
    }

    /// Add or replace entries with those from `other`, variable by variable.
    pub fn merge(&mut self, other: ObsRegistry) {
        for (var, entries) in other.vars {
            self.vars.entry(var).or_default().extend(entries);
        }
    }

    pub fn contains(&self, var: &str, name: &str) -> bool {
        self.vars.get(var).map(|v| v.contains_key(name)).unwrap_or(false)
    }

    /// Resolve `reference` for `var`, following at most one alias.
    pub fn resolve<'a>(&'a self, var: &str, reference: &'a str) -> Result<ResolvedObs<'a>, LoadError> {
        let unknown = || LoadError::UnknownReference { var: var.to_owned(), reference: reference.to_owned() };
        let entries = self.vars.get(var).ok_or_else(unknown)?;
        match entries.get(reference).ok_or_else(unknown)? {
            ObsEntry::Dataset(dataset) => Ok(ResolvedObs { name: reference, dataset }),
            ObsEntry::Alias(target) => match entries.get(target) {
                Some(ObsEntry::Dataset(dataset)) => Ok(ResolvedObs { name: target, dataset }),
                Some(ObsEntry::Alias(next)) => Err(LoadError::ConfigInvalid(format!(
                    "observation alias '{reference}' for '{var}' points to another alias ('{target}' -> '{next}'); aliases may only point to a data set"
                ))),
                None => Err(LoadError::UnknownReference { var: var.to_owned(), reference: target.clone() }),
            },
        }
    }

    /// True if `var` is an ocean variable, judged by the table of its default reference.
    pub fn use_omon(&self, var: &str) -> bool {
        self.resolve(var, DEFAULT_REFERENCE)
            .map(|r| r.dataset.cmor_table == OCEAN_TABLE)
            .unwrap_or(false)
    }

    /// Expand a configured reference list. A list containing "all" (any case) becomes every
    /// alias defined for `var`.
    pub fn expand_references(&self, var: &str, requested: &[String]) -> Vec<String> {
        if !requested.iter().any(|r| r.eq_ignore_ascii_case("all")) {
            return requested.to_vec();
        }
        self.vars.get(var)
            .map(|entries| entries.iter()
                .filter(|(_, e)| matches!(e, ObsEntry::Alias(_)))
                .map(|(k, _)| k.clone())
                .collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ObsRegistry {
        ObsRegistry::from_value(json!({
            "tas": {
                "default": "ERA5",
                "alternate1": "JRA55",
                "ERA5": {"CMIP_CMOR_TABLE": "Amon", "filename": "tas_ERA5.nc", "RefName": "ERA5", "period": "1981-2005"},
                "JRA55": {"CMIP_CMOR_TABLE": "Amon", "filename": "tas_JRA55.nc"},
                "loop": "default"
            },
            "tos": {
                "default": "HadISST",
                "HadISST": {"CMIP_CMOR_TABLE": "Omon", "filename": "tos_HadISST.nc"}
            },
            "GridInfo": {"GridName": "2.5x2.5"},
            "metrics_git_sha1": "abc"
        })).unwrap()
    }

    #[test]
    fn test_reserved_keys_stripped() {
        let reg = sample();
        assert!(reg.contains("tas", "ERA5"));
        assert!(reg.contains("tos", "HadISST"));
        assert!(!reg.contains("GridInfo", "GridName"));
        assert!(reg.expand_references("GridInfo", &["all".to_owned()]).is_empty());
    }

    #[test]
    fn test_resolve_alias() {
        let reg = sample();
        let r = reg.resolve("tas", "default").unwrap();
        assert_eq!(r.name, "ERA5");
        assert_eq!(r.dataset.filename, "tas_ERA5.nc");
        assert_eq!(r.dataset.extra["period"], json!("1981-2005"));

        let r = reg.resolve("tas", "JRA55").unwrap();
        assert_eq!(r.name, "JRA55");
    }

    #[test]
    fn test_resolve_errors() {
        let reg = sample();
        assert!(matches!(reg.resolve("tas", "MERRA"), Err(LoadError::UnknownReference { .. })));
        assert!(matches!(reg.resolve("pr", "default"), Err(LoadError::UnknownReference { .. })));
        let deep = reg.resolve("tas", "loop").unwrap_err();
        assert!(deep.is_fatal());
    }

    #[test]
    fn test_use_omon() {
        let reg = sample();
        assert!(reg.use_omon("tos"));
        assert!(!reg.use_omon("tas"));
        assert!(!reg.use_omon("pr"));
    }

    #[test]
    fn test_expand_all() {
        let reg = sample();
        assert_eq!(reg.expand_references("tas", &["All".to_owned()]), vec!["alternate1", "default", "loop"]);
        assert_eq!(reg.expand_references("tas", &["default".to_owned()]), vec!["default"]);
    }

    #[test]
    fn test_merge_custom() {
        let mut reg = sample();
        let custom = ObsRegistry::from_value(json!({
            "tas": {"default": "MyObs", "MyObs": {"CMIP_CMOR_TABLE": "Amon", "filename": "mine.nc"}}
        })).unwrap();
        reg.merge(custom);
        assert_eq!(reg.resolve("tas", "default").unwrap().name, "MyObs");
        assert!(reg.contains("tas", "ERA5"));
    }

    #[test]
    fn test_sample_catalogue() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("share").join("obs_info_dictionary.json");
        let reg = ObsRegistry::from_json_file(&path).unwrap();
        assert_eq!(reg.resolve("pr", "alternate1").unwrap().name, "TRMM-3B43v-7");
        assert!(reg.use_omon("tos"));
        assert!(reg.expand_references("metrics_git_sha1", &["all".to_owned()]).is_empty());
    }
}
