//! Writing result documents: versioned JSON plus a plain text mirror.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::PmpError;
use crate::provenance::Provenance;

pub const JSON_VERSION: f64 = 3.0;
pub const DEFAULT_JSON_STRUCTURE: [&str; 6] = ["model", "reference", "rip", "region", "statistic", "season"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Json,
    Text,
    Netcdf,
}

impl OutputType {
    pub fn from_extension(ext: &str) -> Result<Self, PmpError> {
        match ext.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "txt" | "asc" | "ascii" => Ok(Self::Text),
            "nc" => Ok(Self::Netcdf),
            other => Err(PmpError::UnknownOutputType(other.to_owned())),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, PmpError> {
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default();
        Self::from_extension(&ext)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
            Self::Netcdf => "nc",
        }
    }
}

/// Serialize `data` to a JSON object, failing if it is not one.
pub fn to_object<T: Serialize>(data: &T, path: &Path) -> Result<Map<String, Value>, PmpError> {
    match serde_json::to_value(data).map_err(|e| PmpError::from_json_error(e, path.to_owned()))? {
        Value::Object(m) => Ok(m),
        _ => Err(PmpError::invalid_config(path.display(), "result documents must serialize to a JSON object")),
    }
}

/// Write a result document as 4-space indented JSON, adding `json_version`,
/// `json_structure` and `provenance`.
///
/// `json_structure` falls back on the one already in `data`; a document of version 3.0 or
/// later without one is refused.
pub fn write_json(
    path: &Path,
    mut data: Map<String, Value>,
    json_structure: Option<&[String]>,
    provenance: &Provenance
) -> Result<(), PmpError> {
    let json_version = data.get("json_version")
        .and_then(json_version_of)
        .unwrap_or(JSON_VERSION);
    let structure = match json_structure {
        Some(s) => Some(Value::from(s.to_vec())),
        None => data.get("json_structure").cloned(),
    };
    let structure = match structure {
        Some(s) => s,
        None if json_version >= 3.0 => return Err(PmpError::MissingJsonStructure(json_version)),
        None => Value::Null,
    };

    data.insert("json_version".to_owned(), Value::from(json_version));
    data.insert("json_structure".to_owned(), structure);
    let prov = serde_json::to_value(provenance).map_err(|e| PmpError::from_json_error(e, path.to_owned()))?;
    data.insert("provenance".to_owned(), prov);

    let mut f = create_file(path)?;
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut f, formatter);
    Value::Object(data).serialize(&mut ser)
        .map_err(|e| PmpError::from_json_error(e, path.to_owned()))?;
    f.flush().map_err(|e| PmpError::from_io_error(e, path.to_owned()))
}

/// Write each top-level entry as a `key value` line.
pub fn write_text(path: &Path, data: &Map<String, Value>) -> Result<(), PmpError> {
    let mut f = create_file(path)?;
    for (key, value) in data {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        writeln!(f, "{key} {value}").map_err(|e| PmpError::from_io_error(e, path.to_owned()))?;
    }
    f.flush().map_err(|e| PmpError::from_io_error(e, path.to_owned()))
}

/// `json_version` may be stored as a number or, in older files, a string.
pub fn json_version_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn create_file(path: &Path) -> Result<std::io::BufWriter<std::fs::File>, PmpError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| PmpError::from_io_error(e, dir.to_owned()))?;
    }
    let f = std::fs::File::create(path).map_err(|e| PmpError::from_io_error(e, path.to_owned()))?;
    Ok(std::io::BufWriter::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Map<String, Value> {
        match json!({"RESULTS": {"m": {"r": 1.0}}, "Variable": {"id": "tas"}}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_output_types() {
        assert_eq!(OutputType::from_extension("ASC").unwrap(), OutputType::Text);
        assert_eq!(OutputType::from_path(Path::new("a/b.nc")).unwrap(), OutputType::Netcdf);
        assert!(matches!(OutputType::from_extension("xlsx"), Err(PmpError::UnknownOutputType(_))));
    }

    #[test]
    fn test_write_json_requires_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let err = write_json(&path, sample(), None, &Provenance::collect()).unwrap_err();
        assert!(matches!(err, PmpError::MissingJsonStructure(v) if v == 3.0));
        assert!(!path.exists());
    }

    #[test]
    fn test_write_json_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("out.json");
        let structure: Vec<String> = DEFAULT_JSON_STRUCTURE.iter().map(|s| s.to_string()).collect();
        write_json(&path, sample(), Some(&structure), &Provenance::collect()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"RESULTS\": {"));
        let v: Value = serde_json::from_str(&text).unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["RESULTS", "Variable", "json_version", "json_structure", "provenance"]);
        assert_eq!(v["json_version"], json!(3.0));
        assert_eq!(v["json_structure"][2], json!("rip"));
    }

    #[test]
    fn test_old_version_needs_no_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        let mut data = sample();
        data.insert("json_version".to_owned(), json!("2.0"));
        write_json(&path, data, None, &Provenance::collect()).unwrap();
        let v: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["json_version"], json!(2.0));
    }

    #[test]
    fn test_write_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_text(&path, &sample()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "RESULTS {\"m\":{\"r\":1.0}}\nVariable {\"id\":\"tas\"}\n");
    }
}
