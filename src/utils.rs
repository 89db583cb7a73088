use std::cmp::Ordering;
use std::io::Read;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, Array1, Ix1};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::LoadError;

const HASH_BLOCK_SIZE: usize = 65536;

pub(crate) fn nc_file(ds: &netcdf::File) -> PathBuf {
    ds.path()
      .unwrap_or_else(|_| PathBuf::from("?"))
}

/// Compute the SHA-256 checksum of a file, returned as a lowercase hex string.
pub fn file_sha256(file: &Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(file)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn load_nc_var(ds: &netcdf::File, varname: &str) -> Result<Array1<f64>, LoadError> {
    let file = nc_file(ds);
    let var = ds.variable(varname)
        .ok_or_else(|| LoadError::VariableMissing { file: file.clone(), varname: varname.to_owned() })?;
    let data = var.values_arr::<f64, _>(netcdf::extent::Extents::All)
        .map_err(|e| LoadError::from_nc_error(e, file.clone(), varname))?
        .into_dimensionality::<Ix1>()
        .map_err(|e| LoadError::from_shape_error(e, file.clone(), varname))?;
    Ok(data)
}

pub fn attr_value_to_string(value: netcdf::AttrValue) -> Option<String> {
    match value {
        netcdf::AttrValue::Str(v) => Some(v),
        netcdf::AttrValue::Strs(v) => Some(v.join("\n")),
        netcdf::AttrValue::Double(v) => Some(v.to_string()),
        netcdf::AttrValue::Float(v) => Some(v.to_string()),
        netcdf::AttrValue::Int(v) => Some(v.to_string()),
        netcdf::AttrValue::Short(v) => Some(v.to_string()),
        netcdf::AttrValue::Longlong(v) => Some(v.to_string()),
        _ => None
    }
}

pub fn attr_value_to_f64(value: netcdf::AttrValue) -> Option<f64> {
    match value {
        netcdf::AttrValue::Double(v) => Some(v),
        netcdf::AttrValue::Float(v) => Some(v as f64),
        netcdf::AttrValue::Int(v) => Some(v as f64),
        netcdf::AttrValue::Short(v) => Some(v as f64),
        netcdf::AttrValue::Doubles(v) => v.first().copied(),
        netcdf::AttrValue::Floats(v) => v.first().map(|x| *x as f64),
        _ => None
    }
}

pub fn get_str_attr(nc_var: &netcdf::Variable, attr_name: &str) -> Option<String> {
    let nc_attr = nc_var.attribute(attr_name)?;
    let value = nc_attr.value().ok()?;
    attr_value_to_string(value)
}

pub fn write_nc_var(
    ds: &mut netcdf::MutableFile,
    data: &ArrayD<f64>,
    name: &str,
    dims: &[&str],
    units: Option<&str>,
    fill_value: Option<f64>,
    compression: Option<(i32, bool)>,
) -> Result<(), netcdf::error::Error> {
    let mut var = ds.add_variable::<f64>(name, dims)?;
    if let Some(fill) = fill_value {
        var.set_fill_value(fill)?;
    }
    if let Some((level, shuffle)) = compression {
        var.compression(level, shuffle)?;
    }

    let standard = data.as_standard_layout();
    let values = standard.as_slice()
        .ok_or_else(|| netcdf::error::Error::from(format!("data for {name} is not contiguous")))?;
    var.put_values(values, netcdf::extent::Extents::All)?;

    if let Some(units) = units {
        var.add_attribute("units", units)?;
    }

    Ok(())
}

/// Recursively merge `update` into `base`. Nested objects are merged, any other value in
/// `update` replaces the one in `base`.
pub fn update_dict(base: &mut Map<String, Value>, update: Map<String, Value>) {
    for (k, v) in update {
        if let Value::Object(new) = v {
            if let Some(Value::Object(existing)) = base.get_mut(&k) {
                update_dict(existing, new);
                continue;
            }
            base.insert(k, Value::Object(new));
        } else {
            base.insert(k, v);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum HumanChunk<'a> {
    Num(u64),
    Text(&'a str),
}

impl<'a> PartialOrd for HumanChunk<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> Ord for HumanChunk<'a> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Num(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Num(_)) => Ordering::Greater,
        }
    }
}

fn human_chunks(s: &str) -> Vec<HumanChunk<'_>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut in_digits = None;
    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        match in_digits {
            Some(d) if d != is_digit => {
                chunks.push(make_chunk(&s[start..i], d));
                start = i;
            },
            _ => {}
        }
        in_digits = Some(is_digit);
    }
    if let Some(d) = in_digits {
        chunks.push(make_chunk(&s[start..], d));
    }
    chunks
}

fn make_chunk(s: &str, digits: bool) -> HumanChunk<'_> {
    if digits {
        // very long digit runs overflow u64, fall back to text ordering for those
        s.parse().map(HumanChunk::Num).unwrap_or(HumanChunk::Text(s))
    } else {
        HumanChunk::Text(s)
    }
}

/// Compare two strings so that embedded numbers sort by value ("r2" before "r10").
pub fn human_cmp(a: &str, b: &str) -> Ordering {
    human_chunks(a).cmp(&human_chunks(b)).then_with(|| a.cmp(b))
}

/// Set up logging for a binary. `-v` raises the level of this package's messages from warn to
/// info, `-vv` to debug and `-vvv` to trace; `RUST_LOG` takes precedence when set.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let default_filter = format!("pmp_metrics={level},merge_metrics_jsons={level}");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

/// Wrap a longitude into [0, 360).
pub fn normalize_lon(lon: f64) -> f64 {
    let l = lon % 360.0;
    if l < 0.0 { l + 360.0 } else { l }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_human_sort() {
        let mut v = vec!["r10i1p1", "r2i1p1", "r1i1p1", "ACCESS1-0", "ACCESS1-3"];
        v.sort_by(|a, b| human_cmp(a, b));
        assert_eq!(v, vec!["ACCESS1-0", "ACCESS1-3", "r1i1p1", "r2i1p1", "r10i1p1"]);
    }

    #[test]
    fn test_update_dict_is_recursive() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let update = json!({"a": {"c": 5, "e": 6}, "d": {"x": 1}});
        if let (Value::Object(b), Value::Object(u)) = (&mut base, update) {
            update_dict(b, u);
        }
        assert_eq!(base, json!({"a": {"b": 1, "c": 5, "e": 6}, "d": {"x": 1}}));
    }

    #[test]
    fn test_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("abc.txt");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(
            file_sha256(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_normalize_lon() {
        assert_eq!(normalize_lon(-90.0), 270.0);
        assert_eq!(normalize_lon(360.0), 0.0);
        assert_eq!(normalize_lon(45.0), 45.0);
    }
}
