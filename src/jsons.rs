//! Reading result documents back: legacy schema migration, merging many documents into one
//! tree and turning that tree into a dense array indexed by the declared axes.
//!
//! A result tree is nested objects, one level per axis of `json_structure`
//! (`model/reference/rip/region/statistic/season` by default), with numbers at the bottom.
//! When documents hold one variable each, a `variable` axis is put in front.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use itertools::Itertools;
use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use serde_json::{Map, Value};

use crate::error::{PmpError, SchemaMigrationError};
use crate::field::MISSING_VALUE;
use crate::store::{json_version_of, DEFAULT_JSON_STRUCTURE, JSON_VERSION};
use crate::utils::{human_cmp, update_dict};

pub const VARIABLE_AXIS: &str = "variable";
pub const DEFAULT_IGNORED_KEYS: [&str; 2] = ["SimulationDescription", "source"];

const CUSTOM_PREFIX: &str = "custom_";
const GLOBAL_DOMAIN_CODE: &str = "GLB";
const GLOBAL_REGION: &str = "global";
const V1_DOMAIN_SUFFIXES: [&str; 2] = ["_GLB", "_NHEX"];

// ---------------------------------------------------------------------------------------
// Schema migration
// ---------------------------------------------------------------------------------------

/// Bring a whole result document to the version 3.0 layout. Legacy documents get the default
/// `json_structure`, the layout migration produces. Documents already at 3.0 or later are
/// returned as they are, with or without a structure.
pub fn migrate(doc: &Value) -> Result<Value, SchemaMigrationError> {
    let mut out = match doc {
        Value::Object(m) => m.clone(),
        _ => return Err(SchemaMigrationError::NotAnObject { path: String::new(), version: "?".to_owned() }),
    };
    let version = detect_version(&out);

    let results = match out.get("RESULTS") {
        Some(Value::Object(r)) => r,
        Some(_) => return Err(SchemaMigrationError::NotAnObject { path: "RESULTS".to_owned(), version: version.to_string() }),
        None => return Err(SchemaMigrationError::MissingResults),
    };

    let migrated = if version == 1.0 {
        Some(migrate_v1_to_v3(results)?)
    } else if version == 2.0 {
        Some(migrate_v2_to_v3(results)?)
    } else if version >= 3.0 {
        None
    } else {
        return Err(SchemaMigrationError::UnsupportedVersion(version.to_string()));
    };

    if let Some(results) = migrated {
        out.insert("RESULTS".to_owned(), Value::Object(results));
        out.insert("json_version".to_owned(), Value::from(JSON_VERSION));
        if !out.contains_key("json_structure") {
            out.insert("json_structure".to_owned(), Value::from(DEFAULT_JSON_STRUCTURE.to_vec()));
        }
    }
    Ok(out.into())
}

/// The document's `json_version`. Without one, a document declaring a `json_structure` is
/// current (legacy layouts never had one) and any other is guessed from its statistic keys:
/// version 1.0 put a domain such as `_NHEX` at the end of every key.
pub fn detect_version(doc: &Map<String, Value>) -> f64 {
    if let Some(version) = doc.get("json_version").and_then(json_version_of) {
        return version;
    }
    if doc.contains_key("json_structure") {
        return JSON_VERSION;
    }
    match doc.get("RESULTS") {
        Some(Value::Object(results)) if has_v1_keys(results) => 1.0,
        _ => 2.0,
    }
}

fn entries<'a>(v: &'a Value) -> impl Iterator<Item = (&'a String, &'a Value)> + 'a {
    v.as_object().into_iter().flat_map(|m| m.iter())
}

fn has_v1_keys(results: &Map<String, Value>) -> bool {
    results.values()
        .flat_map(entries)
        .filter(|(_, reals)| reals.get("source").is_some())
        .flat_map(|(_, reals)| entries(reals))
        .flat_map(|(_, regions)| entries(regions))
        .flat_map(|(_, stats)| entries(stats))
        .any(|(key, _)| V1_DOMAIN_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)))
}

/// Version 1.0 stores `stat_season_DOMAIN` keys directly under each region. The domain
/// becomes the region (`NHEX`, or `land_NHEX` under region `land`; `GLB` means global),
/// the rest is split into statistic and season.
pub fn migrate_v1_to_v3(results: &Map<String, Value>) -> Result<Map<String, Value>, SchemaMigrationError> {
    map_regions(results, "1.0", |path, region, stats| {
        let mut out = Map::new();
        for (key, value) in stats {
            if key.starts_with(CUSTOM_PREFIX) {
                insert_nested(&mut out, &[&v1_bucket(region, GLOBAL_REGION), key], value.clone());
                continue;
            }
            let parts: Vec<&str> = key.split('_').collect();
            if parts.len() < 3 {
                return Err(SchemaMigrationError::BadStatisticKey { key: key.clone(), path: path.to_owned(), version: "1.0".to_owned() });
            }
            let n = parts.len();
            let domain = if parts[n - 1] == GLOBAL_DOMAIN_CODE { GLOBAL_REGION } else { parts[n - 1] };
            let season = parts[n - 2];
            let stat = parts[..n - 2].join("_");
            insert_nested(&mut out, &[&v1_bucket(region, domain), &stat, season], value.clone());
        }
        Ok(out)
    })
}

/// Version 2.0 stores `stat_season` keys under each region; they are split into a
/// statistic and a season. Entries that are already nested are kept.
pub fn migrate_v2_to_v3(results: &Map<String, Value>) -> Result<Map<String, Value>, SchemaMigrationError> {
    map_regions(results, "2.0", |path, region, stats| {
        let mut reg = Map::new();
        for (key, value) in stats {
            if key.starts_with(CUSTOM_PREFIX) || value.is_object() {
                insert_nested(&mut reg, &[key], value.clone());
                continue;
            }
            let (stat, season) = key.rsplit_once('_')
                .ok_or_else(|| SchemaMigrationError::BadStatisticKey { key: key.clone(), path: path.to_owned(), version: "2.0".to_owned() })?;
            insert_nested(&mut reg, &[stat, season], value.clone());
        }
        let mut out = Map::new();
        out.insert(region.to_owned(), Value::Object(reg));
        Ok(out)
    })
}

fn v1_bucket(region: &str, domain: &str) -> String {
    if region == GLOBAL_REGION {
        domain.to_owned()
    } else {
        format!("{region}_{domain}")
    }
}

/// Walk `model/reference/realization/region` of a legacy tree and rebuild each realization
/// from the maps `f` returns for its regions. Only references holding a `source` entry are
/// touched.
fn map_regions<F>(results: &Map<String, Value>, version: &str, f: F) -> Result<Map<String, Value>, SchemaMigrationError>
where F: Fn(&str, &str, &Map<String, Value>) -> Result<Map<String, Value>, SchemaMigrationError>
{
    let not_object = |path: String| SchemaMigrationError::NotAnObject { path, version: version.to_owned() };
    let mut out = results.clone();

    for (model, mval) in out.iter_mut() {
        let Value::Object(refs) = mval else { continue };
        for (reference, rval) in refs.iter_mut() {
            let Value::Object(reals) = rval else { continue };
            if !reals.contains_key("source") {
                continue;
            }
            for (real, realval) in reals.iter_mut() {
                if real == "source" {
                    continue;
                }
                let Value::Object(regions) = realval else {
                    return Err(not_object(format!("{model}/{reference}/{real}")));
                };

                let mut rebuilt = Map::new();
                for (region, stats) in regions.iter() {
                    let path = format!("{model}/{reference}/{real}/{region}");
                    let Value::Object(stats) = stats else {
                        return Err(not_object(path));
                    };
                    update_dict(&mut rebuilt, f(&path, region, stats)?);
                }
                *regions = rebuilt;
            }
        }
    }
    Ok(out)
}

fn insert_nested(map: &mut Map<String, Value>, keys: &[&str], value: Value) {
    match keys {
        [] => {},
        [last] => { map.insert(last.to_string(), value); },
        [first, rest @ ..] => {
            let entry = map.entry(first.to_string()).or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_nested(child, rest, value);
            }
        }
    }
}

// ---------------------------------------------------------------------------------------
// Merging documents
// ---------------------------------------------------------------------------------------

/// What to do when two documents give different values for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// The later document wins
    #[default]
    Overwrite,
    /// Keep both; the later value goes under `<key>_<n>` with the first free `n`
    NoOverwrite,
}

/// A document ready to be merged: its axis names and its (migrated) results tree.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDocument {
    pub structure: Vec<String>,
    pub tree: Map<String, Value>,
}

/// Migrate a parsed document and extract its results tree. A document that declares no
/// `json_structure` takes `structure`; if that is empty too, the document is rejected. With
/// `one_variable_per_file`, the tree is put under the document's variable name (`Variable.id`,
/// with `-<hPa>` for a level, or the part of the file name before the first `_`).
pub fn prepare_document(
    doc: &Value,
    file_name: Option<&str>,
    structure: &[String],
    one_variable_per_file: bool,
) -> Result<PreparedDocument, PmpError> {
    let migrated = migrate(doc)?;
    let mut structure: Vec<String> = match migrated.get("json_structure") {
        Some(Value::Array(a)) => a.iter().filter_map(|v| v.as_str().map(|s| s.to_owned())).collect(),
        _ if !structure.is_empty() => structure.to_vec(),
        _ => {
            let version = migrated.get("json_version").and_then(json_version_of).unwrap_or(JSON_VERSION);
            return Err(PmpError::MissingJsonStructure(version));
        }
    };
    let results = match migrated.get("RESULTS") {
        Some(Value::Object(r)) => r.clone(),
        _ => return Err(SchemaMigrationError::MissingResults.into()),
    };

    if !one_variable_per_file {
        return Ok(PreparedDocument { structure, tree: results });
    }

    if structure.first().map(|s| s == VARIABLE_AXIS).unwrap_or(false) {
        structure.remove(0);
    }
    structure.insert(0, VARIABLE_AXIS.to_owned());

    let varnm = match migrated.get("Variable") {
        Some(var) => {
            let mut name = var.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
            if let Some(level) = var.get("level").and_then(|l| l.as_f64()) {
                name.push_str(&format!("-{}", (level / 100.0) as i64));
            }
            name
        },
        None => file_name
            .and_then(|f| Path::new(f).file_name())
            .map(|f| f.to_string_lossy().split('_').next().unwrap_or_default().to_owned())
            .unwrap_or_default(),
    };

    let mut tree = Map::new();
    tree.insert(varnm, Value::Object(results));
    Ok(PreparedDocument { structure, tree })
}

fn merge_no_overwrite(base: &mut Map<String, Value>, update: Map<String, Value>) {
    for (k, v) in update {
        match base.get_mut(&k) {
            Some(Value::Object(existing)) if v.is_object() => {
                if let Value::Object(new) = v {
                    merge_no_overwrite(existing, new);
                }
            },
            Some(existing) if *existing == v => {},
            Some(_) => {
                let free = (1..).map(|n| format!("{k}_{n}")).find(|key| !base.contains_key(key));
                if let Some(key) = free {
                    log::info!("Key '{k}' already present, keeping the new value as '{key}'");
                    base.insert(key, v);
                }
            },
            None => { base.insert(k, v); },
        }
    }
}

// ---------------------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------------------

/// One axis of a result set and its values, in output order.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisValues {
    pub id: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subset {
    /// Keep exactly these values, in this order
    Values(Vec<String>),
    /// Python-style `start:stop:step` over the sorted values
    Slice { start: Option<usize>, stop: Option<usize>, step: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub subsets: BTreeMap<String, Subset>,
    pub merge: Vec<Vec<String>>,
    pub fillin: Option<String>,
    pub order: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subset(mut self, axis: &str, subset: Subset) -> Self {
        self.subsets.insert(axis.to_owned(), subset);
        self
    }

    pub fn values(self, axis: &str, values: &[&str]) -> Self {
        self.subset(axis, Subset::Values(values.iter().map(|s| s.to_string()).collect()))
    }

    pub fn merge(mut self, axes: &[&str]) -> Self {
        self.merge.push(axes.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn fillin(mut self, axis: &str) -> Self {
        self.fillin = Some(axis.to_owned());
        self
    }

    pub fn order(mut self, axes: &[&str]) -> Self {
        self.order = axes.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// A dense result array. Cells with no value hold `MISSING_VALUE`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsArray {
    pub axes: Vec<AxisValues>,
    pub data: ArrayD<f64>,
}

impl MetricsArray {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn axis_ids(&self) -> Vec<&str> {
        self.axes.iter().map(|a| a.id.as_str()).collect()
    }

    /// The value at the given axis values, one per axis, or `None` if it is missing or a
    /// value is not on its axis.
    pub fn get(&self, keys: &[&str]) -> Option<f64> {
        if keys.len() != self.axes.len() {
            return None;
        }
        let idx = keys.iter().zip(&self.axes)
            .map(|(k, ax)| ax.values.iter().position(|v| v == k))
            .collect::<Option<Vec<usize>>>()?;
        let v = self.data[IxDyn(&idx)];
        if is_missing(v) { None } else { Some(v) }
    }

    /// True where a cell has no value.
    pub fn mask(&self) -> ArrayD<bool> {
        self.data.mapv(is_missing)
    }
}

pub fn is_missing(v: f64) -> bool {
    v.is_nan() || v.abs() >= MISSING_VALUE * 0.99
}

/// A merged set of result documents.
#[derive(Debug, Clone)]
pub struct MetricsJsons {
    structure: Vec<String>,
    data: Map<String, Value>,
    ignored_keys: Vec<String>,
    one_variable_per_file: bool,
    sort_human: bool,
    policy: MergePolicy,
}

impl Default for MetricsJsons {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MetricsJsons {
    /// An empty set. With an empty `structure`, the first document added decides it.
    pub fn new(structure: Vec<String>) -> Self {
        Self {
            structure,
            data: Map::new(),
            ignored_keys: DEFAULT_IGNORED_KEYS.iter().map(|s| s.to_string()).collect(),
            one_variable_per_file: true,
            sort_human: true,
            policy: MergePolicy::default(),
        }
    }

    pub fn with_ignored_keys(mut self, keys: Vec<String>) -> Self {
        self.ignored_keys = keys;
        self
    }

    pub fn one_variable_per_file(mut self, yes: bool) -> Self {
        self.one_variable_per_file = yes;
        self
    }

    pub fn sort_human(mut self, yes: bool) -> Self {
        self.sort_human = yes;
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn structure(&self) -> &[String] {
        &self.structure
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn from_files<P: AsRef<Path>>(files: &[P], structure: Vec<String>) -> Result<Self, PmpError> {
        let mut jsons = Self::new(structure);
        for f in files {
            jsons.add_file(f.as_ref())?;
        }
        Ok(jsons)
    }

    pub fn add_file(&mut self, path: &Path) -> Result<(), PmpError> {
        let prepared = self.prepare_file(path)?;
        self.add_prepared(prepared);
        Ok(())
    }

    /// Read and migrate one file without touching this set; safe to call from many threads.
    pub fn prepare_file(&self, path: &Path) -> Result<PreparedDocument, PmpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PmpError::from_io_error(e, path.to_owned()))?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| PmpError::from_json_error(e, path.to_owned()))?;
        let file_name = path.file_name().map(|f| f.to_string_lossy().into_owned());
        prepare_document(&doc, file_name.as_deref(), &self.structure, self.one_variable_per_file)
    }

    pub fn add_document(&mut self, doc: &Value, file_name: Option<&str>) -> Result<(), PmpError> {
        let prepared = prepare_document(doc, file_name, &self.structure, self.one_variable_per_file)?;
        self.add_prepared(prepared);
        Ok(())
    }

    pub fn add_prepared(&mut self, doc: PreparedDocument) {
        if self.structure.is_empty() {
            self.structure = doc.structure;
        }
        match self.policy {
            MergePolicy::Overwrite => update_dict(&mut self.data, doc.tree),
            MergePolicy::NoOverwrite => merge_no_overwrite(&mut self.data, doc.tree),
        }
    }

    /// The distinct keys found at each depth of the tree, one axis per `json_structure`
    /// entry. Above the last axis only object-valued keys count.
    pub fn axis_list(&self) -> Vec<AxisValues> {
        let n = self.structure.len();
        let mut values: Vec<Vec<String>> = vec![Vec::new(); n];
        if n > 0 {
            self.collect_axis_values(0, n - 1, &self.data, &mut values);
        }

        self.structure.iter().zip(values)
            .map(|(id, mut vals)| {
                vals.sort_by(|a, b| self.compare(a, b));
                vals.dedup();
                AxisValues { id: id.clone(), values: vals }
            })
            .collect()
    }

    fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.sort_human { human_cmp(a, b) } else { a.cmp(b) }
    }

    fn collect_axis_values(&self, depth: usize, max_depth: usize, data: &Map<String, Value>, values: &mut Vec<Vec<String>>) {
        for (k, v) in data {
            if self.ignored_keys.iter().any(|i| i == k) {
                continue;
            }
            match v {
                Value::Object(child) => {
                    values[depth].push(k.clone());
                    if depth != max_depth {
                        self.collect_axis_values(depth + 1, max_depth, child, values);
                    }
                },
                _ if depth == max_depth => values[depth].push(k.clone()),
                _ => {},
            }
        }
    }

    /// Build the dense array for a query.
    ///
    /// Subsets restrict axes (unknown axes or values are errors); the fill-in axis is then
    /// collapsed, keeping the first value found along it; merge groups become one axis
    /// named `a_b` whose values run through `a` slowest; `order` moves the named axes to the
    /// front.
    pub fn query(&self, query: &Query) -> Result<MetricsArray, PmpError> {
        let mut axes = self.axis_list();
        if axes.is_empty() || axes.iter().take(2).any(|a| a.values.is_empty()) {
            return Err(PmpError::EmptyDocument);
        }
        let ids: Vec<String> = axes.iter().map(|a| a.id.clone()).collect();
        let invalid_axis = |axis: &str, available: &[String]| PmpError::InvalidAxis { axis: axis.to_owned(), available: available.to_vec() };

        for (axis_id, subset) in &query.subsets {
            let index = ids.iter().position(|i| i == axis_id).ok_or_else(|| invalid_axis(axis_id, &ids))?;
            let axis = &mut axes[index];
            axis.values = match subset {
                Subset::Values(wanted) => {
                    if let Some(bad) = wanted.iter().find(|w| !axis.values.contains(w)) {
                        return Err(PmpError::InvalidAxisValue { axis: axis_id.clone(), value: bad.clone() });
                    }
                    wanted.clone()
                },
                Subset::Slice { start, stop, step } => {
                    if *step == 0 {
                        return Err(PmpError::invalid_config(axis_id, "slice step must be at least 1"));
                    }
                    let len = axis.values.len();
                    let stop = stop.unwrap_or(len).min(len);
                    let start = start.unwrap_or(0).min(stop);
                    axis.values[start..stop].iter().step_by(*step).cloned().collect()
                }
            };
        }

        let shape: Vec<usize> = axes.iter().map(|a| a.values.len()).collect();
        let mut data = ArrayD::from_elem(IxDyn(&shape), MISSING_VALUE);
        for (idx, cell) in data.indexed_iter_mut() {
            let path: Vec<&str> = idx.slice().iter().enumerate()
                .map(|(d, &i)| axes[d].values[i].as_str())
                .collect();
            if let Some(v) = lookup(&self.data, &path) {
                *cell = v;
            }
        }

        if let Some(fill) = &query.fillin {
            let index = axes.iter().position(|a| &a.id == fill).ok_or_else(|| invalid_axis(fill, &ids))?;
            data = data.map_axis(Axis(index), |lane| {
                lane.iter().copied().find(|v| !is_missing(*v)).unwrap_or(MISSING_VALUE)
            });
            axes.remove(index);
        }

        let (mut data, mut axes) = merge_axes(data, axes, &query.merge)?;

        if !query.order.is_empty() {
            let current: Vec<String> = axes.iter().map(|a| a.id.clone()).collect();
            let mut perm = Vec::with_capacity(axes.len());
            for name in &query.order {
                let i = current.iter().position(|c| c == name).ok_or_else(|| invalid_axis(name, &current))?;
                if !perm.contains(&i) {
                    perm.push(i);
                }
            }
            let rest: Vec<usize> = (0..axes.len()).filter(|i| !perm.contains(i)).collect();
            perm.extend(rest);
            data = data.permuted_axes(IxDyn(&perm)).as_standard_layout().into_owned();
            axes = perm.iter().map(|&i| axes[i].clone()).collect();
        }

        Ok(MetricsArray { axes, data })
    }
}

fn lookup(tree: &Map<String, Value>, path: &[&str]) -> Option<f64> {
    let (last, parents) = path.split_last()?;
    let mut node = tree;
    for key in parents {
        node = node.get(*key)?.as_object()?;
    }
    match node.get(*last)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn merge_axes(data: ArrayD<f64>, axes: Vec<AxisValues>, groups: &[Vec<String>]) -> Result<(ArrayD<f64>, Vec<AxisValues>), PmpError> {
    if groups.is_empty() {
        return Ok((data, axes));
    }

    let ids: Vec<String> = axes.iter().map(|a| a.id.clone()).collect();
    let mut index_groups: Vec<Vec<usize>> = Vec::with_capacity(groups.len());
    for group in groups {
        let mut indices = Vec::with_capacity(group.len());
        for name in group {
            let i = ids.iter().position(|id| id == name)
                .ok_or_else(|| PmpError::InvalidAxis { axis: name.clone(), available: ids.clone() })?;
            if index_groups.iter().flatten().chain(indices.iter()).any(|&j| j == i) {
                return Err(PmpError::invalid_config("merge", format!("axis '{name}' is merged more than once")));
            }
            indices.push(i);
        }
        index_groups.push(indices);
    }

    // Each output axis is either a single input axis or a merge group placed where its
    // first-occurring member was
    let mut layout: Vec<Vec<usize>> = Vec::new();
    for i in 0..axes.len() {
        if layout.iter().flatten().any(|&j| j == i) {
            continue;
        }
        match index_groups.iter().find(|g| g.contains(&i)) {
            Some(g) => layout.push(g.clone()),
            None => layout.push(vec![i]),
        }
    }

    let perm: Vec<usize> = layout.iter().flatten().copied().collect();
    let new_shape: Vec<usize> = layout.iter()
        .map(|g| g.iter().map(|&i| axes[i].values.len()).product())
        .collect();
    let reshape_err = |e: ndarray::ShapeError| PmpError::invalid_config("merge", e);
    let data = data.permuted_axes(IxDyn(&perm))
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&new_shape))
        .map_err(reshape_err)?;

    let new_axes = layout.iter()
        .map(|g| {
            if g.len() == 1 {
                return axes[g[0]].clone();
            }
            let id = g.iter().map(|&i| axes[i].id.as_str()).join("_");
            let values = g.iter()
                .map(|&i| axes[i].values.iter())
                .multi_cartesian_product()
                .map(|combo| combo.into_iter().join("_"))
                .collect();
            AxisValues { id, values }
        })
        .collect();

    Ok((data, new_axes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structure() -> Vec<String> {
        DEFAULT_JSON_STRUCTURE.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_v1_migration() {
        let doc = json!({
            "json_version": 1.0,
            "RESULTS": {"modelA": {
                "units": "K",
                "refX": {"source": {"filename": "x.nc"}, "r1": {
                    "global": {"rms_xy_djf_NHEX": 1.23, "bias_xy_ann_GLB": 0.5, "custom_thing": 7},
                    "land": {"rms_xy_ann_GLB": 2.0}
                }}
            }}
        });
        let out = migrate(&doc).unwrap();
        let r1 = &out["RESULTS"]["modelA"]["refX"]["r1"];
        assert_eq!(r1["NHEX"]["rms_xy"]["djf"], json!(1.23));
        assert_eq!(r1["global"]["bias_xy"]["ann"], json!(0.5));
        assert_eq!(r1["global"]["custom_thing"], json!(7));
        assert_eq!(r1["land_global"]["rms_xy"]["ann"], json!(2.0));
        assert_eq!(out["RESULTS"]["modelA"]["units"], json!("K"));
        assert_eq!(out["json_version"], json!(3.0));

        assert_eq!(migrate(&out).unwrap(), out);
    }

    #[test]
    fn test_v2_migration() {
        let doc = json!({
            "json_version": "2.0",
            "RESULTS": {"modelA": {"refX": {"source": "X", "r1": {
                "NHEX": {"rms_xy_djf": 1.0, "cor_xy_ann": 0.9, "std_xy": {"ann": 3.0}}
            }}}}
        });
        let out = migrate(&doc).unwrap();
        let nhex = &out["RESULTS"]["modelA"]["refX"]["r1"]["NHEX"];
        assert_eq!(nhex["rms_xy"]["djf"], json!(1.0));
        assert_eq!(nhex["cor_xy"]["ann"], json!(0.9));
        assert_eq!(nhex["std_xy"]["ann"], json!(3.0));
    }

    #[test]
    fn test_version_guessed_without_json_version() {
        let v1 = json!({"RESULTS": {"m": {"r": {"source": {}, "r1": {"global": {"bias_xy_djf_NHEX": 1.0}}}}}});
        assert_eq!(detect_version(v1.as_object().unwrap()), 1.0);
        let v2 = json!({"RESULTS": {"m": {"r": {"source": {}, "r1": {"NHEX": {"bias_xy_djf": 1.0}}}}}});
        assert_eq!(detect_version(v2.as_object().unwrap()), 2.0);
        let v3 = json!({"json_structure": ["model"], "RESULTS": {"m": 1.0}});
        assert_eq!(detect_version(v3.as_object().unwrap()), 3.0);

        let out = migrate(&v1).unwrap();
        assert_eq!(out["RESULTS"]["m"]["r"]["r1"]["NHEX"]["bias_xy"]["djf"], json!(1.0));
        assert_eq!(out["json_structure"][0], json!("model"));
    }

    #[test]
    fn test_current_document_keeps_missing_structure() {
        let doc = json!({"json_version": 3.0, "RESULTS": {"m": {"s": 1.0}}});
        let out = migrate(&doc).unwrap();
        assert!(out.get("json_structure").is_none());
    }

    #[test]
    fn test_bad_legacy_layout() {
        let doc = json!({"json_version": 1.0, "RESULTS": {"m": {"r": {"source": {}, "r1": {"global": {"rms": 1.0}}}}}});
        assert!(matches!(migrate(&doc), Err(SchemaMigrationError::BadStatisticKey { .. })));
        let doc = json!({"json_version": 2.0, "RESULTS": {"m": {"r": {"source": {}, "r1": 3}}}});
        assert!(matches!(migrate(&doc), Err(SchemaMigrationError::NotAnObject { .. })));
        assert!(matches!(migrate(&json!({"json_version": 3.0})), Err(SchemaMigrationError::MissingResults)));
    }

    #[test]
    fn test_variable_axis_from_document() {
        let doc = json!({"Variable": {"id": "ua", "level": 85000.0}, "json_structure": structure(), "RESULTS": {"m": {}}});
        let p = prepare_document(&doc, None, &structure(), true).unwrap();
        assert_eq!(p.structure[0], VARIABLE_AXIS);
        assert_eq!(p.structure.len(), 7);
        assert!(p.tree.contains_key("ua-850"));

        let doc = json!({"json_structure": structure(), "RESULTS": {"m": {}}});
        let p = prepare_document(&doc, Some("pr_2.5x2.5_regrid2_linear_metrics.json"), &structure(), true).unwrap();
        assert!(p.tree.contains_key("pr"));
    }

    #[test]
    fn test_no_overwrite_keeps_both() {
        let mut base = json!({"a": {"b": 1.0, "c": 2.0}}).as_object().unwrap().clone();
        let update = json!({"a": {"b": 5.0, "c": 2.0, "d": 3.0}}).as_object().unwrap().clone();
        merge_no_overwrite(&mut base, update);
        assert_eq!(Value::Object(base), json!({"a": {"b": 1.0, "c": 2.0, "b_1": 5.0, "d": 3.0}}));
    }

    #[test]
    fn test_axis_values_human_sorted() {
        let mut jsons = MetricsJsons::new(vec!["model".to_owned(), "stat".to_owned()]).one_variable_per_file(false);
        jsons.add_document(&json!({"json_structure": ["model", "stat"], "RESULTS": {
            "m10": {"s": 1.0}, "m2": {"s": 2.0}, "m1": {"s": 3.0, "SimulationDescription": {"x": "y"}}
        }}), None).unwrap();
        let axes = jsons.axis_list();
        assert_eq!(axes[0].values, vec!["m1", "m2", "m10"]);
        assert_eq!(axes[1].values, vec!["s"]);
    }

    #[test]
    fn test_slice_and_errors() {
        let mut jsons = MetricsJsons::new(Vec::new()).one_variable_per_file(false);
        jsons.add_document(&json!({"json_structure": ["model", "stat"], "RESULTS": {
            "a": {"s": 1.0}, "b": {"s": 2.0}, "c": {"s": 3.0}
        }}), None).unwrap();

        let q = Query::new().subset("model", Subset::Slice { start: Some(1), stop: None, step: 1 });
        let arr = jsons.query(&q).unwrap();
        assert_eq!(arr.axes[0].values, vec!["b", "c"]);
        assert_eq!(arr.get(&["c", "s"]), Some(3.0));

        assert!(matches!(jsons.query(&Query::new().values("model", &["zz"])), Err(PmpError::InvalidAxisValue { .. })));
        assert!(matches!(jsons.query(&Query::new().values("season", &["ann"])), Err(PmpError::InvalidAxis { .. })));
        assert!(matches!(jsons.query(&Query::new().merge(&["model", "bogus"])), Err(PmpError::InvalidAxis { .. })));
    }

    #[test]
    fn test_empty_document() {
        let mut jsons = MetricsJsons::new(Vec::new()).one_variable_per_file(false);
        jsons.add_document(&json!({"json_structure": ["model", "stat"], "RESULTS": {}}), None).unwrap();
        assert!(matches!(jsons.query(&Query::new()), Err(PmpError::EmptyDocument)));
    }

    #[test]
    fn test_fillin_and_order() {
        let mut jsons = MetricsJsons::new(Vec::new()).one_variable_per_file(false);
        jsons.add_document(&json!({"json_structure": ["model", "rip", "stat"], "RESULTS": {
            "a": {"r1": {"s": 1.0}, "r2": {"s": 9.0, "t": 4.0}},
            "b": {"r2": {"t": 5.0}}
        }}), None).unwrap();

        let arr = jsons.query(&Query::new().fillin("rip")).unwrap();
        assert_eq!(arr.axis_ids(), vec!["model", "stat"]);
        assert_eq!(arr.get(&["a", "s"]), Some(1.0));
        assert_eq!(arr.get(&["a", "t"]), Some(4.0));
        assert_eq!(arr.get(&["b", "s"]), None);

        let arr = jsons.query(&Query::new().order(&["stat"])).unwrap();
        assert_eq!(arr.axis_ids(), vec!["stat", "model", "rip"]);
        assert_eq!(arr.get(&["t", "b", "r2"]), Some(5.0));
    }

    #[test]
    fn test_merged_axes() {
        let mut jsons = MetricsJsons::new(Vec::new()).one_variable_per_file(false);
        jsons.add_document(&json!({"json_structure": ["model", "rip", "stat"], "RESULTS": {
            "a": {"r1": {"s": 1.0}, "r2": {"s": 9.0, "t": 4.0}},
            "b": {"r2": {"t": "5.5"}}
        }}), None).unwrap();

        let arr = jsons.query(&Query::new().merge(&["model", "rip"])).unwrap();
        assert_eq!(arr.axis_ids(), vec!["model_rip", "stat"]);
        assert_eq!(arr.axes[0].values, vec!["a_r1", "a_r2", "b_r1", "b_r2"]);
        assert_eq!(arr.shape(), &[4, 2]);
        assert_eq!(arr.get(&["a_r2", "t"]), Some(4.0));
        assert_eq!(arr.get(&["b_r2", "t"]), Some(5.5));
        assert!(arr.mask()[&[2usize, 0][..]]);

        let arr = jsons.query(&Query::new().merge(&["stat", "model"])).unwrap();
        assert_eq!(arr.axis_ids(), vec!["stat_model", "rip"]);
        assert_eq!(arr.axes[0].values[1], "s_b");
    }
}
