//! Data sources: where one side of a comparison comes from and how it is loaded.
//!
//! Observations and models share one load pipeline (read, source mask, regrid, target mask,
//! domain subset) and differ only in how their file path and land fraction are found.

use std::cell::OnceCell;
use std::path::PathBuf;

use serde_json::Value;

use crate::config::RunConfig;
use crate::error::LoadError;
use crate::field::{Field, FieldIo};
use crate::grid::{Grid, Regridder};
use crate::mask::{region_mask, LandFraction, LandSeaClassifier, MaskRegistry, SourceMask, SFTLF};
use crate::parallel::{FilePool, ShowProgress};
use crate::obs_registry::ObsRegistry;
use crate::region::Region;
use crate::template::{resolve_path, Attributes, FileTemplate};
use crate::variable::VariableId;

/// Layout of observation files under the reference data path.
pub const OBS_TEMPLATE: &str = "%(realm)/%(frequency)/%(variable)/%(reference)/%(ac)/%(filename)";

/// Realization used when looking up a model's land fraction file.
pub const SFTLF_REALIZATION: &str = "r0i0p0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Observation,
    Model,
}

/// The table/realm pair decided by whether a variable is an ocean variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realm {
    pub table: &'static str,
    pub realm: &'static str,
    pub ocean: bool,
}

impl Realm {
    pub fn for_variable(obs: &ObsRegistry, var: &str) -> Self {
        if obs.use_omon(var) {
            Self { table: "Omon", realm: "ocn", ocean: true }
        } else {
            Self { table: "Amon", realm: "atm", ocean: false }
        }
    }
}

/// What a data source needs from the run: its configuration and the observation catalogue.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub config: &'a RunConfig,
    pub obs: &'a ObsRegistry,
}

impl<'a> SourceContext<'a> {
    /// Attributes every template of this run can use for `var`: run settings, the target grid
    /// and the custom keys.
    pub fn base_attributes(&self, var: &VariableId) -> Attributes {
        let cfg = self.config;
        let realm = Realm::for_variable(self.obs, &var.var);
        let (tool, method) = cfg.regrid_for(realm.ocean);

        let mut attrs = Attributes::new();
        attrs.insert("variable".to_owned(), var.var.clone());
        attrs.insert("level".to_owned(), var.level_suffix());
        attrs.insert("case_id".to_owned(), cfg.case_id.clone());
        attrs.insert("period".to_owned(), cfg.period.clone());
        attrs.insert("realization".to_owned(), cfg.realization.clone());
        attrs.insert("table".to_owned(), realm.table.to_owned());
        attrs.insert("realm".to_owned(), realm.realm.to_owned());
        attrs.insert("target_grid_name".to_owned(), cfg.target_grid.name());
        attrs.insert("regrid_tool".to_owned(), tool.to_owned());
        attrs.insert("regrid_method".to_owned(), method.to_owned());
        attrs.extend(cfg.custom_key_values(&var.var));
        attrs
    }
}

/// One side of a comparison, fully resolved but not yet loaded.
#[derive(Debug)]
pub struct DataSource {
    pub kind: SourceKind,
    /// The name the source is reported under: the reference token ("default") for
    /// observations, the model name for models
    pub name: String,
    /// Key of this source's land fraction in the mask registry
    pub mask_key: String,
    pub variable: VariableId,
    pub var_in_file: String,
    pub region: Region,
    pub regrid_tool: String,
    pub regrid_method: String,
    pub file_path: PathBuf,
    pub mask_path: Option<PathBuf>,
    /// The catalogue entry of the data set an observation resolved to
    pub metadata: Option<Value>,
    checksum: OnceCell<Result<String, LoadError>>,
}

impl DataSource {
    /// An observation data set, looked up in the catalogue by reference name or alias.
    pub fn observation(ctx: SourceContext, var: &VariableId, reference: &str, region: &Region) -> Result<Self, LoadError> {
        let resolved = ctx.obs.resolve(&var.var, reference)?;
        let mut attrs = ctx.base_attributes(var);
        let (frequency, ac) = obs_table_layout(&resolved.dataset.cmor_table);
        attrs.insert("frequency".to_owned(), frequency.to_owned());
        attrs.insert("ac".to_owned(), ac.to_owned());
        attrs.insert("reference".to_owned(), resolved.name.to_owned());
        attrs.insert("filename".to_owned(), resolved.dataset.filename.clone());
        let file_path = resolve_path(&ctx.config.reference_data_path, &FileTemplate::new(OBS_TEMPLATE), &attrs, None)?;

        let mask_path = resolved.dataset.ref_name.as_deref()
            .and_then(|ref_name| obs_mask_path(ctx, ref_name));
        if mask_path.is_none() {
            log::info!("Could not figure out the land fraction file of {} from the observation catalogue", resolved.name);
        }

        let metadata = serde_json::to_value(resolved.dataset).ok();
        let (tool, method) = ctx.config.regrid_for(Realm::for_variable(ctx.obs, &var.var).ocean);

        Ok(Self {
            kind: SourceKind::Observation,
            name: reference.to_owned(),
            mask_key: resolved.name.to_owned(),
            variable: var.clone(),
            var_in_file: var.var.clone(),
            region: region.clone(),
            regrid_tool: tool.to_owned(),
            regrid_method: method.to_owned(),
            file_path,
            mask_path,
            metadata,
            checksum: OnceCell::new(),
        })
    }

    /// A model, located with the run's `filename_template` under the test data path.
    pub fn model(ctx: SourceContext, var: &VariableId, model: &str, region: &Region) -> Result<Self, LoadError> {
        let cfg = ctx.config;
        let mut attrs = ctx.base_attributes(var);
        attrs.insert("model_version".to_owned(), model.to_owned());
        attrs.insert("ext".to_owned(), "nc".to_owned());
        let file_path = resolve_path(&cfg.test_data_path, &cfg.filename_template, &attrs, Some("nc"))?;

        let (tool, method) = cfg.regrid_for(Realm::for_variable(ctx.obs, &var.var).ocean);
        Ok(Self {
            kind: SourceKind::Model,
            name: model.to_owned(),
            mask_key: model.to_owned(),
            variable: var.clone(),
            var_in_file: cfg.var_in_file(model, &var.var),
            region: region.clone(),
            regrid_tool: tool.to_owned(),
            regrid_method: method.to_owned(),
            file_path,
            mask_path: model_mask_path(ctx, model).ok(),
            metadata: None,
            checksum: OnceCell::new(),
        })
    }

    /// Either side of a comparison: an observation when the catalogue knows `name` for this
    /// variable, a model otherwise.
    pub fn lookup(ctx: SourceContext, var: &VariableId, name: &str, region: &Region) -> Result<Self, LoadError> {
        if ctx.obs.contains(&var.var, name) {
            Self::observation(ctx, var, name, region)
        } else {
            Self::model(ctx, var, name, region)
        }
    }

    pub fn file_name(&self) -> String {
        self.file_path.file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Checksum of the source file, computed on first use.
    pub fn checksum(&self, io: &dyn FieldIo) -> Result<String, LoadError> {
        self.checksum.get_or_init(|| io.checksum(&self.file_path)).clone()
    }
}

/// Everything the load pipeline uses besides the mask registry.
#[derive(Clone, Copy)]
pub struct LoadEnv<'a> {
    pub io: &'a dyn FieldIo,
    pub regridder: &'a dyn Regridder,
    pub classifier: &'a dyn LandSeaClassifier,
    pub target: &'a Grid,
    pub generate_sftlf: bool,
}

/// Load a source's variable onto the target grid, masked and subset to its region.
pub fn load(source: &DataSource, env: &LoadEnv, masks: &mut MaskRegistry) -> Result<Field, LoadError> {
    let mut field = env.io.read_field(&source.file_path, &source.var_in_file, source.variable.level)?;

    if let Some(value) = source.region.value {
        let mask = source_region_mask(source, &field, value, env, masks)?;
        field.mask_where(&mask)?;
    }

    let mut field = env.regridder.regrid(&field, env.target, &source.regrid_tool, &source.regrid_method)?;

    if let Some(value) = source.region.value {
        let target = masks.target_land_fraction()?;
        field.mask_where(&region_mask(target, value))?;
    }

    if let Some(domain) = &source.region.domain {
        field = field.subset(domain);
    }

    Ok(field)
}

fn source_region_mask(source: &DataSource, field: &Field, value: f64, env: &LoadEnv, masks: &mut MaskRegistry) -> Result<ndarray::Array2<bool>, LoadError> {
    if masks.get(&source.mask_key).is_none() {
        match &source.mask_path {
            Some(p) => masks.load_source(&source.mask_key, p, env.io),
            None => { masks.source(&source.mask_key); },
        }
    }

    let entry = masks.source(&source.mask_key);
    if source.kind == SourceKind::Model && !env.generate_sftlf && !entry.is_loaded() {
        return Err(LoadError::MaskUnavailable {
            source_name: source.name.clone(),
            reason: format!("no land fraction file and generate_sftlf is off, skipping region {}", source.region.id),
        });
    }

    let land_fraction = entry.get_or_generate(|| {
        let sftlf = env.classifier.land_fraction(&field.lat, &field.lon)?;
        Ok(LandFraction { lat: field.lat.clone(), lon: field.lon.clone(), sftlf })
    })?;
    let sftlf = land_fraction.on_grid(&field.lat, &field.lon)?;
    Ok(region_mask(&sftlf, value))
}

/// Realm directory parts for an observation of the given CMOR table.
fn obs_table_layout(table: &str) -> (&'static str, &'static str) {
    match table {
        "fx" => ("fx", ""),
        _ => ("mo", "ac"),
    }
}

fn obs_mask_path(ctx: SourceContext, ref_name: &str) -> Option<PathBuf> {
    let resolved = ctx.obs.resolve(SFTLF, ref_name).ok()?;
    let (frequency, ac) = obs_table_layout(&resolved.dataset.cmor_table);
    let realm = if resolved.dataset.cmor_table == "Omon" { "ocn" } else if resolved.dataset.cmor_table == "fx" { "" } else { "atm" };

    let mut attrs = Attributes::new();
    attrs.insert("realm".to_owned(), realm.to_owned());
    attrs.insert("frequency".to_owned(), frequency.to_owned());
    attrs.insert("ac".to_owned(), ac.to_owned());
    attrs.insert("variable".to_owned(), SFTLF.to_owned());
    attrs.insert("reference".to_owned(), resolved.name.to_owned());
    attrs.insert("filename".to_owned(), resolved.dataset.filename.clone());
    resolve_path(&ctx.config.reference_data_path, &FileTemplate::new(OBS_TEMPLATE), &attrs, None).ok()
}

/// Where a model's land fraction file should be: the `sftlf_filename_template` (or the data
/// template) rendered for table `fx`.
pub fn model_mask_path(ctx: SourceContext, model: &str) -> Result<PathBuf, LoadError> {
    let cfg = ctx.config;
    let template = cfg.sftlf_filename_template.as_ref().unwrap_or(&cfg.filename_template);

    let mut attrs = Attributes::new();
    attrs.insert("variable".to_owned(), SFTLF.to_owned());
    attrs.insert("model_version".to_owned(), model.to_owned());
    attrs.insert("table".to_owned(), "fx".to_owned());
    attrs.insert("realm".to_owned(), "atmos".to_owned());
    attrs.insert("period".to_owned(), cfg.period.clone());
    attrs.insert("ext".to_owned(), "nc".to_owned());
    attrs.insert("case_id".to_owned(), cfg.case_id.clone());
    attrs.insert("realization".to_owned(), SFTLF_REALIZATION.to_owned());
    attrs.extend(cfg.custom_key_values(SFTLF));
    Ok(resolve_path(&cfg.test_data_path, template, &attrs, Some("nc"))?)
}

/// Register the land fraction file of every data set in `names` whose source the registry
/// does not know yet. Observations find theirs through the catalogue, models through
/// `model_mask_path`. The files are read on `pool`.
pub fn register_masks(
    ctx: SourceContext,
    io: &dyn FieldIo,
    pool: &FilePool,
    masks: &mut MaskRegistry,
    var: &VariableId,
    names: &[String]
) {
    let mut pending: Vec<(String, Option<PathBuf>)> = Vec::new();
    for name in names {
        match DataSource::lookup(ctx, var, name, &Region::global()) {
            Ok(src) => {
                if masks.get(&src.mask_key).is_none() && !pending.iter().any(|(k, _)| *k == src.mask_key) {
                    pending.push((src.mask_key, src.mask_path));
                }
            },
            Err(e) => log::debug!("No land fraction for {name}: {e}"),
        }
    }

    let read = pool.map(&pending, "Reading land fractions", ShowProgress::No, |(key, path)| match path {
        Some(p) => SourceMask::read(key, p, io),
        None => SourceMask::empty(key),
    });
    for mask in read {
        masks.insert(mask);
    }
}
