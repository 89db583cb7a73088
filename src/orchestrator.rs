//! The mean climate driver: every variable, region, reference and test data set, in nested
//! loops, with one result document written per variable.

use std::collections::BTreeSet;
use std::path::PathBuf;

use log::{error, info, warn};
use serde_json::json;

use crate::config::RunConfig;
use crate::dataset::{self, DataSource, LoadEnv, Realm, SourceContext};
use crate::error::{LoadError, PmpError};
use crate::field::{Field, FieldIo, NetcdfIo};
use crate::grid::{Grid, GridRegridder, Regridder};
use crate::mask::{LandSeaClassifier, MaskRegistry, NoClassifier};
use crate::metrics::{MeanClimateMetrics, MetricDoc, MetricsAdapter};
use crate::obs_registry::ObsRegistry;
use crate::output::{simulation_description, GridInfo, MetricsDocument};
use crate::parallel::FilePool;
use crate::provenance::Provenance;
use crate::region::Region;
use crate::store::{self, OutputType, DEFAULT_JSON_STRUCTURE};
use crate::template::{find_matching_files, resolve_path};
use crate::variable::VariableId;

/// A comparison that was not computed, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPair {
    pub variable: String,
    pub reference: String,
    pub test: String,
    pub region: String,
    pub reason: LoadError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// JSON result files, one per variable
    pub written: Vec<PathBuf>,
    pub skipped: Vec<SkippedPair>,
}

pub struct MetricsOrchestrator {
    config: RunConfig,
    obs: ObsRegistry,
    io: Box<dyn FieldIo>,
    regridder: Box<dyn Regridder>,
    classifier: Box<dyn LandSeaClassifier>,
    metrics: Box<dyn MetricsAdapter>,
    custom_metrics: Option<Box<dyn MetricsAdapter>>,
}

/// Where one (reference, test, region) comparison stands in the loops.
struct Pair<'a> {
    var: &'a VariableId,
    region: &'a Region,
    reference: &'a str,
    test: &'a str,
    first_reference: bool,
}

impl MetricsOrchestrator {
    /// An orchestrator reading netCDF files, with the built-in regridder and statistics and no
    /// land/sea classifier.
    pub fn new(config: RunConfig, obs: ObsRegistry) -> Self {
        let io = NetcdfIo::new(config.runtime);
        Self {
            config,
            obs,
            io: Box::new(io),
            regridder: Box::new(GridRegridder),
            classifier: Box::new(NoClassifier),
            metrics: Box::new(MeanClimateMetrics),
            custom_metrics: None,
        }
    }

    pub fn with_backend<T: FieldIo + 'static>(mut self, io: T) -> Self {
        self.io = Box::new(io);
        self
    }

    pub fn with_regridder<T: Regridder + 'static>(mut self, regridder: T) -> Self {
        self.regridder = Box::new(regridder);
        self
    }

    pub fn with_land_sea_classifier<T: LandSeaClassifier + 'static>(mut self, classifier: T) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn with_metrics<T: MetricsAdapter + 'static>(mut self, metrics: T) -> Self {
        self.metrics = Box::new(metrics);
        self
    }

    pub fn with_custom_metrics<T: MetricsAdapter + 'static>(mut self, metrics: T) -> Self {
        self.custom_metrics = Some(Box::new(metrics));
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn context(&self) -> SourceContext<'_> {
        SourceContext { config: &self.config, obs: &self.obs }
    }

    /// Run every comparison and write the result files.
    ///
    /// Comparisons that cannot be made (missing files, unknown references, shape mismatches,
    /// unavailable masks) are logged and listed in the summary. Configuration errors and
    /// failures to write a result file abort the run.
    pub fn run(&self) -> Result<RunSummary, PmpError> {
        let cfg = &self.config;
        let grid = Grid::from_spec(&cfg.target_grid)?;
        let env = LoadEnv {
            io: self.io.as_ref(),
            regridder: self.regridder.as_ref(),
            classifier: self.classifier.as_ref(),
            target: &grid,
            generate_sftlf: cfg.generate_sftlf,
        };
        let mut masks = if cfg.dry_run {
            MaskRegistry::new(&grid, &NoClassifier)
        } else {
            MaskRegistry::new(&grid, self.classifier.as_ref())
        };
        let provenance = if cfg.dry_run { None } else { Some(Provenance::collect()) };
        let pool = FilePool::new(cfg.num_workers)?;

        let mut summary = RunSummary::default();
        for var_long in &cfg.vars {
            let var = VariableId::parse_with_delimiters(var_long, &cfg.level_delimiters)?;
            info!("Variable {var_long} (var = {}, level = {:?})", var.var, var.level);
            let (out_path, out_type) = self.output_path(&var)?;

            let regions = cfg.regions.regions_for(&var.var)?;
            let references = self.obs.expand_references(&var.var, &cfg.reference_data_set);
            let tests = self.expand_tests(&var)?;
            if references.is_empty() {
                warn!("No reference data sets for {var_long}");
            }

            let mut doc = MetricsDocument::new(&var);
            if !cfg.dry_run {
                let sources: Vec<String> = references.iter().chain(&tests).cloned().collect();
                dataset::register_masks(self.context(), self.io.as_ref(), &pool, &mut masks, &var, &sources);
                check_masked_regions(&regions, &masks, var_long)?;
                self.describe_metrics(&var, &mut doc);
            }

            for region in &regions {
                info!("Region {}", region.id);
                doc.add_region(region);
                for (i_ref, reference) in references.iter().enumerate() {
                    for test in &tests {
                        let pair = Pair { var: &var, region, reference, test, first_reference: i_ref == 0 };
                        match self.compare(&pair, &env, &mut masks, &mut doc) {
                            Ok(()) => {},
                            Err(e) if e.is_fatal() => return Err(e.into()),
                            Err(e) => {
                                warn!("Skipping {var_long}, reference {reference}, test {test}, region {}: {e}", region.id);
                                summary.skipped.push(SkippedPair {
                                    variable: var_long.clone(),
                                    reference: reference.clone(),
                                    test: test.clone(),
                                    region: region.id.clone(),
                                    reason: e,
                                });
                            }
                        }
                    }
                }
            }

            match &provenance {
                Some(prov) => {
                    self.write_document(&out_path, out_type, &doc, prov)?;
                    summary.written.push(out_path);
                },
                None => info!("Dry run, results for {var_long} would be written to {}", out_path.display()),
            }
        }

        Ok(summary)
    }

    /// The test data sets for a variable. "all" stands for every model with a file matching
    /// `filename_template` under the test data path.
    fn expand_tests(&self, var: &VariableId) -> Result<Vec<String>, PmpError> {
        let cfg = &self.config;
        if !cfg.test_data_set.iter().any(|t| t.eq_ignore_ascii_case("all")) {
            return Ok(cfg.test_data_set.clone());
        }

        let mut fixed = self.context().base_attributes(var);
        fixed.insert("ext".to_owned(), "nc".to_owned());
        let found = find_matching_files(&cfg.test_data_path, &cfg.filename_template, &fixed)
            .map_err(|e| PmpError::from_io_error(e, cfg.test_data_path.clone()))?;
        let models: BTreeSet<String> = found.into_iter()
            .filter_map(|(_, attrs)| attrs.get("model_version").cloned())
            .collect();
        info!("Found {} models for {}", models.len(), var.long_name);
        Ok(models.into_iter().collect())
    }

    fn describe_metrics(&self, var: &VariableId, doc: &mut MetricsDocument) {
        match self.metrics.describe(var) {
            Ok(docs) => doc.metrics.extend(docs),
            Err(e) => {
                warn!("Could not document the statistics: {e}");
                doc.metrics.insert("default".to_owned(), MetricDoc::Text(self.metrics.description()));
            }
        }

        if let Some(custom) = &self.custom_metrics {
            match custom.describe(var) {
                Ok(docs) => doc.metrics.extend(docs),
                Err(e) => {
                    info!("Custom metrics have no statistic documentation ({e}), using their description");
                    doc.metrics.insert("custom".to_owned(), MetricDoc::Text(custom.description()));
                }
            }
        }
    }

    fn compare(&self, pair: &Pair, env: &LoadEnv, masks: &mut MaskRegistry, doc: &mut MetricsDocument) -> Result<(), LoadError> {
        let cfg = &self.config;
        let ctx = self.context();
        let ref_src = DataSource::lookup(ctx, pair.var, pair.reference, pair.region)?;
        let test_src = DataSource::lookup(ctx, pair.var, pair.test, pair.region)?;
        let source = ref_src.metadata.clone()
            .unwrap_or_else(|| json!({"filename": ref_src.file_name()}));
        doc.add_reference(&ref_src.name, source.clone());

        if cfg.dry_run {
            info!("Dry run: {} ({}) vs {} ({}), region {}",
                ref_src.name, ref_src.file_path.display(), test_src.name, test_src.file_path.display(), pair.region.id);
            return Ok(());
        }

        let obs_field = dataset::load(&ref_src, env, masks)?;
        let test_field = dataset::load(&test_src, env, masks)?;
        if obs_field.shape() != test_field.shape() {
            return Err(LoadError::ShapeMismatch { reference: obs_field.shape().to_vec(), test: test_field.shape().to_vec() });
        }

        if !doc.results.get(&test_src.name).map(|t| t.is_described()).unwrap_or(false) {
            self.describe_test(&test_src, &test_field, masks, doc);
        }

        let mut stats = self.metrics.compute(pair.var, &test_field, &obs_field)?;
        if let Some(custom) = &self.custom_metrics {
            match custom.compute(pair.var, &test_field, &obs_field) {
                Ok(extra) => stats.extend(extra),
                Err(e) => warn!("Custom metrics failed for {} vs {}: {e}", test_src.name, ref_src.name),
            }
        }

        if doc.grid_info.is_none() {
            let shape = test_field.shape();
            doc.grid_info = Some(GridInfo {
                regrid_method: test_src.regrid_method.clone(),
                regrid_tool: test_src.regrid_tool.clone(),
                grid_name: env.target.name.clone(),
                grid_resolution: shape[shape.len().saturating_sub(2)..].to_vec(),
            });
        }

        doc.set_region_results(&test_src.name, &ref_src.name, &source, &cfg.realization, &pair.region.id, stats);

        if pair.first_reference && cfg.save_test_clims {
            self.save_interpolated(pair, &test_field);
        }
        Ok(())
    }

    /// Fill in the per-test entries written once: units, simulation description and input
    /// file names with their checksums.
    fn describe_test(&self, test_src: &DataSource, test_field: &Field, masks: &MaskRegistry, doc: &mut MetricsDocument) {
        let table = Realm::for_variable(&self.obs, &test_src.variable.var).table;
        let description = simulation_description(&self.config, self.io.as_ref(), test_src, table);
        let checksum = match test_src.checksum(self.io.as_ref()) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("Could not checksum {}: {e}", test_src.file_path.display());
                None
            }
        };
        let mask = masks.get(&test_src.mask_key);

        let entry = doc.test_entry(&test_src.name);
        entry.units = test_field.units.clone();
        entry.simulation_description = Some(description);
        entry.input_climatology_file_name = Some(test_src.file_name());
        entry.input_climatology_md5 = checksum;
        entry.input_region_file_name = mask.and_then(|m| m.filename.clone());
        entry.input_region_md5 = mask.and_then(|m| m.checksum.clone());
    }

    /// Write the regridded test field. A failure only loses this file.
    fn save_interpolated(&self, pair: &Pair, field: &Field) {
        let cfg = &self.config;
        let mut attrs = self.context().base_attributes(pair.var);
        attrs.insert("model_version".to_owned(), pair.test.to_owned());
        attrs.insert("ext".to_owned(), ".nc".to_owned());

        let root = cfg.test_clims_interpolated_output.join(&pair.region.id);
        let path = match resolve_path(&root, &cfg.filename_output_template, &attrs, Some("nc")) {
            Ok(p) => p,
            Err(e) => {
                error!("Cannot name the interpolated climatology of {}: {e}", pair.test);
                return;
            }
        };
        match self.io.write_field(&path, field) {
            Ok(()) => info!("Wrote interpolated climatology {}", path.display()),
            Err(e) => error!("Could not write interpolated climatology {}: {e}", path.display()),
        }
    }

    /// Where a variable's results go, and in which format. The format follows the extension
    /// written in `output_json_template`, JSON if it has none.
    fn output_path(&self, var: &VariableId) -> Result<(PathBuf, OutputType), PmpError> {
        let template = &self.config.output_json_template;
        let (ext, kind) = match template.literal_extension() {
            Some(ext) => (ext, OutputType::from_extension(ext)?),
            None => (OutputType::Json.extension(), OutputType::Json),
        };
        if kind == OutputType::Netcdf {
            return Err(PmpError::invalid_config("output_json_template", "results can only be written as json or txt"));
        }

        let attrs = self.context().base_attributes(var);
        let path = resolve_path(&self.config.metrics_output_path, template, &attrs, Some(ext))
            .map_err(|e| PmpError::Load(e.into()))?;
        Ok((path, kind))
    }

    /// Write the results. A JSON document also gets a text mirror, which is allowed to fail.
    fn write_document(&self, path: &std::path::Path, kind: OutputType, doc: &MetricsDocument, provenance: &Provenance) -> Result<(), PmpError> {
        let data = store::to_object(doc, path)?;
        match kind {
            OutputType::Json => {
                let structure: Vec<String> = DEFAULT_JSON_STRUCTURE.iter().map(|s| s.to_string()).collect();
                store::write_json(path, data.clone(), Some(&structure), provenance)?;
                info!("Wrote {} ({} results)", path.display(), doc.n_results());

                let txt_path = path.with_extension(OutputType::Text.extension());
                if let Err(e) = store::write_text(&txt_path, &data) {
                    error!("Could not write the text copy of the results: {e}");
                }
            },
            OutputType::Text => {
                store::write_text(path, &data)?;
                info!("Wrote {} ({} results)", path.display(), doc.n_results());
            },
            OutputType::Netcdf => return Err(PmpError::UnknownOutputType(kind.extension().to_owned())),
        }
        Ok(())
    }
}

/// Masked regions need the target grid's land fraction. Without a classifier it can only
/// come from a data set's land fraction file, so a run where none was found cannot compute
/// any of them.
fn check_masked_regions(regions: &[Region], masks: &MaskRegistry, var_long: &str) -> Result<(), PmpError> {
    let masked: Vec<&str> = regions.iter()
        .filter(|r| r.value.is_some())
        .map(|r| r.id.as_str())
        .collect();
    if masked.is_empty() || masks.has_target_land_fraction() {
        return Ok(());
    }
    Err(PmpError::invalid_config("land_sea_mask_file", format!(
        "regions {} of {var_long} are masked by land fraction, but no land/sea mask is configured and no data set has a land fraction file",
        masked.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterFile;
    use serde_json::json;

    fn orchestrator(output: &str, extra: &str) -> MetricsOrchestrator {
        let params: ParameterFile = toml::from_str(&format!(r#"
            vars = ["tas"]
            reference_data_set = ["all"]
            test_data_set = ["ModelA"]
            target_grid = "2.5x2.5"
            filename_template = "%(variable)_%(model_version).nc"
            test_data_path = "/nonexistent/models"
            reference_data_path = "/nonexistent/obs"
            metrics_output_path = {output:?}
            {extra}
        "#)).unwrap();
        let obs = ObsRegistry::from_value(json!({
            "tas": {
                "default": "ERA5",
                "alternate1": "JRA55",
                "ERA5": {"CMIP_CMOR_TABLE": "Amon", "filename": "tas_ERA5.nc"},
                "JRA55": {"CMIP_CMOR_TABLE": "Amon", "filename": "tas_JRA55.nc"}
            }
        })).unwrap();
        MetricsOrchestrator::new(RunConfig::from_parameters(params).unwrap(), obs)
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().to_string_lossy(), r#"regions = { tas = ["global", "NHEX"] }"#);
        let summary = orch.run().unwrap();
        // 2 references x 1 test x 2 regions
        assert_eq!(summary.skipped.len(), 4);
        assert!(summary.skipped.iter().all(|s| matches!(s.reason, LoadError::FileNotFound { .. })));
        assert_eq!(summary.written.len(), 1);
        assert!(summary.written[0].exists());
    }

    #[test]
    fn test_output_path() {
        let orch = orchestrator("/nonexistent/out", "");
        let var = VariableId::parse("tas").unwrap();
        assert_eq!(orch.output_path(&var).unwrap().0, PathBuf::from("/nonexistent/out/tas_2.5x2.5_regrid2_linear_metrics.json"));
    }

    #[test]
    fn test_dry_run_resolves_without_writing() {
        let orch = orchestrator("/nonexistent/out", "dry_run = true");
        let summary = orch.run().unwrap();
        assert!(summary.written.is_empty());
        assert!(summary.skipped.is_empty());
    }
}
