use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::PmpError;
use crate::grid::GridSpec;
use crate::region::{RegionRegistry, RegionSpec};
use crate::template::FileTemplate;
use crate::variable::DEFAULT_LEVEL_DELIMITERS;

/// Key used in `custom_keys`, `model_tweaks` and `simulation_description_mapping` tables for
/// "applies to every variable/model".
pub const ALL_KEY: &str = "*";

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(variable)%(level)_%(target_grid_name)_%(regrid_tool)_%(regrid_method)_metrics";
pub const DEFAULT_INTERPOLATED_TEMPLATE: &str = "%(variable)%(level)_%(model_version)_%(table)_%(realization)_%(period).interpolated.%(regrid_method).%(target_grid_name)-clim%(ext)";
pub const DEFAULT_INTERPOLATED_DIR: &str = "interpolated_model_clims";
pub const OBS_CATALOGUE_NAME: &str = "obs_info_dictionary.json";

/// Compute mean climate metrics of models against observations.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct Args {
    /// Path to the TOML parameter file describing the run
    #[clap(short = 'p', long = "parameters")]
    pub parameters: PathBuf,

    /// Override the parameter file's case_id
    #[clap(long)]
    pub case_id: Option<String>,

    /// Resolve every input and output path without computing or writing anything
    #[clap(long)]
    pub dry_run: bool,

    /// Increase logging verbosity (repeat for more)
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Flags for netCDF files this program writes. Built once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub netcdf: NetcdfFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct NetcdfFlags {
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub deflate_level: i32,
}

impl NetcdfFlags {
    /// `(level, shuffle)` as the netCDF writer expects it, or `None` with deflation off.
    pub fn compression(&self) -> Option<(i32, bool)> {
        if self.deflate {
            Some((self.deflate_level.clamp(0, 9), self.shuffle))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTweaks {
    /// Variable name in the file, keyed by the name used in the run
    #[serde(default)]
    pub variable_mapping: BTreeMap<String, String>,
}

/// Where one `SimulationDescription` entry comes from: a single attribute name, or a
/// `%s` format string followed by the attribute names that fill it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DescriptionSource {
    Attribute(String),
    Formatted(Vec<String>),
}

/// The parameter file as written. Everything is optional here; `RunConfig::from_parameters`
/// decides what is required.
#[derive(Debug, Default, Deserialize)]
pub struct ParameterFile {
    pub case_id: Option<String>,
    pub vars: Option<Vec<String>>,
    pub reference_data_set: Option<Vec<String>>,
    #[serde(alias = "model_versions")]
    pub test_data_set: Option<Vec<String>>,
    pub realization: Option<String>,
    pub period: Option<String>,
    pub target_grid: Option<GridSpec>,
    pub regrid_tool: Option<String>,
    pub regrid_method: Option<String>,
    pub regrid_tool_ocn: Option<String>,
    pub regrid_method_ocn: Option<String>,
    pub filename_template: Option<String>,
    pub sftlf_filename_template: Option<String>,
    pub generate_sftlf: Option<bool>,
    pub land_sea_mask_file: Option<PathBuf>,
    #[serde(alias = "mod_data_path")]
    pub test_data_path: Option<PathBuf>,
    #[serde(alias = "obs_data_path")]
    pub reference_data_path: Option<PathBuf>,
    pub metrics_output_path: Option<PathBuf>,
    pub output_json_template: Option<String>,
    #[serde(alias = "save_mod_clims")]
    pub save_test_clims: Option<bool>,
    #[serde(alias = "model_clims_interpolated_output")]
    pub test_clims_interpolated_output: Option<PathBuf>,
    pub filename_output_template: Option<String>,
    #[serde(default)]
    pub regions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub regions_values: BTreeMap<String, f64>,
    #[serde(default)]
    pub regions_specs: BTreeMap<String, RegionSpec>,
    #[serde(default)]
    pub custom_keys: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub model_tweaks: BTreeMap<String, ModelTweaks>,
    #[serde(default)]
    pub simulation_description_mapping: BTreeMap<String, DescriptionSource>,
    #[serde(alias = "custom_observations")]
    pub custom_observations_path: Option<PathBuf>,
    pub obs_info_dictionary: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub level_delimiters: Option<String>,
    pub num_workers: Option<usize>,
    #[serde(default)]
    pub netcdf: NetcdfFlags,
    /// Any other keys; these can be used as `SimulationDescription` sources
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl ParameterFile {
    pub fn from_toml_file(path: &Path) -> Result<Self, PmpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PmpError::from_io_error(e, path.to_owned()))?;
        toml::from_str(&text)
            .map_err(|e| PmpError::Toml { file: path.to_owned(), source: e })
    }
}

/// A validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub case_id: String,
    pub vars: Vec<String>,
    pub reference_data_set: Vec<String>,
    pub test_data_set: Vec<String>,
    pub realization: String,
    pub period: String,
    pub target_grid: GridSpec,
    pub regrid_tool: String,
    pub regrid_method: String,
    pub regrid_tool_ocn: String,
    pub regrid_method_ocn: String,
    pub filename_template: FileTemplate,
    pub sftlf_filename_template: Option<FileTemplate>,
    pub generate_sftlf: bool,
    pub land_sea_mask_file: Option<PathBuf>,
    pub test_data_path: PathBuf,
    pub reference_data_path: PathBuf,
    pub metrics_output_path: PathBuf,
    pub output_json_template: FileTemplate,
    pub save_test_clims: bool,
    pub test_clims_interpolated_output: PathBuf,
    pub filename_output_template: FileTemplate,
    pub regions: RegionRegistry,
    pub custom_keys: BTreeMap<String, BTreeMap<String, String>>,
    pub model_tweaks: BTreeMap<String, ModelTweaks>,
    pub simulation_description_mapping: BTreeMap<String, DescriptionSource>,
    pub custom_observations_path: Option<PathBuf>,
    pub obs_info_dictionary: PathBuf,
    pub dry_run: bool,
    pub level_delimiters: String,
    pub num_workers: Option<usize>,
    pub runtime: RuntimeConfig,
    pub extra: BTreeMap<String, String>,
}

impl RunConfig {
    pub fn from_args(args: &Args) -> Result<Self, PmpError> {
        let mut params = ParameterFile::from_toml_file(&args.parameters)?;
        if let Some(case_id) = &args.case_id {
            params.case_id = Some(case_id.clone());
        }
        if args.dry_run {
            params.dry_run = Some(true);
        }
        Self::from_parameters(params)
    }

    pub fn from_parameters(p: ParameterFile) -> Result<Self, PmpError> {
        let vars = p.vars.ok_or(PmpError::MissingField("vars"))?;
        if vars.is_empty() {
            return Err(PmpError::invalid_config("vars", "at least one variable is needed"));
        }
        let reference_data_set = p.reference_data_set.ok_or(PmpError::MissingField("reference_data_set"))?;
        let test_data_set = p.test_data_set.ok_or(PmpError::MissingField("test_data_set"))?;
        let target_grid = p.target_grid.ok_or(PmpError::MissingField("target_grid"))?;
        let filename_template = p.filename_template.ok_or(PmpError::MissingField("filename_template"))?;
        let test_data_path = p.test_data_path.ok_or(PmpError::MissingField("test_data_path"))?;
        let reference_data_path = p.reference_data_path.ok_or(PmpError::MissingField("reference_data_path"))?;

        let case_id = p.case_id.unwrap_or_default();
        let metrics_output_path = p.metrics_output_path
            .map(|m| PathBuf::from(m.to_string_lossy().replace("%(case_id)", &case_id)))
            .ok_or(PmpError::MissingField("metrics_output_path"))?;

        let save_test_clims = p.save_test_clims.unwrap_or(false);
        let test_clims_interpolated_output = match p.test_clims_interpolated_output {
            Some(d) => d,
            None => {
                if save_test_clims {
                    log::warn!("test_clims_interpolated_output is not set, interpolated climatologies go under {}", metrics_output_path.display());
                }
                metrics_output_path.join(DEFAULT_INTERPOLATED_DIR)
            }
        };
        let filename_output_template = match p.filename_output_template {
            Some(t) => t,
            None => {
                if save_test_clims {
                    log::warn!("filename_output_template is not set, using {DEFAULT_INTERPOLATED_TEMPLATE}");
                }
                DEFAULT_INTERPOLATED_TEMPLATE.to_owned()
            }
        };

        let regions = RegionRegistry::new(p.regions, &p.regions_values, &p.regions_specs)
            .map_err(|e| PmpError::invalid_config("regions_specs", e))?;

        let level_delimiters = p.level_delimiters.unwrap_or_else(|| DEFAULT_LEVEL_DELIMITERS.to_owned());
        if level_delimiters.is_empty() {
            return Err(PmpError::invalid_config("level_delimiters", "must contain at least one character"));
        }
        if p.num_workers == Some(0) {
            return Err(PmpError::invalid_config("num_workers", "must be at least 1"));
        }

        let obs_info_dictionary = p.obs_info_dictionary
            .unwrap_or_else(|| reference_data_path.join(OBS_CATALOGUE_NAME));

        let extra = p.extra.into_iter()
            .filter_map(|(k, v)| toml_scalar_to_string(&v).map(|s| (k, s)))
            .collect();

        Ok(Self {
            case_id,
            vars,
            reference_data_set,
            test_data_set,
            realization: p.realization.unwrap_or_else(|| "r1i1p1".to_owned()),
            period: p.period.unwrap_or_default(),
            target_grid,
            regrid_tool: p.regrid_tool.unwrap_or_else(|| "regrid2".to_owned()),
            regrid_method: p.regrid_method.unwrap_or_else(|| "linear".to_owned()),
            regrid_tool_ocn: p.regrid_tool_ocn.unwrap_or_else(|| "esmf".to_owned()),
            regrid_method_ocn: p.regrid_method_ocn.unwrap_or_else(|| "linear".to_owned()),
            filename_template: FileTemplate::new(&filename_template),
            sftlf_filename_template: p.sftlf_filename_template.as_deref().map(FileTemplate::new),
            generate_sftlf: p.generate_sftlf.unwrap_or(false),
            land_sea_mask_file: p.land_sea_mask_file,
            test_data_path,
            reference_data_path,
            metrics_output_path,
            output_json_template: FileTemplate::new(p.output_json_template.as_deref().unwrap_or(DEFAULT_OUTPUT_TEMPLATE)),
            save_test_clims,
            test_clims_interpolated_output,
            filename_output_template: FileTemplate::new(&filename_output_template),
            regions,
            custom_keys: p.custom_keys,
            model_tweaks: p.model_tweaks,
            simulation_description_mapping: p.simulation_description_mapping,
            custom_observations_path: p.custom_observations_path,
            obs_info_dictionary,
            dry_run: p.dry_run.unwrap_or(false),
            level_delimiters,
            num_workers: p.num_workers,
            runtime: RuntimeConfig { netcdf: p.netcdf },
            extra,
        })
    }

    /// The value of a named run parameter as a string, for `SimulationDescription`. The
    /// realization always has one (`r1i1p1` unless set); other parameters only count when
    /// they were set to something non-empty.
    pub fn attribute(&self, name: &str) -> Option<String> {
        let non_empty = |s: &str| if s.is_empty() { None } else { Some(s.to_owned()) };
        match name {
            "case_id" => non_empty(&self.case_id),
            "realization" => non_empty(&self.realization),
            "period" => non_empty(&self.period),
            _ => self.extra.get(name).cloned(),
        }
    }

    /// Values of the `custom_keys` table for `var`, falling back on the `"*"` entry and then
    /// on an empty string.
    pub fn custom_key_values(&self, var: &str) -> BTreeMap<String, String> {
        self.custom_keys.iter()
            .map(|(key, per_var)| {
                let value = per_var.get(var)
                    .or_else(|| per_var.get(ALL_KEY))
                    .cloned()
                    .unwrap_or_default();
                (key.clone(), value)
            })
            .collect()
    }

    /// Name of `var` inside `model`'s files: the model's own mapping, then the `"*"` mapping,
    /// then `var` itself.
    pub fn var_in_file(&self, model: &str, var: &str) -> String {
        let lookup = |key: &str| self.model_tweaks.get(key).and_then(|t| t.variable_mapping.get(var));
        lookup(model)
            .or_else(|| lookup(ALL_KEY))
            .cloned()
            .unwrap_or_else(|| var.to_owned())
    }

    /// Regrid tool and method for a variable, ocean or atmosphere.
    pub fn regrid_for(&self, ocean: bool) -> (&str, &str) {
        if ocean {
            (&self.regrid_tool_ocn, &self.regrid_method_ocn)
        } else {
            (&self.regrid_tool, &self.regrid_method)
        }
    }
}

fn toml_scalar_to_string(v: &toml::Value) -> Option<String> {
    match v {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        _ => None,
    }
}
