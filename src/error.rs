use std::path::PathBuf;

/// Errors that abort a whole run (or a whole read of a result set).
#[derive(Debug, thiserror::Error)]
pub enum PmpError {
    #[error("Required parameter '{0}' is missing from the parameter file")]
    MissingField(&'static str),
    #[error("Invalid value for parameter '{field}': {reason}")]
    InvalidConfig{field: String, reason: String},
    #[error("Unknown target grid: {0}")]
    UnknownTargetGrid(String),
    #[error("Unknown output type: {0}")]
    UnknownOutputType(String),
    #[error("json_version {0} requires json_structure to be given or be part of the document")]
    MissingJsonStructure(f64),
    #[error("Invalid axis '{axis}', available axes: {available:?}")]
    InvalidAxis{axis: String, available: Vec<String>},
    #[error("Unknown value '{value}' for axis '{axis}'")]
    InvalidAxisValue{axis: String, value: String},
    #[error("No values found for the leading axes of the result set, nothing to return")]
    EmptyDocument,
    #[error("I/O error on {file}: {source}")]
    Io{file: PathBuf, source: std::io::Error},
    #[error("JSON error in {file}: {source}")]
    Json{file: PathBuf, source: serde_json::Error},
    #[error("Could not parse parameter file {file}: {source}")]
    Toml{file: PathBuf, source: toml::de::Error},
    #[error("netCDF error on {file}: {nc_error}")]
    Netcdf{nc_error: netcdf::error::Error, file: PathBuf},
    #[error("Could not start the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    SchemaMigration(#[from] SchemaMigrationError),
}

impl PmpError {
    pub fn from_io_error(source: std::io::Error, file: PathBuf) -> Self {
        Self::Io { file, source }
    }

    pub fn from_json_error(source: serde_json::Error, file: PathBuf) -> Self {
        Self::Json { file, source }
    }

    pub fn from_nc_error(nc_error: netcdf::error::Error, file: PathBuf) -> Self {
        Self::Netcdf { nc_error, file }
    }

    pub fn invalid_config<F: ToString, R: ToString>(field: F, reason: R) -> Self {
        Self::InvalidConfig { field: field.to_string(), reason: reason.to_string() }
    }
}

/// Errors raised while producing the array for one side of a comparison.
///
/// Everything except `ConfigInvalid` only invalidates the current
/// (reference, test, region) comparison.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("File not found: {}", path.display())]
    FileNotFound{path: PathBuf},
    #[error("No variable named '{varname}' in {}", file.display())]
    VariableMissing{file: PathBuf, varname: String},
    #[error("Could not read '{varname}' from {}: {reason}", file.display())]
    Unreadable{file: PathBuf, varname: String, reason: String},
    #[error("'{reference}' is not a valid reference for variable '{var}' according to the obs registry")]
    UnknownReference{var: String, reference: String},
    #[error("The two data sets have different shapes: {reference:?} vs {test:?}")]
    ShapeMismatch{reference: Vec<usize>, test: Vec<usize>},
    #[error("No land/sea mask available for {source_name}: {reason}")]
    MaskUnavailable{source_name: String, reason: String},
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl LoadError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_))
    }

    pub fn from_nc_error(nc_error: netcdf::error::Error, file: PathBuf, varname: &str) -> Self {
        Self::Unreadable { file, varname: varname.to_owned(), reason: nc_error.to_string() }
    }

    pub fn from_shape_error(nd_error: ndarray::ShapeError, file: PathBuf, varname: &str) -> Self {
        Self::Unreadable { file, varname: varname.to_owned(), reason: nd_error.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("No value for placeholder '%({key})' in template '{template}'")]
    MissingKey{key: String, template: String},
    #[error("'{name}' does not match template '{template}'")]
    NoMatch{name: String, template: String},
}

/// A legacy (json_version 1.0/2.0) result document that does not have the expected layout.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaMigrationError {
    #[error("Result document has no RESULTS section")]
    MissingResults,
    #[error("Expected an object at '{path}' in a version {version} document")]
    NotAnObject{path: String, version: String},
    #[error("Statistic key '{key}' at '{path}' does not follow the version {version} naming convention")]
    BadStatisticKey{key: String, path: String, version: String},
    #[error("Unsupported json_version {0}")]
    UnsupportedVersion(String),
}
