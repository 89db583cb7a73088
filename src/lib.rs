//! Mean climate performance metrics of climate models against observations: file name
//! templating, data loading and regridding, land/sea masking, statistics, and the versioned
//! JSON result documents (writing, migration of old layouts and querying).

pub mod config;
pub mod dataset;
pub mod error;
pub mod field;
pub mod grid;
pub mod jsons;
pub mod mask;
pub mod metrics;
pub mod obs_registry;
pub mod orchestrator;
pub mod output;
pub mod parallel;
pub mod provenance;
pub mod region;
pub mod store;
pub mod template;
pub mod utils;
pub mod variable;

pub use error::{LoadError, PmpError};
pub use orchestrator::{MetricsOrchestrator, RunSummary};
