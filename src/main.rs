use clap::Parser;
use pmp_metrics::config::{Args, RunConfig};
use pmp_metrics::error::PmpError;
use pmp_metrics::field::NetcdfIo;
use pmp_metrics::mask::LandFractionFile;
use pmp_metrics::obs_registry::ObsRegistry;
use pmp_metrics::orchestrator::MetricsOrchestrator;
use pmp_metrics::utils::init_logging;

fn main() -> Result<(), PmpError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = RunConfig::from_args(&args)?;
    let obs = load_obs_registry(&config)?;
    let classifier = match &config.land_sea_mask_file {
        Some(path) => {
            let io = NetcdfIo::new(config.runtime);
            Some(LandFractionFile::open(&io, path).map_err(|e| PmpError::invalid_config("land_sea_mask_file", e))?)
        },
        None => {
            if config.generate_sftlf {
                log::warn!("generate_sftlf is set but no land_sea_mask_file is given, land fractions cannot be generated");
            }
            None
        }
    };

    let mut orchestrator = MetricsOrchestrator::new(config, obs);
    if let Some(classifier) = classifier {
        orchestrator = orchestrator.with_land_sea_classifier(classifier);
    }

    let summary = orchestrator.run()?;
    for path in &summary.written {
        println!("Wrote {}", path.display());
    }
    if !summary.skipped.is_empty() {
        println!("Skipped {} comparisons:", summary.skipped.len());
        for s in &summary.skipped {
            println!("  {} / {} vs {} / {}: {}", s.variable, s.test, s.reference, s.region, s.reason);
        }
    }
    Ok(())
}

/// The observation catalogue, with the custom catalogue (if any) layered over it.
fn load_obs_registry(config: &RunConfig) -> Result<ObsRegistry, PmpError> {
    let mut obs = ObsRegistry::from_json_file(&config.obs_info_dictionary)?;
    if let Some(custom) = &config.custom_observations_path {
        log::info!("Adding custom observations from {}", custom.display());
        obs.merge(ObsRegistry::from_json_file(custom)?);
    }
    Ok(obs)
}
