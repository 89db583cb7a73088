use std::path::PathBuf;

use clap::Parser;
use serde_json::{Map, Value};

use pmp_metrics::error::PmpError;
use pmp_metrics::jsons::{MergePolicy, MetricsJsons, Query};
use pmp_metrics::parallel::{FilePool, ShowProgress};
use pmp_metrics::provenance::Provenance;
use pmp_metrics::store::{self, JSON_VERSION};
use pmp_metrics::utils::init_logging;

fn main() -> Result<(), PmpError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let policy = if args.no_overwrite { MergePolicy::NoOverwrite } else { MergePolicy::Overwrite };
    let mut jsons = MetricsJsons::new(args.structure.clone())
        .one_variable_per_file(!args.no_variable_axis)
        .merge_policy(policy);

    let pool = FilePool::new(args.workers)?;
    let show_progress = ShowProgress::from(!args.no_progress);
    let prepared = pool.map(&args.files, "Reading result files", show_progress, |f| jsons.prepare_file(f));

    let mut n_read = 0;
    for (file, doc) in args.files.iter().zip(prepared) {
        match doc {
            Ok(doc) => {
                jsons.add_prepared(doc);
                n_read += 1;
            },
            Err(PmpError::SchemaMigration(e)) => log::warn!("Skipping {}: {e}", file.display()),
            Err(e) => return Err(e),
        }
    }
    println!("Merged {n_read} of {} result files", args.files.len());

    let array = jsons.query(&Query::new())?;
    for axis in &array.axes {
        println!("{}: {} values", axis.id, axis.values.len());
    }

    if let Some(output) = &args.output {
        let mut doc = Map::new();
        doc.insert("RESULTS".to_owned(), Value::Object(jsons.data().clone()));
        doc.insert("json_version".to_owned(), Value::from(JSON_VERSION));
        store::write_json(output, doc, Some(jsons.structure()), &Provenance::collect())?;
        println!("Wrote {}", output.display());
    }
    Ok(())
}

/// Merge metrics result files (any json_version) into one result tree.
#[derive(Debug, Parser)]
#[clap(version)]
struct Args {
    /// Result JSON files to merge
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Axis names of the result trees, comma separated. Taken from the first file if omitted.
    #[clap(short = 's', long, value_delimiter = ',')]
    structure: Vec<String>,

    /// Write the merged results to this JSON file
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,

    /// Number of files read at once; defaults to the number of cores
    #[clap(short = 'j', long)]
    workers: Option<usize>,

    /// Keep both values when two files disagree, storing the later one under a suffixed key
    #[clap(long)]
    no_overwrite: bool,

    /// Files are not one variable each; do not add a leading "variable" axis
    #[clap(long)]
    no_variable_axis: bool,

    /// Do not show a progress bar
    #[clap(long)]
    no_progress: bool,

    /// Increase logging verbosity (repeat for more)
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}
