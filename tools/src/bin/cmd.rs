// Command line utility for running an scx analysis

use anyhow::Error;
use clap::{value_parser, Arg, ArgAction, Command};
use enrich::EnrichrClient;
use log::info;
use scx::backend::PrecomputedAnalysis;
use scx::AnalysisParams;
use std::path::PathBuf;

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("scx-cmd")
        .arg(
            Arg::new("PARAMS")
                .help("JSON parameter file")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory, overrides out_dir in PARAMS")
                .short('o')
                .long("out_dir")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("NO_ENRICHMENT")
                .help("Skip the enrichment queries")
                .long("no-enrichment")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let params_path: &PathBuf = matches.get_one("PARAMS").unwrap();
    let mut params = AnalysisParams::from_json_file(params_path)?;
    if let Some(out_dir) = matches.get_one::<PathBuf>("OUT_DIR") {
        params.out_dir = out_dir.clone();
    }
    if matches.get_flag("NO_ENRICHMENT") {
        params.enrichment.enabled = false;
    }

    let backend = PrecomputedAnalysis::new(&params.analysis_dir);
    let client = if params.enrichment.enabled {
        Some(EnrichrClient::new(&params.enrichment.url, params.enrichment.timeout())?)
    } else {
        None
    };

    let summary = scx::run(&params, &backend, client.as_ref())?;
    info!(
        "{} cells, {} clusters, {} significant markers",
        summary.snapshot.qc.cells_after,
        summary.snapshot.cluster_sizes.len(),
        summary.snapshot.num_significant
    );
    Ok(())
}
