use std::collections::HashMap;
use std::fs::create_dir_all;

use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use log::LevelFilter;

use viwrap::config::{RunConfig, RUN_LOG};
use viwrap::error::ViwrapError;
use viwrap::genome::{group_bins, link_genomes, BinMembership, GenomeMap, LinkerConfig};
use viwrap::identify::reconcile;
use viwrap::pipeline::Pipeline;
use viwrap::terminal::{App, Commands, NlinkArgs, OverlapArgs, RunArgs, ToolsCommands};
use viwrap::tool::CondaRunner;
use viwrap::utils::{init_logger, read_fasta, read_tsv, write_fasta, write_tsv, FastaRecord};

/// ViWrap application
///
/// Run the application from arguments provided
/// by the command line interface
#[cfg(not(tarpaulin_include))]
fn main() -> Result<()> {
    let cli = App::parse();

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };

    match cli.command {
        Commands::Run(args) => run(&args, level)?,
        Commands::Tools(subcommand) => {
            init_logger(None, level)?;
            match subcommand {
                ToolsCommands::Overlap(args) => overlap(&args)?,
                ToolsCommands::Nlink(args) => nlink(&args)?,
            }
        }
    }

    Ok(())
}

fn run(args: &RunArgs, level: LevelFilter) -> Result<(), ViwrapError> {
    if args.outdir.exists() {
        return Err(ViwrapError::OutputDirExists(args.outdir.clone()));
    }
    create_dir_all(&args.outdir)?;
    init_logger(Some(&args.outdir.join(RUN_LOG)), level)?;

    let start = chrono::Local::now();
    log::info!("Command: {}", std::env::args().join(" "));

    let config = RunConfig::from_run_args(args)?;
    let runner = CondaRunner::new(&config.conda_env_dir);

    let manifest = Pipeline::new(&config, &runner).run()?;
    log::info!("Summary tables written to: {}", config.layout.summary.display());
    log::debug!("Genome summary table: {}", manifest.summary.virus_summary.display());

    let elapsed = chrono::Local::now() - start;
    log::info!(
        "ViWrap finished in {}h {}m {}s",
        elapsed.num_hours(),
        elapsed.num_minutes() % 60,
        elapsed.num_seconds() % 60
    );
    Ok(())
}

fn overlap(args: &OverlapArgs) -> Result<(), ViwrapError> {
    if !(2..=3).contains(&args.input.len()) {
        return Err(ViwrapError::OverlapInputCount);
    }

    let mut sets: Vec<(String, Vec<FastaRecord>)> = Vec::new();
    for path in &args.input {
        log::info!("Reading call set: {}", path.display());
        sets.push((path.display().to_string(), read_fasta(path)?));
    }
    let labelled: Vec<(String, &[FastaRecord])> = sets
        .iter()
        .map(|(label, records)| (label.clone(), records.as_slice()))
        .collect();

    let reconciliation = reconcile(&labelled);
    log::info!("Reconciled call set holds {} sequences", reconciliation.records.len());

    write_fasta(&reconciliation.records, &args.output)?;
    if let Some(table) = &args.table {
        write_tsv(&reconciliation.calls, table, true)?;
    }
    Ok(())
}

fn nlink(args: &NlinkArgs) -> Result<(), ViwrapError> {
    let scaffolds = read_fasta(&args.fasta)?;
    let order: Vec<String> = scaffolds.iter().map(|r| r.id.clone()).collect();
    let memberships: Vec<BinMembership> = read_tsv(&args.membership, true)?;

    let genome_map = GenomeMap::from_bins(&order, &group_bins(&memberships))?;
    let sequences: HashMap<String, FastaRecord> = scaffolds.into_iter().map(|r| (r.id.clone(), r)).collect();
    let linker = LinkerConfig {
        length: args.linker_length,
        ..Default::default()
    };

    let linked = link_genomes(&genome_map, &sequences, &linker)?;
    log::info!("Writing {} N-linked genomes to: {}", linked.len(), args.output.display());
    write_fasta(&linked, &args.output)?;
    Ok(())
}
