use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::{
    config::ReadType, genome::LifecyclePolicy, identify::IdentifyMethod, taxonomy::TaxonomySource,
};

/// ViWrap: identification, binning and classification of viral genomes from metagenomes
#[derive(Debug, Parser)]
#[command(author, version, about)]
#[command(styles=get_styles())]
#[command(arg_required_else_help(true))]
#[clap(name = "viwrap", version)]
pub struct App {
    /// Debug level logging
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Viral genome pipeline on a metagenome assembly
    Run(RunArgs),

    #[clap(subcommand)]
    /// Utilities for call sets and genome bins
    Tools(ToolsCommands),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Input metagenome assembly (FASTA)
    #[arg(long, short = 'i')]
    pub input_metagenome: PathBuf,
    /// Input reads, comma-separated or repeated
    ///
    /// Paired short reads are given as consecutive '<sample>_1.fastq.gz,<sample>_2.fastq.gz'
    /// (or '_R1' / '_R2') files, long reads as one file per sample. Without reads the
    /// mapping, binning and abundance stages are skipped.
    #[arg(long, short = 'r', num_args(1..), value_delimiter = ',')]
    pub input_reads: Vec<PathBuf>,
    /// Sequencing technology of the input reads
    #[arg(long, default_value = "illumina", help_heading = "Mapping options")]
    pub reads_type: ReadType,
    /// Minimum read identity retained after mapping (fraction, 0.0 - 1.0)
    #[arg(long, default_value = "0.97", help_heading = "Mapping options")]
    pub identity_cutoff: f64,
    /// Output directory, must not exist
    #[arg(long, short = 'o')]
    pub outdir: PathBuf,
    /// Database root directory
    #[arg(long, short = 'd')]
    pub db_dir: PathBuf,
    /// Identification method
    #[arg(long, short = 'm', default_value = "vb-vs", help_heading = "Identification options")]
    pub identify_method: IdentifyMethod,
    /// Root directory of the tool environments
    #[arg(long, short = 'c')]
    pub conda_env_dir: PathBuf,
    /// Threads passed to every external tool
    #[arg(long, short = 't', default_value = "10")]
    pub threads: usize,
    /// Input is a virome (VIBRANT virome mode)
    #[arg(long, help_heading = "Identification options")]
    pub virome: bool,
    /// Minimum scaffold length for identification
    #[arg(long, short = 'l', default_value = "2000", help_heading = "Identification options")]
    pub input_length_limit: usize,
    /// Directory of custom host genomes (absolute path, '*.fasta' only)
    #[arg(long, help_heading = "Host prediction options")]
    pub custom_mags_dir: Option<PathBuf>,
    /// Prebuilt custom host database from an earlier run
    #[arg(long, help_heading = "Host prediction options")]
    pub custom_host_db: Option<PathBuf>,
    /// Lifecycle of a bin with mixed scaffold calls
    #[arg(long, default_value = "any-lysogenic", help_heading = "Genome options")]
    pub lifecycle_policy: LifecyclePolicy,
    /// Taxonomy sources in order of precedence
    #[arg(long, value_delimiter = ',', default_value = "vcontact2,refseq,vog", help_heading = "Genome options")]
    pub taxonomy_precedence: Vec<TaxonomySource>,
    /// Minimum VirSorter2 score of screening tier 'keep2'
    #[arg(long, default_value = "0.95", help_heading = "Identification options")]
    pub vs_keep2_score: f64,
    /// Hallmark gene count a sequence must exceed for screening tier 'keep2'
    #[arg(long, default_value = "2", help_heading = "Identification options")]
    pub vs_keep2_hallmark: u32,
    /// Host gene count of screening tier 'manual_check'
    #[arg(long, default_value = "1", help_heading = "Identification options")]
    pub vs_manual_host_genes: u32,
    /// Minimum sequence length of screening tier 'manual_check'
    #[arg(long, default_value = "10000", help_heading = "Identification options")]
    pub vs_manual_min_length: u64,
    /// Minimum DeepVirFinder score
    #[arg(long, default_value = "0.9", help_heading = "Identification options")]
    pub dvf_score: f64,
    /// Maximum DeepVirFinder p-value (exclusive)
    #[arg(long, default_value = "0.01", help_heading = "Identification options")]
    pub dvf_pvalue: f64,
    /// Filler bases between the scaffolds of an N-linked genome
    #[arg(long, default_value = "1000", help_heading = "Genome options")]
    pub linker_length: usize,
    /// Plotting script run on the visualisation inputs
    #[arg(long)]
    pub visualizer: Option<PathBuf>,
    /// Print the genome summary table to the console
    #[arg(long)]
    pub table: bool,
}

#[derive(Debug, Subcommand)]
pub enum ToolsCommands {
    /// Reconcile viral call sets by sequence matching
    Overlap(OverlapArgs),
    /// Build N-linked genomes from scaffolds and a bin membership table
    Nlink(NlinkArgs),
}

#[derive(Debug, Args)]
pub struct OverlapArgs {
    /// Call FASTA files, the first is the primary set (two or three)
    #[arg(long, short = 'i', num_args(1..), value_delimiter = ',', value_parser = validate_file)]
    pub input: Vec<PathBuf>,
    /// Output FASTA of the reconciled calls
    #[arg(long, short = 'o')]
    pub output: PathBuf,
    /// Reconciliation table (.tsv)
    #[arg(long, short = 't')]
    pub table: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct NlinkArgs {
    /// Scaffold FASTA
    #[arg(long, short = 'f', value_parser = validate_file)]
    pub fasta: PathBuf,
    /// Bin membership table with 'scaffold' and 'bin' columns (.tsv)
    #[arg(long, short = 'm', value_parser = validate_file)]
    pub membership: PathBuf,
    /// Output FASTA of N-linked genomes
    #[arg(long, short = 'o')]
    pub output: PathBuf,
    /// Filler bases between scaffolds
    #[arg(long, short = 'l', default_value = "1000")]
    pub linker_length: usize,
}

fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(file);

    if !path.exists() {
        return Err(format!("File not found: {}", file));
    }

    if !path.is_file() {
        return Err(format!("Not a valid file: {}", file));
    }

    Ok(path)
}

pub fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .literal(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
}
