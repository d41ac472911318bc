use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::DatabaseConfig;
use crate::error::ViwrapError;
use crate::tool::{Stage, Tool, ToolInvocation, ToolRunner};
use crate::utils::read_table;

pub const GENOME_PREDICTIONS: &str = "Host_prediction_to_genome_m90.csv";
pub const GENUS_PREDICTIONS: &str = "Host_prediction_to_genus_m90.csv";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostLevel {
    Genome,
    Genus,
}
impl std::fmt::Display for HostLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostLevel::Genome => write!(f, "genome"),
            HostLevel::Genus => write!(f, "genus"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostDbKind {
    Default,
    Custom,
}
impl std::fmt::Display for HostDbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostDbKind::Default => write!(f, "default"),
            HostDbKind::Custom => write!(f, "custom"),
        }
    }
}

/// Row of the iPHoP genome level prediction table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IphopGenomeRow {
    #[serde(rename = "Virus")]
    pub virus: String,
    #[serde(rename = "Host genome")]
    pub host_genome: String,
    #[serde(rename = "Host taxonomy")]
    pub host_taxonomy: String,
    #[serde(rename = "Main method")]
    pub method: String,
    #[serde(rename = "Confidence score")]
    pub confidence: f64,
}

/// Row of the iPHoP genus level prediction table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IphopGenusRow {
    #[serde(rename = "Virus")]
    pub virus: String,
    #[serde(rename = "Host genus")]
    pub host_genus: String,
    #[serde(rename = "Confidence score")]
    pub confidence: f64,
    #[serde(rename = "List of methods")]
    pub methods: String,
}

/// Host prediction attached to a genome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPrediction {
    pub genome: String,
    pub level: HostLevel,
    pub host_genome: Option<String>,
    pub host_taxonomy: String,
    pub methods: String,
    pub confidence: f64,
    pub database: HostDbKind,
}

/// Merge genome and genus level predictions, genome level first
pub fn read_predictions(dir: &Path, database: HostDbKind) -> Result<Vec<HostPrediction>, ViwrapError> {
    let genome_rows: Vec<IphopGenomeRow> = read_if_exists(&dir.join(GENOME_PREDICTIONS))?;
    let genus_rows: Vec<IphopGenusRow> = read_if_exists(&dir.join(GENUS_PREDICTIONS))?;

    let genome_level = genome_rows.into_iter().map(|row| HostPrediction {
        genome: row.virus,
        level: HostLevel::Genome,
        host_genome: Some(row.host_genome),
        host_taxonomy: row.host_taxonomy,
        methods: row.method,
        confidence: row.confidence,
        database,
    });
    let genus_level = genus_rows.into_iter().map(|row| HostPrediction {
        genome: row.virus,
        level: HostLevel::Genus,
        host_genome: None,
        host_taxonomy: row.host_genus,
        methods: row.methods,
        confidence: row.confidence,
        database,
    });
    Ok(genome_level.chain(genus_level).collect())
}

fn read_if_exists<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, ViwrapError> {
    if path.exists() {
        read_table(path, b',', true)
    } else {
        Ok(Vec::new())
    }
}

/// Last `;`-delimited rank of a host lineage, used for the genus level counts
pub fn host_genus(taxonomy: &str) -> &str {
    taxonomy.rsplit(';').next().unwrap_or(taxonomy).trim()
}

pub fn run_iphop<R: ToolRunner>(
    runner: &R,
    genomes: &Path,
    db: &Path,
    outdir: &Path,
    threads: usize,
) -> Result<PathBuf, ViwrapError> {
    create_dir_all(outdir)?;
    let invocation = ToolInvocation::new(Tool::IPhop, Stage::PredictHost, outdir)
        .arg("predict")
        .arg("--fa_file")
        .arg_path(genomes)
        .arg("--db_dir")
        .arg_path(db)
        .arg("--out_dir")
        .arg_path(outdir)
        .arg("--num_threads")
        .arg(threads)
        .output_allow_empty(&outdir.join(GENOME_PREDICTIONS))
        .output_allow_empty(&outdir.join(GENUS_PREDICTIONS));
    runner.invoke(&invocation)?;
    Ok(outdir.to_path_buf())
}

/// Classify user genomes with GTDB-Tk and add them to a copy of the host database
pub fn build_custom_db<R: ToolRunner>(
    runner: &R,
    mags: &Path,
    databases: &DatabaseConfig,
    custom_db: &Path,
    workdir: &Path,
    threads: usize,
) -> Result<(), ViwrapError> {
    create_dir_all(workdir)?;

    let domains = [
        ("bacteria", "p__Patescibacteria", "GTDB-tk_bac_outdir"),
        ("archaea", "p__Altarchaeota", "GTDB-tk_ar_outdir"),
    ];
    for (domain, outgroup, dir) in domains {
        log::info!("Classifying custom host genomes with GTDB-Tk ({domain})");
        let outdir = workdir.join(dir);
        let invocation = ToolInvocation::new(Tool::GtdbTk, Stage::PredictHost, workdir)
            .arg("de_novo_wf")
            .arg("--genome_dir")
            .arg_path(mags)
            .arg(format!("--{domain}"))
            .arg("--outgroup_taxon")
            .arg(outgroup)
            .arg("--out_dir")
            .arg_path(&outdir)
            .arg("--cpus")
            .arg(threads)
            .arg("--force")
            .arg("--extension")
            .arg("fasta")
            .env("GTDBTK_DATA_PATH", &databases.gtdb)
            .output_allow_empty(&outdir);
        runner.invoke(&invocation)?;
    }

    log::info!("Adding custom host genomes to the iPHoP database");
    let invocation = ToolInvocation::new(Tool::IPhop, Stage::PredictHost, workdir)
        .arg("add_to_db")
        .arg("--fna_dir")
        .arg_path(mags)
        .arg("--gtdb_dir")
        .arg_path(workdir)
        .arg("--out_dir")
        .arg_path(custom_db)
        .arg("--db_dir")
        .arg_path(&databases.iphop)
        .arg("--num_threads")
        .arg(threads)
        .output_allow_empty(custom_db);
    runner.invoke(&invocation)?;

    Ok(())
}
