use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ViwrapError;
use crate::genome::{LifecyclePolicy, LinkerConfig, DEFAULT_LINKER_BASE};
use crate::identify::{DvfThresholds, IdentifyMethod, ScreeningThresholds};
use crate::taxonomy::TaxonomySource;
use crate::terminal::RunArgs;
use crate::utils::{get_file_component, FileComponent};

pub const RUN_LOG: &str = "ViWrap_run.log";

/// Sequencing technology of the input reads
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
pub enum ReadType {
    Illumina,
    Pacbio,
    #[value(name = "pacbio_hifi")]
    PacbioHifi,
    #[value(name = "pacbio_asm20")]
    PacbioAsm20,
    Nanopore,
}
impl ReadType {
    /// Mapper preset for the technology
    pub fn preset(&self) -> &'static str {
        match self {
            ReadType::Illumina => "sr",
            ReadType::Pacbio => "map-pb",
            ReadType::PacbioHifi => "map-hifi",
            ReadType::PacbioAsm20 => "asm20",
            ReadType::Nanopore => "map-ont",
        }
    }
    pub fn paired(&self) -> bool {
        matches!(self, ReadType::Illumina)
    }
}

/// Reads of one sample: a forward/reverse pair or a single long read file
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSample {
    pub name: String,
    pub files: Vec<PathBuf>,
}

fn strip_fastq_suffix(path: &Path) -> Result<String, ViwrapError> {
    let name = get_file_component(path, FileComponent::FileName)?;
    name.strip_suffix(".fastq.gz")
        .or_else(|| name.strip_suffix(".fastq"))
        .map(String::from)
        .ok_or_else(|| ViwrapError::ReadsSuffixInvalid(path.to_path_buf()))
}

fn pair_prefix(forward: &str, reverse: &str) -> Option<String> {
    [("_R1", "_R2"), ("_1", "_2")].iter().find_map(|(fwd, rev)| {
        match (forward.strip_suffix(fwd), reverse.strip_suffix(rev)) {
            (Some(a), Some(b)) if a == b && !a.is_empty() => Some(a.to_string()),
            _ => None,
        }
    })
}

/// Group read files into samples
///
/// Paired short reads come as consecutive `<sample>_1` / `<sample>_2`
/// (or `_R1` / `_R2`) files, long reads are one file per sample.
pub fn parse_read_samples(files: &[PathBuf], read_type: ReadType) -> Result<Vec<ReadSample>, ViwrapError> {
    for file in files {
        if !file.exists() {
            return Err(ViwrapError::ReadsMissing(file.clone()));
        }
        strip_fastq_suffix(file)?;
    }

    let samples = if read_type.paired() {
        if files.len() % 2 != 0 {
            return Err(ViwrapError::ReadsPairCountInvalid(files.len()));
        }
        files
            .chunks(2)
            .map(|pair| {
                let forward = strip_fastq_suffix(&pair[0])?;
                let reverse = strip_fastq_suffix(&pair[1])?;
                let name = pair_prefix(&forward, &reverse)
                    .ok_or_else(|| ViwrapError::ReadsPairInvalid(pair[0].clone(), pair[1].clone()))?;
                Ok(ReadSample { name, files: pair.to_vec() })
            })
            .collect::<Result<Vec<_>, ViwrapError>>()?
    } else {
        files
            .iter()
            .map(|file| {
                Ok(ReadSample {
                    name: strip_fastq_suffix(file)?,
                    files: vec![file.clone()],
                })
            })
            .collect::<Result<Vec<_>, ViwrapError>>()?
    };

    let mut seen = HashSet::new();
    for sample in &samples {
        if !seen.insert(sample.name.clone()) {
            return Err(ViwrapError::DuplicateSample(sample.name.clone()));
        }
    }
    Ok(samples)
}

/// Fixed database layout under the database root
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub root: PathBuf,
    pub checkv: PathBuf,
    pub vibrant: PathBuf,
    pub virsorter2: PathBuf,
    pub dvf: PathBuf,
    pub taxonomy: PathBuf,
    pub iphop: PathBuf,
    pub iphop_custom: PathBuf,
    pub gtdb: PathBuf,
}
impl DatabaseConfig {
    pub fn from_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            checkv: root.join("CheckV_db"),
            vibrant: root.join("VIBRANT_db"),
            virsorter2: root.join("VirSorter2_db"),
            dvf: root.join("DVF_db"),
            taxonomy: root.join("Tax_classification_db"),
            iphop: root.join("iPHoP_db").join("iPHoP_db"),
            iphop_custom: root.join("iPHoP_db_custom"),
            gtdb: root.join("GTDB_db"),
        }
    }
    pub fn vibrant_databases(&self) -> PathBuf {
        self.vibrant.join("databases")
    }
    pub fn vibrant_files(&self) -> PathBuf {
        self.vibrant.join("files")
    }
    pub fn kegg_profiles(&self) -> PathBuf {
        self.vibrant_databases().join("KEGG_profiles_prokaryotes.HMM")
    }
    pub fn amg_list(&self) -> PathBuf {
        self.vibrant_files().join("VIBRANT_AMGs.tsv")
    }
    pub fn dvf_models(&self) -> PathBuf {
        self.dvf.join("models")
    }
    pub fn refseq_diamond(&self) -> PathBuf {
        self.taxonomy.join("NCBI_RefSeq_viral.dmnd")
    }
    pub fn refseq_protein_taxonomy(&self) -> PathBuf {
        self.taxonomy.join("NCBI_RefSeq_viral_protein2taxonomy.tsv")
    }
    pub fn vog_markers(&self) -> PathBuf {
        self.taxonomy.join("VOG_marker.hmm")
    }
    pub fn vog_marker_table(&self) -> PathBuf {
        self.taxonomy.join("VOG_marker_table.txt")
    }
    pub fn imgvr_proteins(&self) -> PathBuf {
        self.taxonomy.join("IMGVR_high-quality_phage_vOTU_representatives.faa")
    }
    pub fn imgvr_protein_map(&self) -> PathBuf {
        self.taxonomy.join("IMGVR_high-quality_phage_vOTU_representatives_pro2viral_gn_map.csv")
    }
    pub fn imgvr_taxonomy(&self) -> PathBuf {
        self.taxonomy.join("IMGVR_high-quality_phage_vOTU_representatives_taxonomy.tsv")
    }
}

/// Stage-numbered output directories, disabled stages take no number
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub identify: PathBuf,
    pub mapping: Option<PathBuf>,
    pub binning: Option<PathBuf>,
    pub genus: PathBuf,
    pub nlinked: PathBuf,
    pub checkv: PathBuf,
    pub drep: PathBuf,
    pub taxonomy: PathBuf,
    pub iphop: PathBuf,
    pub summary: PathBuf,
    pub visualization: PathBuf,
    pub log_file: PathBuf,
}
impl OutputLayout {
    pub fn new(root: &Path, method: IdentifyMethod, stem: &str, reads_available: bool) -> Self {
        let mut number = 0;
        let mut next = |name: &str| {
            let dir = root.join(format!("{number:02}_{name}"));
            number += 1;
            dir
        };

        let identify = next(&method.dir_name(stem));
        let (mapping, binning) = if reads_available {
            (Some(next("Mapping_result_outdir")), Some(next("vRhyme_outdir")))
        } else {
            (None, None)
        };

        Self {
            root: root.to_path_buf(),
            identify,
            mapping,
            binning,
            genus: next("vConTACT2_outdir"),
            nlinked: next("Nlinked_viral_gn"),
            checkv: next("CheckV_outdir"),
            drep: next("dRep_outdir"),
            taxonomy: next("Tax_classification_outdir"),
            iphop: next("iPHoP_outdir"),
            summary: next("ViWrap_summary_outdir"),
            visualization: next("Virus_statistics_visualization"),
            log_file: root.join(RUN_LOG),
        }
    }
}

/// Host database used for the additional iPHoP run
#[derive(Debug, Clone, PartialEq)]
pub enum HostDatabase {
    Default,
    /// Build a custom database from user genomes before predicting
    Build { mags: PathBuf, db: PathBuf },
    /// Use a custom database built by an earlier run
    Prebuilt { mags: PathBuf, db: PathBuf },
}
impl HostDatabase {
    pub fn from_args(
        mags: Option<&Path>,
        prebuilt: Option<&Path>,
        databases: &DatabaseConfig,
    ) -> Result<Self, ViwrapError> {
        let mags = match (mags, prebuilt) {
            (None, None) => return Ok(Self::Default),
            (None, Some(_)) => return Err(ViwrapError::CustomHostDbWithoutMags),
            (Some(mags), _) => mags,
        };

        if !mags.is_absolute() {
            return Err(ViwrapError::CustomMagsDirNotAbsolute(mags.to_path_buf()));
        }
        if !mags.is_dir() {
            return Err(ViwrapError::CustomMagsDirMissing(mags.to_path_buf()));
        }
        for entry in std::fs::read_dir(mags)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("fasta") {
                return Err(ViwrapError::CustomMagsDirInvalidFile(path));
            }
        }

        match prebuilt {
            Some(db) if db.exists() => Ok(Self::Prebuilt { mags: mags.to_path_buf(), db: db.to_path_buf() }),
            Some(db) => Err(ViwrapError::CustomHostDbMissing(db.to_path_buf())),
            None if databases.iphop_custom.exists() => {
                Err(ViwrapError::CustomHostDbExists(databases.iphop_custom.clone()))
            }
            None => Ok(Self::Build { mags: mags.to_path_buf(), db: databases.iphop_custom.clone() }),
        }
    }
    pub fn custom_db(&self) -> Option<&Path> {
        match self {
            HostDatabase::Default => None,
            HostDatabase::Build { db, .. } | HostDatabase::Prebuilt { db, .. } => Some(db),
        }
    }
}

/// Immutable configuration of a single run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: PathBuf,
    pub stem: String,
    pub reads: Vec<ReadSample>,
    pub read_type: ReadType,
    pub mapping_identity: f64,
    pub method: IdentifyMethod,
    pub threads: usize,
    pub length_limit: usize,
    pub virome: bool,
    pub conda_env_dir: PathBuf,
    pub databases: DatabaseConfig,
    pub layout: OutputLayout,
    pub host: HostDatabase,
    pub lifecycle_policy: LifecyclePolicy,
    pub taxonomy_precedence: Vec<TaxonomySource>,
    pub screening: ScreeningThresholds,
    pub dvf: DvfThresholds,
    pub linker: LinkerConfig,
    pub visualizer: Option<PathBuf>,
    pub table: bool,
}
impl RunConfig {
    /// Validate run preconditions and derive the run configuration
    ///
    /// The output directory is checked and created by the caller.
    pub fn from_run_args(args: &RunArgs) -> Result<Self, ViwrapError> {
        if !args.input_metagenome.is_file() {
            return Err(ViwrapError::InputMetagenomeMissing(args.input_metagenome.clone()));
        }
        if !args.db_dir.is_dir() {
            return Err(ViwrapError::DatabaseDirMissing(args.db_dir.clone()));
        }
        if !args.conda_env_dir.is_dir() {
            return Err(ViwrapError::CondaEnvDirMissing(args.conda_env_dir.clone()));
        }

        let reads = parse_read_samples(&args.input_reads, args.reads_type)?;
        let databases = DatabaseConfig::from_root(&args.db_dir);
        let host = HostDatabase::from_args(
            args.custom_mags_dir.as_deref(),
            args.custom_host_db.as_deref(),
            &databases,
        )?;

        let stem = get_file_component(&args.input_metagenome, FileComponent::FileStem)?;
        let layout = OutputLayout::new(&args.outdir, args.identify_method, &stem, !reads.is_empty());

        let mut taxonomy_precedence = Vec::new();
        for source in &args.taxonomy_precedence {
            if !taxonomy_precedence.contains(source) {
                taxonomy_precedence.push(*source);
            }
        }

        Ok(Self {
            input: args.input_metagenome.clone(),
            stem,
            reads,
            read_type: args.reads_type,
            mapping_identity: args.identity_cutoff,
            method: args.identify_method,
            threads: args.threads,
            length_limit: args.input_length_limit,
            virome: args.virome,
            conda_env_dir: args.conda_env_dir.clone(),
            databases,
            layout,
            host,
            lifecycle_policy: args.lifecycle_policy,
            taxonomy_precedence,
            screening: ScreeningThresholds {
                keep2_min_score: args.vs_keep2_score,
                keep2_min_hallmark: args.vs_keep2_hallmark,
                manual_check_host_genes: args.vs_manual_host_genes,
                manual_check_min_length: args.vs_manual_min_length,
            },
            dvf: DvfThresholds {
                min_score: args.dvf_score,
                max_pvalue: args.dvf_pvalue,
            },
            linker: LinkerConfig {
                length: args.linker_length,
                filler: DEFAULT_LINKER_BASE,
            },
            visualizer: args.visualizer.clone(),
            table: args.table,
        })
    }
    pub fn reads_available(&self) -> bool {
        !self.reads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{App, Commands};
    use clap::Parser;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "@r1\nACGT\n+\nIIII\n").unwrap();
        path
    }

    fn run_args(dir: &Path, extra: &[&str]) -> RunArgs {
        let input = dir.join("assembly.fasta");
        std::fs::write(&input, ">scaffold_1\nACGT\n").unwrap();
        std::fs::create_dir_all(dir.join("db")).unwrap();
        std::fs::create_dir_all(dir.join("envs")).unwrap();

        let mut argv = vec![
            "viwrap".to_string(),
            "run".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            dir.join("out").display().to_string(),
            "-d".to_string(),
            dir.join("db").display().to_string(),
            "-c".to_string(),
            dir.join("envs").display().to_string(),
        ];
        argv.extend(extra.iter().map(|a| a.to_string()));

        match App::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            Commands::Tools(_) => panic!("expected the run command"),
        }
    }

    #[test]
    fn screening_thresholds_follow_arguments() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let defaults = RunConfig::from_run_args(&run_args(dir.path(), &[]))?;
        assert_eq!(defaults.screening, ScreeningThresholds::default());

        let args = run_args(
            dir.path(),
            &[
                "--vs-keep2-score",
                "0.9",
                "--vs-keep2-hallmark",
                "3",
                "--vs-manual-host-genes",
                "2",
                "--vs-manual-min-length",
                "5000",
            ],
        );
        let config = RunConfig::from_run_args(&args)?;
        assert_eq!(
            config.screening,
            ScreeningThresholds {
                keep2_min_score: 0.9,
                keep2_min_hallmark: 3,
                manual_check_host_genes: 2,
                manual_check_min_length: 5000,
            }
        );
        assert!(!config.reads_available());
        Ok(())
    }

    #[test]
    fn paired_reads_share_prefix() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let files = vec![
            touch(dir.path(), "lake_1.fastq.gz"),
            touch(dir.path(), "lake_2.fastq.gz"),
            touch(dir.path(), "river_R1.fastq"),
            touch(dir.path(), "river_R2.fastq"),
        ];
        let samples = parse_read_samples(&files, ReadType::Illumina)?;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "lake");
        assert_eq!(samples[1].name, "river");
        assert_eq!(samples[1].files.len(), 2);
        Ok(())
    }

    #[test]
    fn paired_reads_must_match() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let files = vec![touch(dir.path(), "lake_1.fastq"), touch(dir.path(), "pond_2.fastq")];
        assert!(matches!(
            parse_read_samples(&files, ReadType::Illumina),
            Err(ViwrapError::ReadsPairInvalid(..))
        ));

        let odd = vec![touch(dir.path(), "lake_1.fastq")];
        assert!(matches!(
            parse_read_samples(&odd, ReadType::Illumina),
            Err(ViwrapError::ReadsPairCountInvalid(1))
        ));
        Ok(())
    }

    #[test]
    fn long_reads_are_one_sample_per_file() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let files = vec![touch(dir.path(), "ont_a.fastq"), touch(dir.path(), "ont_b.fastq.gz")];
        let samples = parse_read_samples(&files, ReadType::Nanopore)?;
        assert_eq!(samples.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["ont_a", "ont_b"]);
        assert_eq!(ReadType::Nanopore.preset(), "map-ont");
        Ok(())
    }

    #[test]
    fn reads_suffix_and_presence_are_checked() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let bad = vec![touch(dir.path(), "lake.fq")];
        assert!(matches!(
            parse_read_samples(&bad, ReadType::Pacbio),
            Err(ViwrapError::ReadsSuffixInvalid(_))
        ));
        let missing = vec![dir.path().join("absent.fastq")];
        assert!(matches!(
            parse_read_samples(&missing, ReadType::Pacbio),
            Err(ViwrapError::ReadsMissing(_))
        ));
        Ok(())
    }

    #[test]
    fn layout_numbering_skips_read_stages() {
        let root = Path::new("/out");
        let with_reads = OutputLayout::new(root, IdentifyMethod::VbVs, "lake", true);
        assert_eq!(with_reads.identify, root.join("00_VIBRANT_VirSorter_lake"));
        assert_eq!(with_reads.mapping, Some(root.join("01_Mapping_result_outdir")));
        assert_eq!(with_reads.genus, root.join("03_vConTACT2_outdir"));
        assert_eq!(with_reads.summary, root.join("09_ViWrap_summary_outdir"));

        let without = OutputLayout::new(root, IdentifyMethod::Vb, "lake", false);
        assert_eq!(without.mapping, None);
        assert_eq!(without.genus, root.join("01_vConTACT2_outdir"));
        assert_eq!(without.summary, root.join("07_ViWrap_summary_outdir"));
        assert_eq!(without.log_file, root.join("ViWrap_run.log"));
    }

    #[test]
    fn host_database_options() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let databases = DatabaseConfig::from_root(dir.path());
        assert_eq!(HostDatabase::from_args(None, None, &databases)?, HostDatabase::Default);
        assert!(matches!(
            HostDatabase::from_args(None, Some(dir.path()), &databases),
            Err(ViwrapError::CustomHostDbWithoutMags)
        ));

        let mags = dir.path().join("mags");
        std::fs::create_dir(&mags)?;
        std::fs::write(mags.join("bin.1.fasta"), ">c1\nACGT\n")?;
        assert!(matches!(
            HostDatabase::from_args(Some(&mags), None, &databases)?,
            HostDatabase::Build { .. }
        ));
        assert!(matches!(
            HostDatabase::from_args(Some(Path::new("relative/mags")), None, &databases),
            Err(ViwrapError::CustomMagsDirNotAbsolute(_))
        ));

        std::fs::write(mags.join("notes.txt"), "x")?;
        assert!(matches!(
            HostDatabase::from_args(Some(&mags), None, &databases),
            Err(ViwrapError::CustomMagsDirInvalidFile(_))
        ));
        Ok(())
    }
}
