use std::path::PathBuf;

use thiserror::Error;

use crate::tool::{Stage, Tool};

#[derive(Error, Debug)]
pub enum ViwrapError {
    /// Represents a failed external tool call, fatal to the run
    #[error(transparent)]
    ToolInvocation(#[from] ToolInvocationError),
    /// Represents all other cases of `csv::Error`.
    #[error(transparent)]
    CsvError(#[from] csv::Error),
    /// Represents all other cases of `std::io::Error`.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// Represents all other cases of `niffler::Error`.
    #[error(transparent)]
    NifflerError(#[from] niffler::Error),
    /// Represents all other cases of `needletail::errors::ParseError`.
    #[error(transparent)]
    NeedletailParseError(#[from] needletail::errors::ParseError),
    /// Represents all other cases of `regex::Error`.
    #[error(transparent)]
    RegexError(#[from] regex::Error),
    #[error("failed to parse a valid integer from record")]
    IntError(#[from] std::num::ParseIntError),
    #[error("failed to parse a valid float from record")]
    FloatError(#[from] std::num::ParseFloatError),
    #[error("failed to parse sequence identifier as UTF-8")]
    UTF8Error(#[from] std::str::Utf8Error),
    #[error("Failed to convert OsString to String")]
    FileNameConversionError,
    /// Precondition: input assembly is missing
    #[error("could not find input metagenome: {0}")]
    InputMetagenomeMissing(PathBuf),
    /// Precondition: database root is missing
    #[error("could not find database directory: {0} - was it specified with --db-dir?")]
    DatabaseDirMissing(PathBuf),
    /// Precondition: conda environment root is missing
    #[error("could not find conda environment directory: {0}")]
    CondaEnvDirMissing(PathBuf),
    /// Precondition: the output directory must be created by the run
    #[error("output directory already exists: {0}")]
    OutputDirExists(PathBuf),
    /// Precondition: read file is missing
    #[error("could not find input reads: {0}")]
    ReadsMissing(PathBuf),
    /// Precondition: read file suffix is not recognized
    #[error("input reads must end with '.fastq' or '.fastq.gz': {0}")]
    ReadsSuffixInvalid(PathBuf),
    /// Precondition: paired reads do not form a forward/reverse pair
    #[error("paired reads must be named '<sample>_1.fastq' / '<sample>_2.fastq' or '<sample>_R1.fastq' / '<sample>_R2.fastq': {0} {1}")]
    ReadsPairInvalid(PathBuf, PathBuf),
    /// Precondition: odd number of paired read files
    #[error("paired short reads require an even number of read files, found: {0}")]
    ReadsPairCountInvalid(usize),
    /// Precondition: two samples resolve to the same name
    #[error("duplicate sample name derived from reads: {0}")]
    DuplicateSample(String),
    /// Precondition: custom host genome directory is unusable
    #[error("could not find custom MAGs directory: {0}")]
    CustomMagsDirMissing(PathBuf),
    #[error("custom MAGs directory must be an absolute path: {0}")]
    CustomMagsDirNotAbsolute(PathBuf),
    #[error("custom MAGs directory must only contain '.fasta' files: {0}")]
    CustomMagsDirInvalidFile(PathBuf),
    #[error("custom iPHoP database must not exist before the run: {0}")]
    CustomHostDbExists(PathBuf),
    #[error("a prebuilt custom iPHoP database requires --custom-mags-dir")]
    CustomHostDbWithoutMags,
    #[error("a prebuilt custom iPHoP database was not found: {0}")]
    CustomHostDbMissing(PathBuf),
    /// Represents a scaffold assigned to more than one genome
    #[error("scaffold '{0}' is assigned to more than one genome")]
    ScaffoldAssignedTwice(String),
    /// Represents a genome identifier used by two genomes
    #[error("genome identifier '{0}' is not unique")]
    GenomeIdentityCollision(String),
    /// Represents a bin that references a scaffold without sequence
    #[error("no sequence found for scaffold '{0}' of genome '{1}'")]
    ScaffoldSequenceMissing(String, String),
    /// Represents an empty scaffold set passed to genome identity
    #[error("cannot establish a genome identity from an empty scaffold set")]
    EmptyScaffoldSet,
    /// Represents a malformed line in a whitespace delimited tool table
    #[error("failed to parse line in {0}: {1}")]
    LineParse(PathBuf, String),
    /// Represents an unknown lifecycle annotation
    #[error("unknown lifecycle state: {0}")]
    LifecycleState(String),
    /// Represents an unknown taxonomy source name
    #[error("unknown taxonomy source: {0}")]
    TaxonomySource(String),
    /// Represents an output pattern that did not resolve to a file
    #[error("no file matching '{pattern}' in {dir}")]
    OutputPatternNotFound { pattern: String, dir: PathBuf },
    #[error("at least two call files are required for overlap")]
    OverlapInputCount,
}

/// Opaque failure of an external analysis tool
///
/// Carries the tool and the pipeline stage so a failed run
/// can be traced back to the stage that halted it.
#[derive(Error, Debug)]
pub enum ToolInvocationError {
    #[error("failed to launch {tool} in stage '{stage}': {reason} - is it installed?")]
    Launch {
        tool: Tool,
        stage: Stage,
        reason: String,
    },
    #[error("{tool} exited with status {code} in stage '{stage}'{stderr}")]
    ExitStatus {
        tool: Tool,
        stage: Stage,
        code: i32,
        stderr: String,
    },
    #[error("{tool} did not produce expected output in stage '{stage}': {}", .path.display())]
    MissingOutput {
        tool: Tool,
        stage: Stage,
        path: PathBuf,
    },
    #[error("{tool} produced an empty output in stage '{stage}': {}", .path.display())]
    EmptyOutput {
        tool: Tool,
        stage: Stage,
        path: PathBuf,
    },
}
impl ToolInvocationError {
    pub fn tool(&self) -> &Tool {
        match self {
            Self::Launch { tool, .. }
            | Self::ExitStatus { tool, .. }
            | Self::MissingOutput { tool, .. }
            | Self::EmptyOutput { tool, .. } => tool,
        }
    }
    pub fn stage(&self) -> &Stage {
        match self {
            Self::Launch { stage, .. }
            | Self::ExitStatus { stage, .. }
            | Self::MissingOutput { stage, .. }
            | Self::EmptyOutput { stage, .. } => stage,
        }
    }
}
