//! Boundary to the external analysis tools.
//!
//! Every tool is an opaque collaborator: it receives arguments and a working
//! directory, and either produces its declared outputs or fails. The pipeline
//! only talks to tools through [`ToolRunner`], so the reconciliation and
//! metadata logic can be exercised without any tool installed.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::ToolInvocationError;
use crate::utils::is_file_empty;

/// External analysis tools invoked by the pipeline
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Tool {
    Vibrant,
    VirSorter2,
    CheckV,
    DeepVirFinder,
    Prodigal,
    Hmmsearch,
    Mapper,
    VRhyme,
    VContact2,
    DRep,
    Diamond,
    IPhop,
    GtdbTk,
    Visualizer,
}
impl Tool {
    /// Executable name resolved inside the tool environment
    pub fn program(&self) -> &'static str {
        match self {
            Tool::Vibrant => "VIBRANT_run.py",
            Tool::VirSorter2 => "virsorter",
            Tool::CheckV => "checkv",
            Tool::DeepVirFinder => "dvf.py",
            Tool::Prodigal => "prodigal",
            Tool::Hmmsearch => "hmmsearch",
            Tool::Mapper => "sh",
            Tool::VRhyme => "vRhyme",
            Tool::VContact2 => "vcontact2",
            Tool::DRep => "dRep",
            Tool::Diamond => "diamond",
            Tool::IPhop => "iphop",
            Tool::GtdbTk => "gtdbtk",
            Tool::Visualizer => "Rscript",
        }
    }
    /// Conda environment holding the tool, `None` if run from the host environment
    pub fn environment(&self) -> Option<&'static str> {
        match self {
            Tool::Vibrant | Tool::Prodigal | Tool::Hmmsearch => Some("ViWrap-VIBRANT"),
            Tool::VirSorter2 => Some("ViWrap-vs2"),
            Tool::CheckV => Some("ViWrap-CheckV"),
            Tool::DeepVirFinder => Some("ViWrap-DVF"),
            Tool::Mapper => Some("ViWrap-Mapping"),
            Tool::VRhyme => Some("ViWrap-vRhyme"),
            Tool::VContact2 => Some("ViWrap-vContact2"),
            Tool::DRep => Some("ViWrap-dRep"),
            Tool::Diamond => Some("ViWrap-Tax"),
            Tool::IPhop => Some("ViWrap-iPHoP"),
            Tool::GtdbTk => Some("ViWrap-GTDBTk"),
            Tool::Visualizer => None,
        }
    }
}
impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tool::Vibrant => write!(f, "VIBRANT"),
            Tool::VirSorter2 => write!(f, "VirSorter2"),
            Tool::CheckV => write!(f, "CheckV"),
            Tool::DeepVirFinder => write!(f, "DeepVirFinder"),
            Tool::Prodigal => write!(f, "prodigal"),
            Tool::Hmmsearch => write!(f, "hmmsearch"),
            Tool::Mapper => write!(f, "read mapper"),
            Tool::VRhyme => write!(f, "vRhyme"),
            Tool::VContact2 => write!(f, "vConTACT2"),
            Tool::DRep => write!(f, "dRep"),
            Tool::Diamond => write!(f, "diamond"),
            Tool::IPhop => write!(f, "iPHoP"),
            Tool::GtdbTk => write!(f, "GTDB-Tk"),
            Tool::Visualizer => write!(f, "visualizer"),
        }
    }
}

/// Pipeline stages in execution order
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Identify,
    Map,
    Bin,
    ClusterGenus,
    LinkGenomes,
    QualityCheck,
    ClusterSpecies,
    ClassifyTaxonomy,
    PredictHost,
    Summarize,
    Visualize,
}
impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Identify => write!(f, "identify"),
            Stage::Map => write!(f, "map"),
            Stage::Bin => write!(f, "bin"),
            Stage::ClusterGenus => write!(f, "cluster-genus"),
            Stage::LinkGenomes => write!(f, "link-genomes"),
            Stage::QualityCheck => write!(f, "quality-check"),
            Stage::ClusterSpecies => write!(f, "cluster-species"),
            Stage::ClassifyTaxonomy => write!(f, "classify-taxonomy"),
            Stage::PredictHost => write!(f, "predict-host"),
            Stage::Summarize => write!(f, "summarize"),
            Stage::Visualize => write!(f, "visualize"),
        }
    }
}

/// Output path a tool must leave behind
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedOutput {
    pub path: PathBuf,
    pub allow_empty: bool,
}

/// A single external tool call
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub outputs: Vec<ExpectedOutput>,
}
impl ToolInvocation {
    pub fn new(tool: Tool, stage: Stage, cwd: &Path) -> Self {
        Self {
            program: tool.program().to_string(),
            tool,
            stage,
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
            outputs: Vec::new(),
        }
    }
    pub fn program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }
    pub fn arg<S: ToString>(mut self, arg: S) -> Self {
        self.args.push(arg.to_string());
        self
    }
    pub fn arg_path(self, path: &Path) -> Self {
        let value = path.display().to_string();
        self.arg(value)
    }
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }
    pub fn env(mut self, key: &str, value: &Path) -> Self {
        self.env.push((key.to_string(), value.display().to_string()));
        self
    }
    /// Declare an output that must exist and hold data
    pub fn output(mut self, path: &Path) -> Self {
        self.outputs.push(ExpectedOutput { path: path.to_path_buf(), allow_empty: false });
        self
    }
    /// Declare an output that must exist but may legitimately be empty
    pub fn output_allow_empty(mut self, path: &Path) -> Self {
        self.outputs.push(ExpectedOutput { path: path.to_path_buf(), allow_empty: true });
        self
    }
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
    /// Check the declared outputs after the tool returned successfully
    pub fn validate_outputs(&self) -> Result<ToolOutputs, ToolInvocationError> {
        for output in &self.outputs {
            if !output.path.exists() {
                return Err(ToolInvocationError::MissingOutput {
                    tool: self.tool.clone(),
                    stage: self.stage,
                    path: output.path.clone(),
                });
            }
            if !output.allow_empty && output.path.is_file() {
                let empty = is_file_empty(&output.path).unwrap_or(true);
                if empty {
                    return Err(ToolInvocationError::EmptyOutput {
                        tool: self.tool.clone(),
                        stage: self.stage,
                        path: output.path.clone(),
                    });
                }
            }
        }
        Ok(ToolOutputs {
            paths: self.outputs.iter().map(|o| o.path.clone()).collect(),
        })
    }
}

/// Validated output paths of a tool call, in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutputs {
    pub paths: Vec<PathBuf>,
}

/// Capability to run external tools
pub trait ToolRunner {
    fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolOutputs, ToolInvocationError>;
}

/// Runs tools inside their conda environments with `conda run -p`
pub struct CondaRunner {
    env_dir: PathBuf,
}
impl CondaRunner {
    pub fn new(env_dir: &Path) -> Self {
        Self { env_dir: env_dir.to_path_buf() }
    }
    fn command(&self, invocation: &ToolInvocation) -> Command {
        match invocation.tool.environment() {
            Some(env) => {
                let mut cmd = Command::new("conda");
                cmd.arg("run")
                    .arg("-p")
                    .arg(self.env_dir.join(env))
                    .arg(&invocation.program)
                    .args(&invocation.args);
                cmd
            }
            None => {
                let mut cmd = Command::new(&invocation.program);
                cmd.args(&invocation.args);
                cmd
            }
        }
    }
}
impl ToolRunner for CondaRunner {
    fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolOutputs, ToolInvocationError> {
        log::debug!("Running command: {}", invocation.command_line());

        let output = self
            .command(invocation)
            .current_dir(&invocation.cwd)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ToolInvocationError::Launch {
                tool: invocation.tool.clone(),
                stage: invocation.stage,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ToolInvocationError::ExitStatus {
                tool: invocation.tool.clone(),
                stage: invocation.stage,
                code: output.status.code().unwrap_or(-1),
                stderr: stderr_tail(&output.stderr, 10),
            });
        }

        invocation.validate_outputs()
    }
}

fn stderr_tail(stderr: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let tail: Vec<&str> = text.lines().rev().take(lines).collect();
    if tail.is_empty() {
        String::new()
    } else {
        format!(", stderr:\n{}", tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_outputs_missing_file_fails() {
        let dir = tempdir().unwrap();
        let invocation = ToolInvocation::new(Tool::CheckV, Stage::QualityCheck, dir.path())
            .output(&dir.path().join("quality_summary.tsv"));

        let err = invocation.validate_outputs().unwrap_err();
        assert!(matches!(err, ToolInvocationError::MissingOutput { .. }));
        assert_eq!(err.tool(), &Tool::CheckV);
        assert_eq!(err.stage(), &Stage::QualityCheck);
    }

    #[test]
    fn validate_outputs_respects_allow_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phages_combined.fna");
        std::fs::File::create(&path).unwrap();

        let strict = ToolInvocation::new(Tool::Vibrant, Stage::Identify, dir.path()).output(&path);
        assert!(matches!(
            strict.validate_outputs().unwrap_err(),
            ToolInvocationError::EmptyOutput { .. }
        ));

        let lenient = ToolInvocation::new(Tool::Vibrant, Stage::Identify, dir.path()).output_allow_empty(&path);
        assert_eq!(lenient.validate_outputs().unwrap().paths, vec![path]);
    }

    #[test]
    fn command_line_joins_program_and_args() {
        let invocation = ToolInvocation::new(Tool::CheckV, Stage::QualityCheck, Path::new("."))
            .arg("end_to_end")
            .arg_path(Path::new("genomes.fasta"))
            .args(["-t", "8"]);
        assert_eq!(invocation.command_line(), "checkv end_to_end genomes.fasta -t 8");
    }

    #[test]
    fn conda_runner_reports_launch_failure() {
        let dir = tempdir().unwrap();
        let runner = CondaRunner::new(dir.path());
        let invocation = ToolInvocation::new(Tool::Visualizer, Stage::Visualize, dir.path())
            .program("viwrap-program-that-does-not-exist");

        let err = runner.invoke(&invocation).unwrap_err();
        assert!(matches!(err, ToolInvocationError::Launch { .. }));
    }

    #[test]
    fn tool_error_names_tool_and_stage() {
        let err = ToolInvocationError::ExitStatus {
            tool: Tool::VRhyme,
            stage: Stage::Bin,
            code: 1,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "vRhyme exited with status 1 in stage 'bin'");
    }
}
