//! Virus identification and call reconciliation.
//!
//! Up to three independent identifiers are run on the assembly. Their
//! filtered calls are reconciled into one authoritative call set by
//! sequence matching, since tools rename or trim scaffold headers.
//! An empty call set is a valid outcome at every step.

use std::collections::{HashMap, HashSet};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::annotation::{
    annotate_proteins, best_hits, lifecycle_map, protein_scaffold, read_amg_list, read_hmmsearch_tblout,
    read_vibrant_annotations, read_vibrant_lifecycle, AnnotationRecord, LifecycleRecord,
    KO_EVALUE_CUTOFF,
};
use crate::config::RunConfig;
use crate::error::ViwrapError;
use crate::genome::LifecycleState;
use crate::tool::{Stage, Tool, ToolInvocation, ToolRunner};
use crate::utils::{
    concatenate_fasta_files, get_file_component, read_fasta, read_tsv, write_fasta, write_id_list,
    write_tsv, FastaRecord, FileComponent,
};

/// Identification method selected for a run
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
pub enum IdentifyMethod {
    /// VIBRANT
    Vb,
    /// VirSorter2 with the CheckV screening protocol
    Vs,
    /// DeepVirFinder
    Dvf,
    /// Overlap of VIBRANT and VirSorter2
    VbVs,
    /// Overlap of VIBRANT, VirSorter2 and DeepVirFinder
    VbVsDvf,
}
impl IdentifyMethod {
    pub fn methods(&self) -> Vec<Method> {
        match self {
            IdentifyMethod::Vb => vec![Method::Vb],
            IdentifyMethod::Vs => vec![Method::Vs],
            IdentifyMethod::Dvf => vec![Method::Dvf],
            IdentifyMethod::VbVs => vec![Method::Vb, Method::Vs],
            IdentifyMethod::VbVsDvf => vec![Method::Vb, Method::Vs, Method::Dvf],
        }
    }
    /// Identification output directory name, without the stage number
    pub fn dir_name(&self, stem: &str) -> String {
        match self {
            IdentifyMethod::Vb => format!("VIBRANT_{stem}"),
            IdentifyMethod::Vs => format!("VirSorter_{stem}"),
            IdentifyMethod::Dvf => format!("DeepVirFinder_{stem}"),
            IdentifyMethod::VbVs => format!("VIBRANT_VirSorter_{stem}"),
            IdentifyMethod::VbVsDvf => format!("VIBRANT_VirSorter_DeepVirFinder_{stem}"),
        }
    }
}
impl std::fmt::Display for IdentifyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifyMethod::Vb => write!(f, "vb"),
            IdentifyMethod::Vs => write!(f, "vs"),
            IdentifyMethod::Dvf => write!(f, "dvf"),
            IdentifyMethod::VbVs => write!(f, "vb-vs"),
            IdentifyMethod::VbVsDvf => write!(f, "vb-vs-dvf"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Vb,
    Vs,
    Dvf,
}
impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Vb => write!(f, "vb"),
            Method::Vs => write!(f, "vs"),
            Method::Dvf => write!(f, "dvf"),
        }
    }
}

/// VirSorter2 screening tier of a candidate sequence
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VsTier {
    Keep1,
    Keep2,
    ManualCheck,
    Discard,
}

/// Per method decision on a single sequence
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CallRecord {
    pub scaffold_id: String,
    pub method: Method,
    pub passed: bool,
    pub tier: Option<VsTier>,
}

/// Reconciled decision on a single sequence
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReconciledCall {
    pub scaffold_id: String,
    pub methods: String,
    pub included: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreeningThresholds {
    pub keep2_min_score: f64,
    /// Hallmark gene count that must be exceeded for keep2
    pub keep2_min_hallmark: u32,
    pub manual_check_host_genes: u32,
    pub manual_check_min_length: u64,
}
impl Default for ScreeningThresholds {
    fn default() -> Self {
        Self {
            keep2_min_score: 0.95,
            keep2_min_hallmark: 2,
            manual_check_host_genes: 1,
            manual_check_min_length: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DvfThresholds {
    pub min_score: f64,
    pub max_pvalue: f64,
}
impl Default for DvfThresholds {
    fn default() -> Self {
        Self {
            min_score: 0.9,
            max_pvalue: 0.01,
        }
    }
}

/// Row of `final-viral-score.tsv`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirSorterScore {
    pub seqname: String,
    pub max_score: f64,
    pub max_score_group: String,
    pub length: u64,
    pub hallmark: u32,
}

/// Row of CheckV `contamination.tsv`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckvContamination {
    pub contig_id: String,
    pub contig_length: u64,
    pub viral_genes: u32,
    pub host_genes: u32,
}

/// Row of the DeepVirFinder prediction table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvfPrediction {
    pub name: String,
    pub len: u64,
    pub score: f64,
    pub pvalue: f64,
}

/// Screening tier from the second VirSorter2 and CheckV passes
///
/// A sequence without a CheckV row counts as having no viral and no host genes.
pub fn classify_tier(
    score: &VirSorterScore,
    contamination: Option<&CheckvContamination>,
    thresholds: &ScreeningThresholds,
) -> VsTier {
    let (viral, host, length) = match contamination {
        Some(c) => (c.viral_genes, c.host_genes, c.contig_length),
        None => (0, 0, score.length),
    };

    if viral > 0 {
        VsTier::Keep1
    } else if host == 0
        || score.max_score >= thresholds.keep2_min_score
        || score.hallmark > thresholds.keep2_min_hallmark
    {
        VsTier::Keep2
    } else if host == thresholds.manual_check_host_genes && length >= thresholds.manual_check_min_length {
        VsTier::ManualCheck
    } else {
        VsTier::Discard
    }
}

pub fn screen_virsorter(
    scores: &[VirSorterScore],
    contamination: &[CheckvContamination],
    thresholds: &ScreeningThresholds,
) -> Vec<(String, VsTier)> {
    let checkv: HashMap<&str, &CheckvContamination> = contamination
        .iter()
        .map(|c| (c.contig_id.as_str(), c))
        .collect();

    scores
        .iter()
        .map(|score| {
            let tier = classify_tier(score, checkv.get(score.seqname.as_str()).copied(), thresholds);
            (score.seqname.clone(), tier)
        })
        .collect()
}

/// Candidates confirmed by a VIBRANT pass, trimmed proviral fragments count for their source
pub fn vibrant_passed(candidates: &[String], vibrant_ids: &[String]) -> Result<Vec<String>, ViwrapError> {
    let fragment = Regex::new(r"_fragment_\d+$")?;
    let called: HashSet<String> = vibrant_ids
        .iter()
        .map(|id| fragment.replace(id, "").to_string())
        .collect();

    Ok(candidates
        .iter()
        .filter(|c| called.contains(c.as_str()))
        .cloned()
        .collect())
}

pub fn dvf_passed(predictions: &[DvfPrediction], thresholds: &DvfThresholds) -> Vec<String> {
    predictions
        .iter()
        .filter(|p| p.score >= thresholds.min_score && p.pvalue < thresholds.max_pvalue)
        .filter_map(|p| p.name.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// VirSorter2 header made safe for downstream tools
pub fn sanitize_virsorter_id(id: &str) -> String {
    id.replace('|', "_")
}

/// One sequence contains the other, ignoring case
pub fn sequences_match(a: &[u8], b: &[u8]) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.is_empty() {
        return false;
    }
    long.windows(short.len())
        .any(|window| window.eq_ignore_ascii_case(short))
}

/// Bases packed into one seed value
const SEED_LENGTH: usize = 32;

fn encode_base(base: u8) -> Option<u64> {
    match base {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

/// Rolling 2-bit packed windows of uppercase ACGT, windows with other
/// symbols are skipped
struct Seeds<'a> {
    seq: &'a [u8],
    pos: usize,
    value: u64,
    run: usize,
}

impl<'a> Seeds<'a> {
    fn new(seq: &'a [u8]) -> Self {
        Self { seq, pos: 0, value: 0, run: 0 }
    }
}

impl Iterator for Seeds<'_> {
    /// Window start and packed value
    type Item = (usize, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.seq.len() {
            let base = self.seq[self.pos];
            self.pos += 1;
            match encode_base(base) {
                Some(code) => {
                    self.value = (self.value << 2) | code;
                    self.run += 1;
                    if self.run >= SEED_LENGTH {
                        return Some((self.pos - SEED_LENGTH, self.value));
                    }
                }
                None => {
                    self.value = 0;
                    self.run = 0;
                }
            }
        }
        None
    }
}

/// First seed of every sequence in a set, keyed by packed value
struct SeedIndex<'a> {
    seqs: &'a [Vec<u8>],
    seeds: HashMap<u64, Vec<(usize, usize)>>,
    unseeded: Vec<usize>,
}

impl<'a> SeedIndex<'a> {
    fn new(seqs: &'a [Vec<u8>]) -> Self {
        let mut seeds: HashMap<u64, Vec<(usize, usize)>> = HashMap::new();
        let mut unseeded = Vec::new();
        for (j, seq) in seqs.iter().enumerate() {
            match Seeds::new(seq).next() {
                Some((offset, value)) => seeds.entry(value).or_default().push((j, offset)),
                None => unseeded.push(j),
            }
        }
        Self { seqs, seeds, unseeded }
    }

    /// Indexed sequences contained in `long`, possibly repeated
    fn contained_in(&self, long: &[u8]) -> Vec<usize> {
        let mut hits = Vec::new();
        for (pos, value) in Seeds::new(long) {
            let Some(candidates) = self.seeds.get(&value) else {
                continue;
            };
            for &(j, offset) in candidates {
                let short = &self.seqs[j];
                if pos < offset || short.len() > long.len() {
                    continue;
                }
                let start = pos - offset;
                if start + short.len() <= long.len() && long[start..start + short.len()] == short[..] {
                    hits.push(j);
                }
            }
        }
        for &j in &self.unseeded {
            let short = &self.seqs[j];
            if short.len() <= long.len() && sequences_match(short, long) {
                hits.push(j);
            }
        }
        hits
    }
}

/// Matching partners in `b` for every uppercase sequence of `a`
///
/// Containment holds when the shorter sequence's first seed occurs in the
/// longer one at a position where the whole sequence aligns, so each set
/// is scanned once against the other's seed index.
fn matching_pairs(a: &[Vec<u8>], b: &[Vec<u8>]) -> Vec<Vec<usize>> {
    let index_a = SeedIndex::new(a);
    let index_b = SeedIndex::new(b);

    let mut partners: Vec<Vec<usize>> = a.iter().map(|seq| index_b.contained_in(seq)).collect();
    for (j, seq) in b.iter().enumerate() {
        for i in index_a.contained_in(seq) {
            partners[i].push(j);
        }
    }
    for hits in partners.iter_mut() {
        hits.sort_unstable();
        hits.dedup();
    }
    partners
}

/// Outcome of reconciling call sets
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Sequences called by every method, taken from the first set
    pub records: Vec<FastaRecord>,
    pub calls: Vec<ReconciledCall>,
}
impl Reconciliation {
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

/// Reconcile labelled call sets by sequence matching
///
/// The first set is primary: a primary sequence is included when every
/// other set holds a matching sequence, and it keeps its own header and
/// annotation. Sequences of the other sets without a primary match are
/// reported once as excluded calls. With a single set every call passes.
pub fn reconcile(sets: &[(String, &[FastaRecord])]) -> Reconciliation {
    let Some(((primary_label, primary), others)) = sets.split_first() else {
        return Reconciliation { records: Vec::new(), calls: Vec::new() };
    };

    let upper = |records: &[FastaRecord]| -> Vec<Vec<u8>> {
        records.iter().map(|r| r.seq.to_ascii_uppercase()).collect()
    };
    let primary_seqs = upper(primary);
    let other_seqs: Vec<Vec<Vec<u8>>> = others.iter().map(|(_, records)| upper(records)).collect();
    let primary_hits: Vec<Vec<Vec<usize>>> = other_seqs
        .iter()
        .map(|seqs| matching_pairs(&primary_seqs, seqs))
        .collect();
    let mut claimed: Vec<Vec<bool>> = others.iter().map(|(_, records)| vec![false; records.len()]).collect();

    let mut records = Vec::new();
    let mut calls = Vec::new();

    for (i, record) in primary.iter().enumerate() {
        let mut methods = vec![primary_label.clone()];

        for (k, (label, _)) in others.iter().enumerate() {
            let hits = &primary_hits[k][i];
            for &j in hits {
                claimed[k][j] = true;
            }
            if !hits.is_empty() {
                methods.push(label.clone());
            }
        }

        let included = methods.len() == sets.len();
        if included {
            records.push(record.clone());
        }
        calls.push(ReconciledCall {
            scaffold_id: record.id.clone(),
            methods: methods.join(","),
            included,
        });
    }

    for k in 0..others.len() {
        let (label, other_records) = &others[k];
        let later_hits: Vec<Vec<Vec<usize>>> = ((k + 1)..others.len())
            .map(|k2| matching_pairs(&other_seqs[k], &other_seqs[k2]))
            .collect();
        for j in 0..other_records.len() {
            if claimed[k][j] {
                continue;
            }
            claimed[k][j] = true;
            let mut methods = vec![label.clone()];
            for (offset, hits) in later_hits.iter().enumerate() {
                let k2 = k + 1 + offset;
                for &j2 in &hits[j] {
                    claimed[k2][j2] = true;
                }
                if !hits[j].is_empty() {
                    methods.push(others[k2].0.clone());
                }
            }
            calls.push(ReconciledCall {
                scaffold_id: other_records[j].id.clone(),
                methods: methods.join(","),
                included: false,
            });
        }
    }

    Reconciliation { records, calls }
}

/// Output paths of a VIBRANT run on one input file
#[derive(Debug, Clone, PartialEq)]
pub struct VibrantOutputs {
    pub fna: PathBuf,
    pub faa: PathBuf,
    pub genome_quality: PathBuf,
    pub annotations: PathBuf,
}
impl VibrantOutputs {
    pub fn new(folder: &Path, stem: &str) -> Self {
        let root = folder.join(format!("VIBRANT_{stem}"));
        let phages = root.join(format!("VIBRANT_phages_{stem}"));
        let results = root.join(format!("VIBRANT_results_{stem}"));
        Self {
            fna: phages.join(format!("{stem}.phages_combined.fna")),
            faa: phages.join(format!("{stem}.phages_combined.faa")),
            genome_quality: results.join(format!("VIBRANT_genome_quality_{stem}.tsv")),
            annotations: results.join(format!("VIBRANT_annotations_{stem}.tsv")),
        }
    }
}

/// Output paths of a VirSorter2 run
#[derive(Debug, Clone, PartialEq)]
pub struct VirSorterOutputs {
    pub fasta: PathBuf,
    pub scores: PathBuf,
}
impl VirSorterOutputs {
    pub fn new(workdir: &Path) -> Self {
        Self {
            fasta: workdir.join("final-viral-combined.fa"),
            scores: workdir.join("final-viral-score.tsv"),
        }
    }
}

/// Output paths of a CheckV run
#[derive(Debug, Clone, PartialEq)]
pub struct CheckvOutputs {
    pub viruses: PathBuf,
    pub proviruses: PathBuf,
    pub contamination: PathBuf,
    pub quality_summary: PathBuf,
}
impl CheckvOutputs {
    pub fn new(outdir: &Path) -> Self {
        Self {
            viruses: outdir.join("viruses.fna"),
            proviruses: outdir.join("proviruses.fna"),
            contamination: outdir.join("contamination.tsv"),
            quality_summary: outdir.join("quality_summary.tsv"),
        }
    }
}

/// Files of the reconciled call set handed to downstream stages
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyManifest {
    pub fasta: PathBuf,
    pub proteins: PathBuf,
    pub annotations: PathBuf,
    pub lifecycle: PathBuf,
    pub calls: PathBuf,
    pub call_records: PathBuf,
    /// Final scaffolds in call order
    pub scaffolds: Vec<String>,
}
impl IdentifyManifest {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            fasta: dir.join("final_virus.fasta"),
            proteins: dir.join("final_virus.faa"),
            annotations: dir.join("final_virus_annotation.tsv"),
            lifecycle: dir.join("final_virus_lifecycle.tsv"),
            calls: dir.join("reconciled_calls.tsv"),
            call_records: dir.join("call_records.tsv"),
            scaffolds: Vec::new(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.scaffolds.is_empty()
    }
}

/// VIBRANT calls with their proteins, annotation and lifecycle
#[derive(Debug, Clone, Default)]
struct VibrantCalls {
    records: Vec<FastaRecord>,
    proteins: Vec<FastaRecord>,
    annotations: Vec<AnnotationRecord>,
    lifecycle: Vec<LifecycleRecord>,
}

/// Runs the configured identification method
pub struct Identifier<'a, R: ToolRunner> {
    config: &'a RunConfig,
    runner: &'a R,
}
impl<'a, R: ToolRunner> Identifier<'a, R> {
    pub fn new(config: &'a RunConfig, runner: &'a R) -> Self {
        Self { config, runner }
    }

    pub fn run(&self) -> Result<IdentifyManifest, ViwrapError> {
        let dir = &self.config.layout.identify;
        create_dir_all(dir)?;

        let stem = &self.config.stem;
        let methods = self.config.method.methods();

        let mut call_records = Vec::new();
        let mut vibrant = None;
        let mut sets: Vec<(String, Vec<FastaRecord>)> = Vec::new();

        for method in &methods {
            let records = match method {
                Method::Vb => {
                    let calls = self.run_vibrant(&self.config.input, dir, true)?;
                    call_records.extend(calls.records.iter().map(|r| CallRecord {
                        scaffold_id: r.id.clone(),
                        method: Method::Vb,
                        passed: true,
                        tier: None,
                    }));
                    let records = calls.records.clone();
                    vibrant = Some(calls);
                    records
                }
                Method::Vs => {
                    let (records, tiers) = self.run_virsorter_protocol(&dir.join(format!("VirSorter_{stem}")))?;
                    call_records.extend(tiers);
                    records
                }
                Method::Dvf => {
                    let (records, dvf_calls) = self.run_deepvirfinder(&dir.join(format!("DeepVirFinder_{stem}")))?;
                    call_records.extend(dvf_calls);
                    records
                }
            };
            log::info!("Method '{method}' called {} viral sequences", records.len());
            sets.push((method.to_string(), records));
        }

        let labelled: Vec<(String, &[FastaRecord])> = sets
            .iter()
            .map(|(label, records)| (label.clone(), records.as_slice()))
            .collect();
        let reconciliation = reconcile(&labelled);

        if methods.len() > 1 {
            let overlap_dir = dir.join(format!("Overlap_{stem}"));
            create_dir_all(&overlap_dir)?;
            write_fasta(&reconciliation.records, &overlap_dir.join("final_overlapped_virus.fasta"))?;
        }

        let mut manifest = IdentifyManifest::in_dir(dir);
        manifest.scaffolds = reconciliation.ids();

        if reconciliation.records.is_empty() {
            log::warn!("No viral sequences were identified by method '{}'", self.config.method);
        } else {
            log::info!("Reconciled call set holds {} viral sequences", reconciliation.records.len());
        }

        let final_ids: HashSet<&str> = manifest.scaffolds.iter().map(String::as_str).collect();

        let (proteins, annotations, lifecycle): (Vec<FastaRecord>, Vec<AnnotationRecord>, Vec<LifecycleRecord>) =
            match vibrant {
                Some(calls) => (
                    calls
                        .proteins
                        .into_iter()
                        .filter(|p| final_ids.contains(protein_scaffold(&p.id)))
                        .collect(),
                    calls
                        .annotations
                        .into_iter()
                        .filter(|a| final_ids.contains(a.scaffold.as_str()))
                        .collect(),
                    calls
                        .lifecycle
                        .into_iter()
                        .filter(|l| final_ids.contains(l.scaffold.as_str()))
                        .collect(),
                ),
                None => {
                    let (proteins, annotations) =
                        self.annotate_with_kegg(&reconciliation.records, &dir.join("KEGG_annotation"))?;
                    let lifecycle = reconciliation
                        .records
                        .iter()
                        .map(|r| LifecycleRecord {
                            scaffold: r.id.clone(),
                            lifecycle: LifecycleState::Unknown,
                        })
                        .collect();
                    (proteins, annotations, lifecycle)
                }
            };

        write_fasta(&reconciliation.records, &manifest.fasta)?;
        write_fasta(&proteins, &manifest.proteins)?;
        write_tsv(&annotations, &manifest.annotations, true)?;
        write_tsv(&lifecycle, &manifest.lifecycle, true)?;
        write_tsv(&reconciliation.calls, &manifest.calls, true)?;
        write_tsv(&call_records, &manifest.call_records, true)?;

        Ok(manifest)
    }

    /// VIBRANT on one input; secondary passes tolerate absent outputs
    fn run_vibrant(&self, input: &Path, folder: &Path, primary: bool) -> Result<VibrantCalls, ViwrapError> {
        create_dir_all(folder)?;
        let stem = get_file_component(input, FileComponent::FileStem)?;
        let outputs = VibrantOutputs::new(folder, &stem);

        let mut invocation = ToolInvocation::new(Tool::Vibrant, Stage::Identify, folder)
            .arg("-i")
            .arg_path(input)
            .arg("-folder")
            .arg_path(folder)
            .arg("-t")
            .arg(self.config.threads)
            .arg("-l")
            .arg(self.config.length_limit)
            .arg("-d")
            .arg_path(&self.config.databases.vibrant_databases())
            .arg("-m")
            .arg_path(&self.config.databases.vibrant_files());
        if self.config.virome {
            invocation = invocation.arg("-virome");
        }
        if primary {
            invocation = invocation
                .output_allow_empty(&outputs.fna)
                .output_allow_empty(&outputs.faa)
                .output_allow_empty(&outputs.genome_quality)
                .output_allow_empty(&outputs.annotations);
        }
        self.runner.invoke(&invocation)?;

        let read_if_exists = |path: &Path| -> Result<Vec<FastaRecord>, ViwrapError> {
            if path.exists() { read_fasta(path) } else { Ok(Vec::new()) }
        };

        Ok(VibrantCalls {
            records: read_if_exists(&outputs.fna)?,
            proteins: read_if_exists(&outputs.faa)?,
            annotations: if outputs.annotations.exists() {
                read_vibrant_annotations(&outputs.annotations)?
            } else {
                Vec::new()
            },
            lifecycle: if outputs.genome_quality.exists() {
                read_vibrant_lifecycle(&outputs.genome_quality)?
            } else {
                Vec::new()
            },
        })
    }

    fn run_virsorter(&self, input: &Path, workdir: &Path, second_pass: bool) -> Result<VirSorterOutputs, ViwrapError> {
        create_dir_all(workdir)?;
        let outputs = VirSorterOutputs::new(workdir);

        let mut invocation = ToolInvocation::new(Tool::VirSorter2, Stage::Identify, workdir).arg("run");
        invocation = if second_pass {
            invocation.args([
                "--seqname-suffix-off",
                "--viral-gene-enrich-off",
                "--provirus-off",
                "--prep-for-dramv",
            ])
        } else {
            invocation.arg("--keep-original-seq")
        };
        let invocation = invocation
            .arg("-i")
            .arg_path(input)
            .arg("-w")
            .arg_path(workdir)
            .arg("--include-groups")
            .arg("dsDNAphage,ssDNA")
            .arg("--min-length")
            .arg(self.config.length_limit)
            .arg("--min-score")
            .arg("0.5")
            .arg("-j")
            .arg(self.config.threads)
            .arg("--db-dir")
            .arg_path(&self.config.databases.virsorter2)
            .arg("all")
            .output_allow_empty(&outputs.fasta)
            .output_allow_empty(&outputs.scores);

        self.runner.invoke(&invocation)?;
        Ok(outputs)
    }

    fn run_checkv(&self, input: &Path, outdir: &Path, stage: Stage) -> Result<CheckvOutputs, ViwrapError> {
        run_checkv(self.runner, input, outdir, &self.config.databases.checkv, self.config.threads, stage)
    }

    /// VirSorter2 -> CheckV -> VirSorter2 -> CheckV -> screening -> VIBRANT rescue
    fn run_virsorter_protocol(&self, dir: &Path) -> Result<(Vec<FastaRecord>, Vec<CallRecord>), ViwrapError> {
        create_dir_all(dir)?;

        let pass1 = self.run_virsorter(&self.config.input, &dir.join("vs2-pass1"), false)?;
        if read_fasta(&pass1.fasta)?.is_empty() {
            log::warn!("VirSorter2 first pass called no sequences");
            return Ok((Vec::new(), Vec::new()));
        }

        let checkv1 = self.run_checkv(&pass1.fasta, &dir.join("checkv-pass1"), Stage::Identify)?;
        let trimmed = dir.join("checkv-pass1").join("combined.fna");
        concatenate_fasta_files(&[checkv1.proviruses.clone(), checkv1.viruses.clone()], &trimmed)?;
        if read_fasta(&trimmed)?.is_empty() {
            log::warn!("CheckV first pass retained no sequences");
            return Ok((Vec::new(), Vec::new()));
        }

        let pass2 = self.run_virsorter(&trimmed, &dir.join("vs2-pass2"), true)?;
        let pass2_records = read_fasta(&pass2.fasta)?;
        if pass2_records.is_empty() {
            log::warn!("VirSorter2 second pass called no sequences");
            return Ok((Vec::new(), Vec::new()));
        }
        let checkv2 = self.run_checkv(&pass2.fasta, &dir.join("checkv-pass2"), Stage::Identify)?;

        let scores: Vec<VirSorterScore> = read_tsv(&pass2.scores, true)?;
        let contamination: Vec<CheckvContamination> = read_tsv(&checkv2.contamination, true)?;
        let tiers = screen_virsorter(&scores, &contamination, &self.config.screening);

        let screening_dir = dir.join("screening");
        create_dir_all(&screening_dir)?;

        let tier_ids = |tier: VsTier| -> Vec<String> {
            tiers
                .iter()
                .filter(|(_, t)| *t == tier)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let keep1 = tier_ids(VsTier::Keep1);
        let keep2 = tier_ids(VsTier::Keep2);
        let manual_check = tier_ids(VsTier::ManualCheck);

        write_id_list(&keep1, &screening_dir.join("keep1_list.txt"))?;
        write_id_list(&keep2, &screening_dir.join("keep2_list.txt"))?;
        write_id_list(&manual_check, &screening_dir.join("manual_check_list.txt"))?;
        write_id_list(&tier_ids(VsTier::Discard), &screening_dir.join("discard_list.txt"))?;

        let by_id: HashMap<&str, &FastaRecord> = pass2_records.iter().map(|r| (r.id.as_str(), r)).collect();

        let keep2_passed = self.rescue_with_vibrant(&keep2, &by_id, &screening_dir, "keep2")?;
        let manual_check_passed = self.rescue_with_vibrant(&manual_check, &by_id, &screening_dir, "manual_check")?;
        write_id_list(&keep2_passed, &screening_dir.join("keep2_list_vb_passed.txt"))?;
        write_id_list(&manual_check_passed, &screening_dir.join("manual_check_list_vb_passed.txt"))?;

        let accepted: HashSet<&String> = keep1
            .iter()
            .chain(keep2_passed.iter())
            .chain(manual_check_passed.iter())
            .collect();

        let records: Vec<FastaRecord> = pass2_records
            .iter()
            .filter(|r| accepted.contains(&r.id))
            .map(|r| FastaRecord {
                id: sanitize_virsorter_id(&r.id),
                seq: r.seq.clone(),
            })
            .collect();
        write_fasta(&records, &dir.join("final_vs2_virus.fasta"))?;

        let call_records = tiers
            .into_iter()
            .map(|(id, tier)| CallRecord {
                passed: accepted.contains(&id),
                scaffold_id: sanitize_virsorter_id(&id),
                method: Method::Vs,
                tier: Some(tier),
            })
            .collect();

        Ok((records, call_records))
    }

    fn rescue_with_vibrant(
        &self,
        candidates: &[String],
        sequences: &HashMap<&str, &FastaRecord>,
        dir: &Path,
        group: &str,
    ) -> Result<Vec<String>, ViwrapError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let fasta = dir.join(format!("{group}.fasta"));
        let records: Vec<FastaRecord> = candidates
            .iter()
            .filter_map(|id| sequences.get(id.as_str()).map(|r| (*r).clone()))
            .collect();
        write_fasta(&records, &fasta)?;

        let calls = self.run_vibrant(&fasta, &dir.join(format!("{group}_VIBRANT")), false)?;
        let called: Vec<String> = calls.records.into_iter().map(|r| r.id).collect();
        let passed = vibrant_passed(candidates, &called)?;

        log::info!("VIBRANT confirmed {} of {} '{group}' sequences", passed.len(), candidates.len());
        Ok(passed)
    }

    fn run_deepvirfinder(&self, dir: &Path) -> Result<(Vec<FastaRecord>, Vec<CallRecord>), ViwrapError> {
        create_dir_all(dir)?;
        let input_name = get_file_component(&self.config.input, FileComponent::FileName)?;
        let predictions = dir.join(format!("{input_name}_gt{}bp_dvfpred.txt", self.config.length_limit));

        let invocation = ToolInvocation::new(Tool::DeepVirFinder, Stage::Identify, dir)
            .arg("-i")
            .arg_path(&self.config.input)
            .arg("-o")
            .arg_path(dir)
            .arg("-l")
            .arg(self.config.length_limit)
            .arg("-c")
            .arg(self.config.threads)
            .arg("-m")
            .arg_path(&self.config.databases.dvf_models())
            .output_allow_empty(&predictions);
        self.runner.invoke(&invocation)?;

        let table: Vec<DvfPrediction> = read_tsv(&predictions, true)?;
        let passed: HashSet<String> = dvf_passed(&table, &self.config.dvf).into_iter().collect();

        let records: Vec<FastaRecord> = read_fasta(&self.config.input)?
            .into_iter()
            .filter(|r| passed.contains(&r.id))
            .collect();
        write_fasta(&records, &dir.join("final_dvf_virus.fasta"))?;

        let call_records = table
            .iter()
            .filter_map(|p| p.name.split_whitespace().next())
            .map(|id| CallRecord {
                scaffold_id: id.to_string(),
                method: Method::Dvf,
                passed: passed.contains(id),
                tier: None,
            })
            .collect();

        Ok((records, call_records))
    }

    /// prodigal + hmmsearch against the VIBRANT KEGG profiles
    fn annotate_with_kegg(
        &self,
        records: &[FastaRecord],
        dir: &Path,
    ) -> Result<(Vec<FastaRecord>, Vec<AnnotationRecord>), ViwrapError> {
        if records.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        create_dir_all(dir)?;

        let fasta = dir.join("virus.fasta");
        let proteins = dir.join("virus.faa");
        let tblout = dir.join("virus.kegg.tblout");
        write_fasta(records, &fasta)?;

        self.runner.invoke(
            &ToolInvocation::new(Tool::Prodigal, Stage::Identify, dir)
                .arg("-i")
                .arg_path(&fasta)
                .arg("-a")
                .arg_path(&proteins)
                .arg("-p")
                .arg("meta")
                .arg("-q")
                .output_allow_empty(&proteins),
        )?;

        self.runner.invoke(
            &ToolInvocation::new(Tool::Hmmsearch, Stage::Identify, dir)
                .arg("--tblout")
                .arg_path(&tblout)
                .arg("--noali")
                .arg("-E")
                .arg(KO_EVALUE_CUTOFF)
                .arg("--cpu")
                .arg(self.config.threads)
                .arg_path(&self.config.databases.kegg_profiles())
                .arg_path(&proteins)
                .output_allow_empty(&tblout),
        )?;

        let protein_records = read_fasta(&proteins)?;
        let hits = best_hits(read_hmmsearch_tblout(&tblout)?, KO_EVALUE_CUTOFF);
        let amg_kos = read_amg_list(&self.config.databases.amg_list())?;
        let annotations = annotate_proteins(&protein_records, &hits, &amg_kos);

        Ok((protein_records, annotations))
    }
}

/// CheckV end-to-end on a nucleotide FASTA
pub fn run_checkv<R: ToolRunner>(
    runner: &R,
    input: &Path,
    outdir: &Path,
    db: &Path,
    threads: usize,
    stage: Stage,
) -> Result<CheckvOutputs, ViwrapError> {
    create_dir_all(outdir)?;
    let outputs = CheckvOutputs::new(outdir);

    let invocation = ToolInvocation::new(Tool::CheckV, stage, outdir)
        .arg("end_to_end")
        .arg_path(input)
        .arg_path(outdir)
        .arg("-t")
        .arg(threads)
        .arg("-d")
        .arg_path(db)
        .output_allow_empty(&outputs.contamination)
        .output_allow_empty(&outputs.quality_summary);

    runner.invoke(&invocation)?;
    Ok(outputs)
}

/// Lifecycle state per scaffold from a persisted identification table
pub fn read_lifecycle_table(path: &Path) -> Result<HashMap<String, LifecycleState>, ViwrapError> {
    let records: Vec<LifecycleRecord> = read_tsv(path, true)?;
    Ok(lifecycle_map(&records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, seq: &str) -> FastaRecord {
        FastaRecord::new(id, seq.as_bytes())
    }

    fn score(seqname: &str, max_score: f64, length: u64, hallmark: u32) -> VirSorterScore {
        VirSorterScore {
            seqname: seqname.to_string(),
            max_score,
            max_score_group: "dsDNAphage".to_string(),
            length,
            hallmark,
        }
    }

    fn checkv(contig_id: &str, length: u64, viral: u32, host: u32) -> CheckvContamination {
        CheckvContamination {
            contig_id: contig_id.to_string(),
            contig_length: length,
            viral_genes: viral,
            host_genes: host,
        }
    }

    #[test]
    fn screening_tiers() {
        let t = ScreeningThresholds::default();
        let scores = vec![
            score("a", 0.6, 5000, 0),
            score("b", 0.6, 5000, 0),
            score("c", 0.97, 5000, 0),
            score("d", 0.6, 12000, 1),
            score("e", 0.6, 5000, 1),
            score("f", 0.6, 5000, 3),
            score("g", 0.6, 5000, 0),
        ];
        let contamination = vec![
            checkv("a", 5000, 2, 5),
            checkv("b", 5000, 0, 0),
            checkv("c", 5000, 0, 3),
            checkv("d", 12000, 0, 1),
            checkv("e", 5000, 0, 1),
            checkv("f", 5000, 0, 4),
        ];
        let tiers: Vec<VsTier> = screen_virsorter(&scores, &contamination, &t)
            .into_iter()
            .map(|(_, tier)| tier)
            .collect();

        assert_eq!(
            tiers,
            vec![
                VsTier::Keep1,
                VsTier::Keep2,
                VsTier::Keep2,
                VsTier::ManualCheck,
                VsTier::Discard,
                VsTier::Keep2,
                VsTier::Keep2,
            ]
        );
    }

    #[test]
    fn vibrant_rescue_matches_fragments() -> Result<(), ViwrapError> {
        let candidates = vec!["k141_1".to_string(), "k141_2".to_string(), "k141_3".to_string()];
        let called = vec!["k141_1".to_string(), "k141_3_fragment_2".to_string()];
        assert_eq!(vibrant_passed(&candidates, &called)?, vec!["k141_1", "k141_3"]);
        assert!(vibrant_passed(&[], &called)?.is_empty());
        Ok(())
    }

    #[test]
    fn dvf_thresholds_filter_predictions() {
        let predictions = vec![
            DvfPrediction { name: "s1 len=5000".into(), len: 5000, score: 0.95, pvalue: 0.001 },
            DvfPrediction { name: "s2".into(), len: 5000, score: 0.85, pvalue: 0.001 },
            DvfPrediction { name: "s3".into(), len: 5000, score: 0.99, pvalue: 0.05 },
        ];
        assert_eq!(dvf_passed(&predictions, &DvfThresholds::default()), vec!["s1"]);
    }

    #[test]
    fn sequence_matching_is_containment() {
        assert!(sequences_match(b"ACGTACGT", b"gtac"));
        assert!(sequences_match(b"GTA", b"ACGTACGT"));
        assert!(!sequences_match(b"ACGT", b"TTTT"));
        assert!(!sequences_match(b"", b"ACGT"));
    }

    #[test]
    fn overlap_of_vb_and_vs() {
        let vb = vec![rec("scaffold_1", "AAAACCCCGGGG"), rec("scaffold_3", "TTTTGGGGAAAA")];
        let vs = vec![rec("scaffold_2", "CACACACACACA"), rec("scaffold_3", "TTTTGGGGAAAA")];
        let result = reconcile(&[("vb".to_string(), vb.as_slice()), ("vs".to_string(), vs.as_slice())]);

        assert_eq!(result.ids(), vec!["scaffold_3"]);
        assert_eq!(result.calls.len(), 3);
        let s3 = result.calls.iter().find(|c| c.scaffold_id == "scaffold_3").unwrap();
        assert_eq!(s3.methods, "vb,vs");
        assert!(s3.included);
        let s2 = result.calls.iter().find(|c| c.scaffold_id == "scaffold_2").unwrap();
        assert_eq!(s2.methods, "vs");
        assert!(!s2.included);
    }

    #[test]
    fn overlap_matches_renamed_and_trimmed_sequences() {
        let vb = vec![rec("scaffold_7_fragment_1", "CCCCGGGG")];
        let vs = vec![rec("scaffold_7__full", "AAAACCCCGGGGTTTT")];
        let result = reconcile(&[("vb".to_string(), vb.as_slice()), ("vs".to_string(), vs.as_slice())]);
        assert_eq!(result.ids(), vec!["scaffold_7_fragment_1"]);
    }

    #[test]
    fn overlap_result_is_subset_and_idempotent() {
        let a = vec![rec("x", "ACGTTGCA"), rec("y", "GGGGCCCC"), rec("z", "ATATATAT")];
        let b = vec![rec("y", "GGGGCCCC"), rec("z", "ATATATAT"), rec("w", "CGCGCGCG")];
        let result = reconcile(&[("a".to_string(), a.as_slice()), ("b".to_string(), b.as_slice())]);
        assert_eq!(result.ids(), vec!["y", "z"]);

        let again = reconcile(&[
            ("a".to_string(), result.records.as_slice()),
            ("b".to_string(), result.records.as_slice()),
        ]);
        assert_eq!(again.records, result.records);
    }

    #[test]
    fn triple_overlap_requires_all_methods() {
        let vb = vec![rec("s1", "AAAACCCC"), rec("s2", "GGGGTTTT")];
        let vs = vec![rec("s1", "AAAACCCC"), rec("s2", "GGGGTTTT")];
        let dvf = vec![rec("s2", "GGGGTTTT"), rec("s9", "CGCGATAT")];
        let result = reconcile(&[
            ("vb".to_string(), vb.as_slice()),
            ("vs".to_string(), vs.as_slice()),
            ("dvf".to_string(), dvf.as_slice()),
        ]);
        assert_eq!(result.ids(), vec!["s2"]);
        let s1 = result.calls.iter().find(|c| c.scaffold_id == "s1").unwrap();
        assert_eq!(s1.methods, "vb,vs");
        assert!(!s1.included);
    }

    #[test]
    fn empty_sets_reconcile_to_empty() {
        let vb: Vec<FastaRecord> = Vec::new();
        let vs = vec![rec("s1", "ACGT")];
        let result = reconcile(&[("vb".to_string(), vb.as_slice()), ("vs".to_string(), vs.as_slice())]);
        assert!(result.records.is_empty());
        assert_eq!(result.calls.len(), 1);
        assert!(reconcile(&[]).records.is_empty());
    }

    #[test]
    fn single_method_passes_through() {
        let vb = vec![rec("s1", "ACGT"), rec("s2", "TTTT")];
        let result = reconcile(&[("vb".to_string(), vb.as_slice())]);
        assert_eq!(result.records, vb);
        assert!(result.calls.iter().all(|c| c.included));
    }

    fn random_seq(state: &mut u64, len: usize) -> String {
        (0..len)
            .map(|_| {
                *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                b"ACGT"[(*state >> 62) as usize] as char
            })
            .collect()
    }

    #[test]
    fn seeded_matching_finds_containment_at_any_offset() {
        let mut state = 7;
        let long = random_seq(&mut state, 5000);
        let inner = long[1234..3456].to_string();
        let tail = long[4900..].to_lowercase();
        let substitute = if &long[40..41] == "A" { "C" } else { "A" };
        let diverged = format!("{}{}{}", &long[0..40], substitute, &long[41..200]);

        let vb = vec![rec("inner", &inner), rec("tail", &tail), rec("diverged", &diverged)];
        let vs = vec![rec("long", &long)];
        let result = reconcile(&[("vb".to_string(), vb.as_slice()), ("vs".to_string(), vs.as_slice())]);

        assert_eq!(result.ids(), vec!["inner", "tail"]);
        assert!(!result.calls.iter().any(|c| c.scaffold_id == "long"));
    }

    #[test]
    fn seeded_matching_handles_ambiguous_bases() {
        let mut state = 11;
        let left = random_seq(&mut state, 300);
        let right = random_seq(&mut state, 300);
        let long = format!("{}NNNNN{}", left, right);
        let short = format!("{}NNNNN{}", &left[250..], &right[..60]);

        let vb = vec![rec("scaffold_1", &long)];
        let vs = vec![rec("scaffold_1||full", &short), rec("masked", "NNNNNNNNNN")];
        let result = reconcile(&[("vb".to_string(), vb.as_slice()), ("vs".to_string(), vs.as_slice())]);

        assert_eq!(result.ids(), vec!["scaffold_1"]);
        let masked = result.calls.iter().find(|c| c.scaffold_id == "masked").unwrap();
        assert_eq!(masked.methods, "vs");
    }

    #[test]
    fn large_disjoint_call_sets_reconcile_to_empty() {
        let mut state = 3;
        let vb: Vec<FastaRecord> = (0..300)
            .map(|i| rec(&format!("vb_{i}"), &random_seq(&mut state, 2000 + i * 7)))
            .collect();
        let vs: Vec<FastaRecord> = (0..300)
            .map(|i| rec(&format!("vs_{i}"), &random_seq(&mut state, 3000 + i * 5)))
            .collect();
        let result = reconcile(&[("vb".to_string(), vb.as_slice()), ("vs".to_string(), vs.as_slice())]);

        assert!(result.records.is_empty());
        assert_eq!(result.calls.len(), 600);
    }

    #[test]
    fn triple_overlap_of_long_sequences() {
        let mut state = 19;
        let shared = random_seq(&mut state, 1500);
        let other = random_seq(&mut state, 1500);
        let vb = vec![rec("s1", &shared), rec("s2", &other)];
        let vs = vec![rec("s1||full", &shared[100..1400]), rec("s2||full", &other)];
        let dvf = vec![rec("s1", &shared[200..1300])];
        let result = reconcile(&[
            ("vb".to_string(), vb.as_slice()),
            ("vs".to_string(), vs.as_slice()),
            ("dvf".to_string(), dvf.as_slice()),
        ]);
        assert_eq!(result.ids(), vec!["s1"]);
        assert_eq!(result.calls.len(), 2);
    }

    #[test]
    fn virsorter_ids_are_sanitized() {
        assert_eq!(sanitize_virsorter_id("k141_5||full"), "k141_5__full");
    }

    #[test]
    fn method_dir_names() {
        assert_eq!(IdentifyMethod::VbVs.dir_name("lake"), "VIBRANT_VirSorter_lake");
        assert_eq!(IdentifyMethod::VbVsDvf.methods(), vec![Method::Vb, Method::Vs, Method::Dvf]);
    }
}
