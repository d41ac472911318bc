use std::collections::HashMap;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{ReadSample, ReadType};
use crate::error::ViwrapError;
use crate::genome::Genome;
use crate::tool::{Stage, Tool, ToolInvocation, ToolRunner};
use crate::utils::read_tsv;

/// Reads per sample used as the normalization unit
pub const NORMALIZATION_READS: f64 = 1e8;

/// Row of `samtools coverage` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRow {
    #[serde(rename = "#rname")]
    pub rname: String,
    pub startpos: u64,
    pub endpos: u64,
    pub numreads: u64,
    pub meandepth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Abundance {
    pub raw: f64,
    pub normalized: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReads {
    pub sample: String,
    pub reads: u64,
}

/// Alignment and coverage of one sample against the viral scaffolds
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMapping {
    pub sample: String,
    pub bam: PathBuf,
    pub coverage: PathBuf,
    pub reads: u64,
}

/// Scaffold length and mean depth from a coverage table
pub fn read_coverage(path: &Path) -> Result<HashMap<String, (u64, f64)>, ViwrapError> {
    let rows: Vec<CoverageRow> = read_tsv(path, true)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let length = row.endpos.saturating_sub(row.startpos) + 1;
            (row.rname, (length, row.meandepth))
        })
        .collect())
}

/// Length weighted mean depth over the member scaffolds of a genome
pub fn raw_abundance(genome: &Genome, coverage: &HashMap<String, (u64, f64)>) -> f64 {
    let (bases, weighted) = genome
        .scaffolds
        .iter()
        .filter_map(|scaffold| coverage.get(scaffold))
        .fold((0u64, 0f64), |(bases, weighted), (length, depth)| {
            (bases + length, weighted + *length as f64 * depth)
        });

    if bases == 0 {
        0.0
    } else {
        weighted / bases as f64
    }
}

pub fn normalized_abundance(raw: f64, reads: u64) -> f64 {
    if reads == 0 {
        0.0
    } else {
        raw * NORMALIZATION_READS / reads as f64
    }
}

pub fn genome_abundance(genome: &Genome, coverage: &HashMap<String, (u64, f64)>, reads: u64) -> Abundance {
    let raw = raw_abundance(genome, coverage);
    Abundance {
        raw,
        normalized: normalized_abundance(raw, reads),
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// minimap2 | samtools sort, coverm identity filter, samtools index and coverage
pub fn mapping_command(
    sample: &ReadSample,
    reference: &Path,
    outdir: &Path,
    read_type: ReadType,
    identity: f64,
    threads: usize,
) -> (String, PathBuf, PathBuf) {
    let unfiltered = outdir.join(format!("{}.unfiltered.bam", sample.name));
    let bam = outdir.join(format!("{}.bam", sample.name));
    let coverage = outdir.join(format!("{}.coverage.tsv", sample.name));

    let reads = sample
        .files
        .iter()
        .map(|f| shell_quote(f))
        .collect::<Vec<_>>()
        .join(" ");

    let script = format!(
        "minimap2 -ax {preset} -t {threads} {reference} {reads} | samtools sort -@ {threads} -o {unfiltered} - && \
         coverm filter --bam-files {unfiltered} --output-bam-files {bam} --min-read-percent-identity {identity} --threads {threads} && \
         samtools index {bam} && \
         samtools coverage {bam} > {coverage} && \
         rm {unfiltered}",
        preset = read_type.preset(),
        reference = shell_quote(reference),
        unfiltered = shell_quote(&unfiltered),
        bam = shell_quote(&bam),
        coverage = shell_quote(&coverage),
        identity = identity * 100.0,
    );
    (script, bam, coverage)
}

/// Map every sample against the viral scaffolds
pub fn map_samples<R: ToolRunner>(
    runner: &R,
    samples: &[ReadSample],
    read_counts: &HashMap<String, u64>,
    reference: &Path,
    outdir: &Path,
    read_type: ReadType,
    identity: f64,
    threads: usize,
) -> Result<Vec<SampleMapping>, ViwrapError> {
    create_dir_all(outdir)?;

    let mut mappings = Vec::new();
    for sample in samples {
        log::info!("Mapping reads of sample '{}'", sample.name);
        let (script, bam, coverage) = mapping_command(sample, reference, outdir, read_type, identity, threads);

        let invocation = ToolInvocation::new(Tool::Mapper, Stage::Map, outdir)
            .arg("-c")
            .arg(script)
            .output(&bam)
            .output(&coverage);
        runner.invoke(&invocation)?;

        mappings.push(SampleMapping {
            sample: sample.name.clone(),
            bam,
            coverage,
            reads: read_counts.get(&sample.name).copied().unwrap_or(0),
        });
    }
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::GenomeKind;
    use float_eq::assert_float_eq;

    fn genome(scaffolds: &[&str]) -> Genome {
        Genome {
            id: "vRhyme_bin_1".to_string(),
            kind: GenomeKind::Bin,
            scaffolds: scaffolds.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn raw_abundance_is_length_weighted() {
        let coverage: HashMap<String, (u64, f64)> = [
            ("s1".to_string(), (1000, 10.0)),
            ("s2".to_string(), (3000, 2.0)),
        ]
        .into_iter()
        .collect();

        let abundance = genome_abundance(&genome(&["s1", "s2", "s3"]), &coverage, 2_000_000);
        assert_float_eq!(abundance.raw, 4.0, abs <= 1e-9);
        assert_float_eq!(abundance.normalized, 200.0, abs <= 1e-9);
    }

    #[test]
    fn abundance_without_coverage_or_reads_is_zero() {
        let coverage = HashMap::new();
        assert_float_eq!(raw_abundance(&genome(&["s1"]), &coverage), 0.0, abs <= 1e-12);
        assert_float_eq!(normalized_abundance(5.0, 0), 0.0, abs <= 1e-12);
    }

    #[test]
    fn mapping_command_uses_preset_and_identity() {
        let sample = ReadSample {
            name: "lake".to_string(),
            files: vec![PathBuf::from("/reads/lake_1.fastq"), PathBuf::from("/reads/lake_2.fastq")],
        };
        let (script, bam, coverage) =
            mapping_command(&sample, Path::new("/out/virus.fasta"), Path::new("/out/map"), ReadType::Illumina, 0.97, 4);

        assert!(script.starts_with("minimap2 -ax sr -t 4 '/out/virus.fasta' '/reads/lake_1.fastq' '/reads/lake_2.fastq'"));
        assert!(script.contains("--min-read-percent-identity 97"));
        assert_eq!(bam, PathBuf::from("/out/map/lake.bam"));
        assert_eq!(coverage, PathBuf::from("/out/map/lake.coverage.tsv"));
    }
}
