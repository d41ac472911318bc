use std::collections::HashMap;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use tabled::settings::object::Columns;
use tabled::settings::{Style, Width};
use tabled::{Table, Tabled};

use crate::abundance::{Abundance, SampleReads};
use crate::annotation::{protein_scaffold, AnnotationRecord};
use crate::error::ViwrapError;
use crate::genome::{genome_member_records, GenomeMap};
use crate::host::host_genus;
use crate::metadata::{GenomeMetadata, MetadataStore};
use crate::taxonomy::{reconcile_taxonomy, TaxonomySource};
use crate::utils::{write_fasta, write_header, write_tsv, FastaRecord};

/// Placeholder for values a stage did not provide
pub const NOT_AVAILABLE: &str = "NA";

fn na<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

fn na_str(value: &str) -> String {
    if value.is_empty() {
        NOT_AVAILABLE.to_string()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Tabled)]
pub struct VirusSummaryRow {
    #[serde(rename = "Genome")]
    #[tabled(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "Scaffold number")]
    #[tabled(rename = "Scaffolds")]
    pub scaffold_count: String,
    #[serde(rename = "Scaffolds")]
    #[tabled(skip)]
    pub scaffolds: String,
    #[serde(rename = "Genome size (bp)")]
    #[tabled(rename = "Size")]
    pub size: String,
    #[serde(rename = "Protein number")]
    #[tabled(skip)]
    pub protein_count: String,
    #[serde(rename = "Lifecycle")]
    #[tabled(rename = "Lifecycle")]
    pub lifecycle: String,
    #[serde(rename = "CheckV quality")]
    #[tabled(rename = "CheckV")]
    pub checkv_quality: String,
    #[serde(rename = "MIUViG quality")]
    #[tabled(skip)]
    pub miuvig_quality: String,
    #[serde(rename = "Completeness")]
    #[tabled(rename = "Completeness")]
    pub completeness: String,
    #[serde(rename = "Completeness method")]
    #[tabled(skip)]
    pub completeness_method: String,
    #[serde(rename = "Contamination")]
    #[tabled(skip)]
    pub contamination: String,
    #[serde(rename = "Contamination flag")]
    #[tabled(skip)]
    pub contamination_flag: String,
    #[serde(rename = "Genus cluster")]
    #[tabled(rename = "Genus")]
    pub genus_cluster: String,
    #[serde(rename = "Species cluster")]
    #[tabled(rename = "Species")]
    pub species_cluster: String,
    #[serde(rename = "Taxonomy")]
    #[tabled(rename = "Taxonomy")]
    pub taxonomy: String,
    #[serde(rename = "Taxonomy source")]
    #[tabled(skip)]
    pub taxonomy_source: String,
    #[serde(rename = "Host")]
    #[tabled(rename = "Host")]
    pub host: String,
    #[serde(rename = "AMG number")]
    #[tabled(rename = "AMGs")]
    pub amg_count: String,
}
impl VirusSummaryRow {
    pub fn from_metadata(metadata: &GenomeMetadata, precedence: &[TaxonomySource]) -> Self {
        let quality = metadata.quality.as_ref();
        let taxonomy = reconcile_taxonomy(&metadata.taxonomy, precedence);
        let host = metadata
            .hosts
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            genome: metadata.genome_id.clone(),
            scaffold_count: na(metadata.scaffold_count),
            scaffolds: metadata.scaffolds.join(","),
            size: na(metadata.size),
            protein_count: na(metadata.protein_count),
            lifecycle: na(metadata.lifecycle),
            checkv_quality: na(quality.map(|q| q.checkv_quality.as_str()).filter(|q| !q.is_empty())),
            miuvig_quality: na(quality.map(|q| q.miuvig_quality.as_str()).filter(|q| !q.is_empty())),
            completeness: na(quality.and_then(|q| q.completeness).map(|c| format!("{c:.2}"))),
            completeness_method: na(quality.and_then(|q| q.completeness_method.clone())),
            contamination: na(quality.and_then(|q| q.contamination).map(|c| format!("{c:.2}"))),
            contamination_flag: na(quality.map(|q| if q.contamination_flag() { "yes" } else { "no" })),
            genus_cluster: na(metadata.genus_cluster.as_ref()),
            species_cluster: na(metadata.species_cluster.as_ref()),
            taxonomy: na(taxonomy.map(|(_, lineage)| lineage)),
            taxonomy_source: na(taxonomy.map(|(source, _)| source)),
            host: na(host.map(|h| h.host_taxonomy.as_str())),
            amg_count: metadata.amgs.len().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxonomyRow {
    #[serde(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "vConTACT2")]
    pub vcontact2: String,
    #[serde(rename = "NCBI RefSeq")]
    pub refseq: String,
    #[serde(rename = "VOG")]
    pub vog: String,
    #[serde(rename = "Taxonomy")]
    pub taxonomy: String,
    #[serde(rename = "Source")]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostRow {
    #[serde(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "Level")]
    pub level: String,
    #[serde(rename = "Host genome")]
    pub host_genome: String,
    #[serde(rename = "Host taxonomy")]
    pub host_taxonomy: String,
    #[serde(rename = "Confidence score")]
    pub confidence: String,
    #[serde(rename = "Methods")]
    pub methods: String,
    #[serde(rename = "Database")]
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmgRow {
    #[serde(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "AMG number")]
    pub amg_count: usize,
    #[serde(rename = "AMG KOs")]
    pub kos: String,
    #[serde(rename = "AMG proteins")]
    pub proteins: String,
}

/// Protein annotation of a genome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationRow {
    #[serde(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "Scaffold")]
    pub scaffold: String,
    #[serde(rename = "Protein")]
    pub protein: String,
    #[serde(rename = "KO")]
    pub ko: String,
    #[serde(rename = "KO description")]
    pub ko_name: String,
    #[serde(rename = "AMG")]
    pub amg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmgProteinRow {
    #[serde(rename = "Protein")]
    pub protein: String,
    #[serde(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "Scaffold")]
    pub scaffold: String,
    #[serde(rename = "KO")]
    pub ko: String,
    #[serde(rename = "KO description")]
    pub ko_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterRow {
    #[serde(rename = "Cluster")]
    pub cluster: String,
    #[serde(rename = "Genome number")]
    pub genome_count: usize,
    #[serde(rename = "Genomes")]
    pub genomes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountRow {
    pub category: String,
    pub count: usize,
}

/// Files of the summary directory
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryManifest {
    pub virus_summary: PathBuf,
    pub taxonomy: PathBuf,
    pub host: PathBuf,
    pub amg: PathBuf,
    pub genus: PathBuf,
    pub species: PathBuf,
    pub raw_abundance: Option<PathBuf>,
    pub normalized_abundance: Option<PathBuf>,
    pub sample_reads: Option<PathBuf>,
    pub genome_files: PathBuf,
    pub annotation: PathBuf,
    pub amg_dir: PathBuf,
}
impl SummaryManifest {
    pub fn in_dir(dir: &Path, reads_available: bool) -> Self {
        let with_reads = |name: &str| if reads_available { Some(dir.join(name)) } else { None };
        Self {
            virus_summary: dir.join("Virus_summary_info.tsv"),
            taxonomy: dir.join("Tax_classification_result.tsv"),
            host: dir.join("Host_prediction_summary.tsv"),
            amg: dir.join("AMG_statistics.tsv"),
            genus: dir.join("Genus_cluster_info.tsv"),
            species: dir.join("Species_cluster_info.tsv"),
            raw_abundance: with_reads("Virus_raw_abundance.tsv"),
            normalized_abundance: with_reads("Virus_normalized_abundance.tsv"),
            sample_reads: with_reads("Sample2read_info.tsv"),
            genome_files: dir.join("Virus_genomes_files"),
            annotation: dir.join("Virus_annotation_results.tsv"),
            amg_dir: dir.join("AMG_results"),
        }
    }
}

pub fn summary_rows(store: &MetadataStore, precedence: &[TaxonomySource]) -> Vec<VirusSummaryRow> {
    store
        .iter()
        .map(|metadata| VirusSummaryRow::from_metadata(metadata, precedence))
        .collect()
}

pub fn taxonomy_rows(store: &MetadataStore, precedence: &[TaxonomySource]) -> Vec<TaxonomyRow> {
    store
        .iter()
        .map(|metadata| {
            let source = |s: TaxonomySource| na(metadata.taxonomy.get(&s));
            let reported = reconcile_taxonomy(&metadata.taxonomy, precedence);
            TaxonomyRow {
                genome: metadata.genome_id.clone(),
                vcontact2: source(TaxonomySource::Vcontact2),
                refseq: source(TaxonomySource::Refseq),
                vog: source(TaxonomySource::Vog),
                taxonomy: na(reported.map(|(_, lineage)| lineage)),
                source: na(reported.map(|(source, _)| source)),
            }
        })
        .collect()
}

/// One row per prediction, genomes without prediction get a placeholder row
pub fn host_rows(store: &MetadataStore) -> Vec<HostRow> {
    store
        .iter()
        .flat_map(|metadata| {
            if metadata.hosts.is_empty() {
                vec![HostRow {
                    genome: metadata.genome_id.clone(),
                    level: NOT_AVAILABLE.to_string(),
                    host_genome: NOT_AVAILABLE.to_string(),
                    host_taxonomy: NOT_AVAILABLE.to_string(),
                    confidence: NOT_AVAILABLE.to_string(),
                    methods: NOT_AVAILABLE.to_string(),
                    database: NOT_AVAILABLE.to_string(),
                }]
            } else {
                metadata
                    .hosts
                    .iter()
                    .map(|host| HostRow {
                        genome: metadata.genome_id.clone(),
                        level: host.level.to_string(),
                        host_genome: na(host.host_genome.as_ref()),
                        host_taxonomy: na_str(&host.host_taxonomy),
                        confidence: format!("{:.2}", host.confidence),
                        methods: na_str(&host.methods),
                        database: host.database.to_string(),
                    })
                    .collect()
            }
        })
        .collect()
}

pub fn amg_rows(store: &MetadataStore) -> Vec<AmgRow> {
    store
        .iter()
        .map(|metadata| AmgRow {
            genome: metadata.genome_id.clone(),
            amg_count: metadata.amgs.len(),
            kos: na_str(&metadata.amgs.iter().map(|a| a.ko.as_str()).unique().join(",")),
            proteins: na_str(&metadata.amgs.iter().map(|a| a.protein.as_str()).join(",")),
        })
        .collect()
}

/// Cluster membership rows from a per-genome cluster label
pub fn cluster_rows<F>(store: &MetadataStore, label: F) -> Vec<ClusterRow>
where
    F: Fn(&GenomeMetadata) -> Option<&String>,
{
    let mut clusters: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for metadata in store.iter() {
        if let Some(cluster) = label(metadata) {
            clusters.entry(cluster.as_str()).or_default().push(metadata.genome_id.as_str());
        }
    }
    clusters
        .into_iter()
        .map(|(cluster, genomes)| ClusterRow {
            cluster: cluster.to_string(),
            genome_count: genomes.len(),
            genomes: genomes.join(","),
        })
        .collect()
}

/// Genome x sample table with one value column per sample
fn write_abundance_table<F>(store: &MetadataStore, samples: &[String], path: &Path, value: F) -> Result<(), ViwrapError>
where
    F: Fn(&Abundance) -> f64,
{
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;

    let mut header = vec!["Genome".to_string()];
    header.extend(samples.iter().cloned());
    writer.write_record(&header)?;

    for metadata in store.iter() {
        let mut record = vec![metadata.genome_id.clone()];
        record.extend(samples.iter().map(|sample| {
            metadata
                .abundance
                .get(sample)
                .map(|a| format!("{:.4}", value(a)))
                .unwrap_or_else(|| NOT_AVAILABLE.to_string())
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Per-genome scaffold and protein files, bin members keep their scaffold names
pub fn write_genome_files(
    genomes: &GenomeMap,
    sequences: &HashMap<String, FastaRecord>,
    proteins: &[FastaRecord],
    dir: &Path,
) -> Result<(), ViwrapError> {
    create_dir_all(dir)?;

    let mut genome_proteins: HashMap<&str, Vec<FastaRecord>> = HashMap::new();
    for protein in proteins {
        if let Some(genome) = genomes.genome_of(protein_scaffold(&protein.id)) {
            genome_proteins.entry(genome.id.as_str()).or_default().push(protein.clone());
        }
    }

    for genome in genomes.iter() {
        let records = genome_member_records(genome, sequences)?;
        write_fasta(&records, &dir.join(format!("{}.fasta", genome.id)))?;
        let proteins = genome_proteins.remove(genome.id.as_str()).unwrap_or_default();
        write_fasta(&proteins, &dir.join(format!("{}.faa", genome.id)))?;
    }
    Ok(())
}

/// Annotations of the genome scaffolds in genome order
pub fn annotation_rows(genomes: &GenomeMap, annotations: &[AnnotationRecord]) -> Vec<AnnotationRow> {
    let mut rows: IndexMap<&str, Vec<AnnotationRow>> = genomes.ids().map(|id| (id.as_str(), Vec::new())).collect();
    for annotation in annotations {
        let Some(genome) = genomes.genome_of(&annotation.scaffold) else {
            continue;
        };
        if let Some(genome_rows) = rows.get_mut(genome.id.as_str()) {
            genome_rows.push(AnnotationRow {
                genome: genome.id.clone(),
                scaffold: annotation.scaffold.clone(),
                protein: annotation.protein.clone(),
                ko: na(annotation.ko.as_ref()),
                ko_name: na(annotation.ko_name.as_ref()),
                amg: if annotation.amg { "yes" } else { "no" }.to_string(),
            });
        }
    }
    rows.into_values().flatten().collect()
}

pub fn amg_protein_rows(annotation_rows: &[AnnotationRow]) -> Vec<AmgProteinRow> {
    annotation_rows
        .iter()
        .filter(|row| row.amg == "yes")
        .map(|row| AmgProteinRow {
            protein: row.protein.clone(),
            genome: row.genome.clone(),
            scaffold: row.scaffold.clone(),
            ko: row.ko.clone(),
            ko_name: row.ko_name.clone(),
        })
        .collect()
}

/// Protein annotation table and the AMG protein picks
pub fn write_annotation_results(
    genomes: &GenomeMap,
    annotations: &[AnnotationRecord],
    proteins: &[FastaRecord],
    manifest: &SummaryManifest,
) -> Result<(), ViwrapError> {
    let rows = annotation_rows(genomes, annotations);
    write_rows(
        &rows,
        &["Genome", "Scaffold", "Protein", "KO", "KO description", "AMG"],
        &manifest.annotation,
    )?;

    create_dir_all(&manifest.amg_dir)?;
    let amg_rows = amg_protein_rows(&rows);
    write_rows(
        &amg_rows,
        &["Protein", "Genome", "Scaffold", "KO", "KO description"],
        &manifest.amg_dir.join("AMG_protein_info.tsv"),
    )?;

    let amg_ids: HashMap<&str, usize> = amg_rows
        .iter()
        .enumerate()
        .map(|(i, row)| (row.protein.as_str(), i))
        .collect();
    let mut picked: Vec<&FastaRecord> = proteins.iter().filter(|p| amg_ids.contains_key(p.id.as_str())).collect();
    picked.sort_by_key(|p| amg_ids[p.id.as_str()]);
    let picked: Vec<FastaRecord> = picked.into_iter().cloned().collect();
    write_fasta(&picked, &manifest.amg_dir.join("AMG_proteins.faa"))?;

    log::info!("Wrote {} protein annotations, {} AMG proteins", rows.len(), picked.len());
    Ok(())
}

/// Serialized rows, or the bare header when there are none
fn write_rows<T: Serialize>(rows: &[T], header: &[&str], path: &Path) -> Result<(), ViwrapError> {
    if rows.is_empty() {
        write_header(header, path)
    } else {
        write_tsv(rows, path, true)
    }
}

/// Write every summary table, each genome appears exactly once per genome table
pub fn write_summary(
    store: &MetadataStore,
    precedence: &[TaxonomySource],
    sample_reads: Option<&[SampleReads]>,
    dir: &Path,
) -> Result<SummaryManifest, ViwrapError> {
    create_dir_all(dir)?;
    let manifest = SummaryManifest::in_dir(dir, sample_reads.is_some());

    write_tsv(&summary_rows(store, precedence), &manifest.virus_summary, true)?;
    write_tsv(&taxonomy_rows(store, precedence), &manifest.taxonomy, true)?;
    write_tsv(&host_rows(store), &manifest.host, true)?;
    write_tsv(&amg_rows(store), &manifest.amg, true)?;
    write_tsv(&cluster_rows(store, |m| m.genus_cluster.as_ref()), &manifest.genus, true)?;
    write_tsv(&cluster_rows(store, |m| m.species_cluster.as_ref()), &manifest.species, true)?;

    if store.is_empty() {
        write_empty_headers(&manifest)?;
    }

    if let (Some(reads), Some(raw), Some(normalized), Some(sample_path)) = (
        sample_reads,
        &manifest.raw_abundance,
        &manifest.normalized_abundance,
        &manifest.sample_reads,
    ) {
        let samples: Vec<String> = reads.iter().map(|r| r.sample.clone()).collect();
        write_abundance_table(store, &samples, raw, |a| a.raw)?;
        write_abundance_table(store, &samples, normalized, |a| a.normalized)?;
        write_tsv(reads, sample_path, true)?;
    }

    Ok(manifest)
}

/// serde writes no header without rows, tables of an empty run still carry one
fn write_empty_headers(manifest: &SummaryManifest) -> Result<(), ViwrapError> {
    write_header(
        &[
            "Genome", "Scaffold number", "Scaffolds", "Genome size (bp)", "Protein number", "Lifecycle",
            "CheckV quality", "MIUViG quality", "Completeness", "Completeness method", "Contamination",
            "Contamination flag", "Genus cluster", "Species cluster", "Taxonomy", "Taxonomy source", "Host",
            "AMG number",
        ],
        &manifest.virus_summary,
    )?;
    write_header(&["Genome", "vConTACT2", "NCBI RefSeq", "VOG", "Taxonomy", "Source"], &manifest.taxonomy)?;
    write_header(
        &["Genome", "Level", "Host genome", "Host taxonomy", "Confidence score", "Methods", "Database"],
        &manifest.host,
    )?;
    write_header(&["Genome", "AMG number", "AMG KOs", "AMG proteins"], &manifest.amg)?;
    write_header(&["Cluster", "Genome number", "Genomes"], &manifest.genus)?;
    write_header(&["Cluster", "Genome number", "Genomes"], &manifest.species)?;
    Ok(())
}

fn count_rows<I>(categories: I) -> Vec<CountRow>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for category in categories {
        *counts.entry(category).or_default() += 1;
    }
    counts.sort_by(|a, a_count, b, b_count| b_count.cmp(a_count).then_with(|| a.cmp(b)));
    counts
        .into_iter()
        .map(|(category, count)| CountRow { category, count })
        .collect()
}

/// Count tables consumed by the plotting program
pub fn write_visualization_inputs(
    store: &MetadataStore,
    precedence: &[TaxonomySource],
    dir: &Path,
) -> Result<Vec<PathBuf>, ViwrapError> {
    create_dir_all(dir)?;

    let lifecycle = count_rows(store.iter().map(|m| na(m.lifecycle)));
    let quality = count_rows(
        store
            .iter()
            .map(|m| na(m.quality.as_ref().map(|q| q.checkv_quality.as_str()).filter(|q| !q.is_empty()))),
    );
    let taxonomy = count_rows(
        store
            .iter()
            .map(|m| na(reconcile_taxonomy(&m.taxonomy, precedence).map(|(_, lineage)| lineage))),
    );
    let host = count_rows(store.iter().map(|m| {
        na(m.hosts
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
            .map(|h| host_genus(&h.host_taxonomy)))
    }));

    let tables = [
        ("Lifecycle_counts.tsv", lifecycle),
        ("CheckV_quality_counts.tsv", quality),
        ("Taxonomy_counts.tsv", taxonomy),
        ("Host_genus_counts.tsv", host),
    ];

    let mut paths = Vec::new();
    for (name, rows) in tables {
        let path = dir.join(name);
        write_rows(&rows, &["category", "count"], &path)?;
        paths.push(path);
    }
    Ok(paths)
}

pub fn print_table(rows: &[VirusSummaryRow]) {
    let mut table = Table::new(rows);

    table
        .modify(Columns::new(7..), Width::wrap(32).keep_words())
        .with(Style::modern());

    eprintln!("{}", table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::LifecycleState;
    use crate::metadata::{AmgHit, MetadataValue};
    use crate::tool::Stage;
    use tempfile::tempdir;

    fn store(ids: &[&str]) -> MetadataStore {
        let scaffolds: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        MetadataStore::new(&GenomeMap::singletons(&scaffolds).unwrap())
    }

    #[test]
    fn every_genome_has_one_summary_row() -> Result<(), ViwrapError> {
        let mut store = store(&["s1", "s2"]);
        store.merge("s1", MetadataValue::Lifecycle(LifecycleState::Lysogenic), Stage::Bin);
        store.merge("s1", MetadataValue::Taxonomy(TaxonomySource::Vog, "Caudoviricetes".into()), Stage::ClassifyTaxonomy);
        store.merge("s1", MetadataValue::Amg(AmgHit { protein: "s1_3".into(), ko: "K00001".into() }), Stage::Summarize);

        let rows = summary_rows(&store, &TaxonomySource::default_precedence());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].lifecycle, "lysogenic");
        assert_eq!(rows[0].taxonomy, "Caudoviricetes");
        assert_eq!(rows[0].taxonomy_source, "vog");
        assert_eq!(rows[0].amg_count, "1");
        assert_eq!(rows[1].lifecycle, NOT_AVAILABLE);
        assert_eq!(rows[1].checkv_quality, NOT_AVAILABLE);
        assert_eq!(rows[1].host, NOT_AVAILABLE);

        let hosts = host_rows(&store);
        assert_eq!(hosts.len(), 2);
        assert!(hosts.iter().all(|h| h.host_taxonomy == NOT_AVAILABLE));
        Ok(())
    }

    #[test]
    fn empty_store_writes_header_only_tables() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let manifest = write_summary(&store(&[]), &TaxonomySource::default_precedence(), None, dir.path())?;

        let content = std::fs::read_to_string(&manifest.virus_summary)?;
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("Genome\t"));
        assert!(manifest.raw_abundance.is_none());
        Ok(())
    }

    #[test]
    fn abundance_tables_have_sample_columns() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let mut store = store(&["s1", "s2"]);
        store.merge("s1", MetadataValue::Abundance("lake".into(), Abundance { raw: 2.0, normalized: 4.0 }), Stage::Map);

        let reads = vec![
            SampleReads { sample: "lake".into(), reads: 50_000_000 },
            SampleReads { sample: "river".into(), reads: 10 },
        ];
        let manifest = write_summary(&store, &TaxonomySource::default_precedence(), Some(&reads), dir.path())?;

        let raw = std::fs::read_to_string(manifest.raw_abundance.unwrap())?;
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines[0], "Genome\tlake\triver");
        assert_eq!(lines[1], "s1\t2.0000\tNA");
        assert_eq!(lines[2], "s2\tNA\tNA");
        Ok(())
    }

    fn annotation(protein: &str, scaffold: &str, ko: Option<&str>, amg: bool) -> AnnotationRecord {
        AnnotationRecord {
            protein: protein.into(),
            scaffold: scaffold.into(),
            ko: ko.map(String::from),
            amg,
            ko_name: ko.map(|ko| format!("{ko} description")),
        }
    }

    #[test]
    fn annotations_follow_genome_order_and_pick_amgs() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let order: Vec<String> = ["s1", "s2", "s3"].iter().map(|s| s.to_string()).collect();
        let bins: IndexMap<String, Vec<String>> = [("vRhyme_bin_1".to_string(), vec!["s1".to_string(), "s3".to_string()])]
            .into_iter()
            .collect();
        let genomes = GenomeMap::from_bins(&order, &bins)?;
        let annotations = vec![
            annotation("s2_1", "s2", None, false),
            annotation("s3_1", "s3", Some("K00558"), true),
            annotation("s1_1", "s1", Some("K01000"), false),
            annotation("s9_1", "s9", Some("K00001"), true),
        ];
        let proteins = vec![
            FastaRecord::new("s1_1", b"MKV"),
            FastaRecord::new("s2_1", b"MKL"),
            FastaRecord::new("s3_1", b"MRA"),
        ];

        let rows = annotation_rows(&genomes, &annotations);
        let order: Vec<(&str, &str)> = rows.iter().map(|r| (r.genome.as_str(), r.protein.as_str())).collect();
        assert_eq!(order, vec![("vRhyme_bin_1", "s3_1"), ("vRhyme_bin_1", "s1_1"), ("s2", "s2_1")]);
        assert_eq!(rows[2].ko, NOT_AVAILABLE);
        assert_eq!(rows[2].ko_name, NOT_AVAILABLE);

        let manifest = SummaryManifest::in_dir(dir.path(), false);
        write_annotation_results(&genomes, &annotations, &proteins, &manifest)?;
        let info = std::fs::read_to_string(manifest.amg_dir.join("AMG_protein_info.tsv"))?;
        assert_eq!(
            info,
            "Protein\tGenome\tScaffold\tKO\tKO description\ns3_1\tvRhyme_bin_1\ts3\tK00558\tK00558 description\n"
        );
        assert_eq!(std::fs::read_to_string(manifest.amg_dir.join("AMG_proteins.faa"))?, ">s3_1\nMRA\n");

        write_genome_files(&genomes, &HashMap::from([
            ("s1".to_string(), FastaRecord::new("s1", b"ACGT")),
            ("s2".to_string(), FastaRecord::new("s2", b"GGCC")),
            ("s3".to_string(), FastaRecord::new("s3", b"TTAA")),
        ]), &proteins, &manifest.genome_files)?;
        let bin_proteins = std::fs::read_to_string(manifest.genome_files.join("vRhyme_bin_1.faa"))?;
        assert_eq!(bin_proteins, ">s1_1\nMKV\n>s3_1\nMRA\n");
        Ok(())
    }

    #[test]
    fn annotation_tables_without_rows_keep_headers() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let manifest = SummaryManifest::in_dir(dir.path(), false);
        write_annotation_results(&GenomeMap::default(), &[], &[], &manifest)?;

        let content = std::fs::read_to_string(&manifest.annotation)?;
        assert_eq!(content, "Genome\tScaffold\tProtein\tKO\tKO description\tAMG\n");
        assert!(manifest.amg_dir.join("AMG_proteins.faa").exists());
        Ok(())
    }

    #[test]
    fn cluster_rows_group_genomes() {
        let mut store = store(&["s1", "s2", "s3"]);
        store.merge("s1", MetadataValue::GenusCluster("VC_1_0".into()), Stage::ClusterGenus);
        store.merge("s2", MetadataValue::GenusCluster("Singleton_genus_1".into()), Stage::ClusterGenus);
        store.merge("s3", MetadataValue::GenusCluster("VC_1_0".into()), Stage::ClusterGenus);

        let rows = cluster_rows(&store, |m| m.genus_cluster.as_ref());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].genomes, "s1,s3");
        assert_eq!(rows[0].genome_count, 2);
    }

    #[test]
    fn visualization_counts_are_sorted() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let mut store = store(&["s1", "s2", "s3"]);
        store.merge("s1", MetadataValue::Lifecycle(LifecycleState::Lytic), Stage::Bin);
        store.merge("s2", MetadataValue::Lifecycle(LifecycleState::Lytic), Stage::Bin);
        store.merge("s3", MetadataValue::Lifecycle(LifecycleState::Lysogenic), Stage::Bin);

        let paths = write_visualization_inputs(&store, &TaxonomySource::default_precedence(), dir.path())?;
        let lifecycle = std::fs::read_to_string(&paths[0])?;
        assert_eq!(lifecycle, "category\tcount\nlytic\t2\nlysogenic\t1\n");
        Ok(())
    }
}
