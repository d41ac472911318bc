//! Genome taxonomy from three independent sources.
//!
//! Each source assigns lineages to proteins or reference genomes; a genome
//! takes the plurality lineage of its hits per source. The reported lineage
//! follows a configurable source precedence.

use std::collections::{HashMap, HashSet};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::annotation::{best_hits, protein_scaffold, read_hmmsearch_tblout, KO_EVALUE_CUTOFF};
use crate::cluster::GenomeOverview;
use crate::config::DatabaseConfig;
use crate::error::ViwrapError;
use crate::genome::GenomeMap;
use crate::tool::{Stage, Tool, ToolInvocation, ToolRunner};
use crate::utils::{read_table, read_tsv, FastaRecord};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TaxonomySource {
    /// IMG/VR reference genomes sharing a vConTACT2 subcluster
    Vcontact2,
    /// NCBI RefSeq viral proteins
    Refseq,
    /// VOG marker profiles
    Vog,
}
impl TaxonomySource {
    pub fn default_precedence() -> Vec<TaxonomySource> {
        vec![TaxonomySource::Vcontact2, TaxonomySource::Refseq, TaxonomySource::Vog]
    }
}
impl std::str::FromStr for TaxonomySource {
    type Err = ViwrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vcontact2" => Ok(Self::Vcontact2),
            "refseq" => Ok(Self::Refseq),
            "vog" => Ok(Self::Vog),
            _ => Err(ViwrapError::TaxonomySource(s.to_string())),
        }
    }
}
impl std::fmt::Display for TaxonomySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaxonomySource::Vcontact2 => write!(f, "vcontact2"),
            TaxonomySource::Refseq => write!(f, "refseq"),
            TaxonomySource::Vog => write!(f, "vog"),
        }
    }
}

/// Most frequent lineage, ties resolve to the lexicographically smallest
pub fn plurality_vote<'a, I>(lineages: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for lineage in lineages.into_iter().filter(|l| !l.trim().is_empty()) {
        *counts.entry(lineage).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, a_count), (b, b_count)| a_count.cmp(b_count).then_with(|| b.cmp(a)))
        .map(|(lineage, _)| lineage.to_string())
}

/// First source in precedence order with an assignment
pub fn reconcile_taxonomy<'a>(
    assignments: &'a IndexMap<TaxonomySource, String>,
    precedence: &[TaxonomySource],
) -> Option<(TaxonomySource, &'a str)> {
    precedence
        .iter()
        .find_map(|source| assignments.get(source).map(|lineage| (*source, lineage.as_str())))
}

/// Two column `key<TAB>lineage` lookup table without header
fn read_lineage_table(path: &Path) -> Result<HashMap<String, String>, ViwrapError> {
    if !path.exists() {
        log::warn!("Lineage table not found: {}", path.display());
        return Ok(HashMap::new());
    }
    let rows: Vec<Vec<String>> = read_table(path, b'\t', false)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row.as_slice() {
            [key, lineage, ..] if !key.is_empty() && !key.starts_with('#') => {
                Some((key.clone(), lineage.trim().to_string()))
            }
            _ => None,
        })
        .collect())
}

/// Row of the IMG/VR reference taxonomy table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgvrTaxonomy {
    #[serde(rename = "UViG")]
    pub genome: String,
    #[serde(rename = "Taxonomic classification")]
    pub lineage: String,
}

/// Per-genome lineage from the proteins with a lineage hit
fn vote_by_genome(protein_lineages: &[(String, String)], genomes: &GenomeMap) -> IndexMap<String, String> {
    let mut per_genome: HashMap<&str, Vec<&str>> = HashMap::new();
    for (protein, lineage) in protein_lineages {
        if let Some(genome) = genomes.genome_of(protein_scaffold(protein)) {
            per_genome.entry(genome.id.as_str()).or_default().push(lineage.as_str());
        }
    }

    genomes
        .ids()
        .filter_map(|id| {
            per_genome
                .get(id.as_str())
                .and_then(|lineages| plurality_vote(lineages.iter().copied()))
                .map(|lineage| (id.clone(), lineage))
        })
        .collect()
}

/// vConTACT2 source: reference genomes in the same viral subcluster
pub fn vcontact2_taxonomy(
    overview: &[GenomeOverview],
    reference_taxonomy: &[ImgvrTaxonomy],
    genomes: &GenomeMap,
) -> IndexMap<String, String> {
    let references: HashMap<&str, &str> = reference_taxonomy
        .iter()
        .map(|r| (r.genome.as_str(), r.lineage.as_str()))
        .collect();

    let mut subcluster_lineages: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in overview {
        if let (Some(subcluster), Some(lineage)) = (row.subcluster(), references.get(row.genome.as_str())) {
            subcluster_lineages.entry(subcluster).or_default().push(*lineage);
        }
    }

    let subclusters: HashMap<&str, &str> = overview
        .iter()
        .filter_map(|row| row.subcluster().map(|sc| (row.genome.as_str(), sc)))
        .collect();

    genomes
        .ids()
        .filter_map(|id| {
            subclusters
                .get(id.as_str())
                .and_then(|sc| subcluster_lineages.get(sc))
                .and_then(|lineages| plurality_vote(lineages.iter().copied()))
                .map(|lineage| (id.clone(), lineage))
        })
        .collect()
}

/// Best diamond hit per query from BLAST tabular output
fn read_diamond_hits(path: &Path) -> Result<Vec<(String, String)>, ViwrapError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let rows: Vec<Vec<String>> = read_table(path, b'\t', false)?;

    let mut seen = HashSet::new();
    let mut hits = Vec::new();
    for row in rows {
        let [query, target, ..] = row.as_slice() else {
            return Err(ViwrapError::LineParse(path.to_path_buf(), row.join("\t")));
        };
        if seen.insert(query.clone()) {
            hits.push((query.clone(), target.clone()));
        }
    }
    Ok(hits)
}

/// Protein -> reference hit pairs mapped through a lineage table
fn hits_to_lineages(hits: Vec<(String, String)>, lineages: &HashMap<String, String>) -> Vec<(String, String)> {
    hits.into_iter()
        .filter_map(|(protein, reference)| lineages.get(&reference).map(|l| (protein, l.clone())))
        .collect()
}

/// Per-source genome lineages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaxonomyAssignments {
    pub sources: IndexMap<TaxonomySource, IndexMap<String, String>>,
}
impl TaxonomyAssignments {
    pub fn for_genome(&self, genome: &str) -> IndexMap<TaxonomySource, String> {
        self.sources
            .iter()
            .filter_map(|(source, lineages)| lineages.get(genome).map(|l| (*source, l.clone())))
            .collect()
    }
}

/// Runs the protein based taxonomy sources
pub fn classify_proteins<R: ToolRunner>(
    runner: &R,
    proteins: &Path,
    protein_records: &[FastaRecord],
    genomes: &GenomeMap,
    databases: &DatabaseConfig,
    outdir: &Path,
    threads: usize,
) -> Result<TaxonomyAssignments, ViwrapError> {
    create_dir_all(outdir)?;
    let mut assignments = TaxonomyAssignments::default();

    if protein_records.is_empty() {
        log::warn!("No viral proteins available for taxonomic classification");
        return Ok(assignments);
    }

    let diamond_hits: PathBuf = outdir.join("NCBI_RefSeq_viral.diamond.tsv");
    runner.invoke(
        &ToolInvocation::new(Tool::Diamond, Stage::ClassifyTaxonomy, outdir)
            .arg("blastp")
            .arg("-q")
            .arg_path(proteins)
            .arg("-d")
            .arg_path(&databases.refseq_diamond())
            .arg("-o")
            .arg_path(&diamond_hits)
            .arg("--outfmt")
            .arg("6")
            .arg("-k")
            .arg("1")
            .arg("-e")
            .arg(KO_EVALUE_CUTOFF)
            .arg("-p")
            .arg(threads)
            .output_allow_empty(&diamond_hits),
    )?;
    let refseq_lineages = read_lineage_table(&databases.refseq_protein_taxonomy())?;
    let refseq = hits_to_lineages(read_diamond_hits(&diamond_hits)?, &refseq_lineages);
    assignments
        .sources
        .insert(TaxonomySource::Refseq, vote_by_genome(&refseq, genomes));

    let vog_hits: PathBuf = outdir.join("VOG_marker.tblout");
    runner.invoke(
        &ToolInvocation::new(Tool::Hmmsearch, Stage::ClassifyTaxonomy, outdir)
            .arg("--tblout")
            .arg_path(&vog_hits)
            .arg("--noali")
            .arg("-E")
            .arg(KO_EVALUE_CUTOFF)
            .arg("--cpu")
            .arg(threads)
            .arg_path(&databases.vog_markers())
            .arg_path(proteins)
            .output_allow_empty(&vog_hits),
    )?;
    let vog_lineages = read_lineage_table(&databases.vog_marker_table())?;
    let vog: Vec<(String, String)> = best_hits(read_hmmsearch_tblout(&vog_hits)?, KO_EVALUE_CUTOFF)
        .into_iter()
        .map(|(protein, hit)| (protein, hit.query))
        .collect();
    let vog = hits_to_lineages(vog, &vog_lineages);
    assignments
        .sources
        .insert(TaxonomySource::Vog, vote_by_genome(&vog, genomes));

    Ok(assignments)
}

pub fn read_imgvr_taxonomy(path: &Path) -> Result<Vec<ImgvrTaxonomy>, ViwrapError> {
    if path.exists() {
        read_tsv(path, true)
    } else {
        log::warn!("IMG/VR reference taxonomy not found: {}", path.display());
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_table_skips_comments_and_short_rows() -> Result<(), ViwrapError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("refseq_lineages.tsv");
        std::fs::write(
            &path,
            "#accession\tlineage\nYP_009\tViruses;Caudoviricetes \norphan\nYP_010\tViruses;Tectiliviricetes\textra\n",
        )?;
        let table = read_lineage_table(&path)?;

        assert_eq!(table.len(), 2);
        assert_eq!(table["YP_009"], "Viruses;Caudoviricetes");
        assert_eq!(table["YP_010"], "Viruses;Tectiliviricetes");
        assert!(read_lineage_table(&dir.path().join("missing.tsv"))?.is_empty());
        Ok(())
    }

    #[test]
    fn diamond_hits_keep_first_hit_per_query() -> Result<(), ViwrapError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("diamond.tsv");
        std::fs::write(
            &path,
            "s1_1\tYP_009\t98.1\t120\t2\t0\t1\t120\t1\t120\t1e-50\t230\n\
             s1_1\tYP_010\t60.0\t120\t2\t0\t1\t120\t1\t120\t1e-20\t90\n\
             s2_3\tYP_010\t75.5\t88\t2\t0\t1\t88\t1\t88\t1e-30\t150\n",
        )?;
        let hits = read_diamond_hits(&path)?;
        assert_eq!(
            hits,
            vec![("s1_1".to_string(), "YP_009".to_string()), ("s2_3".to_string(), "YP_010".to_string())]
        );

        std::fs::write(&path, "s1_1\n")?;
        assert!(matches!(read_diamond_hits(&path), Err(ViwrapError::LineParse(..))));
        Ok(())
    }

    #[test]
    fn plurality_vote_breaks_ties_lexicographically() {
        assert_eq!(
            plurality_vote(["b;x", "a;y", "b;x"]),
            Some("b;x".to_string())
        );
        assert_eq!(plurality_vote(["c;z", "a;y"]), Some("a;y".to_string()));
        assert_eq!(plurality_vote(Vec::<&str>::new()), None);
        assert_eq!(plurality_vote([""]), None);
    }

    #[test]
    fn precedence_selects_first_available_source() {
        let mut assignments = IndexMap::new();
        assignments.insert(TaxonomySource::Vog, "Caudoviricetes".to_string());
        assignments.insert(TaxonomySource::Refseq, "Caudoviricetes;Siphoviridae".to_string());

        let (source, lineage) =
            reconcile_taxonomy(&assignments, &TaxonomySource::default_precedence()).unwrap();
        assert_eq!(source, TaxonomySource::Refseq);
        assert_eq!(lineage, "Caudoviricetes;Siphoviridae");

        let (source, _) = reconcile_taxonomy(&assignments, &[TaxonomySource::Vog, TaxonomySource::Refseq]).unwrap();
        assert_eq!(source, TaxonomySource::Vog);
        assert!(reconcile_taxonomy(&IndexMap::new(), &TaxonomySource::default_precedence()).is_none());
    }

    #[test]
    fn protein_votes_resolve_through_genomes() {
        let scaffolds = vec!["s1".to_string(), "s2".to_string()];
        let genomes = GenomeMap::singletons(&scaffolds).unwrap();
        let hits = vec![
            ("s1_1".to_string(), "A".to_string()),
            ("s1_2".to_string(), "B".to_string()),
            ("s1_3".to_string(), "B".to_string()),
            ("s9_1".to_string(), "C".to_string()),
        ];
        let votes = vote_by_genome(&hits, &genomes);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes["s1"], "B");
    }

    #[test]
    fn vcontact2_source_uses_reference_subclusters() {
        let genomes = GenomeMap::singletons(&["s1".to_string(), "s2".to_string()]).unwrap();
        let overview = vec![
            GenomeOverview::new("s1", "Clustered", "VC_3_0"),
            GenomeOverview::new("IMGVR_UViG_1", "Clustered", "VC_3_0"),
            GenomeOverview::new("s2", "Singleton", ""),
        ];
        let references = vec![ImgvrTaxonomy {
            genome: "IMGVR_UViG_1".to_string(),
            lineage: "r__Duplodnaviria;c__Caudoviricetes".to_string(),
        }];

        let lineages = vcontact2_taxonomy(&overview, &references, &genomes);
        assert_eq!(lineages.len(), 1);
        assert_eq!(lineages["s1"], "r__Duplodnaviria;c__Caudoviricetes");
    }
}
