use std::collections::{HashMap, HashSet};
use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ViwrapError;
use crate::genome::LifecycleState;
use crate::utils::{read_tsv, FastaRecord};

/// Best hit E-value cutoff for KEGG profile annotation
pub const KO_EVALUE_CUTOFF: f64 = 1e-5;

/// Row of the VIBRANT annotation table, other columns are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibrantAnnotation {
    pub protein: String,
    pub scaffold: String,
    #[serde(rename = "KO")]
    pub ko: Option<String>,
    #[serde(rename = "AMG")]
    pub amg: Option<String>,
    #[serde(rename = "KO name", default)]
    pub ko_name: Option<String>,
}

/// Row of the VIBRANT genome quality table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibrantQuality {
    pub scaffold: String,
    #[serde(rename = "type")]
    pub lifecycle: String,
    #[serde(rename = "Quality")]
    pub quality: Option<String>,
}

/// Protein level annotation of the final viral call set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub protein: String,
    pub scaffold: String,
    #[serde(rename = "KO")]
    pub ko: Option<String>,
    #[serde(rename = "AMG")]
    pub amg: bool,
    #[serde(rename = "KO name", default)]
    pub ko_name: Option<String>,
}
impl AnnotationRecord {
    pub fn from_vibrant(annotation: &VibrantAnnotation) -> Self {
        Self {
            protein: annotation.protein.clone(),
            scaffold: annotation.scaffold.clone(),
            ko: annotation.ko.clone().filter(|ko| !ko.is_empty()),
            amg: annotation
                .amg
                .as_deref()
                .map(|amg| amg.eq_ignore_ascii_case("AMG"))
                .unwrap_or(false),
            ko_name: annotation.ko_name.clone().filter(|name| !name.is_empty()),
        }
    }
}

/// Scaffold lifecycle call persisted by the identification stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub scaffold: String,
    pub lifecycle: LifecycleState,
}

pub fn read_vibrant_annotations(path: &Path) -> Result<Vec<AnnotationRecord>, ViwrapError> {
    let annotations: Vec<VibrantAnnotation> = read_tsv(path, true)?;
    Ok(annotations.iter().map(AnnotationRecord::from_vibrant).collect())
}

pub fn read_vibrant_lifecycle(path: &Path) -> Result<Vec<LifecycleRecord>, ViwrapError> {
    let quality: Vec<VibrantQuality> = read_tsv(path, true)?;
    quality
        .into_iter()
        .map(|row| {
            Ok(LifecycleRecord {
                lifecycle: row.lifecycle.parse()?,
                scaffold: row.scaffold,
            })
        })
        .collect()
}

pub fn lifecycle_map(records: &[LifecycleRecord]) -> HashMap<String, LifecycleState> {
    records
        .iter()
        .map(|r| (r.scaffold.clone(), r.lifecycle))
        .collect()
}

/// Scaffold of a predicted protein named `<scaffold>_<gene>`
pub fn protein_scaffold(protein: &str) -> &str {
    match protein.rsplit_once('_') {
        Some((scaffold, gene)) if !gene.is_empty() && gene.chars().all(|c| c.is_ascii_digit()) => scaffold,
        _ => protein,
    }
}

/// A row of an HMMER `--tblout` table
#[derive(Debug, Clone, PartialEq)]
pub struct HmmHit {
    pub target: String,
    pub query: String,
    pub evalue: f64,
    pub score: f64,
}

pub fn read_hmmsearch_tblout(path: &Path) -> Result<Vec<HmmHit>, ViwrapError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;

    let mut hits = Vec::new();
    for line in content.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(ViwrapError::LineParse(path.to_path_buf(), line.to_string()));
        }
        hits.push(HmmHit {
            target: fields[0].to_string(),
            query: fields[2].to_string(),
            evalue: fields[4].parse()?,
            score: fields[5].parse()?,
        });
    }
    Ok(hits)
}

/// Best hit per target below the E-value cutoff, lowest E-value then highest score
pub fn best_hits(hits: Vec<HmmHit>, max_evalue: f64) -> IndexMap<String, HmmHit> {
    let mut best: IndexMap<String, HmmHit> = IndexMap::new();
    for hit in hits.into_iter().filter(|h| h.evalue <= max_evalue) {
        match best.get(&hit.target) {
            Some(current)
                if current.evalue < hit.evalue
                    || (current.evalue == hit.evalue && current.score >= hit.score) => {}
            _ => {
                best.insert(hit.target.clone(), hit);
            }
        }
    }
    best
}

/// KEGG orthologs listed in the VIBRANT AMG table
pub fn read_amg_list(path: &Path) -> Result<HashSet<String>, ViwrapError> {
    let ko = Regex::new(r"^K\d{5}$")?;
    if !path.exists() {
        log::warn!("AMG list not found: {}", path.display());
        return Ok(HashSet::new());
    }
    Ok(std::fs::read_to_string(path)?
        .lines()
        .filter_map(|line| line.split('\t').next())
        .map(str::trim)
        .filter(|token| ko.is_match(token))
        .map(String::from)
        .collect())
}

/// Annotate predicted proteins with their best KEGG profile hit
pub fn annotate_proteins(
    proteins: &[FastaRecord],
    hits: &IndexMap<String, HmmHit>,
    amg_kos: &HashSet<String>,
) -> Vec<AnnotationRecord> {
    proteins
        .iter()
        .map(|protein| {
            let ko = hits.get(&protein.id).map(|hit| hit.query.clone());
            let amg = ko.as_ref().map(|ko| amg_kos.contains(ko)).unwrap_or(false);
            AnnotationRecord {
                protein: protein.id.clone(),
                scaffold: protein_scaffold(&protein.id).to_string(),
                ko,
                amg,
                ko_name: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn protein_scaffold_strips_gene_index() {
        assert_eq!(protein_scaffold("scaffold_12_3"), "scaffold_12");
        assert_eq!(protein_scaffold("k141_9_fragment_1_22"), "k141_9_fragment_1");
        assert_eq!(protein_scaffold("orphan"), "orphan");
    }

    #[test]
    fn tblout_best_hit_per_protein() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let path = dir.path().join("hits.tbl");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "# target name accession query name accession E-value score bias")?;
        writeln!(file, "scaffold_1_1 - K00001 - 1e-30 100.2 0.1")?;
        writeln!(file, "scaffold_1_1 - K00002 - 1e-50 150.0 0.1")?;
        writeln!(file, "scaffold_1_2 - K00003 - 0.01 12.0 0.1")?;

        let hits = best_hits(read_hmmsearch_tblout(&path)?, KO_EVALUE_CUTOFF);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits["scaffold_1_1"].query, "K00002");
        Ok(())
    }

    #[test]
    fn annotate_marks_amg_kos() {
        let proteins = vec![
            FastaRecord::new("scaffold_1_1", b"MK"),
            FastaRecord::new("scaffold_1_2", b"MK"),
        ];
        let mut hits = IndexMap::new();
        hits.insert(
            "scaffold_1_1".to_string(),
            HmmHit { target: "scaffold_1_1".into(), query: "K00123".into(), evalue: 1e-20, score: 80.0 },
        );
        let amg: HashSet<String> = ["K00123".to_string()].into_iter().collect();

        let records = annotate_proteins(&proteins, &hits, &amg);
        assert_eq!(records.len(), 2);
        assert!(records[0].amg);
        assert_eq!(records[0].scaffold, "scaffold_1");
        assert_eq!(records[1].ko, None);
        assert!(!records[1].amg);
    }

    #[test]
    fn vibrant_annotation_conversion() {
        let row = VibrantAnnotation {
            protein: "scaffold_2_4".into(),
            scaffold: "scaffold_2".into(),
            ko: Some(String::new()),
            amg: Some("AMG".into()),
            ko_name: Some("glutamine amidotransferase".into()),
        };
        let record = AnnotationRecord::from_vibrant(&row);
        assert_eq!(record.ko, None);
        assert!(record.amg);
        assert_eq!(record.ko_name.as_deref(), Some("glutamine amidotransferase"));
    }

    #[test]
    fn vibrant_annotations_read_ko_names() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let path = dir.path().join("VIBRANT_annotations_assembly.tsv");
        std::fs::write(
            &path,
            "protein\tscaffold\tKO\tAMG\tKO name\tKO evalue\n\
             scaffold_1_1\tscaffold_1\tK00558\tAMG\tDNA (cytosine-5)-methyltransferase 1\t1e-30\n\
             scaffold_1_2\tscaffold_1\t\t\t\t\n",
        )?;
        let records = read_vibrant_annotations(&path)?;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ko_name.as_deref(), Some("DNA (cytosine-5)-methyltransferase 1"));
        assert!(records[0].amg);
        assert_eq!(records[1].ko, None);
        assert_eq!(records[1].ko_name, None);
        Ok(())
    }
}
