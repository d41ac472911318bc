use std::collections::HashMap;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::annotation::protein_scaffold;
use crate::error::ViwrapError;
use crate::genome::GenomeMap;
use crate::tool::{Stage, Tool, ToolInvocation, ToolRunner};
use crate::utils::{get_file_component, read_table, FastaRecord, FileComponent};

pub const GENOME_OVERVIEW: &str = "genome_by_genome_overview.csv";

/// Row of the vConTACT2 protein -> genome map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinGenomeRow {
    pub protein_id: String,
    pub contig_id: String,
    pub keywords: String,
}

/// Row of the vConTACT2 genome overview, other columns are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeOverview {
    #[serde(rename = "Genome")]
    pub genome: String,
    #[serde(rename = "VC Status")]
    pub status: String,
    #[serde(rename = "VC Subcluster")]
    pub subcluster: Option<String>,
}
impl GenomeOverview {
    pub fn new(genome: &str, status: &str, subcluster: &str) -> Self {
        Self {
            genome: genome.to_string(),
            status: status.to_string(),
            subcluster: Some(subcluster.to_string()).filter(|s| !s.is_empty()),
        }
    }
    /// Viral subcluster of a clustered genome
    pub fn subcluster(&self) -> Option<&str> {
        match (&self.status[..], &self.subcluster) {
            ("Clustered", Some(subcluster)) if !subcluster.is_empty() => Some(subcluster.as_str()),
            _ => None,
        }
    }
}

/// Row of dRep `data_tables/Cdb.csv`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrepCluster {
    pub genome: String,
    pub secondary_cluster: String,
}

/// Protein -> genome rows for the viral proteins of known genomes
pub fn protein_genome_map(proteins: &[FastaRecord], genomes: &GenomeMap) -> Vec<ProteinGenomeRow> {
    proteins
        .iter()
        .filter_map(|protein| {
            genomes
                .genome_of(protein_scaffold(&protein.id))
                .map(|genome| ProteinGenomeRow {
                    protein_id: protein.id.clone(),
                    contig_id: genome.id.clone(),
                    keywords: "None".to_string(),
                })
        })
        .collect()
}

pub fn read_genome_overview(path: &Path) -> Result<Vec<GenomeOverview>, ViwrapError> {
    if path.exists() {
        read_table(path, b',', true)
    } else {
        Ok(Vec::new())
    }
}

/// Genus cluster per genome, unclustered genomes become singleton genera
pub fn assign_genus_clusters(genomes: &GenomeMap, overview: &[GenomeOverview]) -> IndexMap<String, String> {
    let subclusters: HashMap<&str, &str> = overview
        .iter()
        .filter_map(|row| row.subcluster().map(|sc| (row.genome.as_str(), sc)))
        .collect();

    let mut singleton = 0;
    genomes
        .ids()
        .map(|id| {
            let cluster = match subclusters.get(id.as_str()) {
                Some(subcluster) => subcluster.to_string(),
                None => {
                    singleton += 1;
                    format!("Singleton_genus_{singleton}")
                }
            };
            (id.clone(), cluster)
        })
        .collect()
}

/// Sequential species labels in genome order
///
/// Genomes of the same genus sharing a dRep secondary cluster share a
/// species, every other genome is its own species.
pub fn assign_species_clusters(
    genus: &IndexMap<String, String>,
    secondary: &HashMap<String, String>,
) -> IndexMap<String, String> {
    let mut labels: HashMap<(String, String), String> = HashMap::new();
    let mut species = IndexMap::new();

    for (genome, genus_cluster) in genus {
        let key = match secondary.get(genome) {
            Some(cluster) => (genus_cluster.clone(), cluster.clone()),
            None => (genome.clone(), String::new()),
        };
        let next = labels.len() + 1;
        let label = labels
            .entry(key)
            .or_insert_with(|| format!("Species_{next}"))
            .clone();
        species.insert(genome.clone(), label);
    }
    species
}

/// Genus clusters holding at least two genomes, in first appearance order
pub fn multi_genome_genera(genus: &IndexMap<String, String>) -> IndexMap<String, Vec<String>> {
    let mut members: IndexMap<String, Vec<String>> = IndexMap::new();
    for (genome, cluster) in genus {
        members.entry(cluster.clone()).or_default().push(genome.clone());
    }
    members.retain(|_, genomes| genomes.len() >= 2);
    members
}

pub fn run_vcontact2<R: ToolRunner>(
    runner: &R,
    proteins: &Path,
    protein_map: &Path,
    outdir: &Path,
    cluster_one: &Path,
    threads: usize,
) -> Result<PathBuf, ViwrapError> {
    let overview = outdir.join(GENOME_OVERVIEW);
    let invocation = ToolInvocation::new(Tool::VContact2, Stage::ClusterGenus, outdir)
        .arg("--raw-proteins")
        .arg_path(proteins)
        .arg("--rel-mode")
        .arg("Diamond")
        .arg("--proteins-fp")
        .arg_path(protein_map)
        .arg("--db")
        .arg("None")
        .arg("--pcs-mode")
        .arg("MCL")
        .arg("--vcs-mode")
        .arg("ClusterONE")
        .arg("--c1-bin")
        .arg_path(cluster_one)
        .arg("--output-dir")
        .arg_path(outdir)
        .arg("--threads")
        .arg(threads)
        .output_allow_empty(&overview);
    runner.invoke(&invocation)?;
    Ok(overview)
}

/// Dereplicate the genomes of one genus cluster, returns genome -> secondary cluster
pub fn run_drep<R: ToolRunner>(
    runner: &R,
    genome_files: &[PathBuf],
    outdir: &Path,
    threads: usize,
) -> Result<HashMap<String, String>, ViwrapError> {
    create_dir_all(outdir)?;
    let list = outdir.join("genome_list.txt");
    std::fs::write(
        &list,
        genome_files
            .iter()
            .map(|p| format!("{}\n", p.display()))
            .collect::<String>(),
    )?;

    let cdb = outdir.join("data_tables").join("Cdb.csv");
    let invocation = ToolInvocation::new(Tool::DRep, Stage::ClusterSpecies, outdir)
        .arg("dereplicate")
        .arg_path(outdir)
        .arg("-g")
        .arg_path(&list)
        .arg("--ignoreGenomeQuality")
        .args(["-pa", "0.8", "-sa", "0.95", "-nc", "0.85"])
        .args(["-comW", "0", "-conW", "0", "-strW", "0", "-N50W", "0", "-sizeW", "1", "-centW", "0"])
        .args(["-l", "1000"])
        .arg("-p")
        .arg(threads)
        .output(&cdb);
    runner.invoke(&invocation)?;

    let rows: Vec<DrepCluster> = read_table(&cdb, b',', true)?;
    rows.into_iter()
        .map(|row| {
            let genome = get_file_component(Path::new(&row.genome), FileComponent::FileStem)?;
            Ok((genome, row.secondary_cluster))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn genus_assignment_with_singletons() {
        let genomes = GenomeMap::singletons(&ids(&["s1", "s2", "s3"])).unwrap();
        let overview = vec![
            GenomeOverview::new("s1", "Clustered", "VC_1_0"),
            GenomeOverview::new("s2", "Outlier", ""),
            GenomeOverview::new("s3", "Clustered", "VC_1_0"),
        ];
        let genus = assign_genus_clusters(&genomes, &overview);
        assert_eq!(genus["s1"], "VC_1_0");
        assert_eq!(genus["s2"], "Singleton_genus_1");
        assert_eq!(genus["s3"], "VC_1_0");

        let multi = multi_genome_genera(&genus);
        assert_eq!(multi.len(), 1);
        assert_eq!(multi["VC_1_0"], ids(&["s1", "s3"]));
    }

    #[test]
    fn species_labels_are_sequential() {
        let genus: IndexMap<String, String> = [
            ("s1", "VC_1_0"),
            ("s2", "VC_1_0"),
            ("s3", "Singleton_genus_1"),
            ("s4", "VC_1_0"),
        ]
        .iter()
        .map(|(g, c)| (g.to_string(), c.to_string()))
        .collect();
        let secondary: HashMap<String, String> = [("s1", "1_1"), ("s2", "1_2"), ("s4", "1_1")]
            .iter()
            .map(|(g, c)| (g.to_string(), c.to_string()))
            .collect();

        let species = assign_species_clusters(&genus, &secondary);
        assert_eq!(species["s1"], "Species_1");
        assert_eq!(species["s2"], "Species_2");
        assert_eq!(species["s3"], "Species_3");
        assert_eq!(species["s4"], "Species_1");
    }

    #[test]
    fn protein_map_skips_unknown_scaffolds() {
        let genomes = GenomeMap::singletons(&ids(&["s1"])).unwrap();
        let proteins = vec![FastaRecord::new("s1_1", b"MK"), FastaRecord::new("s7_1", b"MK")];
        let rows = protein_genome_map(&proteins, &genomes);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].contig_id, "s1");
    }
}
