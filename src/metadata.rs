//! Per-genome metadata accumulated across stages.
//!
//! A bundle is created empty for every genome when the genome map is fixed.
//! Stages then left-join their values into it: single-valued fields keep the
//! first value written, additive fields (hosts, AMGs, per-sample abundance)
//! accumulate.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::abundance::Abundance;
use crate::genome::{GenomeMap, LifecycleState};
use crate::host::HostPrediction;
use crate::taxonomy::TaxonomySource;
use crate::tool::Stage;

/// Row of CheckV `quality_summary.tsv`, other columns are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckvQuality {
    pub contig_id: String,
    pub contig_length: u64,
    pub checkv_quality: String,
    pub miuvig_quality: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub completeness: Option<f64>,
    pub completeness_method: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub contamination: Option<f64>,
}

/// Genome quality from CheckV on the N-linked genome
#[derive(Debug, Clone, PartialEq)]
pub struct QualityRecord {
    pub checkv_quality: String,
    pub miuvig_quality: String,
    pub completeness: Option<f64>,
    pub completeness_method: Option<String>,
    pub contamination: Option<f64>,
}
impl QualityRecord {
    pub fn contamination_flag(&self) -> bool {
        self.contamination.map(|c| c > 0.0).unwrap_or(false)
    }
}
impl From<CheckvQuality> for QualityRecord {
    fn from(row: CheckvQuality) -> Self {
        Self {
            checkv_quality: row.checkv_quality,
            miuvig_quality: row.miuvig_quality,
            completeness: row.completeness,
            completeness_method: row.completeness_method,
            contamination: row.contamination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmgHit {
    pub protein: String,
    pub ko: String,
}

/// A single value offered to a genome's metadata bundle
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    ScaffoldCount(usize),
    Size(u64),
    ProteinCount(usize),
    Lifecycle(LifecycleState),
    Quality(QualityRecord),
    GenusCluster(String),
    SpeciesCluster(String),
    Taxonomy(TaxonomySource, String),
    Host(HostPrediction),
    Amg(AmgHit),
    Abundance(String, Abundance),
}
impl MetadataValue {
    fn field(&self) -> String {
        match self {
            MetadataValue::ScaffoldCount(_) => "scaffold_count".to_string(),
            MetadataValue::Size(_) => "size".to_string(),
            MetadataValue::ProteinCount(_) => "protein_count".to_string(),
            MetadataValue::Lifecycle(_) => "lifecycle".to_string(),
            MetadataValue::Quality(_) => "quality".to_string(),
            MetadataValue::GenusCluster(_) => "genus_cluster".to_string(),
            MetadataValue::SpeciesCluster(_) => "species_cluster".to_string(),
            MetadataValue::Taxonomy(source, _) => format!("taxonomy ({source})"),
            MetadataValue::Host(_) => "host".to_string(),
            MetadataValue::Amg(_) => "amg".to_string(),
            MetadataValue::Abundance(sample, _) => format!("abundance ({sample})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The field was empty and now holds the value
    Written,
    /// The field was already set by an earlier stage
    Kept,
    /// The value was added to an additive field
    Accumulated,
    /// The genome is not part of the genome map
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenomeMetadata {
    pub genome_id: String,
    pub scaffolds: Vec<String>,
    pub scaffold_count: Option<usize>,
    pub size: Option<u64>,
    pub protein_count: Option<usize>,
    pub lifecycle: Option<LifecycleState>,
    pub quality: Option<QualityRecord>,
    pub genus_cluster: Option<String>,
    pub species_cluster: Option<String>,
    pub taxonomy: IndexMap<TaxonomySource, String>,
    pub hosts: Vec<HostPrediction>,
    pub amgs: Vec<AmgHit>,
    pub abundance: IndexMap<String, Abundance>,
}

fn set_once<T: PartialEq>(slot: &mut Option<T>, value: T) -> (MergeOutcome, bool) {
    match slot {
        None => {
            *slot = Some(value);
            (MergeOutcome::Written, false)
        }
        Some(existing) => (MergeOutcome::Kept, *existing != value),
    }
}

/// Metadata bundles of all genomes, in genome map order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataStore {
    genomes: IndexMap<String, GenomeMetadata>,
}
impl MetadataStore {
    pub fn new(genome_map: &GenomeMap) -> Self {
        Self {
            genomes: genome_map
                .iter()
                .map(|genome| {
                    (
                        genome.id.clone(),
                        GenomeMetadata {
                            genome_id: genome.id.clone(),
                            scaffolds: genome.scaffolds.clone(),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        }
    }

    /// Left-join a value into the bundle of a genome
    pub fn merge(&mut self, genome_id: &str, value: MetadataValue, stage: Stage) -> MergeOutcome {
        let Some(metadata) = self.genomes.get_mut(genome_id) else {
            log::debug!("Ignoring {} for unknown genome '{genome_id}' from stage '{stage}'", value.field());
            return MergeOutcome::Ignored;
        };

        let field = value.field();
        let (outcome, conflict) = match value {
            MetadataValue::ScaffoldCount(v) => set_once(&mut metadata.scaffold_count, v),
            MetadataValue::Size(v) => set_once(&mut metadata.size, v),
            MetadataValue::ProteinCount(v) => set_once(&mut metadata.protein_count, v),
            MetadataValue::Lifecycle(v) => set_once(&mut metadata.lifecycle, v),
            MetadataValue::Quality(v) => set_once(&mut metadata.quality, v),
            MetadataValue::GenusCluster(v) => set_once(&mut metadata.genus_cluster, v),
            MetadataValue::SpeciesCluster(v) => set_once(&mut metadata.species_cluster, v),
            MetadataValue::Taxonomy(source, lineage) => match metadata.taxonomy.get(&source) {
                Some(existing) => (MergeOutcome::Kept, *existing != lineage),
                None => {
                    metadata.taxonomy.insert(source, lineage);
                    (MergeOutcome::Written, false)
                }
            },
            MetadataValue::Host(host) => {
                if metadata.hosts.contains(&host) {
                    (MergeOutcome::Kept, false)
                } else {
                    metadata.hosts.push(host);
                    (MergeOutcome::Accumulated, false)
                }
            }
            MetadataValue::Amg(hit) => {
                if metadata.amgs.iter().any(|existing| existing.protein == hit.protein) {
                    (MergeOutcome::Kept, false)
                } else {
                    metadata.amgs.push(hit);
                    (MergeOutcome::Accumulated, false)
                }
            }
            MetadataValue::Abundance(sample, abundance) => match metadata.abundance.get(&sample) {
                Some(existing) => (MergeOutcome::Kept, *existing != abundance),
                None => {
                    metadata.abundance.insert(sample, abundance);
                    (MergeOutcome::Accumulated, false)
                }
            },
        };

        if conflict {
            log::debug!("Keeping earlier {field} of genome '{genome_id}', value from stage '{stage}' differs");
        }
        outcome
    }

    /// Merge values for many genomes from one stage
    pub fn merge_all<I>(&mut self, values: I, stage: Stage)
    where
        I: IntoIterator<Item = (String, MetadataValue)>,
    {
        for (genome_id, value) in values {
            self.merge(&genome_id, value, stage);
        }
    }

    pub fn get(&self, genome_id: &str) -> Option<&GenomeMetadata> {
        self.genomes.get(genome_id)
    }
    pub fn iter(&self) -> impl Iterator<Item = &GenomeMetadata> {
        self.genomes.values()
    }
    pub fn len(&self) -> usize {
        self.genomes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.genomes.is_empty()
    }
}

/// Scaffold -> genome values resolved through the genome map
pub fn scaffold_values_to_genomes<T: Clone>(
    genome_map: &GenomeMap,
    scaffold_values: &HashMap<String, T>,
) -> Vec<(String, Vec<T>)> {
    genome_map
        .iter()
        .map(|genome| {
            let values = genome
                .scaffolds
                .iter()
                .filter_map(|scaffold| scaffold_values.get(scaffold).cloned())
                .collect();
            (genome.id.clone(), values)
        })
        .collect()
}
