//! Viral genome identities across the pipeline.
//!
//! A scaffold called by the identification stage either stays a singleton
//! genome or is grouped into a bin. Once the [`GenomeMap`] is built the
//! genome -> scaffold mapping is fixed and every later stage resolves its
//! per-scaffold results through it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::ViwrapError;
use crate::utils::{write_tsv, FastaRecord};

pub const DEFAULT_LINKER_LENGTH: usize = 1000;
pub const DEFAULT_LINKER_BASE: u8 = b'N';

const BIN_PREFIX: &str = "vRhyme_bin_";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Lytic,
    Lysogenic,
    Unknown,
}
impl FromStr for LifecycleState {
    type Err = ViwrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lytic" => Ok(Self::Lytic),
            "lysogenic" => Ok(Self::Lysogenic),
            "unknown" | "na" | "" => Ok(Self::Unknown),
            _ => Err(ViwrapError::LifecycleState(s.to_string())),
        }
    }
}
impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Lytic => write!(f, "lytic"),
            LifecycleState::Lysogenic => write!(f, "lysogenic"),
            LifecycleState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Rule used to assign one lifecycle state to a multi-scaffold bin
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
pub enum LifecyclePolicy {
    /// Any lysogenic member makes the bin lysogenic
    AnyLysogenic,
    /// Most frequent known state, ties resolve to lysogenic
    Majority,
    /// State of the first member with a known state
    FirstMember,
}
impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::AnyLysogenic
    }
}

/// Resolve the lifecycle state of a genome from its member scaffolds
///
/// Members without a known state are ignored; a genome without any known
/// member state is `Unknown` under every policy.
pub fn resolve_lifecycle_state(states: &[LifecycleState], policy: LifecyclePolicy) -> LifecycleState {
    let known: Vec<LifecycleState> = states
        .iter()
        .copied()
        .filter(|s| *s != LifecycleState::Unknown)
        .collect();

    if known.is_empty() {
        return LifecycleState::Unknown;
    }

    match policy {
        LifecyclePolicy::AnyLysogenic => {
            if known.contains(&LifecycleState::Lysogenic) {
                LifecycleState::Lysogenic
            } else {
                LifecycleState::Lytic
            }
        }
        LifecyclePolicy::Majority => {
            let lysogenic = known.iter().filter(|s| **s == LifecycleState::Lysogenic).count();
            if lysogenic * 2 >= known.len() {
                LifecycleState::Lysogenic
            } else {
                LifecycleState::Lytic
            }
        }
        LifecyclePolicy::FirstMember => known[0],
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenomeKind {
    Singleton,
    Bin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Genome {
    pub id: String,
    pub kind: GenomeKind,
    /// Member scaffolds in assembly order
    pub scaffolds: Vec<String>,
}

/// Row of the binner membership table
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BinMembership {
    pub scaffold: String,
    pub bin: String,
}

/// Row of the persisted genome -> scaffold map
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GenomeMapRecord {
    pub genome: String,
    pub kind: GenomeKind,
    pub scaffold: String,
}

pub fn bin_label(bin: &str) -> String {
    if bin.starts_with(BIN_PREFIX) {
        bin.to_string()
    } else {
        format!("{BIN_PREFIX}{bin}")
    }
}

fn bin_number(label: &str) -> Option<u64> {
    label.trim_start_matches(BIN_PREFIX).parse().ok()
}

/// Genome identifier for a scaffold set
///
/// Bins of two or more scaffolds take the binning label, a single scaffold
/// keeps its own name.
pub fn establish_genome_identity(scaffolds: &[String], bin: Option<&str>) -> Result<String, ViwrapError> {
    match (scaffolds, bin) {
        ([], _) => Err(ViwrapError::EmptyScaffoldSet),
        ([single], _) => Ok(single.clone()),
        (_, Some(label)) => Ok(bin_label(label)),
        (_, None) => Err(ViwrapError::GenomeIdentityCollision(scaffolds.join(","))),
    }
}

/// Group membership rows into bins, ordered by bin number
pub fn group_bins(memberships: &[BinMembership]) -> IndexMap<String, Vec<String>> {
    let mut bins: IndexMap<String, Vec<String>> = IndexMap::new();
    for membership in memberships {
        bins.entry(bin_label(&membership.bin))
            .or_default()
            .push(membership.scaffold.clone());
    }
    bins.sort_by(|a, _, b, _| {
        bin_number(a)
            .cmp(&bin_number(b))
            .then_with(|| a.cmp(b))
    });
    bins
}

/// Refine bins with scaffold-level lifecycle and completeness
///
/// Complete scaffolds leave their bin, bins holding more than one lysogenic
/// scaffold are dissolved and bins left with fewer than two members are
/// dropped so their scaffolds become singletons.
pub fn refine_bins(
    bins: IndexMap<String, Vec<String>>,
    lifecycle: &HashMap<String, LifecycleState>,
    complete: &HashSet<String>,
) -> IndexMap<String, Vec<String>> {
    let mut refined = IndexMap::new();

    for (label, members) in bins {
        let members: Vec<String> = members
            .into_iter()
            .filter(|scaffold| !complete.contains(scaffold))
            .collect();

        let lysogenic = members
            .iter()
            .filter(|scaffold| lifecycle.get(*scaffold) == Some(&LifecycleState::Lysogenic))
            .count();

        if lysogenic > 1 {
            log::debug!("Dissolving bin '{label}' with {lysogenic} lysogenic scaffolds");
            continue;
        }
        if members.len() < 2 {
            continue;
        }
        refined.insert(label, members);
    }
    refined
}

/// Immutable genome -> scaffold set mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenomeMap {
    genomes: IndexMap<String, Genome>,
    scaffold_index: HashMap<String, String>,
}
impl GenomeMap {
    /// Every scaffold is its own genome
    pub fn singletons(scaffold_order: &[String]) -> Result<Self, ViwrapError> {
        Self::from_bins(scaffold_order, &IndexMap::new())
    }
    /// Bins first (in bin order), then unbinned scaffolds in assembly order
    pub fn from_bins(
        scaffold_order: &[String],
        bins: &IndexMap<String, Vec<String>>,
    ) -> Result<Self, ViwrapError> {
        let position: HashMap<&str, usize> = scaffold_order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        let mut map = Self::default();

        for (label, members) in bins {
            let mut known: Vec<String> = Vec::new();
            for scaffold in members {
                if position.contains_key(scaffold.as_str()) {
                    known.push(scaffold.clone());
                } else {
                    log::warn!("Scaffold '{scaffold}' of bin '{label}' is not in the viral call set (skipped)");
                }
            }
            known.sort_by_key(|scaffold| position[scaffold.as_str()]);

            if known.is_empty() {
                continue;
            }
            let kind = if known.len() > 1 { GenomeKind::Bin } else { GenomeKind::Singleton };
            let id = establish_genome_identity(&known, Some(label))?;
            map.insert(Genome { id, kind, scaffolds: known })?;
        }

        for scaffold in scaffold_order {
            if !map.scaffold_index.contains_key(scaffold) {
                let scaffolds = vec![scaffold.clone()];
                let id = establish_genome_identity(&scaffolds, None)?;
                map.insert(Genome { id, kind: GenomeKind::Singleton, scaffolds })?;
            }
        }

        Ok(map)
    }
    fn insert(&mut self, genome: Genome) -> Result<(), ViwrapError> {
        if self.genomes.contains_key(&genome.id) {
            return Err(ViwrapError::GenomeIdentityCollision(genome.id));
        }
        for scaffold in &genome.scaffolds {
            if self.scaffold_index.insert(scaffold.clone(), genome.id.clone()).is_some() {
                return Err(ViwrapError::ScaffoldAssignedTwice(scaffold.clone()));
            }
        }
        self.genomes.insert(genome.id.clone(), genome);
        Ok(())
    }
    pub fn get(&self, genome_id: &str) -> Option<&Genome> {
        self.genomes.get(genome_id)
    }
    pub fn genome_of(&self, scaffold: &str) -> Option<&Genome> {
        self.scaffold_index
            .get(scaffold)
            .and_then(|id| self.genomes.get(id))
    }
    pub fn iter(&self) -> impl Iterator<Item = &Genome> {
        self.genomes.values()
    }
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.genomes.keys()
    }
    pub fn len(&self) -> usize {
        self.genomes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.genomes.is_empty()
    }
    pub fn write_tsv(&self, path: &Path) -> Result<(), ViwrapError> {
        let records: Vec<GenomeMapRecord> = self
            .iter()
            .flat_map(|genome| {
                genome.scaffolds.iter().map(|scaffold| GenomeMapRecord {
                    genome: genome.id.clone(),
                    kind: genome.kind,
                    scaffold: scaffold.clone(),
                })
            })
            .collect();
        write_tsv(&records, path, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkerConfig {
    pub length: usize,
    pub filler: u8,
}
impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_LINKER_LENGTH,
            filler: DEFAULT_LINKER_BASE,
        }
    }
}

/// Join scaffold sequences with a run of filler bases between members
pub fn concatenate_with_linker(scaffolds: &[&[u8]], linker: &LinkerConfig) -> Vec<u8> {
    let spacer = vec![linker.filler; linker.length];
    Itertools::intersperse(scaffolds.iter().copied(), spacer.as_slice())
        .flatten()
        .copied()
        .collect()
}

fn member_records<'a>(
    genome: &Genome,
    sequences: &'a HashMap<String, FastaRecord>,
) -> Result<Vec<&'a FastaRecord>, ViwrapError> {
    genome
        .scaffolds
        .iter()
        .map(|scaffold| {
            sequences
                .get(scaffold)
                .ok_or_else(|| ViwrapError::ScaffoldSequenceMissing(scaffold.clone(), genome.id.clone()))
        })
        .collect()
}

/// N-linked genome sequences named by genome identifier
pub fn link_genomes(
    genomes: &GenomeMap,
    sequences: &HashMap<String, FastaRecord>,
    linker: &LinkerConfig,
) -> Result<Vec<FastaRecord>, ViwrapError> {
    genomes
        .iter()
        .map(|genome| {
            let members = member_records(genome, sequences)?;
            let seqs: Vec<&[u8]> = members.iter().map(|r| r.seq.as_slice()).collect();
            Ok(FastaRecord {
                id: genome.id.clone(),
                seq: concatenate_with_linker(&seqs, linker),
            })
        })
        .collect()
}

/// Unlinked member records of a genome, bin members are prefixed with the bin label
pub fn genome_member_records(
    genome: &Genome,
    sequences: &HashMap<String, FastaRecord>,
) -> Result<Vec<FastaRecord>, ViwrapError> {
    let members = member_records(genome, sequences)?;
    Ok(members
        .into_iter()
        .map(|record| match genome.kind {
            GenomeKind::Bin => FastaRecord {
                id: format!("{}__{}", genome.id, record.id),
                seq: record.seq.clone(),
            },
            GenomeKind::Singleton => record.clone(),
        })
        .collect())
}

/// Total member length without linkers
pub fn genome_size(genome: &Genome, sequences: &HashMap<String, FastaRecord>) -> u64 {
    genome
        .scaffolds
        .iter()
        .filter_map(|scaffold| sequences.get(scaffold))
        .map(|record| record.len() as u64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn sequences(records: &[(&str, &str)]) -> HashMap<String, FastaRecord> {
        records
            .iter()
            .map(|(id, seq)| (id.to_string(), FastaRecord::new(id, seq.as_bytes())))
            .collect()
    }

    #[test]
    fn concatenation_length_includes_linkers() {
        let linker = LinkerConfig { length: 10, filler: b'N' };
        let a = b"ACGTACGT".as_slice();
        let b = b"GG".as_slice();
        let c = b"TTTAA".as_slice();

        let linked = concatenate_with_linker(&[a, b, c], &linker);
        assert_eq!(linked.len(), a.len() + b.len() + c.len() + 2 * 10);
        assert_eq!(&linked[..8], a);
        assert_eq!(&linked[8..18], b"NNNNNNNNNN");
        assert_eq!(&linked[18..20], b);
    }

    #[test]
    fn concatenation_single_scaffold_has_no_linker() {
        let linked = concatenate_with_linker(&[b"ACGT".as_slice()], &LinkerConfig::default());
        assert_eq!(linked, b"ACGT");
    }

    #[test]
    fn genome_identity_singleton_and_bin() {
        assert_eq!(establish_genome_identity(&ids(&["scaffold_3"]), None).unwrap(), "scaffold_3");
        assert_eq!(
            establish_genome_identity(&ids(&["scaffold_1", "scaffold_2"]), Some("4")).unwrap(),
            "vRhyme_bin_4"
        );
        assert!(matches!(
            establish_genome_identity(&[], None),
            Err(ViwrapError::EmptyScaffoldSet)
        ));
    }

    #[test]
    fn genome_map_orders_members_by_assembly() {
        let order = ids(&["s1", "s2", "s3", "s4"]);
        let mut bins = IndexMap::new();
        bins.insert("vRhyme_bin_1".to_string(), ids(&["s3", "s1"]));

        let map = GenomeMap::from_bins(&order, &bins).unwrap();
        let genome_ids: Vec<&String> = map.ids().collect();
        assert_eq!(genome_ids, vec!["vRhyme_bin_1", "s2", "s4"]);
        assert_eq!(map.get("vRhyme_bin_1").unwrap().scaffolds, ids(&["s1", "s3"]));
        assert_eq!(map.genome_of("s3").unwrap().id, "vRhyme_bin_1");
        assert_eq!(map.genome_of("s2").unwrap().kind, GenomeKind::Singleton);
    }

    #[test]
    fn genome_map_rejects_scaffold_in_two_bins() {
        let order = ids(&["s1", "s2", "s3"]);
        let mut bins = IndexMap::new();
        bins.insert("vRhyme_bin_1".to_string(), ids(&["s1", "s2"]));
        bins.insert("vRhyme_bin_2".to_string(), ids(&["s2", "s3"]));

        assert!(matches!(
            GenomeMap::from_bins(&order, &bins),
            Err(ViwrapError::ScaffoldAssignedTwice(s)) if s == "s2"
        ));
    }

    #[test]
    fn genome_map_is_deterministic() {
        let order = ids(&["s1", "s2", "s3", "s4"]);
        let memberships = vec![
            BinMembership { scaffold: "s4".into(), bin: "2".into() },
            BinMembership { scaffold: "s2".into(), bin: "10".into() },
            BinMembership { scaffold: "s1".into(), bin: "2".into() },
            BinMembership { scaffold: "s3".into(), bin: "10".into() },
        ];
        let first = GenomeMap::from_bins(&order, &group_bins(&memberships)).unwrap();
        let second = GenomeMap::from_bins(&order, &group_bins(&memberships)).unwrap();
        assert_eq!(first, second);

        let genome_ids: Vec<&String> = first.ids().collect();
        assert_eq!(genome_ids, vec!["vRhyme_bin_2", "vRhyme_bin_10"]);
    }

    #[test]
    fn link_genomes_uses_member_order() {
        let order = ids(&["s1", "s2"]);
        let mut bins = IndexMap::new();
        bins.insert("vRhyme_bin_1".to_string(), ids(&["s2", "s1"]));
        let map = GenomeMap::from_bins(&order, &bins).unwrap();
        let seqs = sequences(&[("s1", "AAAA"), ("s2", "CC")]);

        let linker = LinkerConfig { length: 3, filler: b'N' };
        let linked = link_genomes(&map, &seqs, &linker).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, "vRhyme_bin_1");
        assert_eq!(linked[0].seq, b"AAAANNNCC");

        let members = genome_member_records(map.get("vRhyme_bin_1").unwrap(), &seqs).unwrap();
        assert_eq!(members[0].id, "vRhyme_bin_1__s1");
        assert_eq!(genome_size(map.get("vRhyme_bin_1").unwrap(), &seqs), 6);
    }

    #[test]
    fn link_genomes_missing_sequence_fails() {
        let map = GenomeMap::singletons(&ids(&["s1"])).unwrap();
        let err = link_genomes(&map, &HashMap::new(), &LinkerConfig::default()).unwrap_err();
        assert!(matches!(err, ViwrapError::ScaffoldSequenceMissing(..)));
    }

    #[test]
    fn lifecycle_policies() {
        use LifecycleState::*;
        let mixed = [Lytic, Lysogenic, Lytic, Unknown];

        assert_eq!(resolve_lifecycle_state(&mixed, LifecyclePolicy::AnyLysogenic), Lysogenic);
        assert_eq!(resolve_lifecycle_state(&mixed, LifecyclePolicy::Majority), Lytic);
        assert_eq!(resolve_lifecycle_state(&mixed, LifecyclePolicy::FirstMember), Lytic);
        assert_eq!(resolve_lifecycle_state(&[Lytic, Lysogenic], LifecyclePolicy::Majority), Lysogenic);
        assert_eq!(resolve_lifecycle_state(&[Unknown, Lysogenic], LifecyclePolicy::FirstMember), Lysogenic);
        assert_eq!(resolve_lifecycle_state(&[Unknown], LifecyclePolicy::AnyLysogenic), Unknown);
        assert_eq!(resolve_lifecycle_state(&[], LifecyclePolicy::Majority), Unknown);
    }

    #[test]
    fn refine_bins_dissolves_and_releases() {
        let mut bins = IndexMap::new();
        bins.insert("vRhyme_bin_1".to_string(), ids(&["a", "b", "c"]));
        bins.insert("vRhyme_bin_2".to_string(), ids(&["d", "e"]));
        bins.insert("vRhyme_bin_3".to_string(), ids(&["f", "g"]));

        let lifecycle: HashMap<String, LifecycleState> = [
            ("d".to_string(), LifecycleState::Lysogenic),
            ("e".to_string(), LifecycleState::Lysogenic),
        ]
        .into_iter()
        .collect();
        let complete: HashSet<String> = ["a".to_string(), "f".to_string()].into_iter().collect();

        let refined = refine_bins(bins, &lifecycle, &complete);
        assert_eq!(refined.len(), 1);
        assert_eq!(refined["vRhyme_bin_1"], ids(&["b", "c"]));
    }

    #[test]
    fn lifecycle_state_parsing() {
        assert_eq!("Lysogenic".parse::<LifecycleState>().unwrap(), LifecycleState::Lysogenic);
        assert_eq!("NA".parse::<LifecycleState>().unwrap(), LifecycleState::Unknown);
        assert!("temperate".parse::<LifecycleState>().is_err());
    }
}
