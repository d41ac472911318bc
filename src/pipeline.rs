//! Sequential run controller.
//!
//! Stages run strictly in order and hand typed manifests to each other. The
//! only branches are the static capabilities of the run configuration (reads
//! available, custom host genomes, visualisation program) and the empty call
//! set, which skips every external tool and still writes the summary.

use std::collections::{HashMap, HashSet};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use regex::Regex;

use crate::abundance::{genome_abundance, map_samples, read_coverage, SampleMapping, SampleReads};
use crate::annotation::{protein_scaffold, AnnotationRecord};
use crate::cluster::{
    assign_genus_clusters, assign_species_clusters, multi_genome_genera, protein_genome_map, read_genome_overview,
    run_drep, run_vcontact2, GenomeOverview, ProteinGenomeRow,
};
use crate::config::{HostDatabase, RunConfig};
use crate::error::ViwrapError;
use crate::genome::{
    genome_size, group_bins, link_genomes, refine_bins, resolve_lifecycle_state, BinMembership, GenomeMap,
    LifecycleState,
};
use crate::host::{build_custom_db, read_predictions, run_iphop, HostDbKind};
use crate::identify::{read_lifecycle_table, run_checkv, Identifier, IdentifyManifest};
use crate::metadata::{scaffold_values_to_genomes, AmgHit, CheckvQuality, MetadataStore, MetadataValue, QualityRecord};
use crate::summary::{
    print_table, summary_rows, write_annotation_results, write_genome_files, write_summary, write_visualization_inputs,
    SummaryManifest,
};
use crate::taxonomy::{classify_proteins, read_imgvr_taxonomy, vcontact2_taxonomy, TaxonomySource};
use crate::tool::{Stage, Tool, ToolInvocation, ToolRunner};
use crate::utils::{concatenate_fasta_files, count_reads, read_fasta, read_table, read_tsv, write_fasta, write_table, FastaRecord};

const BEST_BINS_PATTERN: &str = r"^vRhyme_best_bins\.\d+\.membership\.tsv$";

/// Read mapping outputs of all samples
#[derive(Debug, Clone, PartialEq)]
pub struct MappingManifest {
    pub reference: PathBuf,
    pub samples: Vec<SampleMapping>,
}

/// Binning outputs, `membership` is absent when the binner was skipped
#[derive(Debug, Clone, PartialEq)]
pub struct BinningManifest {
    pub membership: Option<PathBuf>,
    pub genome_map: GenomeMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenusManifest {
    pub overview: PathBuf,
    pub clusters: IndexMap<String, String>,
}

/// N-linked genome sequences, combined and per genome
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedManifest {
    pub combined: PathBuf,
    pub genome_map: PathBuf,
    pub genome_files: IndexMap<String, PathBuf>,
}

/// Everything a completed run leaves behind
#[derive(Debug, Clone, PartialEq)]
pub struct RunManifest {
    pub identify: IdentifyManifest,
    pub mapping: Option<MappingManifest>,
    pub linked: Option<LinkedManifest>,
    pub summary: SummaryManifest,
    pub visualization: Vec<PathBuf>,
}

pub struct Pipeline<'a, R: ToolRunner> {
    config: &'a RunConfig,
    runner: &'a R,
}
impl<'a, R: ToolRunner> Pipeline<'a, R> {
    pub fn new(config: &'a RunConfig, runner: &'a R) -> Self {
        Self { config, runner }
    }

    pub fn run(&self) -> Result<RunManifest, ViwrapError> {
        log::info!("Identifying viral sequences ({})... In processing...", self.config.method);
        let identify = Identifier::new(self.config, self.runner).run()?;
        log::info!("Identifying viral sequences ({})... Finished", self.config.method);

        let sequences: HashMap<String, FastaRecord> = read_fasta(&identify.fasta)?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        if identify.is_empty() {
            log::warn!("Empty viral call set, skipping mapping, binning, clustering, taxonomy and host prediction");
            let store = MetadataStore::new(&GenomeMap::default());
            let summary = self.summarize(&store, &GenomeMap::default(), &sequences, &[], &[], None)?;
            let visualization = self.visualize(&store)?;
            return Ok(RunManifest { identify, mapping: None, linked: None, summary, visualization });
        }

        let lifecycle = read_lifecycle_table(&identify.lifecycle)?;
        let annotations: Vec<AnnotationRecord> = read_tsv(&identify.annotations, true)?;
        let proteins = read_fasta(&identify.proteins)?;

        let (mapping, sample_reads) = match &self.config.layout.mapping {
            Some(dir) => {
                let (mapping, reads) = self.map(&identify, dir)?;
                (Some(mapping), Some(reads))
            }
            None => {
                log::warn!("No reads provided, skipping mapping, binning and abundance");
                (None, None)
            }
        };

        let binning = self.bin(&identify, mapping.as_ref(), &lifecycle)?;
        let genome_map = binning.genome_map;

        let mut store = MetadataStore::new(&genome_map);
        self.merge_identification(&mut store, &genome_map, &proteins, &annotations, &lifecycle);
        if let Some(mapping) = &mapping {
            merge_abundance(&mut store, &genome_map, mapping)?;
        }

        let genus = self.cluster_genus(&identify, &proteins, &genome_map)?;
        store.merge_all(
            genus.clusters.iter().map(|(genome, cluster)| (genome.clone(), MetadataValue::GenusCluster(cluster.clone()))),
            Stage::ClusterGenus,
        );

        let linked = self.link(&genome_map, &sequences)?;
        store.merge_all(
            genome_map
                .iter()
                .map(|genome| (genome.id.clone(), MetadataValue::Size(genome_size(genome, &sequences)))),
            Stage::LinkGenomes,
        );

        for (genome, quality) in self.quality_check(&linked)? {
            store.merge(&genome, MetadataValue::Quality(quality), Stage::QualityCheck);
        }

        let species = self.cluster_species(&genus.clusters, &linked)?;
        store.merge_all(
            species.into_iter().map(|(genome, cluster)| (genome, MetadataValue::SpeciesCluster(cluster))),
            Stage::ClusterSpecies,
        );

        self.classify_taxonomy(&mut store, &identify, &proteins, &genome_map, &genus)?;
        self.predict_host(&mut store, &linked)?;

        let summary = self.summarize(
            &store,
            &genome_map,
            &sequences,
            &proteins,
            &annotations,
            sample_reads.as_deref(),
        )?;
        let visualization = self.visualize(&store)?;

        Ok(RunManifest { identify, mapping, linked: Some(linked), summary, visualization })
    }

    fn map(&self, identify: &IdentifyManifest, dir: &Path) -> Result<(MappingManifest, Vec<SampleReads>), ViwrapError> {
        log::info!("Mapping reads to viral scaffolds... In processing...");
        create_dir_all(dir)?;

        let mut sample_reads = Vec::new();
        for sample in &self.config.reads {
            let mut reads = 0;
            for file in &sample.files {
                reads += count_reads(file)?;
            }
            log::info!("Sample '{}' holds {reads} reads", sample.name);
            sample_reads.push(SampleReads { sample: sample.name.clone(), reads });
        }
        let read_counts: HashMap<String, u64> = sample_reads.iter().map(|s| (s.sample.clone(), s.reads)).collect();

        let samples = map_samples(
            self.runner,
            &self.config.reads,
            &read_counts,
            &identify.fasta,
            dir,
            self.config.read_type,
            self.config.mapping_identity,
            self.config.threads,
        )?;
        log::info!("Mapping reads to viral scaffolds... Finished");

        Ok((MappingManifest { reference: identify.fasta.clone(), samples }, sample_reads))
    }

    fn bin(
        &self,
        identify: &IdentifyManifest,
        mapping: Option<&MappingManifest>,
        lifecycle: &HashMap<String, LifecycleState>,
    ) -> Result<BinningManifest, ViwrapError> {
        let (Some(mapping), Some(dir)) = (mapping, &self.config.layout.binning) else {
            return Ok(BinningManifest { membership: None, genome_map: GenomeMap::singletons(&identify.scaffolds)? });
        };
        if identify.scaffolds.len() < 2 {
            log::warn!("Fewer than two viral scaffolds, skipping binning");
            return Ok(BinningManifest { membership: None, genome_map: GenomeMap::singletons(&identify.scaffolds)? });
        }

        log::info!("Binning viral scaffolds with vRhyme... In processing...");
        create_dir_all(dir)?;
        let result_dir = dir.join("vRhyme_result");

        let mut invocation = ToolInvocation::new(Tool::VRhyme, Stage::Bin, dir)
            .arg("-i")
            .arg_path(&identify.fasta)
            .arg("-b");
        for sample in &mapping.samples {
            invocation = invocation.arg_path(&sample.bam);
        }
        let invocation = invocation
            .arg("-o")
            .arg_path(&result_dir)
            .arg("-t")
            .arg(self.config.threads)
            .output_allow_empty(&result_dir);
        self.runner.invoke(&invocation)?;

        let Some(membership) = find_best_bins(&result_dir)? else {
            log::warn!("vRhyme produced no bins, every viral scaffold is its own genome");
            return Ok(BinningManifest { membership: None, genome_map: GenomeMap::singletons(&identify.scaffolds)? });
        };
        let rows: Vec<BinMembership> = read_tsv(&membership, true)?;

        let checkv = run_checkv(
            self.runner,
            &identify.fasta,
            &dir.join("CheckV_scaffolds"),
            &self.config.databases.checkv,
            self.config.threads,
            Stage::Bin,
        )?;
        let complete: HashSet<String> = read_tsv::<CheckvQuality>(&checkv.quality_summary, true)?
            .into_iter()
            .filter(|row| row.checkv_quality == "Complete")
            .map(|row| row.contig_id)
            .collect();

        let bins = refine_bins(group_bins(&rows), lifecycle, &complete);
        log::info!("Retained {} bins after refinement", bins.len());
        let genome_map = GenomeMap::from_bins(&identify.scaffolds, &bins)?;
        log::info!("Binning viral scaffolds with vRhyme... Finished");

        Ok(BinningManifest { membership: Some(membership), genome_map })
    }

    fn merge_identification(
        &self,
        store: &mut MetadataStore,
        genome_map: &GenomeMap,
        proteins: &[FastaRecord],
        annotations: &[AnnotationRecord],
        lifecycle: &HashMap<String, LifecycleState>,
    ) {
        let mut protein_counts: HashMap<String, usize> = HashMap::new();
        for protein in proteins {
            if let Some(genome) = genome_map.genome_of(protein_scaffold(&protein.id)) {
                *protein_counts.entry(genome.id.clone()).or_default() += 1;
            }
        }

        for genome in genome_map.iter() {
            store.merge(&genome.id, MetadataValue::ScaffoldCount(genome.scaffolds.len()), Stage::Identify);
            store.merge(
                &genome.id,
                MetadataValue::ProteinCount(protein_counts.get(&genome.id).copied().unwrap_or(0)),
                Stage::Identify,
            );
        }

        for (genome, states) in scaffold_values_to_genomes(genome_map, lifecycle) {
            let state = resolve_lifecycle_state(&states, self.config.lifecycle_policy);
            store.merge(&genome, MetadataValue::Lifecycle(state), Stage::Identify);
        }

        for annotation in annotations.iter().filter(|a| a.amg) {
            let (Some(genome), Some(ko)) = (genome_map.genome_of(&annotation.scaffold), &annotation.ko) else {
                continue;
            };
            store.merge(
                &genome.id,
                MetadataValue::Amg(AmgHit { protein: annotation.protein.clone(), ko: ko.clone() }),
                Stage::Identify,
            );
        }
    }

    fn cluster_genus(
        &self,
        identify: &IdentifyManifest,
        proteins: &[FastaRecord],
        genome_map: &GenomeMap,
    ) -> Result<GenusManifest, ViwrapError> {
        log::info!("Clustering genomes at genus level with vConTACT2... In processing...");
        let dir = &self.config.layout.genus;
        create_dir_all(dir)?;

        let mut rows = protein_genome_map(proteins, genome_map);
        let mut protein_files = vec![identify.proteins.clone()];

        let reference_proteins = self.config.databases.imgvr_proteins();
        let reference_map = self.config.databases.imgvr_protein_map();
        if reference_proteins.exists() && reference_map.exists() {
            log::info!("Including IMG/VR reference genomes in the protein network");
            protein_files.push(reference_proteins);
            rows.extend(read_table::<ProteinGenomeRow>(&reference_map, b',', true)?);
        }

        let combined = dir.join("combined_viral_proteins.faa");
        let protein_map = dir.join("combined_viral_pro2viral_gn_map.csv");
        concatenate_fasta_files(&protein_files, &combined)?;
        write_table(&rows, &protein_map, b',', true)?;

        let cluster_one = self
            .config
            .conda_env_dir
            .join("ViWrap-vContact2")
            .join("bin")
            .join("cluster_one-1.0.jar");
        let overview = run_vcontact2(self.runner, &combined, &protein_map, dir, &cluster_one, self.config.threads)?;
        let clusters = assign_genus_clusters(genome_map, &read_genome_overview(&overview)?);
        log::info!("Clustering genomes at genus level with vConTACT2... Finished");

        Ok(GenusManifest { overview, clusters })
    }

    fn link(&self, genome_map: &GenomeMap, sequences: &HashMap<String, FastaRecord>) -> Result<LinkedManifest, ViwrapError> {
        log::info!("Building N-linked viral genomes... In processing...");
        let dir = &self.config.layout.nlinked;
        let genome_dir = dir.join("viral_genomes");
        create_dir_all(&genome_dir)?;

        let linked = link_genomes(genome_map, sequences, &self.config.linker)?;
        let combined = dir.join("viral_genomes_combined.fasta");
        write_fasta(&linked, &combined)?;

        let mut genome_files = IndexMap::new();
        for record in linked {
            let path = genome_dir.join(format!("{}.fasta", record.id));
            write_fasta(std::slice::from_ref(&record), &path)?;
            genome_files.insert(record.id, path);
        }

        let map_path = dir.join("viral_genome_map.tsv");
        genome_map.write_tsv(&map_path)?;
        log::info!("Building N-linked viral genomes... Finished");

        Ok(LinkedManifest { combined, genome_map: map_path, genome_files })
    }

    fn quality_check(&self, linked: &LinkedManifest) -> Result<Vec<(String, QualityRecord)>, ViwrapError> {
        log::info!("Checking genome quality with CheckV... In processing...");
        let outputs = run_checkv(
            self.runner,
            &linked.combined,
            &self.config.layout.checkv,
            &self.config.databases.checkv,
            self.config.threads,
            Stage::QualityCheck,
        )?;
        let rows: Vec<CheckvQuality> = read_tsv(&outputs.quality_summary, true)?;
        log::info!("Checking genome quality with CheckV... Finished");

        Ok(rows
            .into_iter()
            .map(|row| (row.contig_id.clone(), QualityRecord::from(row)))
            .collect())
    }

    fn cluster_species(
        &self,
        genus: &IndexMap<String, String>,
        linked: &LinkedManifest,
    ) -> Result<IndexMap<String, String>, ViwrapError> {
        log::info!("Clustering genomes at species level with dRep... In processing...");
        let mut secondary = HashMap::new();

        let multi = multi_genome_genera(genus);
        if multi.is_empty() {
            log::warn!("No genus cluster holds two or more genomes, skipping dRep");
        }
        for (index, (cluster, genomes)) in multi.iter().enumerate() {
            let files: Vec<PathBuf> = genomes
                .iter()
                .filter_map(|genome| linked.genome_files.get(genome).cloned())
                .collect();
            log::info!("Dereplicating genus cluster '{cluster}' (n = {})", files.len());
            let outdir = self.config.layout.drep.join(format!("genus_cluster_{}", index + 1));
            secondary.extend(run_drep(self.runner, &files, &outdir, self.config.threads)?);
        }

        let species = assign_species_clusters(genus, &secondary);
        log::info!("Clustering genomes at species level with dRep... Finished");
        Ok(species)
    }

    fn classify_taxonomy(
        &self,
        store: &mut MetadataStore,
        identify: &IdentifyManifest,
        proteins: &[FastaRecord],
        genome_map: &GenomeMap,
        genus: &GenusManifest,
    ) -> Result<(), ViwrapError> {
        log::info!("Classifying viral taxonomy... In processing...");
        let mut assignments = classify_proteins(
            self.runner,
            &identify.proteins,
            proteins,
            genome_map,
            &self.config.databases,
            &self.config.layout.taxonomy,
            self.config.threads,
        )?;

        let overview: Vec<GenomeOverview> = read_genome_overview(&genus.overview)?;
        let references = read_imgvr_taxonomy(&self.config.databases.imgvr_taxonomy())?;
        assignments
            .sources
            .insert(TaxonomySource::Vcontact2, vcontact2_taxonomy(&overview, &references, genome_map));

        for genome in genome_map.ids() {
            for (source, lineage) in assignments.for_genome(genome) {
                store.merge(genome, MetadataValue::Taxonomy(source, lineage), Stage::ClassifyTaxonomy);
            }
        }
        log::info!("Classifying viral taxonomy... Finished");
        Ok(())
    }

    fn predict_host(&self, store: &mut MetadataStore, linked: &LinkedManifest) -> Result<(), ViwrapError> {
        log::info!("Predicting hosts with iPHoP... In processing...");
        let dir = &self.config.layout.iphop;
        create_dir_all(dir)?;

        let default = run_iphop(
            self.runner,
            &linked.combined,
            &self.config.databases.iphop,
            &dir.join("iPHoP_default_db"),
            self.config.threads,
        )?;
        let mut predictions = read_predictions(&default, HostDbKind::Default)?;

        match &self.config.host {
            HostDatabase::Default => log::warn!("No custom host genomes provided, skipping custom iPHoP database"),
            HostDatabase::Build { mags, db } => {
                log::info!("Building custom iPHoP database from: {}", mags.display());
                build_custom_db(
                    self.runner,
                    mags,
                    &self.config.databases,
                    db,
                    &dir.join("custom_db_build"),
                    self.config.threads,
                )?;
            }
            HostDatabase::Prebuilt { db, .. } => log::info!("Using prebuilt custom iPHoP database: {}", db.display()),
        }

        if let Some(db) = self.config.host.custom_db() {
            let custom = run_iphop(self.runner, &linked.combined, db, &dir.join("iPHoP_custom_db"), self.config.threads)?;
            predictions.extend(read_predictions(&custom, HostDbKind::Custom)?);
        }

        for prediction in predictions {
            let genome = prediction.genome.clone();
            store.merge(&genome, MetadataValue::Host(prediction), Stage::PredictHost);
        }
        log::info!("Predicting hosts with iPHoP... Finished");
        Ok(())
    }

    fn summarize(
        &self,
        store: &MetadataStore,
        genome_map: &GenomeMap,
        sequences: &HashMap<String, FastaRecord>,
        proteins: &[FastaRecord],
        annotations: &[AnnotationRecord],
        sample_reads: Option<&[SampleReads]>,
    ) -> Result<SummaryManifest, ViwrapError> {
        log::info!("Writing summary tables... In processing...");
        let manifest = write_summary(store, &self.config.taxonomy_precedence, sample_reads, &self.config.layout.summary)?;
        write_genome_files(genome_map, sequences, proteins, &manifest.genome_files)?;
        write_annotation_results(genome_map, annotations, proteins, &manifest)?;

        if self.config.table {
            print_table(&summary_rows(store, &self.config.taxonomy_precedence));
        }
        log::info!("Writing summary tables... Finished");
        Ok(manifest)
    }

    fn visualize(&self, store: &MetadataStore) -> Result<Vec<PathBuf>, ViwrapError> {
        let dir = &self.config.layout.visualization;
        let inputs = dir.join("Result_visualization_inputs");
        let tables = write_visualization_inputs(store, &self.config.taxonomy_precedence, &inputs)?;

        match &self.config.visualizer {
            Some(script) => {
                log::info!("Plotting virus statistics... In processing...");
                let invocation = ToolInvocation::new(Tool::Visualizer, Stage::Visualize, dir)
                    .arg_path(script)
                    .arg_path(&inputs)
                    .arg_path(dir);
                self.runner.invoke(&invocation)?;
                log::info!("Plotting virus statistics... Finished");
            }
            None => log::warn!("No visualisation program configured, writing plot inputs only"),
        }
        Ok(tables)
    }
}

/// Genome abundance per sample from the per-scaffold coverage tables
fn merge_abundance(store: &mut MetadataStore, genome_map: &GenomeMap, mapping: &MappingManifest) -> Result<(), ViwrapError> {
    for sample in &mapping.samples {
        let coverage = read_coverage(&sample.coverage)?;
        for genome in genome_map.iter() {
            let abundance = genome_abundance(genome, &coverage, sample.reads);
            store.merge(&genome.id, MetadataValue::Abundance(sample.sample.clone(), abundance), Stage::Map);
        }
    }
    Ok(())
}

/// Membership table of the best vRhyme binning iteration, none when no bins were formed
pub fn find_best_bins(dir: &Path) -> Result<Option<PathBuf>, ViwrapError> {
    let pattern = Regex::new(BEST_BINS_PATTERN)?;
    if !dir.is_dir() {
        return Err(ViwrapError::OutputPatternNotFound {
            pattern: BEST_BINS_PATTERN.to_string(),
            dir: dir.to_path_buf(),
        });
    }

    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if pattern.is_match(name) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}
