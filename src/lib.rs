//! ViWrap: viral genome recovery from metagenome assemblies.
//!
//! Identification, binning, clustering, quality control, taxonomy and host
//! prediction are delegated to external tools behind [`tool::ToolRunner`].
//! This crate reconciles their outputs into one set of viral genomes and a
//! per-genome metadata summary.

pub mod abundance;
pub mod annotation;
pub mod cluster;
pub mod config;
pub mod error;
pub mod genome;
pub mod host;
pub mod identify;
pub mod metadata;
pub mod pipeline;
pub mod summary;
pub mod taxonomy;
pub mod terminal;
pub mod tool;
pub mod utils;
