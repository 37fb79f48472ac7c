//! # custom-gwas - per-variant association scans over VCF dosages
//!
//! For each biallelic SNV in a VCF/BCF file the scan joins per-sample dosage
//! with a phenotype and covariate table, hands the combined table to a
//! user-supplied model, and writes one association record per fitted variant.

pub mod filter;
pub mod join;
pub mod model;
pub mod output;
pub mod partition;
pub mod samples;
pub mod scan;
pub mod utils;
pub mod vcf;

use serde::{Deserialize, Serialize};

/// Name of the identity column expected in phenotype and covariate files
pub const SAMPLE_ID_COLUMN: &str = "IID";

/// Name under which the per-variant dosage is handed to the model
pub const DOSAGE_COLUMN: &str = "DOSAGE";

/// A genomic variant as read from the genotype source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub chrom: String,
    /// 1-based position
    pub pos: u64,
    pub id: String,
    pub ref_allele: String,
    pub alt_alleles: Vec<String>,
    /// One value per genotype sample (NaN when missing); `None` when the
    /// dosage field is absent from the record.
    pub dosages: Option<Vec<f32>>,
}

impl VariantRecord {
    pub fn new(
        chrom: String,
        pos: u64,
        id: String,
        ref_allele: String,
        alt_alleles: Vec<String>,
        dosages: Option<Vec<f32>>,
    ) -> Self {
        Self {
            chrom,
            pos,
            id,
            ref_allele,
            alt_alleles,
            dosages,
        }
    }

    /// Alternate alleles joined the way they appear in the VCF ALT column
    pub fn alt_display(&self) -> String {
        if self.alt_alleles.is_empty() {
            ".".to_string()
        } else {
            self.alt_alleles.join(",")
        }
    }

    /// Short `chrom:pos ref>alt` label for log lines
    pub fn locus(&self) -> String {
        format!(
            "{}:{} {}>{}",
            self.chrom,
            self.pos,
            self.ref_allele,
            self.alt_display()
        )
    }
}

/// How sample identities are matched between the tabular inputs and the
/// genotype source. The same mode is applied at every join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum JoinMode {
    /// Keep only samples present on both sides
    Inner,
    /// Keep every sample of the left side; gaps become missing values
    Left,
}

/// What to do when the model fails on a single variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelErrorPolicy {
    /// Stop the run (or the worker's partition)
    Abort,
    /// Drop the variant, count the failure and keep going
    Skip,
}

/// What to do when a worker fails its whole partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkerFailurePolicy {
    /// Fail the run after writing the partitions that precede the failure
    Abort,
    /// Log the failed partition, omit its rows and finish the run
    Continue,
}

/// Configuration parameters for an association scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub join_mode: JoinMode,
    pub id_column: String,
    pub dosage_field: String,
    /// Columns that must be non-missing for a sample to enter the fit.
    /// `None` means every sample-table column plus `DOSAGE`.
    pub required_columns: Option<Vec<String>>,
    pub model_error_policy: ModelErrorPolicy,
    pub worker_failure_policy: WorkerFailurePolicy,
    pub workers: usize,
    pub progress_interval: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            join_mode: JoinMode::Inner,
            id_column: SAMPLE_ID_COLUMN.to_string(),
            dosage_field: "DS".to_string(),
            required_columns: None,
            model_error_policy: ModelErrorPolicy::Abort,
            worker_failure_policy: WorkerFailurePolicy::Abort,
            workers: 1,
            progress_interval: 10_000,
        }
    }
}

/// Validate scan configuration parameters
pub fn validate_scan_config(config: &ScanConfig) -> GwasResult<()> {
    if config.workers == 0 {
        return Err(GwasError::InvalidConfig(
            "number of workers must be at least 1".to_string(),
        ));
    }

    if config.progress_interval == 0 {
        return Err(GwasError::InvalidConfig(
            "progress interval must be at least 1".to_string(),
        ));
    }

    if config.dosage_field.trim().is_empty() {
        return Err(GwasError::InvalidConfig(
            "dosage field name must not be empty".to_string(),
        ));
    }

    if config.id_column.trim().is_empty() {
        return Err(GwasError::InvalidConfig(
            "sample identity column name must not be empty".to_string(),
        ));
    }

    if let Some(columns) = &config.required_columns {
        if columns.iter().any(|c| c.trim().is_empty()) {
            return Err(GwasError::InvalidConfig(
                "required column names must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Error types for the association scan
#[derive(Debug, thiserror::Error)]
pub enum GwasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTSlib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Input file {path}: {reason}")]
    InputFile { path: String, reason: String },

    #[error("Join error: {0}")]
    Join(String),

    #[error("Partition error: {0}")]
    Partition(String),

    #[error("Model invocation error: {0}")]
    ModelInvocation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GwasError {
    pub fn input_file<P: AsRef<std::path::Path>>(path: P, reason: impl Into<String>) -> Self {
        GwasError::InputFile {
            path: path.as_ref().to_string_lossy().to_string(),
            reason: reason.into(),
        }
    }
}

pub type GwasResult<T> = Result<T, GwasError>;
