//! CLI binary for custom-gwas - per-variant association scan with a user-supplied model

use clap::Parser;
use custom_gwas_rs::{
    model::ScriptModelLoader,
    scan::{execute, ScanPaths},
    utils::{ensure_parent_dirs, format_file_size, get_num_cpus, validate_file_readable, Timer},
    GwasError, GwasResult, JoinMode, ModelErrorPolicy, ScanConfig, WorkerFailurePolicy,
    SAMPLE_ID_COLUMN,
};
use env_logger::Env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "custom_gwas")]
#[command(about = "custom-gwas - genome-wide association scan with a user-defined model")]
#[command(long_about = "
custom-gwas fits a user-defined association model once per variant of a VCF/BCF file.

For every biallelic SNV the per-sample dosage (FORMAT/DS by default) is joined with the
phenotype and covariate tables on the IID column, samples with missing required values
are dropped, and the resulting table is handed to the model as a data frame with a
DOSAGE column. The model must return estimate, se and p.

The model is an R script defining the function named by --model. One interpreter is
started per worker and reused for every variant of that worker.

With more than one worker the VCF must be bgzipped and indexed (.tbi or .csi). Output
rows are written in file order regardless of the number of workers:

  CHR POS SNP REF ALT ESTIMATE SE P N
")]
struct Args {
    /// Path to the genotype VCF/BCF file
    #[arg(long, value_name = "FILE")]
    vcf: PathBuf,

    /// Path to the phenotype table (whitespace-delimited, IID column)
    #[arg(long, value_name = "FILE")]
    pheno: PathBuf,

    /// Path to the covariate table (whitespace-delimited, IID column)
    #[arg(long, value_name = "FILE")]
    covar: PathBuf,

    /// Script defining the model function
    #[arg(long, value_name = "FILE")]
    model_script: PathBuf,

    /// Name of the model function in the script
    #[arg(long, value_name = "NAME")]
    model: String,

    /// Path to the output table (gzip-compressed if it ends in .gz)
    #[arg(long, value_name = "FILE")]
    out: PathBuf,

    /// Number of workers; 1 scans the file in a single pass without an index
    #[arg(long, default_value_t = get_num_cpus())]
    workers: usize,

    /// How samples are matched between the tables and the genotypes
    #[arg(long, value_enum, default_value_t = JoinMode::Inner)]
    join: JoinMode,

    /// Columns that must be non-missing for a sample to enter a fit
    /// [default: every table column plus DOSAGE]
    #[arg(long, value_delimiter = ',', value_name = "COLUMNS")]
    required_columns: Option<Vec<String>>,

    /// FORMAT field holding the dosage
    #[arg(long, default_value = "DS")]
    dosage_field: String,

    /// What to do when the model fails on a variant
    #[arg(long, value_enum, default_value_t = ModelErrorPolicy::Abort)]
    on_model_error: ModelErrorPolicy,

    /// What to do when a worker fails its partition
    #[arg(long, value_enum, default_value_t = WorkerFailurePolicy::Abort)]
    on_worker_failure: WorkerFailurePolicy,

    /// Interpreter that runs the model driver
    #[arg(long, default_value = "Rscript")]
    interpreter: String,

    /// Alternative model driver program [default: built-in R driver]
    #[arg(long, value_name = "FILE")]
    driver: Option<PathBuf>,

    /// Log progress every N processed variants
    #[arg(long, default_value_t = 10_000)]
    progress_every: usize,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force overwrite of output file if it exists
    #[arg(short, long)]
    force: bool,
}

impl Args {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            join_mode: self.join,
            id_column: SAMPLE_ID_COLUMN.to_string(),
            dosage_field: self.dosage_field.clone(),
            required_columns: self.required_columns.clone(),
            model_error_policy: self.on_model_error,
            worker_failure_policy: self.on_worker_failure,
            workers: self.workers,
            progress_interval: self.progress_every,
        }
    }

    fn model_loader(&self) -> ScriptModelLoader {
        let loader = ScriptModelLoader::new(&self.interpreter, &self.model_script, &self.model);
        match &self.driver {
            Some(driver) => loader.with_driver(driver),
            None => loader,
        }
    }
}

fn run() -> GwasResult<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    scan(&args)
}

/// Check the output path and run the scan. The VCF is only opened once the
/// phenotype and covariate tables have loaded.
fn scan(args: &Args) -> GwasResult<()> {
    log::info!("Starting custom-gwas scan");
    log::info!("Genotypes: {:?}", args.vcf);
    log::info!("Phenotypes: {:?}", args.pheno);
    log::info!("Covariates: {:?}", args.covar);
    log::info!("Model: {} from {:?}", args.model, args.model_script);
    log::info!("Output: {:?}", args.out);
    log::info!("Workers: {}", args.workers);

    validate_file_readable(&args.pheno)?;
    validate_file_readable(&args.covar)?;

    if args.out.exists() && !args.force {
        return Err(GwasError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("Output file {:?} already exists. Use --force to overwrite.", args.out),
        )));
    }
    ensure_parent_dirs(&args.out)?;

    let config = args.scan_config();
    let loader = args.model_loader();
    let paths = ScanPaths {
        vcf: args.vcf.clone(),
        pheno: args.pheno.clone(),
        covar: args.covar.clone(),
        out: args.out.clone(),
    };

    let _timer = Timer::new("custom-gwas");
    let summary = execute(&paths, &loader, &config)?;

    if !summary.failed_partitions.is_empty() {
        log::warn!(
            "Output is missing the variants of {} failed partitions",
            summary.failed_partitions.len()
        );
    }

    log::info!("Results written to: {:?}", args.out);
    if let Ok(size) = std::fs::metadata(&args.out).map(|m| m.len()) {
        log::info!("Output size: {}", format_file_size(size));
    }

    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: GwasError) -> ! {
    match error {
        GwasError::InputFile { path, reason } => {
            eprintln!("Error: Invalid input file {}: {}", path, reason);
            eprintln!("Phenotype and covariate files must be whitespace-delimited with an IID column.");
        }
        GwasError::Join(msg) => {
            eprintln!("Error: Sample join failed: {}", msg);
            eprintln!("Check that IIDs in the tables match the VCF sample names.");
        }
        GwasError::Partition(msg) => {
            eprintln!("Error: Cannot partition the genotype file: {}", msg);
            eprintln!("Index the VCF with `bcftools index`, or run with --workers 1.");
        }
        GwasError::ModelInvocation(msg) => {
            eprintln!("Error: Model invocation failed: {}", msg);
            eprintln!("Check the model script and function name, and that the interpreter is installed.");
            eprintln!("Use --on-model-error skip to drop variants the model cannot fit.");
        }
        GwasError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
        }
        GwasError::Htslib(ref e) => {
            eprintln!("Error: VCF/BCF processing error: {}", e);
            eprintln!("Please check that your VCF file is properly formatted.");
        }
        GwasError::Io(ref e) => {
            eprintln!("Error: I/O error: {}", e);
            eprintln!("Please check file permissions and disk space.");
        }
        GwasError::Csv(ref e) => {
            eprintln!("Error: Output writing error: {}", e);
        }
        GwasError::ThreadPool(ref e) => {
            eprintln!("Error: Could not start worker threads: {}", e);
            eprintln!("Try a smaller --workers value.");
        }
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    const REQUIRED: [&str; 13] = [
        "custom_gwas",
        "--vcf",
        "calls.vcf.gz",
        "--pheno",
        "pheno.txt",
        "--covar",
        "covar.txt",
        "--model-script",
        "model.R",
        "--model",
        "fit_lm",
        "--out",
        "out.txt",
    ];

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        let config = args.scan_config();

        assert_eq!(config.join_mode, JoinMode::Inner);
        assert_eq!(config.dosage_field, "DS");
        assert_eq!(config.required_columns, None);
        assert_eq!(config.model_error_policy, ModelErrorPolicy::Abort);
        assert_eq!(config.worker_failure_policy, WorkerFailurePolicy::Abort);
        assert_eq!(config.workers, get_num_cpus());
        assert_eq!(config.progress_interval, 10_000);

        let loader = args.model_loader();
        assert_eq!(loader.interpreter, "Rscript");
        assert_eq!(loader.driver, None);
        assert_eq!(loader.model, "fit_lm");
    }

    #[test]
    fn test_options() {
        let mut argv: Vec<&str> = REQUIRED.to_vec();
        argv.extend([
            "--workers",
            "4",
            "--join",
            "left",
            "--required-columns",
            "Y,AGE,DOSAGE",
            "--on-model-error",
            "skip",
            "--on-worker-failure",
            "continue",
            "--interpreter",
            "sh",
            "--driver",
            "driver.sh",
        ]);
        let args = Args::try_parse_from(argv).unwrap();
        let config = args.scan_config();

        assert_eq!(config.workers, 4);
        assert_eq!(config.join_mode, JoinMode::Left);
        assert_eq!(
            config.required_columns,
            Some(vec!["Y".to_string(), "AGE".to_string(), "DOSAGE".to_string()])
        );
        assert_eq!(config.model_error_policy, ModelErrorPolicy::Skip);
        assert_eq!(config.worker_failure_policy, WorkerFailurePolicy::Continue);
        assert_eq!(args.model_loader().driver, Some(PathBuf::from("driver.sh")));
    }

    #[test]
    fn test_phenotype_checked_before_vcf() {
        let dir = tempfile::tempdir().unwrap();
        let pheno = dir.path().join("pheno.txt");
        let covar = dir.path().join("covar.txt");
        let script = dir.path().join("model.R");
        std::fs::write(&pheno, "SAMPLE Y\nS1 1\n").unwrap();
        std::fs::write(&covar, "IID AGE\nS1 40\n").unwrap();
        std::fs::write(&script, "fit_lm <- function(df) NULL\n").unwrap();
        let missing_vcf = dir.path().join("missing.vcf.gz");
        let out = dir.path().join("out.txt");

        let argv: Vec<OsString> = vec![
            "custom_gwas".into(),
            "--vcf".into(),
            missing_vcf.into(),
            "--pheno".into(),
            pheno.clone().into(),
            "--covar".into(),
            covar.into(),
            "--model-script".into(),
            script.into(),
            "--model".into(),
            "fit_lm".into(),
            "--out".into(),
            out.clone().into(),
            "--workers".into(),
            "1".into(),
        ];
        let args = Args::try_parse_from(argv).unwrap();

        match scan(&args) {
            Err(GwasError::InputFile { path, reason }) => {
                assert_eq!(path, pheno.to_string_lossy());
                assert!(reason.contains("IID"), "{}", reason);
            }
            other => panic!("Expected InputFile error for the phenotype file, got {:?}", other),
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_missing_required_argument() {
        assert!(Args::try_parse_from(REQUIRED[..REQUIRED.len() - 2].iter().copied()).is_err());
        let mut argv: Vec<&str> = REQUIRED.to_vec();
        argv.extend(["--join", "outer"]);
        assert!(Args::try_parse_from(argv).is_err());
    }
}
