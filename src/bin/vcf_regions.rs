//! Print the partitions a multi-worker scan would use for a VCF/BCF file

use clap::Parser;
use custom_gwas_rs::{vcf::GenotypeSource, vcf::VcfSource, GwasError, GwasResult};
use env_logger::Env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vcf_regions")]
#[command(about = "Split an indexed VCF/BCF file into contiguous regions for parallel scans")]
struct Args {
    /// Path to the indexed VCF/BCF file
    #[arg(long, value_name = "FILE")]
    vcf: PathBuf,

    /// Number of partitions to produce (at most)
    #[arg(long, default_value_t = 1)]
    parts: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn run() -> GwasResult<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    if args.parts == 0 {
        return Err(GwasError::InvalidConfig(
            "number of parts must be at least 1".to_string(),
        ));
    }

    let source = VcfSource::open(&args.vcf, "DS")?;
    for partition in source.partitions(args.parts)? {
        let regions: Vec<String> = partition.regions.iter().map(|r| r.to_string()).collect();
        println!("{}\t{}", partition.index, regions.join(","));
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
