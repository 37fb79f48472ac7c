//! The association scan: filter, join, fit and write, per variant

use crate::{
    filter::{check_variant, SkipReason},
    join::SampleJoiner,
    model::{AssociationModel, ModelLoader},
    output::{AssociationResult, ResultSink, ResultWriter},
    partition::Partition,
    samples::load_sample_table,
    utils::{log_memory_usage, log_progress, Timer},
    validate_scan_config,
    vcf::{GenotypeSource, VcfSource},
    GwasError, GwasResult, ModelErrorPolicy, ScanConfig, VariantRecord, WorkerFailurePolicy,
};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Counters for one scan, or one partition of it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub processed: usize,
    pub written: usize,
    pub skipped_not_snv: usize,
    pub skipped_no_dosage: usize,
    pub skipped_no_samples: usize,
    pub model_failures: usize,
}

impl ScanStats {
    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NotBiallelicSnv => self.skipped_not_snv += 1,
            SkipReason::MissingDosage => self.skipped_no_dosage += 1,
            SkipReason::NoCompleteSamples => self.skipped_no_samples += 1,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_not_snv + self.skipped_no_dosage + self.skipped_no_samples
    }

    pub fn merge(&mut self, other: &ScanStats) {
        self.processed += other.processed;
        self.written += other.written;
        self.skipped_not_snv += other.skipped_not_snv;
        self.skipped_no_dosage += other.skipped_no_dosage;
        self.skipped_no_samples += other.skipped_no_samples;
        self.model_failures += other.model_failures;
    }

    pub fn log_summary(&self) {
        log::info!("Scan summary:");
        log::info!("  Variants processed: {}", self.processed);
        log::info!("  Results written: {}", self.written);
        log::info!("  Variants skipped: {}", self.skipped());
        log::info!("  Skipped INDEL/MULTI-ALLELIC: {}", self.skipped_not_snv);
        log::info!("  Skipped without dosage: {}", self.skipped_no_dosage);
        log::info!("  Skipped without complete samples: {}", self.skipped_no_samples);
        if self.model_failures > 0 {
            log::warn!(
                "  {} variants dropped after model failures",
                self.model_failures
            );
        }
    }
}

/// State of one scan worker: the loaded model, the shared join, and counters
pub struct ScanContext<'a> {
    label: String,
    joiner: &'a SampleJoiner<'a>,
    model: Box<dyn AssociationModel>,
    config: &'a ScanConfig,
    stats: ScanStats,
}

impl<'a> ScanContext<'a> {
    pub fn new(
        label: &str,
        joiner: &'a SampleJoiner<'a>,
        model: Box<dyn AssociationModel>,
        config: &'a ScanConfig,
    ) -> Self {
        ScanContext {
            label: label.to_string(),
            joiner,
            model,
            config,
            stats: ScanStats::default(),
        }
    }

    pub fn into_stats(self) -> ScanStats {
        self.stats
    }

    /// Filter, join and fit one variant, handing any result to the sink
    pub fn process<S: ResultSink + ?Sized>(
        &mut self,
        record: VariantRecord,
        sink: &mut S,
    ) -> GwasResult<()> {
        self.stats.processed += 1;
        let outcome = self.fit_variant(&record, sink);
        log_progress(
            &self.label,
            self.stats.processed,
            self.stats.written,
            self.config.progress_interval,
        );
        outcome
    }

    fn skip(&mut self, record: &VariantRecord, reason: SkipReason) {
        log::info!("{}: skipping {} {}", self.label, reason, record.locus());
        self.stats.record_skip(reason);
    }

    fn fit_variant<S: ResultSink + ?Sized>(
        &mut self,
        record: &VariantRecord,
        sink: &mut S,
    ) -> GwasResult<()> {
        if let Err(reason) = check_variant(record) {
            self.skip(record, reason);
            return Ok(());
        }

        let dosages = record.dosages.as_deref().unwrap_or_default();
        let table = self.joiner.join(dosages);
        if table.is_empty() {
            self.skip(record, SkipReason::NoCompleteSamples);
            return Ok(());
        }

        match self.model.fit(&table) {
            Ok(fit) => {
                sink.accept(AssociationResult::new(record, fit, table.n_rows()))?;
                self.stats.written += 1;
                Ok(())
            }
            Err(e) if e.is_fatal() || self.config.model_error_policy == ModelErrorPolicy::Abort => {
                Err(GwasError::ModelInvocation(format!(
                    "{} at {}",
                    e,
                    record.locus()
                )))
            }
            Err(e) => {
                log::warn!(
                    "{}: model failed at {}, skipping: {}",
                    self.label,
                    record.locus(),
                    e
                );
                self.stats.model_failures += 1;
                Ok(())
            }
        }
    }

    /// Process a whole variant stream
    pub fn run<I, S>(&mut self, variants: I, sink: &mut S) -> GwasResult<()>
    where
        I: Iterator<Item = GwasResult<VariantRecord>>,
        S: ResultSink + ?Sized,
    {
        for record in variants {
            self.process(record?, sink)?;
        }
        Ok(())
    }
}

/// Outcome of a finished scan
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub stats: ScanStats,
    pub partitions: usize,
    pub failed_partitions: Vec<usize>,
}

/// Scan one partition on the calling worker, buffering its results
fn scan_partition<G, L>(
    source: &G,
    partition: &Partition,
    joiner: &SampleJoiner<'_>,
    loader: &L,
    config: &ScanConfig,
) -> GwasResult<(Vec<AssociationResult>, ScanStats)>
where
    G: GenotypeSource + ?Sized,
    L: ModelLoader + ?Sized,
{
    log::debug!("Starting {}", partition);
    let label = format!("partition {}", partition.index);
    let mut context = ScanContext::new(&label, joiner, loader.load()?, config);
    let mut results = Vec::new();
    context.run(source.partition_variants(partition)?, &mut results)?;

    let stats = context.into_stats();
    log::info!(
        "{} finished: {} processed, {} written",
        label,
        stats.processed,
        stats.written
    );
    Ok((results, stats))
}

/// Run the scan and write the output table.
///
/// The model is loaded once up front, and with more than one worker the source
/// is partitioned before the output file is created, so those failures leave
/// no output behind. Single-worker runs stream results straight to the file;
/// partitioned runs buffer each partition and write them in partition order.
pub fn run_scan<G, L>(
    source: &G,
    joiner: &SampleJoiner<'_>,
    loader: &L,
    config: &ScanConfig,
    out_path: &Path,
) -> GwasResult<ScanSummary>
where
    G: GenotypeSource + ?Sized,
    L: ModelLoader + ?Sized,
{
    validate_scan_config(config)?;
    let model = loader.load()?;

    if config.workers <= 1 {
        let mut writer = ResultWriter::create(out_path)?;
        let mut context = ScanContext::new("scan", joiner, model, config);
        let outcome = source
            .variants()
            .and_then(|variants| context.run(variants, &mut writer));
        let finished = writer.finish();
        outcome?;
        finished?;

        return Ok(ScanSummary {
            stats: context.into_stats(),
            partitions: 1,
            failed_partitions: Vec::new(),
        });
    }

    let partitions = source.partitions(config.workers)?;
    drop(model);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(partitions.len())
        .build()?;
    let mut writer = ResultWriter::create(out_path)?;

    let outcomes: Vec<GwasResult<(Vec<AssociationResult>, ScanStats)>> = pool.install(|| {
        partitions
            .par_iter()
            .map(|partition| scan_partition(source, partition, joiner, loader, config))
            .collect()
    });

    let mut summary = ScanSummary {
        partitions: partitions.len(),
        ..ScanSummary::default()
    };

    for (partition, outcome) in partitions.iter().zip(outcomes) {
        match outcome {
            Ok((results, stats)) => {
                for result in results {
                    writer.accept(result)?;
                }
                summary.stats.merge(&stats);
            }
            Err(e) => match config.worker_failure_policy {
                WorkerFailurePolicy::Abort => {
                    log::error!("{} failed, aborting the run", partition);
                    writer.finish()?;
                    return Err(e);
                }
                WorkerFailurePolicy::Continue => {
                    log::error!("{} failed, its variants are omitted: {}", partition, e);
                    summary.failed_partitions.push(partition.index);
                }
            },
        }
    }

    writer.finish()?;

    if !summary.failed_partitions.is_empty() {
        log::warn!(
            "{} of {} partitions failed: {:?}",
            summary.failed_partitions.len(),
            summary.partitions,
            summary.failed_partitions
        );
    }

    Ok(summary)
}

/// Input and output paths of a scan
#[derive(Debug, Clone)]
pub struct ScanPaths {
    pub vcf: PathBuf,
    pub pheno: PathBuf,
    pub covar: PathBuf,
    pub out: PathBuf,
}

/// Load the sample table, open the VCF, align samples and run the scan.
///
/// The tabular inputs are validated before the genotype source is opened.
pub fn execute<L: ModelLoader + ?Sized>(
    paths: &ScanPaths,
    loader: &L,
    config: &ScanConfig,
) -> GwasResult<ScanSummary> {
    validate_scan_config(config)?;

    let table = {
        let _timer = Timer::new("Loading sample table");
        load_sample_table(&paths.pheno, &paths.covar, &config.id_column, config.join_mode)?
    };
    log_memory_usage("after loading sample table");

    let source = VcfSource::open(&paths.vcf, &config.dosage_field)?;
    let joiner = SampleJoiner::new(
        &table,
        source.samples(),
        config.join_mode,
        config.required_columns.as_deref(),
    )?;

    let _timer = Timer::new("Association scan");
    let summary = run_scan(&source, &joiner, loader, config, &paths.out)?;
    summary.stats.log_summary();
    log_memory_usage("after scan");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::AnalysisTable;
    use crate::model::{ModelError, ModelFit};
    use crate::partition::{partition_contigs, Contig};
    use crate::samples::SampleTable;
    use crate::vcf::VariantStream;
    use crate::JoinMode;
    use std::io::Write;
    use tempfile::TempDir;

    /// In-memory genotype source; sorted records, header-order contigs
    struct MemorySource {
        samples: Vec<String>,
        contigs: Vec<Contig>,
        records: Vec<VariantRecord>,
        indexed: bool,
    }

    impl GenotypeSource for MemorySource {
        fn samples(&self) -> &[String] {
            &self.samples
        }

        fn variants(&self) -> GwasResult<VariantStream<'_>> {
            Ok(Box::new(self.records.iter().cloned().map(Ok)))
        }

        fn partitions(&self, parts: usize) -> GwasResult<Vec<Partition>> {
            if !self.indexed {
                return Err(GwasError::Partition("not indexed".to_string()));
            }
            Ok(partition_contigs(&self.contigs, parts))
        }

        fn partition_variants(&self, partition: &Partition) -> GwasResult<VariantStream<'_>> {
            let mut selected = Vec::new();
            for region in &partition.regions {
                selected.extend(
                    self.records
                        .iter()
                        .filter(|r| r.chrom == region.contig && region.contains_start(r.pos - 1))
                        .cloned(),
                );
            }
            Ok(Box::new(selected.into_iter().map(Ok)))
        }
    }

    struct FixedModel;

    impl AssociationModel for FixedModel {
        fn fit(&mut self, _table: &AnalysisTable<'_>) -> Result<ModelFit, ModelError> {
            Ok(ModelFit {
                estimate: 1.0,
                se: 0.1,
                p: 0.05,
            })
        }
    }

    /// Reports N as the estimate and the dosage sum as the standard error
    struct EchoModel;

    impl AssociationModel for EchoModel {
        fn fit(&mut self, table: &AnalysisTable<'_>) -> Result<ModelFit, ModelError> {
            Ok(ModelFit {
                estimate: table.n_rows() as f64,
                se: table.dosages().iter().map(|&d| d as f64).sum(),
                p: 0.5,
            })
        }
    }

    /// Fails whenever the first sample carries the given dosage
    struct FailOnDosage {
        dosage: f32,
        fatal: bool,
    }

    impl AssociationModel for FailOnDosage {
        fn fit(&mut self, table: &AnalysisTable<'_>) -> Result<ModelFit, ModelError> {
            if table.dosage(0) == Some(self.dosage) {
                if self.fatal {
                    return Err(ModelError::ProcessExited("exit status: 1".to_string()));
                }
                return Err(ModelError::Failed("non-finite coefficient".to_string()));
            }
            EchoModel.fit(table)
        }
    }

    fn fixed() -> GwasResult<Box<dyn AssociationModel>> {
        Ok(Box::new(FixedModel))
    }

    fn echo() -> GwasResult<Box<dyn AssociationModel>> {
        Ok(Box::new(EchoModel))
    }

    fn failing() -> GwasResult<Box<dyn AssociationModel>> {
        Ok(Box::new(FailOnDosage {
            dosage: 1.5,
            fatal: false,
        }))
    }

    fn write_file(dir: &TempDir, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn sample_table(dir: &TempDir) -> SampleTable {
        let pheno = write_file(dir, "pheno.txt", &["IID Y", "S1 1", "S2 0", "S3 1"]);
        let covar = write_file(dir, "covar.txt", &["IID AGE", "S1 40", "S2 50", "S3 60"]);
        load_sample_table(&pheno, &covar, "IID", JoinMode::Inner).unwrap()
    }

    fn snv(chrom: &str, pos: u64, dosages: Option<Vec<f32>>) -> VariantRecord {
        VariantRecord::new(
            chrom.to_string(),
            pos,
            format!("{}_{}", chrom, pos),
            "A".to_string(),
            vec!["G".to_string()],
            dosages,
        )
    }

    fn source(records: Vec<VariantRecord>) -> MemorySource {
        MemorySource {
            samples: vec!["S1".to_string(), "S2".to_string(), "S3".to_string()],
            contigs: vec![
                Contig {
                    name: "chr1".to_string(),
                    length: Some(1000),
                },
                Contig {
                    name: "chr2".to_string(),
                    length: Some(600),
                },
                Contig {
                    name: "chrUn".to_string(),
                    length: None,
                },
            ],
            records,
            indexed: true,
        }
    }

    fn genome_wide_records() -> Vec<VariantRecord> {
        let mut records = Vec::new();
        for i in 0..40u64 {
            let chrom = if i < 25 { "chr1" } else { "chr2" };
            let pos = if i < 25 { 1 + i * 40 } else { 1 + (i - 25) * 40 };
            let d = (i % 3) as f32;
            let dosages = match i % 7 {
                0 => None,
                3 => Some(vec![f32::NAN, d, 1.0]),
                _ => Some(vec![d, 0.5, 2.0 - d]),
            };
            let mut record = snv(chrom, pos, dosages);
            if i % 11 == 5 {
                record.ref_allele = "AC".to_string();
            }
            records.push(record);
        }
        records.push(snv("chrUn", 10, Some(vec![1.0, 1.0, 1.0])));
        records
    }

    fn data_rows(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(1)
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_variant_without_dosage_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let source = source(vec![
            snv("chr1", 100, Some(vec![0.0, 1.0, 2.0])),
            snv("chr1", 200, None),
        ]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");

        let summary = run_scan(&source, &joiner, &fixed, &ScanConfig::default(), &out).unwrap();

        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "CHR POS SNP REF ALT ESTIMATE SE P N\nchr1 100 chr1_100 A G 1.0 0.1 0.05 3\n"
        );
        assert_eq!(summary.stats.processed, 2);
        assert_eq!(summary.stats.written, 1);
        assert_eq!(summary.stats.skipped_no_dosage, 1);
    }

    #[test]
    fn test_row_count_matches_skips() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let mut indel = snv("chr1", 300, Some(vec![1.0, 1.0, 1.0]));
        indel.alt_alleles = vec!["GT".to_string()];
        let mut multi = snv("chr1", 400, Some(vec![1.0, 1.0, 1.0]));
        multi.alt_alleles = vec!["G".to_string(), "T".to_string()];

        let records = vec![
            snv("chr1", 100, Some(vec![0.0, 1.0, 2.0])),
            snv("chr1", 200, Some(vec![f32::NAN, f32::NAN, f32::NAN])),
            indel,
            multi,
            snv("chr1", 500, Some(vec![1.0, 1.5, 1.0])),
            snv("chr1", 600, Some(vec![2.0, 2.0, f32::NAN])),
        ];
        let source = source(records);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");
        let config = ScanConfig {
            model_error_policy: ModelErrorPolicy::Skip,
            ..ScanConfig::default()
        };

        let summary = run_scan(&source, &joiner, &failing, &config, &out).unwrap();
        let stats = &summary.stats;

        assert_eq!(stats.processed, 6);
        assert_eq!(stats.skipped_not_snv, 2);
        assert_eq!(stats.skipped_no_dosage, 1);
        // only a leading 1.5 dosage fails the model
        assert_eq!(stats.model_failures, 0);
        assert_eq!(
            stats.written,
            stats.processed - stats.skipped() - stats.model_failures
        );

        let rows = data_rows(&out);
        assert_eq!(rows.len(), stats.written);
        assert_eq!(
            rows,
            vec![
                "chr1 100 chr1_100 A G 3.0 3.0 0.5 3",
                "chr1 500 chr1_500 A G 3.0 3.5 0.5 3",
                "chr1 600 chr1_600 A G 2.0 4.0 0.5 2",
            ]
        );
    }

    #[test]
    fn test_n_reflects_per_variant_missingness() {
        let dir = tempfile::tempdir().unwrap();
        let pheno = write_file(&dir, "pheno.txt", &["IID Y", "S1 1", "S2 0", "S3 1", "S4 0"]);
        let covar = write_file(&dir, "covar.txt", &["IID AGE", "S1 40", "S2 NA", "S3 60", "S4 70"]);
        let table = load_sample_table(&pheno, &covar, "IID", JoinMode::Inner).unwrap();
        let source = source(vec![
            snv("chr1", 100, Some(vec![0.0, 1.0, 2.0])),
            snv("chr1", 200, Some(vec![f32::NAN, 1.0, 2.0])),
            snv("chr1", 300, Some(vec![f32::NAN, 1.0, f32::NAN])),
        ]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");

        let summary = run_scan(&source, &joiner, &echo, &ScanConfig::default(), &out).unwrap();

        // S2 lacks AGE, S4 is not genotyped
        let n: Vec<usize> = data_rows(&out)
            .iter()
            .map(|row| row.rsplit(' ').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(n, vec![2, 1]);
        assert!(n.iter().all(|&n| n <= table.n_samples()));
        assert_eq!(summary.stats.skipped_no_samples, 1);
    }

    #[test]
    fn test_partitioned_output_matches_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let source = source(genome_wide_records());
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();

        let single = dir.path().join("single.txt");
        let single_summary =
            run_scan(&source, &joiner, &echo, &ScanConfig::default(), &single).unwrap();
        let expected = std::fs::read(&single).unwrap();
        assert!(single_summary.stats.written > 10);

        for workers in [2, 3, 4, 8] {
            let out = dir.path().join(format!("workers{}.txt", workers));
            let config = ScanConfig {
                workers,
                ..ScanConfig::default()
            };
            let summary = run_scan(&source, &joiner, &echo, &config, &out).unwrap();

            assert!(summary.partitions > 1 && summary.partitions <= workers);
            assert_eq!(summary.stats, single_summary.stats);
            assert_eq!(std::fs::read(&out).unwrap(), expected, "workers = {}", workers);
        }
    }

    #[test]
    fn test_model_error_abort_keeps_prior_rows() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let source = source(vec![
            snv("chr1", 100, Some(vec![0.0, 1.0, 2.0])),
            snv("chr1", 200, Some(vec![1.5, 1.0, 2.0])),
            snv("chr1", 300, Some(vec![1.0, 1.0, 2.0])),
        ]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");

        let result = run_scan(&source, &joiner, &failing, &ScanConfig::default(), &out);
        match result {
            Err(GwasError::ModelInvocation(msg)) => assert!(msg.contains("chr1:200")),
            other => panic!("Expected ModelInvocation error, got {:?}", other),
        }

        let rows = data_rows(&out);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].starts_with("chr1 100 "));
    }

    #[test]
    fn test_model_error_skip_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let source = source(vec![
            snv("chr1", 100, Some(vec![0.0, 1.0, 2.0])),
            snv("chr1", 200, Some(vec![1.5, 1.0, 2.0])),
            snv("chr1", 300, Some(vec![1.0, 1.0, 2.0])),
        ]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");
        let config = ScanConfig {
            model_error_policy: ModelErrorPolicy::Skip,
            ..ScanConfig::default()
        };

        let summary = run_scan(&source, &joiner, &failing, &config, &out).unwrap();
        assert_eq!(summary.stats.model_failures, 1);
        assert_eq!(summary.stats.written, 2);

        let rows = data_rows(&out);
        assert!(rows[0].starts_with("chr1 100 "));
        assert!(rows[1].starts_with("chr1 300 "));
    }

    #[test]
    fn test_dead_model_process_is_fatal_even_when_skipping() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let source = source(vec![snv("chr1", 100, Some(vec![1.5, 1.0, 2.0]))]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");
        let config = ScanConfig {
            model_error_policy: ModelErrorPolicy::Skip,
            ..ScanConfig::default()
        };
        let dying = || -> GwasResult<Box<dyn AssociationModel>> {
            Ok(Box::new(FailOnDosage {
                dosage: 1.5,
                fatal: true,
            }))
        };

        assert!(matches!(
            run_scan(&source, &joiner, &dying, &config, &out),
            Err(GwasError::ModelInvocation(_))
        ));
    }

    #[test]
    fn test_worker_failure_policies() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        // two workers split at chr1:800, so the chr2 failure lands in partition 1
        let source = source(vec![
            snv("chr1", 100, Some(vec![0.0, 1.0, 2.0])),
            snv("chr1", 500, Some(vec![1.0, 1.0, 2.0])),
            snv("chr2", 100, Some(vec![1.5, 1.0, 2.0])),
            snv("chr2", 500, Some(vec![0.0, 1.0, 2.0])),
        ]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();

        let out = dir.path().join("continue.txt");
        let config = ScanConfig {
            workers: 2,
            worker_failure_policy: WorkerFailurePolicy::Continue,
            ..ScanConfig::default()
        };
        let summary = run_scan(&source, &joiner, &failing, &config, &out).unwrap();
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.failed_partitions, vec![1]);
        let rows = data_rows(&out);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.starts_with("chr1 ")));

        // with chr2 declared first the failing partition comes first
        let mut reordered = source;
        reordered.contigs.swap(0, 1);
        reordered.records.rotate_left(2);
        let out = dir.path().join("abort.txt");
        let config = ScanConfig {
            workers: 2,
            ..ScanConfig::default()
        };
        assert!(matches!(
            run_scan(&reordered, &joiner, &failing, &config, &out),
            Err(GwasError::ModelInvocation(_))
        ));
        assert!(data_rows(&out).is_empty());
    }

    #[test]
    fn test_unindexed_source_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let mut source = source(vec![snv("chr1", 100, Some(vec![0.0, 1.0, 2.0]))]);
        source.indexed = false;
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");
        let config = ScanConfig {
            workers: 4,
            ..ScanConfig::default()
        };

        assert!(matches!(
            run_scan(&source, &joiner, &fixed, &config, &out),
            Err(GwasError::Partition(_))
        ));
        assert!(!out.exists());
    }

    #[test]
    fn test_model_load_failure_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(&dir);
        let source = source(vec![snv("chr1", 100, Some(vec![0.0, 1.0, 2.0]))]);
        let joiner = SampleJoiner::new(&table, source.samples(), JoinMode::Inner, None).unwrap();
        let out = dir.path().join("out.txt");
        let broken = || -> GwasResult<Box<dyn AssociationModel>> {
            Err(GwasError::ModelInvocation("object 'fit' not found".to_string()))
        };

        assert!(run_scan(&source, &joiner, &broken, &ScanConfig::default(), &out).is_err());
        assert!(!out.exists());
    }

    fn write_vcf(dir: &TempDir) -> PathBuf {
        write_file(
            dir,
            "calls.vcf",
            &[
                "##fileformat=VCFv4.2",
                "##contig=<ID=1,length=10000>",
                "##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">",
                "##FORMAT=<ID=DS,Number=1,Type=Float,Description=\"Dosage\">",
                "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3",
                "1\t100\trs1\tA\tG\t.\tPASS\t.\tGT:DS\t0/1:1\t0/0:0\t1/1:2",
                "1\t200\trs2\tC\tT\t.\tPASS\t.\tGT\t0/1\t0/0\t1/1",
                "1\t300\trs3\tCA\tC\t.\tPASS\t.\tGT:DS\t0/1:1\t0/0:0\t1/1:2",
                "1\t400\trs4\tG\tA\t.\tPASS\t.\tGT:DS\t0/1:1\t0/0:.\t1/1:2",
            ],
        )
    }

    #[test]
    fn test_execute_on_vcf() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ScanPaths {
            vcf: write_vcf(&dir),
            pheno: write_file(&dir, "pheno.txt", &["IID Y", "S1 1", "S2 0", "S3 1"]),
            covar: write_file(&dir, "covar.txt", &["IID AGE", "S1 40", "S2 50", "S3 60"]),
            out: dir.path().join("out.txt"),
        };

        let summary = execute(&paths, &echo, &ScanConfig::default()).unwrap();
        assert_eq!(summary.stats.processed, 4);
        assert_eq!(
            data_rows(&paths.out),
            vec!["1 100 rs1 A G 3.0 3.0 0.5 3", "1 400 rs4 G A 2.0 3.0 0.5 2"]
        );
    }

    #[test]
    fn test_execute_indexed_vcf_matches_across_workers() {
        let dir = tempfile::tempdir().unwrap();
        let vcf = crate::vcf::fixtures::write_indexed_vcf(dir.path());
        let pheno = write_file(&dir, "pheno.txt", &["IID Y", "S1 1", "S2 0", "S3 1"]);
        let covar = write_file(&dir, "covar.txt", &["IID AGE", "S1 40", "S2 50", "S3 60"]);

        let mut outputs = Vec::new();
        for workers in [1, 3] {
            let paths = ScanPaths {
                vcf: vcf.clone(),
                pheno: pheno.clone(),
                covar: covar.clone(),
                out: dir.path().join(format!("workers{}.txt", workers)),
            };
            let config = ScanConfig {
                workers,
                ..ScanConfig::default()
            };
            let summary = execute(&paths, &echo, &config).unwrap();
            assert_eq!(summary.stats.processed, 9);
            assert_eq!(summary.stats.skipped_not_snv, 1);
            assert_eq!(summary.stats.skipped_no_dosage, 1);
            outputs.push(std::fs::read(&paths.out).unwrap());
        }

        assert_eq!(outputs[0], outputs[1]);
        let rows = data_rows(&dir.path().join("workers3.txt"));
        let ids: Vec<&str> = rows.iter().map(|r| r.split(' ').nth(2).unwrap()).collect();
        assert_eq!(ids, vec!["rs1", "rs3", "rs4", "rs6", "rs7", "rs8", "rs9"]);
    }

    #[test]
    fn test_execute_join_error_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ScanPaths {
            vcf: write_vcf(&dir),
            pheno: write_file(&dir, "pheno.txt", &["IID Y", "S1 1", "S2 0"]),
            covar: write_file(&dir, "covar.txt", &["IID AGE", "X1 40", "X2 50"]),
            out: dir.path().join("out.txt"),
        };

        assert!(matches!(
            execute(&paths, &fixed, &ScanConfig::default()),
            Err(GwasError::Join(_))
        ));
        assert!(!paths.out.exists());
    }

    #[test]
    fn test_execute_checks_phenotype_before_vcf() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ScanPaths {
            vcf: dir.path().join("missing.vcf.gz"),
            pheno: write_file(&dir, "pheno.txt", &["SAMPLE Y", "S1 1"]),
            covar: write_file(&dir, "covar.txt", &["IID AGE", "S1 40"]),
            out: dir.path().join("out.txt"),
        };

        match execute(&paths, &fixed, &ScanConfig::default()) {
            Err(GwasError::InputFile { path, reason }) => {
                assert!(path.ends_with("pheno.txt"));
                assert!(reason.contains("IID"));
            }
            other => panic!("Expected InputFile error, got {:?}", other),
        }
        assert!(!paths.out.exists());
    }
}
