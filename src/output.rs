//! Association result records and the output table writer

use crate::{model::ModelFit, utils::has_extension, GwasResult, VariantRecord};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Output header, in column order
pub const OUTPUT_HEADER: [&str; 9] = ["CHR", "POS", "SNP", "REF", "ALT", "ESTIMATE", "SE", "P", "N"];

/// One output row per fitted variant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationResult {
    pub chrom: String,
    pub pos: u64,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    pub estimate: f64,
    pub se: f64,
    pub p: f64,
    pub n: usize,
}

impl AssociationResult {
    pub fn new(record: &VariantRecord, fit: ModelFit, n: usize) -> Self {
        Self {
            chrom: record.chrom.clone(),
            pos: record.pos,
            id: record.id.clone(),
            ref_allele: record.ref_allele.clone(),
            alt_allele: record.alt_display(),
            estimate: fit.estimate,
            se: fit.se,
            p: fit.p,
            n,
        }
    }
}

/// Destination for results as the scan produces them
pub trait ResultSink {
    fn accept(&mut self, result: AssociationResult) -> GwasResult<()>;
}

/// Buffering sink: keeps a partition's results until the orchestrator
/// writes them in partition order
impl ResultSink for Vec<AssociationResult> {
    fn accept(&mut self, result: AssociationResult) -> GwasResult<()> {
        self.push(result);
        Ok(())
    }
}

enum OutputStream {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            OutputStream::Plain(w) => w.write(buf),
            OutputStream::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            OutputStream::Plain(w) => w.flush(),
            OutputStream::Gzip(w) => w.flush(),
        }
    }
}

impl OutputStream {
    fn finish(self) -> std::io::Result<()> {
        match self {
            OutputStream::Plain(mut w) => w.flush(),
            OutputStream::Gzip(w) => w.finish()?.flush(),
        }
    }
}

/// Streaming sink: writes the space-delimited output table as results arrive.
/// Gzip-compressed when the path ends in `.gz`.
pub struct ResultWriter {
    writer: csv::Writer<OutputStream>,
    written: usize,
}

impl ResultWriter {
    /// Create the output file and write the header row
    pub fn create<P: AsRef<Path>>(path: P) -> GwasResult<Self> {
        let file = BufWriter::new(File::create(&path)?);
        let stream = if has_extension(&path, "gz") {
            OutputStream::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            OutputStream::Plain(file)
        };

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_writer(stream);
        writer.write_record(OUTPUT_HEADER)?;

        Ok(ResultWriter { writer, written: 0 })
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and close the output, leaving a complete table on disk
    pub fn finish(self) -> GwasResult<()> {
        let stream = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::new(e.error().kind(), e.error().to_string()))?;
        stream.finish()?;
        Ok(())
    }
}

impl ResultSink for ResultWriter {
    fn accept(&mut self, result: AssociationResult) -> GwasResult<()> {
        self.writer.serialize(&result)?;
        self.written += 1;
        Ok(())
    }
}
