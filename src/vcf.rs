//! VCF/BCF genotype access through htslib

use crate::{
    partition::{partition_contigs, Contig, Partition, Region},
    samples::normalize_sample_id,
    GwasError, GwasResult, VariantRecord,
};
use rust_htslib::bcf::{self, header::HeaderRecord, Read};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Boxed stream of variant records, in source order
pub type VariantStream<'a> = Box<dyn Iterator<Item = GwasResult<VariantRecord>> + 'a>;

/// A genotype source the scan can stream in one pass or by partition.
///
/// Implementations must be shareable across worker threads; each call to
/// `variants` or `partition_variants` opens an independent stream.
pub trait GenotypeSource: Sync {
    /// Sample identities in genotype column order
    fn samples(&self) -> &[String];

    /// Stream every variant in file order
    fn variants(&self) -> GwasResult<VariantStream<'_>>;

    /// Divide the source into at most `parts` partitions
    fn partitions(&self, parts: usize) -> GwasResult<Vec<Partition>>;

    /// Stream the variants whose start position lies in the partition
    fn partition_variants(&self, partition: &Partition) -> GwasResult<VariantStream<'_>>;
}

/// Look for a tabix or CSI index next to the VCF/BCF file
pub fn find_index<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    ["tbi", "csi"].iter().find_map(|ext| {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(".");
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        candidate.exists().then_some(candidate)
    })
}

/// Contig names and declared lengths from the header, in header order
pub fn header_contigs(header: &bcf::header::HeaderView) -> Vec<Contig> {
    header
        .header_records()
        .into_iter()
        .filter_map(|record| match record {
            HeaderRecord::Contig { values, .. } => {
                let name = values.get("ID")?.clone();
                let length = values.get("length").and_then(|l| l.parse::<u64>().ok());
                Some(Contig { name, length })
            }
            _ => None,
        })
        .collect()
}

/// Convert an htslib record into an owned variant record
fn convert_record(record: &bcf::Record, dosage_field: &[u8]) -> GwasResult<VariantRecord> {
    let rid = record
        .rid()
        .ok_or_else(|| GwasError::input_file("<vcf>", "record without a chromosome"))?;
    let chrom = String::from_utf8_lossy(record.header().rid2name(rid)?).to_string();
    let pos = record.pos() as u64 + 1;
    let id = String::from_utf8_lossy(&record.id()).to_string();

    let alleles = record.alleles();
    let ref_allele = alleles
        .first()
        .map(|a| String::from_utf8_lossy(a).to_string())
        .unwrap_or_default();
    let alt_alleles = alleles
        .iter()
        .skip(1)
        .map(|a| String::from_utf8_lossy(a).to_string())
        .collect();

    // an absent tag surfaces as an error from htslib;
    // missing and vector-end values are NaN payloads
    let dosages = match record.format(dosage_field).float() {
        Ok(values) => Some(
            values
                .iter()
                .map(|sample| match sample.first() {
                    Some(v) if !v.is_nan() => *v,
                    _ => f32::NAN,
                })
                .collect(),
        ),
        Err(_) => None,
    };

    Ok(VariantRecord::new(chrom, pos, id, ref_allele, alt_alleles, dosages))
}

/// Streams every record of a reader in file order
struct FullScan {
    reader: bcf::Reader,
    record: bcf::Record,
    dosage_field: Vec<u8>,
}

impl Iterator for FullScan {
    type Item = GwasResult<VariantRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read(&mut self.record)? {
            Ok(()) => Some(convert_record(&self.record, &self.dosage_field)),
            Err(e) => Some(Err(GwasError::Htslib(e))),
        }
    }
}

/// Streams the records of a partition, one region after the other
struct RegionScan {
    reader: bcf::IndexedReader,
    record: bcf::Record,
    dosage_field: Vec<u8>,
    pending: VecDeque<Region>,
    current: Option<Region>,
}

impl RegionScan {
    /// Position the reader on the next region with indexed records
    fn advance(&mut self) -> bool {
        while let Some(region) = self.pending.pop_front() {
            let rid = match self.reader.header().name2rid(region.contig.as_bytes()) {
                Ok(rid) => rid,
                Err(_) => {
                    log::debug!("Contig {} not in header, skipping", region.contig);
                    continue;
                }
            };

            match self.reader.fetch(rid, region.start, region.end) {
                Ok(()) => {
                    self.current = Some(region);
                    return true;
                }
                Err(e) => log::debug!("No indexed records for {} ({}), skipping", region, e),
            }
        }
        self.current = None;
        false
    }
}

impl Iterator for RegionScan {
    type Item = GwasResult<VariantRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() && !self.advance() {
                return None;
            }

            match self.reader.read(&mut self.record) {
                Some(Ok(())) => {
                    let pos = self.record.pos() as u64;
                    let in_region = self
                        .current
                        .as_ref()
                        .map(|r| r.contains_start(pos))
                        .unwrap_or(false);
                    // records overlapping the region start belong to the previous region
                    if in_region {
                        return Some(convert_record(&self.record, &self.dosage_field));
                    }
                }
                Some(Err(e)) => return Some(Err(GwasError::Htslib(e))),
                None => self.current = None,
            }
        }
    }
}

/// VCF/BCF file (plain, bgzipped, or BCF) read through htslib
#[derive(Debug, Clone)]
pub struct VcfSource {
    path: PathBuf,
    samples: Vec<String>,
    dosage_field: String,
}

impl VcfSource {
    /// Open the file, read its header and sample list
    pub fn open<P: AsRef<Path>>(path: P, dosage_field: &str) -> GwasResult<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = bcf::Reader::from_path(&path)
            .map_err(|e| GwasError::input_file(&path, format!("cannot read VCF: {}", e)))?;

        let samples: Vec<String> = reader
            .header()
            .samples()
            .iter()
            .map(|s| normalize_sample_id(&String::from_utf8_lossy(s)))
            .collect();

        if samples.is_empty() {
            return Err(GwasError::input_file(&path, "VCF has no sample columns"));
        }

        log::info!("VCF {}: {} samples", path.display(), samples.len());

        Ok(VcfSource {
            path,
            samples,
            dosage_field: dosage_field.to_string(),
        })
    }

    fn indexed_reader(&self) -> GwasResult<bcf::IndexedReader> {
        if find_index(&self.path).is_none() {
            return Err(GwasError::Partition(format!(
                "no .tbi or .csi index found next to {}; index it with `bcftools index` or run with --workers 1",
                self.path.display()
            )));
        }
        Ok(bcf::IndexedReader::from_path(&self.path)?)
    }
}

impl GenotypeSource for VcfSource {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn variants(&self) -> GwasResult<VariantStream<'_>> {
        let reader = bcf::Reader::from_path(&self.path)
            .map_err(|e| GwasError::input_file(&self.path, format!("cannot read VCF: {}", e)))?;
        let record = reader.empty_record();

        Ok(Box::new(FullScan {
            reader,
            record,
            dosage_field: self.dosage_field.as_bytes().to_vec(),
        }))
    }

    fn partitions(&self, parts: usize) -> GwasResult<Vec<Partition>> {
        let reader = self.indexed_reader()?;
        let contigs = header_contigs(reader.header());
        if contigs.is_empty() {
            return Err(GwasError::Partition(format!(
                "{} declares no ##contig lines to partition",
                self.path.display()
            )));
        }

        let partitions = partition_contigs(&contigs, parts);
        log::info!(
            "Partitioned {} contigs into {} regions (requested {})",
            contigs.len(),
            partitions.len(),
            parts
        );
        Ok(partitions)
    }

    fn partition_variants(&self, partition: &Partition) -> GwasResult<VariantStream<'_>> {
        let reader = self.indexed_reader()?;
        let record = reader.empty_record();

        Ok(Box::new(RegionScan {
            reader,
            record,
            dosage_field: self.dosage_field.as_bytes().to_vec(),
            pending: partition.regions.iter().cloned().collect(),
            current: None,
        }))
    }
}
