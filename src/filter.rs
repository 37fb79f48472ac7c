//! Per-variant validity checks applied before the join

use crate::VariantRecord;
use std::fmt;

/// Why a variant was left out of the scan. Skips are expected and never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Indel, MNV, multi-allelic or monomorphic site
    NotBiallelicSnv,
    /// Dosage field absent, or missing for every sample
    MissingDosage,
    /// No sample left after the join and missingness filtering
    NoCompleteSamples,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::NotBiallelicSnv => "INDEL/MULTI-ALLELIC variant",
            SkipReason::MissingDosage => "variant without dosage",
            SkipReason::NoCompleteSamples => "variant with no complete samples",
        };
        f.write_str(label)
    }
}

/// Apply the allele check, then the dosage check
pub fn check_variant(record: &VariantRecord) -> Result<(), SkipReason> {
    let snv = record.ref_allele.len() == 1
        && record.alt_alleles.len() == 1
        && record.alt_alleles[0].len() == 1;
    if !snv {
        return Err(SkipReason::NotBiallelicSnv);
    }

    match &record.dosages {
        Some(dosages) if dosages.iter().any(|d| !d.is_nan()) => Ok(()),
        _ => Err(SkipReason::MissingDosage),
    }
}
