//! Per-variant join of genotype dosage against the sample table

use crate::{samples::SampleTable, GwasError, GwasResult, JoinMode, DOSAGE_COLUMN};
use std::collections::HashMap;

/// Aligns sample-table rows to genotype columns once per run and builds the
/// analysis table for each variant from that alignment.
#[derive(Debug)]
pub struct SampleJoiner<'a> {
    table: &'a SampleTable,
    /// Sample-table rows with complete required columns, with their genotype column
    rows: Vec<(usize, Option<usize>)>,
    dosage_required: bool,
}

impl<'a> SampleJoiner<'a> {
    /// Align the sample table with the genotype samples.
    ///
    /// `required` lists the columns that must be non-missing for a sample to
    /// enter a fit (`DOSAGE` included); `None` requires every column.
    pub fn new(
        table: &'a SampleTable,
        genotype_samples: &[String],
        mode: JoinMode,
        required: Option<&[String]>,
    ) -> GwasResult<Self> {
        let mut required_columns = Vec::new();
        let mut dosage_required = false;
        match required {
            Some(names) => {
                for name in names {
                    if name == DOSAGE_COLUMN {
                        dosage_required = true;
                        continue;
                    }
                    let idx = table.column_index(name).ok_or_else(|| {
                        GwasError::InvalidConfig(format!(
                            "required column '{}' is not in the phenotype or covariate files",
                            name
                        ))
                    })?;
                    required_columns.push(idx);
                }
            }
            None => {
                required_columns = (0..table.columns().len()).collect();
                dosage_required = true;
            }
        }

        let genotype_index: HashMap<&str, usize> = genotype_samples
            .iter()
            .enumerate()
            .rev()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        let mut matched = 0;
        let mut rows = Vec::new();
        for (row, sample_id) in table.sample_ids().iter().enumerate() {
            let column = genotype_index.get(sample_id.as_str()).copied();
            if column.is_some() {
                matched += 1;
            } else if mode == JoinMode::Inner {
                continue;
            }

            if required_columns.iter().all(|&c| table.value(row, c).is_some()) {
                rows.push((row, column));
            }
        }

        if matched == 0 {
            return Err(GwasError::Join(
                "no sample in the phenotype/covariate table appears in the genotype file".to_string(),
            ));
        }
        if rows.is_empty() {
            return Err(GwasError::Join(
                "no sample has complete values for the required columns".to_string(),
            ));
        }

        log::info!(
            "{} of {} table samples found among {} genotype samples; {} eligible for fitting",
            matched,
            table.n_samples(),
            genotype_samples.len(),
            rows.len()
        );

        Ok(SampleJoiner {
            table,
            rows,
            dosage_required,
        })
    }

    /// Build the analysis table for one variant's dosage vector
    pub fn join(&self, dosages: &[f32]) -> AnalysisTable<'a> {
        let mut rows = Vec::with_capacity(self.rows.len());
        let mut values = Vec::with_capacity(self.rows.len());

        for &(row, column) in &self.rows {
            let dosage = column
                .and_then(|c| dosages.get(c).copied())
                .unwrap_or(f32::NAN);
            if self.dosage_required && dosage.is_nan() {
                continue;
            }
            rows.push(row);
            values.push(dosage);
        }

        AnalysisTable {
            table: self.table,
            rows,
            dosages: values,
        }
    }
}

/// Sample table rows joined with one variant's dosage. Rows follow sample table order.
#[derive(Debug, Clone)]
pub struct AnalysisTable<'a> {
    table: &'a SampleTable,
    rows: Vec<usize>,
    dosages: Vec<f32>,
}

impl<'a> AnalysisTable<'a> {
    /// Effective sample size for this variant
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Phenotype and covariate column names, without `DOSAGE`
    pub fn columns(&self) -> &'a [String] {
        self.table.columns()
    }

    pub fn sample_id(&self, row: usize) -> &'a str {
        &self.table.sample_ids()[self.rows[row]]
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&'a str> {
        self.table.value(self.rows[row], column)
    }

    pub fn dosage(&self, row: usize) -> Option<f32> {
        let d = self.dosages[row];
        (!d.is_nan()).then_some(d)
    }

    pub fn dosages(&self) -> &[f32] {
        &self.dosages
    }
}
