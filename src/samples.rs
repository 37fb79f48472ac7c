//! Phenotype and covariate loading into the per-run sample table

use crate::{utils::open_text_reader, GwasError, GwasResult, JoinMode, DOSAGE_COLUMN};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

/// Tokens read as missing values
const MISSING_TOKENS: &[&str] = &["NA", "N/A", "NaN", "nan", "null", "NULL", "."];

/// Normalize a sample identity so all sources compare equal
pub fn normalize_sample_id(raw: &str) -> String {
    raw.trim().to_string()
}

fn parse_cell(raw: &str) -> Option<String> {
    if raw.is_empty() || MISSING_TOKENS.contains(&raw) {
        None
    } else {
        Some(raw.to_string())
    }
}

/// A whitespace-delimited table keyed by sample identity
#[derive(Debug, Clone)]
pub struct TabularFile {
    pub columns: Vec<String>,
    pub sample_ids: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    index: HashMap<String, usize>,
}

impl TabularFile {
    pub fn row_of(&self, sample_id: &str) -> Option<usize> {
        self.index.get(sample_id).copied()
    }
}

/// Read a whitespace-delimited table with a header row and an identity column
pub fn read_tabular_file<P: AsRef<Path>>(path: P, id_column: &str) -> GwasResult<TabularFile> {
    let path = path.as_ref();
    let reader = open_text_reader(path)?;
    let mut lines = reader.lines().enumerate();

    let header = loop {
        match lines.next() {
            Some((_, line)) => {
                let line = line.map_err(|e| GwasError::input_file(path, e.to_string()))?;
                if !line.trim().is_empty() {
                    break line;
                }
            }
            None => return Err(GwasError::input_file(path, "file is empty")),
        }
    };

    let header: Vec<String> = header.split_whitespace().map(|s| s.to_string()).collect();
    let id_idx = header
        .iter()
        .position(|col| col == id_column)
        .ok_or_else(|| {
            GwasError::input_file(path, format!("identity column '{}' not found in header", id_column))
        })?;

    let mut seen = HashSet::new();
    for col in &header {
        if !seen.insert(col.as_str()) {
            return Err(GwasError::input_file(path, format!("duplicate column '{}'", col)));
        }
        if col == DOSAGE_COLUMN {
            return Err(GwasError::input_file(
                path,
                format!("column name '{}' is reserved for genotype dosage", DOSAGE_COLUMN),
            ));
        }
    }

    let columns: Vec<String> = header
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != id_idx)
        .map(|(_, c)| c.clone())
        .collect();

    if columns.is_empty() {
        return Err(GwasError::input_file(
            path,
            format!("no data columns besides '{}'", id_column),
        ));
    }

    let mut sample_ids = Vec::new();
    let mut rows = Vec::new();
    let mut index = HashMap::new();

    for (line_idx, line) in lines {
        let line = line.map_err(|e| GwasError::input_file(path, e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != header.len() {
            return Err(GwasError::input_file(
                path,
                format!(
                    "line {} has {} fields, expected {}",
                    line_idx + 1,
                    fields.len(),
                    header.len()
                ),
            ));
        }

        let sample_id = normalize_sample_id(fields[id_idx]);
        if index.insert(sample_id.clone(), rows.len()).is_some() {
            return Err(GwasError::input_file(
                path,
                format!("sample '{}' appears more than once (line {})", sample_id, line_idx + 1),
            ));
        }

        let row = fields
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id_idx)
            .map(|(_, value)| parse_cell(value))
            .collect();

        sample_ids.push(sample_id);
        rows.push(row);
    }

    log::debug!(
        "Read {} samples x {} columns from {}",
        rows.len(),
        columns.len(),
        path.display()
    );

    Ok(TabularFile {
        columns,
        sample_ids,
        rows,
        index,
    })
}

/// Phenotype and covariate values for every sample entering the scan.
/// Built once per run and shared read-only across workers.
#[derive(Debug, Clone)]
pub struct SampleTable {
    columns: Vec<String>,
    n_phenotype_columns: usize,
    sample_ids: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl SampleTable {
    /// Join a phenotype table with a covariate table by sample identity
    pub fn join(phenotypes: TabularFile, covariates: TabularFile, mode: JoinMode) -> GwasResult<Self> {
        let mut covariate_keep = Vec::new();
        for (idx, col) in covariates.columns.iter().enumerate() {
            if phenotypes.columns.contains(col) {
                log::warn!(
                    "Column '{}' appears in both phenotype and covariate files; using the phenotype values",
                    col
                );
            } else {
                covariate_keep.push(idx);
            }
        }

        let mut columns = phenotypes.columns.clone();
        columns.extend(covariate_keep.iter().map(|&i| covariates.columns[i].clone()));

        let mut sample_ids = Vec::new();
        let mut rows = Vec::new();

        for (sample_id, pheno_row) in phenotypes.sample_ids.into_iter().zip(phenotypes.rows) {
            let covar_row = covariates.row_of(&sample_id).map(|r| &covariates.rows[r]);
            let covar_values: Vec<Option<String>> = match (covar_row, mode) {
                (Some(row), _) => covariate_keep.iter().map(|&i| row[i].clone()).collect(),
                (None, JoinMode::Left) => vec![None; covariate_keep.len()],
                (None, JoinMode::Inner) => continue,
            };

            let mut row = pheno_row;
            row.extend(covar_values);
            sample_ids.push(sample_id);
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(GwasError::Join(
                "phenotype and covariate files share no sample identities".to_string(),
            ));
        }

        Ok(SampleTable {
            columns,
            n_phenotype_columns: phenotypes.columns.len(),
            sample_ids,
            rows,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn phenotype_columns(&self) -> &[String] {
        &self.columns[..self.n_phenotype_columns]
    }

    pub fn covariate_columns(&self) -> &[String] {
        &self.columns[self.n_phenotype_columns..]
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        self.rows[row][column].as_deref()
    }
}

/// Load the phenotype and covariate files and join them into one sample table.
///
/// The phenotype file is fully validated before the covariate file is opened.
pub fn load_sample_table<P: AsRef<Path>>(
    pheno_path: P,
    covar_path: P,
    id_column: &str,
    mode: JoinMode,
) -> GwasResult<SampleTable> {
    let phenotypes = read_tabular_file(&pheno_path, id_column)?;
    log::info!(
        "Phenotype file: {} samples, columns: {}",
        phenotypes.sample_ids.len(),
        phenotypes.columns.join(" ")
    );

    let covariates = read_tabular_file(&covar_path, id_column)?;
    log::info!(
        "Covariate file: {} samples, columns: {}",
        covariates.sample_ids.len(),
        covariates.columns.join(" ")
    );

    let table = SampleTable::join(phenotypes, covariates, mode)?;
    log::info!(
        "Sample table ({:?} join): {} samples; phenotypes: {}; covariates: {}",
        mode,
        table.n_samples(),
        table.phenotype_columns().join(" "),
        table.covariate_columns().join(" ")
    );

    Ok(table)
}
