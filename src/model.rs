//! Invocation of the user-supplied association model

use crate::{
    join::AnalysisTable, utils::validate_file_readable, GwasError, GwasResult, DOSAGE_COLUMN,
    SAMPLE_ID_COLUMN,
};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::NamedTempFile;

/// R program that sources the model script and serves fits line by line
const R_DRIVER: &str = include_str!("model_driver.R");

/// Effect estimate returned by the model for the dosage term
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelFit {
    pub estimate: f64,
    pub se: f64,
    pub p: f64,
}

/// Failure of a single model invocation
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model raised an error: {0}")]
    Failed(String),

    #[error("model result is missing field '{0}'")]
    MissingField(&'static str),

    #[error("unreadable model reply: {0}")]
    Protocol(String),

    #[error("model process exited: {0}")]
    ProcessExited(String),

    #[error("IO error talking to the model process: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Errors after which no later invocation can succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModelError::ProcessExited(_) | ModelError::Io(_))
    }
}

impl From<ModelError> for GwasError {
    fn from(e: ModelError) -> Self {
        GwasError::ModelInvocation(e.to_string())
    }
}

/// An association model: one fit per variant on that variant's analysis table
pub trait AssociationModel {
    fn fit(&mut self, table: &AnalysisTable<'_>) -> Result<ModelFit, ModelError>;
}

/// Creates one model instance per worker
pub trait ModelLoader: Sync {
    fn load(&self) -> GwasResult<Box<dyn AssociationModel>>;
}

impl<F> ModelLoader for F
where
    F: Fn() -> GwasResult<Box<dyn AssociationModel>> + Sync,
{
    fn load(&self) -> GwasResult<Box<dyn AssociationModel>> {
        self()
    }
}

/// Serialize an analysis table as a model request: a `#TABLE <n>` line, a
/// header line, then one whitespace-delimited row per sample with `NA` for
/// missing values.
pub fn write_model_input<W: Write>(table: &AnalysisTable<'_>, writer: &mut W) -> std::io::Result<()> {
    writeln!(writer, "#TABLE {}", table.n_rows())?;

    write!(writer, "{}", SAMPLE_ID_COLUMN)?;
    for column in table.columns() {
        write!(writer, " {}", column)?;
    }
    writeln!(writer, " {}", DOSAGE_COLUMN)?;

    for row in 0..table.n_rows() {
        write!(writer, "{}", table.sample_id(row))?;
        for column in 0..table.columns().len() {
            write!(writer, " {}", table.value(row, column).unwrap_or("NA"))?;
        }
        match table.dosage(row) {
            Some(dosage) => writeln!(writer, " {}", dosage)?,
            None => writeln!(writer, " NA")?,
        }
    }

    Ok(())
}

fn parse_value(raw: Option<&str>, name: &'static str) -> Result<f64, ModelError> {
    match raw {
        None => Err(ModelError::MissingField(name)),
        Some("NA") | Some("NaN") => Ok(f64::NAN),
        Some(value) => value
            .parse::<f64>()
            .map_err(|_| ModelError::Protocol(format!("{} is not a number: '{}'", name, value))),
    }
}

/// Parse an `OK <estimate> <se> <p>` or `ERR <message>` reply
pub fn parse_reply(line: &str) -> Result<ModelFit, ModelError> {
    let mut fields = line.split_whitespace();
    match fields.next() {
        Some("OK") => {
            let estimate = parse_value(fields.next(), "estimate")?;
            let se = parse_value(fields.next(), "se")?;
            let p = parse_value(fields.next(), "p")?;
            Ok(ModelFit { estimate, se, p })
        }
        Some("ERR") => Err(ModelError::Failed(fields.collect::<Vec<_>>().join(" "))),
        _ => Err(ModelError::Protocol(line.to_string())),
    }
}

fn is_reply(line: &str) -> bool {
    matches!(line.split_whitespace().next(), Some("OK") | Some("ERR") | Some("READY"))
}

/// How to start the model process
#[derive(Debug, Clone)]
pub struct ScriptModelLoader {
    pub interpreter: String,
    /// Driver program; the embedded R driver when `None`
    pub driver: Option<PathBuf>,
    pub script: PathBuf,
    pub model: String,
}

impl ScriptModelLoader {
    pub fn new<P: AsRef<Path>>(interpreter: &str, script: P, model: &str) -> Self {
        ScriptModelLoader {
            interpreter: interpreter.to_string(),
            driver: None,
            script: script.as_ref().to_path_buf(),
            model: model.to_string(),
        }
    }

    pub fn with_driver<P: AsRef<Path>>(mut self, driver: P) -> Self {
        self.driver = Some(driver.as_ref().to_path_buf());
        self
    }

    fn materialize_driver(&self) -> GwasResult<(PathBuf, Option<NamedTempFile>)> {
        match &self.driver {
            Some(path) => Ok((path.clone(), None)),
            None => {
                let mut file = tempfile::Builder::new()
                    .prefix("custom_gwas_driver")
                    .suffix(".R")
                    .tempfile()?;
                file.write_all(R_DRIVER.as_bytes())?;
                file.flush()?;
                Ok((file.path().to_path_buf(), Some(file)))
            }
        }
    }
}

impl ModelLoader for ScriptModelLoader {
    fn load(&self) -> GwasResult<Box<dyn AssociationModel>> {
        validate_file_readable(&self.script).map_err(|e| {
            GwasError::ModelInvocation(format!("cannot load model script: {}", e))
        })?;
        Ok(Box::new(ScriptModel::spawn(self)?))
    }
}

/// A long-lived interpreter process that fits the model on request
pub struct ScriptModel {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    line: String,
    _driver: Option<NamedTempFile>,
}

impl ScriptModel {
    pub fn spawn(loader: &ScriptModelLoader) -> GwasResult<Self> {
        let (driver_path, driver_file) = loader.materialize_driver()?;

        let mut child = Command::new(&loader.interpreter)
            .arg(&driver_path)
            .arg(&loader.script)
            .arg(&loader.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                GwasError::ModelInvocation(format!(
                    "cannot start interpreter '{}': {}",
                    loader.interpreter, e
                ))
            })?;

        let stdin = child.stdin.take().map(BufWriter::new);
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| GwasError::ModelInvocation("model process has no stdout".to_string()))?;

        let mut model = ScriptModel {
            child,
            stdin,
            stdout,
            line: String::new(),
            _driver: driver_file,
        };

        match model.read_reply() {
            Ok(line) if line == "READY" => {
                log::debug!(
                    "Loaded model '{}' from {}",
                    loader.model,
                    loader.script.display()
                );
                Ok(model)
            }
            Ok(line) => Err(GwasError::ModelInvocation(format!(
                "cannot load model '{}' from {}: {}",
                loader.model,
                loader.script.display(),
                line.strip_prefix("ERR").unwrap_or(&line).trim()
            ))),
            Err(e) => Err(GwasError::ModelInvocation(format!(
                "cannot load model '{}' from {}: {}",
                loader.model,
                loader.script.display(),
                e
            ))),
        }
    }

    /// Read the next protocol line, passing other output through to the log
    fn read_reply(&mut self) -> Result<String, ModelError> {
        loop {
            self.line.clear();
            if self.stdout.read_line(&mut self.line)? == 0 {
                let status = match self.child.try_wait() {
                    Ok(Some(status)) => status.to_string(),
                    _ => "output closed".to_string(),
                };
                return Err(ModelError::ProcessExited(status));
            }

            let line = self.line.trim();
            if is_reply(line) {
                return Ok(line.to_string());
            }
            log::debug!("model output: {}", line);
        }
    }
}

impl AssociationModel for ScriptModel {
    fn fit(&mut self, table: &AnalysisTable<'_>) -> Result<ModelFit, ModelError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ModelError::ProcessExited("input closed".to_string()))?;

        // a broken pipe means the interpreter is gone
        let sent = write_model_input(table, stdin).and_then(|_| stdin.flush());
        if let Err(e) = sent {
            return Err(ModelError::ProcessExited(e.to_string()));
        }

        let line = self.read_reply()?;
        parse_reply(&line)
    }
}

impl Drop for ScriptModel {
    fn drop(&mut self) {
        // closing stdin ends the driver loop
        self.stdin.take();
        if let Err(e) = self.child.wait() {
            log::warn!("Failed to wait for model process: {}", e);
        }
    }
}
