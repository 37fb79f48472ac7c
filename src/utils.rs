//! Utility functions for file handling and common operations

use crate::{GwasError, GwasResult};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Check if a file is gzip compressed
pub fn is_gzipped<P: AsRef<Path>>(path: P) -> GwasResult<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0; 2];

    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(GwasError::Io(e)),
    }
}

/// Open a text file for line reading, transparently decompressing gzip input
pub fn open_text_reader<P: AsRef<Path>>(path: P) -> GwasResult<Box<dyn BufRead>> {
    let file = File::open(&path)
        .map_err(|e| GwasError::input_file(&path, format!("cannot open: {}", e)))?;

    let reader: Box<dyn BufRead> = if is_gzipped(&path)? {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    Ok(reader)
}

/// Get the number of CPU cores, with a fallback default
pub fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Validate file paths and check if they exist
pub fn validate_file_exists<P: AsRef<Path>>(path: P) -> GwasResult<()> {
    if !path.as_ref().exists() {
        return Err(GwasError::input_file(path, "file not found"));
    }
    Ok(())
}

/// Validate that a file is readable
pub fn validate_file_readable<P: AsRef<Path>>(path: P) -> GwasResult<()> {
    validate_file_exists(&path)?;

    File::open(&path).map_err(|e| GwasError::input_file(&path, format!("not readable: {}", e)))?;

    Ok(())
}

/// Check if a path has a specific extension
pub fn has_extension<P: AsRef<Path>>(path: P, extension: &str) -> bool {
    path.as_ref()
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Format a file size in bytes to a human-readable string
pub fn format_file_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Create parent directories if they don't exist
pub fn ensure_parent_dirs<P: AsRef<Path>>(path: P) -> GwasResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Log a progress notice every `interval` processed items
pub fn log_progress(label: &str, processed: usize, written: usize, interval: usize) {
    if interval > 0 && processed > 0 && processed % interval == 0 {
        log::info!(
            "{}: processed {} variants, {} results written",
            label,
            processed,
            written
        );
    }
}

/// Timer utility for measuring execution time
pub struct Timer {
    start: std::time::Instant,
    name: String,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        log::info!("Starting timer: {}", name);
        Timer {
            start: std::time::Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn log_elapsed(&self) {
        let duration = self.elapsed();
        log::info!("Timer '{}' elapsed: {:.2?}", self.name, duration);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.log_elapsed();
    }
}

/// Memory usage reporting utility
pub fn log_memory_usage(context: &str) {
    #[cfg(unix)]
    {
        use std::fs;
        if let Ok(status) = fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(memory_str) = line.split_whitespace().nth(1) {
                        if let Ok(memory_kb) = memory_str.parse::<u64>() {
                            log::info!("Memory usage ({}): {} MB", context, memory_kb / 1024);
                        }
                    }
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        log::debug!("Memory usage logging not supported on this platform ({})", context);
    }
}
