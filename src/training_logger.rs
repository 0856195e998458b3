//! Training Logger
//!
//! Records one CSV row per epoch so a run can be plotted or compared later,
//! and mirrors each row as a `tracing` event.
//!
//! ## Example
//!
//! ```rust,no_run
//! use synapse::TrainingLogger;
//!
//! let mut logger = TrainingLogger::new("xor_training.csv")?;
//! logger.log(1, 0.01, 0.25)?;
//! # Ok::<(), synapse::Error>(())
//! ```
//!
//! ## CSV Format
//!
//! - `epoch`: cumulative epoch number of the network
//! - `elapsed_seconds`: time since the logger was created
//! - `learning_rate`: optimizer learning rate during the epoch
//! - `error`: mean epoch error

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::Result;

/// Per-epoch CSV writer
#[derive(Debug)]
pub struct TrainingLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    start_time: Instant,
    last_log_time: Instant,
    rows: usize,
}

impl TrainingLogger {
    /// Create (or truncate) the CSV file and write its header
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "epoch,elapsed_seconds,learning_rate,error")?;
        writer.flush()?;

        let now = Instant::now();
        Ok(Self {
            path,
            writer,
            start_time: now,
            last_log_time: now,
            rows: 0,
        })
    }

    /// Append one epoch row
    ///
    /// The row is flushed immediately so an interrupted run keeps its history.
    pub fn log(&mut self, epoch: usize, learning_rate: f64, error: f64) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        writeln!(
            self.writer,
            "{},{:.3},{:.8},{:.8}",
            epoch, elapsed, learning_rate, error
        )?;
        self.writer.flush()?;

        let since_last = self.last_log_time.elapsed().as_secs_f64();
        tracing::debug!(
            epoch,
            elapsed = format_args!("{elapsed:.1}s"),
            delta = format_args!("+{since_last:.2}s"),
            learning_rate,
            error,
            "epoch complete"
        );

        self.last_log_time = Instant::now();
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far, excluding the header
    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_writes_header_and_rows() {
        let path = std::env::temp_dir().join(format!(
            "synapse-logger-{}-{:?}.csv",
            std::process::id(),
            std::thread::current().id()
        ));
        {
            let mut logger = TrainingLogger::new(&path).unwrap();
            logger.log(1, 0.01, 0.5).unwrap();
            logger.log(2, 0.01, 0.25).unwrap();
            assert_eq!(logger.rows(), 2);
        }

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "epoch,elapsed_seconds,learning_rate,error");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2,"));
        assert!(lines[2].ends_with(",0.01000000,0.25000000"));
        fs::remove_file(&path).ok();
    }
}
