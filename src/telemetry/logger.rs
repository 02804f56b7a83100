//! # Telemetry Logger
//!
//! Writes decoded samples as JSON Lines into numbered files
//! (`pwmon_0001.jsonl`, `pwmon_0002.jsonl`, ...). A file is closed after
//! `max_records_per_file` records and only the newest `max_files_to_keep`
//! files are kept.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::types::{decode_page, SampleRecord, Timebase};
use crate::error::Result;
use crate::storage::layout::PageImage;

const FILE_PREFIX: &str = "pwmon_";
const FILE_SUFFIX: &str = ".jsonl";

/// Rotating JSONL writer
#[derive(Debug)]
pub struct TelemetryLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    next_index: u32,
}

impl TelemetryLogger {
    /// Create the log directory if needed. Numbering continues after the
    /// highest existing file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created or listed.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        max_records_per_file: usize,
        max_files_to_keep: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let next_index = existing_files(&dir)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(1);
        Ok(Self {
            dir,
            max_records_per_file: max_records_per_file.max(1),
            max_files_to_keep: max_files_to_keep.max(1),
            writer: None,
            records_in_file: 0,
            next_index,
        })
    }

    /// Append one record, rotating first if the current file is full
    pub fn log<T: Serialize>(&mut self, record: &T) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
            self.records_in_file += 1;
        }
        Ok(())
    }

    /// Decode a drained page and log all of its samples
    ///
    /// # Returns
    ///
    /// * `Result<usize>` - Number of records written
    pub fn log_page(&mut self, page: &PageImage, timebase: &Timebase) -> Result<usize> {
        let records: Vec<SampleRecord> = decode_page(page, timebase)?;
        for record in &records {
            self.log(record)?;
        }
        self.flush()?;
        debug!(
            page = page.header.page_idx,
            records = records.len(),
            "page written to telemetry"
        );
        Ok(records.len())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.flush()?;
        let path = self.dir.join(file_name(self.next_index));
        let file = File::create(&path)?;
        info!("Telemetry file opened: {}", path.display());
        self.writer = Some(BufWriter::new(file));
        self.records_in_file = 0;
        self.next_index += 1;
        self.prune()
    }

    /// Remove the oldest files beyond the retention limit
    fn prune(&self) -> Result<()> {
        let files = existing_files(&self.dir)?;
        let excess = files.len().saturating_sub(self.max_files_to_keep);
        for (_, path) in files.into_iter().take(excess) {
            debug!("Removing old telemetry file: {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn file_name(index: u32) -> String {
    format!("{}{:04}{}", FILE_PREFIX, index, FILE_SUFFIX)
}

/// Telemetry files in `dir`, oldest first
fn existing_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let index = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(FILE_PREFIX))
            .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            .and_then(|digits| digits.parse::<u32>().ok());
        if let Some(index) = index {
            files.push((index, path));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::{item_offset, Domain, PageHeader, PAGE_SIZE};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Line {
        n: usize,
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_rotates_after_max_records() {
        let dir = tempdir().unwrap();
        let mut logger = TelemetryLogger::new(dir.path(), 2, 10).unwrap();
        for n in 0..5 {
            logger.log(&Line { n }).unwrap();
        }
        logger.flush().unwrap();

        assert_eq!(lines(&dir.path().join("pwmon_0001.jsonl")), vec!["{\"n\":0}", "{\"n\":1}"]);
        assert_eq!(lines(&dir.path().join("pwmon_0002.jsonl")).len(), 2);
        assert_eq!(lines(&dir.path().join("pwmon_0003.jsonl")), vec!["{\"n\":4}"]);
    }

    #[test]
    fn test_keeps_only_newest_files() {
        let dir = tempdir().unwrap();
        let mut logger = TelemetryLogger::new(dir.path(), 1, 2).unwrap();
        for n in 0..4 {
            logger.log(&Line { n }).unwrap();
        }
        let names: Vec<u32> = existing_files(dir.path()).unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(names, vec![3, 4]);
    }

    #[test]
    fn test_numbering_continues_after_existing_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pwmon_0007.jsonl"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let mut logger = TelemetryLogger::new(dir.path(), 10, 10).unwrap();
        logger.log(&Line { n: 1 }).unwrap();
        assert!(dir.path().join("pwmon_0008.jsonl").exists());
    }

    #[test]
    fn test_log_page_writes_every_sample() {
        let dir = tempdir().unwrap();
        let mut logger = TelemetryLogger::new(dir.path(), 100, 10).unwrap();
        let mut data = Box::new([0xFFu8; PAGE_SIZE]);
        data[item_offset(0)..item_offset(1)].copy_from_slice(&(3u32 | 4 << 16).to_le_bytes());
        let page = PageImage {
            header: PageHeader::initial(Domain::FastPower, 2, 10),
            data,
        };
        let timebase = Timebase {
            report_sn: 20,
            report_time: Utc::now(),
            period: Duration::from_secs(12),
        };

        assert_eq!(logger.log_page(&page, &timebase).unwrap(), 2);
        let written = lines(&dir.path().join("pwmon_0001.jsonl"));
        assert_eq!(written.len(), 2);
        let record: SampleRecord = serde_json::from_str(&written[1]).unwrap();
        assert_eq!((record.sn, record.raw), (11, 4));
    }
}
