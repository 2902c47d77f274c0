//! CSV I/O for [`Row`]s.
//!
//! This module provides:
//! - **Whole-file I/O**: [`read_rows`] and [`write_rows`]
//! - **Streaming ingestion** in fixed-size batches: [`RowBatches`]
//! - **Dataset directories**: [`dataset_files`] and [`write_results`]
//!
//! # Design notes
//! - Every value is read and written as text; rows keep the header's column order.
//! - A dataset may be one file `<name>.csv` or a directory `<name>/` of CSV
//!   parts, read in file-name order.

use crate::gateway::QueryResults;
use crate::io::{dataset_name, result_name};
use crate::message::Kind;
use crate::row::Row;
use anyhow::{Context, Result};
use csv::{StringRecord, StringRecordsIntoIter, WriterBuilder};
use glob::{MatchOptions, Pattern, glob_with};
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

fn row_of(headers: &[String], record: &StringRecord) -> Row {
    headers
        .iter()
        .zip(record.iter())
        .map(|(h, v)| (h.clone(), v.to_string()))
        .collect()
}

fn open_reader(path: &Path) -> Result<(Vec<String>, csv::Reader<File>)> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(f);
    let headers = rdr
        .headers()
        .with_context(|| format!("read CSV header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    Ok((headers, rdr))
}

/// Read a headed CSV file into rows.
///
/// # Errors
/// The file cannot be opened or a record is malformed.
pub fn read_rows(path: impl AsRef<Path>) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    for batch in RowBatches::open(path, usize::MAX)? {
        out.extend(batch?);
    }
    Ok(out)
}

/// Reads a headed CSV file `size` rows at a time.
pub struct RowBatches {
    path: PathBuf,
    headers: Vec<String>,
    records: StringRecordsIntoIter<File>,
    size: usize,
    line: u64,
}

impl RowBatches {
    /// # Errors
    /// The file cannot be opened or has no readable header.
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (headers, rdr) = open_reader(&path)?;
        Ok(Self {
            path,
            headers,
            records: rdr.into_records(),
            size: size.max(1),
            line: 1,
        })
    }

    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl Iterator for RowBatches {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::new();
        while batch.len() < self.size {
            match self.records.next() {
                Some(Ok(record)) => {
                    self.line += 1;
                    batch.push(row_of(&self.headers, &record));
                }
                Some(Err(e)) => {
                    let at = format!("parse CSV record after line {} of {}", self.line, self.path.display());
                    return Some(Err(e).context(at));
                }
                None => break,
            }
        }
        (!batch.is_empty()).then_some(Ok(batch))
    }
}

/// Write rows to a CSV file, header first.
///
/// The header is the union of field names in first-seen order; missing values
/// are written empty. Creates parent directories.
///
/// # Returns
/// The number of rows written.
///
/// # Errors
/// The file cannot be created or written.
pub fn write_rows(path: impl AsRef<Path>, rows: &[Row]) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let mut headers: Vec<&str> = Vec::new();
    for row in rows {
        for (field, _) in row.iter() {
            if !headers.contains(&field) {
                headers.push(field);
            }
        }
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    if headers.is_empty() {
        return Ok(0);
    }
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(f);
    wtr.write_record(&headers)?;
    for (i, row) in rows.iter().enumerate() {
        wtr.write_record(headers.iter().map(|h| row.get_or_empty(h)))
            .with_context(|| format!("write CSV row #{}", i + 1))?;
    }
    wtr.flush()?;
    Ok(rows.len())
}

/// CSV files holding `kind` under `dir`: `<name>.csv`, or every `*.csv` in
/// `<name>/` sorted by file name. Empty if neither exists.
///
/// # Errors
/// The directory exists but cannot be listed.
pub fn dataset_files(dir: impl AsRef<Path>, kind: Kind) -> Result<Vec<PathBuf>> {
    let Some(name) = dataset_name(kind) else {
        return Ok(Vec::new());
    };
    let dir = dir.as_ref();
    let single = dir.join(format!("{name}.csv"));
    if single.is_file() {
        return Ok(vec![single]);
    }
    let parts = dir.join(name);
    if !parts.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = format!("{}/*.csv", Pattern::escape(&parts.to_string_lossy()));
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let mut files = Vec::new();
    for entry in glob_with(&pattern, options).with_context(|| format!("invalid glob pattern: {pattern}"))? {
        let path = entry.with_context(|| format!("list {}", parts.display()))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// One CSV per result kind under `dir/<session>/`.
///
/// # Returns
/// The number of rows written.
///
/// # Errors
/// A file cannot be written.
pub fn write_results(dir: impl AsRef<Path>, results: &QueryResults) -> Result<usize> {
    let base = dir.as_ref().join(&results.session);
    let mut written = 0;
    for kind in Kind::RESULTS {
        if let Some(name) = result_name(kind) {
            written += write_rows(base.join(format!("{name}.csv")), results.rows(kind))?;
        }
    }
    Ok(written)
}
