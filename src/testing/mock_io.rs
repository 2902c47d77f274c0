//! Temporary files and dataset directories for I/O tests.

use crate::io::csv::write_rows;
use crate::io::dataset_name;
use crate::message::Kind;
use crate::row::Row;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};

/// A temporary file that is automatically deleted when dropped.
pub struct TempFilePath {
    _temp_file: NamedTempFile,
    path: PathBuf,
}

impl TempFilePath {
    /// Create a new temporary file with a specific extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be created.
    pub fn with_extension(extension: &str) -> std::io::Result<Self> {
        let temp_file = tempfile::Builder::new()
            .suffix(&format!(".{extension}"))
            .tempfile()?;
        let path = temp_file.path().to_path_buf();
        Ok(Self {
            _temp_file: temp_file,
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A temporary directory that is automatically deleted when dropped.
pub struct TempDirPath {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl TempDirPath {
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().to_path_buf();
        Ok(Self {
            _temp_dir: temp_dir,
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.path.join(filename)
    }
}

/// Write `rows` to a temporary CSV file.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn mock_csv_file(rows: &[Row]) -> Result<TempFilePath> {
    let file = TempFilePath::with_extension("csv").context("create temp CSV")?;
    write_rows(file.path(), rows)?;
    Ok(file)
}

/// A temporary data directory holding `<dataset>.csv` for each entry.
///
/// # Errors
///
/// Returns an error if a file cannot be written.
///
/// # Example
///
/// ```
/// use stageflow::io::csv::dataset_files;
/// use stageflow::message::Kind;
/// use stageflow::testing::{coffee_shop_datasets, mock_dataset_dir};
///
/// let dir = mock_dataset_dir(&coffee_shop_datasets()).unwrap();
/// assert_eq!(dataset_files(dir.path(), Kind::Stores).unwrap().len(), 1);
/// ```
pub fn mock_dataset_dir(datasets: &BTreeMap<Kind, Vec<Row>>) -> Result<TempDirPath> {
    let dir = TempDirPath::new().context("create temp dir")?;
    for (kind, rows) in datasets {
        if let Some(name) = dataset_name(*kind) {
            write_rows(dir.file_path(&format!("{name}.csv")), rows)?;
        }
    }
    Ok(dir)
}
