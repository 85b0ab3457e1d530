//! Saving result sets to files.

use std::future::Future;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Map;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{ResultSet, ResultSetError};
use crate::datum::Value;
use crate::row::Row;
use crate::storage::RowStore;

/// Rows read from the store per chunk while saving.
const SAVE_CHUNK_ROWS: u64 = 1000;

/// Called once with the outcome of a background save.
pub type SaveCallback =
    Box<dyn FnOnce(Result<PathBuf, ResultSetError>) -> BoxFuture<'static, ()> + Send>;

/// Wraps an async closure as a [`SaveCallback`].
pub fn save_callback<F, Fut>(f: F) -> SaveCallback
where
    F: FnOnce(Result<PathBuf, ResultSetError>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |outcome| f(outcome).boxed())
}

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Comma separated values with RFC 4180 quoting.
    Csv,
    /// A JSON array of objects keyed by column name.
    Json,
}

/// Where and what to save.
///
/// Row and column bounds are zero-based and inclusive. A missing bound
/// extends to the first or last row (column).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveParams {
    pub file_path: PathBuf,
    #[serde(skip, default = "default_format")]
    pub format: SaveFormat,
    #[serde(default)]
    pub row_start_index: Option<u64>,
    #[serde(default)]
    pub row_end_index: Option<u64>,
    #[serde(default)]
    pub column_start_index: Option<usize>,
    #[serde(default)]
    pub column_end_index: Option<usize>,
    /// CSV only: write a header line with the column names.
    #[serde(default = "default_include_headers")]
    pub include_headers: bool,
}

fn default_format() -> SaveFormat {
    SaveFormat::Csv
}

fn default_include_headers() -> bool {
    true
}

impl SaveParams {
    /// Saves every row and column to `file_path`.
    pub fn new(file_path: impl Into<PathBuf>, format: SaveFormat) -> Self {
        Self {
            file_path: file_path.into(),
            format,
            row_start_index: None,
            row_end_index: None,
            column_start_index: None,
            column_end_index: None,
            include_headers: true,
        }
    }

    fn row_range(&self, row_count: u64) -> Result<Option<RangeInclusive<u64>>, ResultSetError> {
        if row_count == 0 {
            return Ok(None);
        }
        let start = self.row_start_index.unwrap_or(0);
        let end = self.row_end_index.unwrap_or(row_count - 1);
        if start > end || end >= row_count {
            return Err(ResultSetError::InvalidSaveRange(format!(
                "rows {}..={} of {}",
                start, end, row_count
            )));
        }
        Ok(Some(start..=end))
    }

    fn column_range(&self, column_count: usize) -> Result<RangeInclusive<usize>, ResultSetError> {
        let start = self.column_start_index.unwrap_or(0);
        let end = self
            .column_end_index
            .unwrap_or(column_count.saturating_sub(1));
        if column_count == 0 || start > end || end >= column_count {
            return Err(ResultSetError::InvalidSaveRange(format!(
                "columns {}..={} of {}",
                start, end, column_count
            )));
        }
        Ok(start..=end)
    }
}

/// Writes the selected rows of `result_set` to `params.file_path`.
pub(super) async fn write_results<S: RowStore>(
    result_set: &ResultSet<S>,
    params: &SaveParams,
) -> Result<PathBuf, ResultSetError> {
    let rows = params.row_range(result_set.row_count())?;
    let columns = params.column_range(result_set.columns().len())?;
    let names: Vec<&str> = result_set.columns()[columns.clone()]
        .iter()
        .map(|c| c.display_name())
        .collect();

    let file = File::create(&params.file_path).await?;
    let mut out = BufWriter::new(file);
    let mut writer = match params.format {
        SaveFormat::Csv => FormatWriter::Csv,
        SaveFormat::Json => FormatWriter::Json { first: true },
    };

    writer.begin(&mut out, &names, params.include_headers).await?;
    if let Some(rows) = rows {
        let mut next = *rows.start();
        while next <= *rows.end() {
            let count = (*rows.end() - next + 1).min(SAVE_CHUNK_ROWS);
            let chunk = result_set.store.read_rows(next, count).await?;
            let encoded = writer.encode_chunk(&names, &chunk, &columns)?;
            out.write_all(&encoded).await?;
            next += count;
        }
    }
    writer.finish(&mut out).await?;
    out.flush().await?;

    Ok(params.file_path.clone())
}

enum FormatWriter {
    Csv,
    Json { first: bool },
}

impl FormatWriter {
    async fn begin(
        &mut self,
        out: &mut BufWriter<File>,
        names: &[&str],
        include_headers: bool,
    ) -> Result<(), ResultSetError> {
        match self {
            FormatWriter::Csv if include_headers => {
                let mut records = csv_writer();
                records.write_record(names)?;
                out.write_all(&into_bytes(records)?).await?;
            }
            FormatWriter::Csv => {}
            FormatWriter::Json { .. } => out.write_all(b"[").await?,
        }
        Ok(())
    }

    /// Encodes one chunk of rows in the output format.
    fn encode_chunk(
        &mut self,
        names: &[&str],
        rows: &[Row],
        columns: &RangeInclusive<usize>,
    ) -> Result<Vec<u8>, ResultSetError> {
        match self {
            FormatWriter::Csv => {
                let mut records = csv_writer();
                for row in rows {
                    records.write_record(selected(row, columns)?.iter().map(Value::to_display))?;
                }
                into_bytes(records)
            }
            FormatWriter::Json { first } => {
                let mut buf = Vec::new();
                for row in rows {
                    let object: Map<String, serde_json::Value> = names
                        .iter()
                        .zip(selected(row, columns)?)
                        .map(|(name, value)| (name.to_string(), value.to_json()))
                        .collect();
                    if !*first {
                        buf.push(b',');
                    }
                    *first = false;
                    buf.extend_from_slice(b"\n  ");
                    serde_json::to_writer(&mut buf, &object)?;
                }
                Ok(buf)
            }
        }
    }

    async fn finish(&mut self, out: &mut BufWriter<File>) -> Result<(), ResultSetError> {
        match self {
            FormatWriter::Csv => {}
            FormatWriter::Json { first: true } => out.write_all(b"]\n").await?,
            FormatWriter::Json { first: false } => out.write_all(b"\n]\n").await?,
        }
        Ok(())
    }
}

fn selected<'a>(
    row: &'a Row,
    columns: &RangeInclusive<usize>,
) -> Result<&'a [Value], ResultSetError> {
    row.values
        .get(columns.clone())
        .ok_or_else(|| ResultSetError::InvalidSaveRange("row is narrower than columns".into()))
}

/// CSV writer producing RFC 4180 records into memory.
fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new())
}

fn into_bytes(records: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, ResultSetError> {
    records.into_inner().map_err(|e| e.into_error().into())
}
