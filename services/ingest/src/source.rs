//! File sources: CSV streaming and spreadsheet reading.
//!
//! Runs on a blocking worker thread. Rows are mapped and normalized here
//! (CPU-bound hashing stays off the async runtime) and handed to the
//! orchestrator as owned `NormalizedChunk` messages over a bounded channel.

use crate::error::IngestError;
use crate::mapper::FieldMapper;
use crate::normalize::{normalize_chunk, NormalizedChunk};
use crate::record::{IngestKind, RawRow};
use calamine::{open_workbook_auto, Data, Reader};
use serde_json::Value;
use std::fs::File;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Delimited,
    Spreadsheet,
}

/// Detect format from the file extension.
pub fn detect_format(file_name: &str) -> Option<FileFormat> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "csv" | "txt" => Some(FileFormat::Delimited),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(FileFormat::Spreadsheet),
        _ => None,
    }
}

/// Strip a BOM, trim, and collapse runs of whitespace to one space.
pub fn clean_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Header for column `idx`; unnamed columns keep their data under a
/// positional name.
fn header_name(idx: usize, header: &str) -> String {
    let header = clean_header(header);
    if header.is_empty() {
        format!("column_{}", idx + 1)
    } else {
        header
    }
}

fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        // Spreadsheet exports on Windows are frequently cp1252.
        Err(_) => encoding_rs::WINDOWS_1252
            .decode_without_bom_handling(bytes)
            .0
            .into_owned(),
    }
}

fn is_blank(row: &RawRow) -> bool {
    row.values().all(|v| match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    })
}

/// What the worker read from one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub rows: u64,
    pub chunks: u64,
}

/// Buffers rows into chunks, threading the file-wide ordinal from chunk to
/// chunk.
struct ChunkAssembler {
    file: String,
    mapper: FieldMapper,
    kind: IngestKind,
    chunk_size: usize,
    next_ordinal: u64,
    buffer: Vec<RawRow>,
    tx: mpsc::Sender<NormalizedChunk>,
    report: SourceReport,
}

impl ChunkAssembler {
    fn new(file: &str, kind: IngestKind, chunk_size: usize, tx: mpsc::Sender<NormalizedChunk>) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            file: file.to_string(),
            mapper: FieldMapper::new(),
            kind,
            chunk_size,
            next_ordinal: 0,
            buffer: Vec::with_capacity(chunk_size),
            tx,
            report: SourceReport::default(),
        }
    }

    fn push(&mut self, row: RawRow) -> Result<(), IngestError> {
        if is_blank(&row) {
            return Ok(());
        }
        self.buffer.push(row);
        if self.buffer.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IngestError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        let chunk = normalize_chunk(rows, &mut self.mapper, self.kind, self.next_ordinal);
        self.next_ordinal = chunk.next_ordinal;
        self.report.rows += chunk.records.len() as u64;
        self.report.chunks += 1;
        debug!(
            "{}: chunk {} rows {}..{}",
            self.file, self.report.chunks, chunk.first_ordinal, chunk.next_ordinal
        );

        self.tx.blocking_send(chunk).map_err(|_| IngestError::Aborted {
            file: self.file.clone(),
        })
    }

    fn finish(mut self) -> Result<SourceReport, IngestError> {
        self.flush()?;
        Ok(self.report)
    }
}

/// Read `path` and send normalized chunks to `tx`. Blocking; call from
/// `spawn_blocking`.
pub fn produce_chunks(
    path: &Path,
    file_name: &str,
    format: FileFormat,
    kind: IngestKind,
    chunk_size: usize,
    tx: mpsc::Sender<NormalizedChunk>,
) -> Result<SourceReport, IngestError> {
    let mut assembler = ChunkAssembler::new(file_name, kind, chunk_size, tx);
    match format {
        FileFormat::Delimited => read_csv(path, file_name, &mut assembler)?,
        FileFormat::Spreadsheet => read_spreadsheet(path, file_name, &mut assembler)?,
    }
    let report = assembler.finish()?;
    info!("{}: parsed {} rows in {} chunks", file_name, report.rows, report.chunks);
    Ok(report)
}

fn read_csv(path: &Path, file_name: &str, assembler: &mut ChunkAssembler) -> Result<(), IngestError> {
    let file = File::open(path).map_err(|source| IngestError::Read {
        file: file_name.to_string(),
        source,
    })?;

    let csv_error = |e: csv::Error| IngestError::Csv {
        file: file_name.to_string(),
        message: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(csv_error)?
        .iter()
        .enumerate()
        .map(|(idx, h)| header_name(idx, &decode_field(h)))
        .collect();

    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record).map_err(csv_error)? {
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.clone(), Value::String(decode_field(value))))
            .collect();
        assembler.push(row)?;
    }
    Ok(())
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::String(String::new()),
        Data::String(s) => Value::String(s.trim().to_string()),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::Int(i) => Value::from(*i),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time() == chrono::NaiveTime::MIN => Value::String(ts.date().to_string()),
            Some(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
            None => Value::String(cell.to_string()),
        },
        other => Value::String(other.to_string()),
    }
}

fn read_spreadsheet(path: &Path, file_name: &str, assembler: &mut ChunkAssembler) -> Result<(), IngestError> {
    let spreadsheet_error = |message: String| IngestError::Spreadsheet {
        file: file_name.to_string(),
        message,
    };

    // calamine auto-detects xls, xlsx, xlsb, ods
    let mut workbook = open_workbook_auto(path).map_err(|e| spreadsheet_error(e.to_string()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names
        .first()
        .ok_or_else(|| spreadsheet_error("workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|e| spreadsheet_error(e.to_string()))?;

    let (row_count, col_count) = range.get_size();
    info!(
        "{}: reading sheet '{}' ({} rows x {} columns, first of {} sheets)",
        file_name,
        sheet_name,
        row_count,
        col_count,
        sheet_names.len()
    );

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(());
    };

    let headers: Vec<String> = header_row
        .iter()
        .enumerate()
        .map(|(idx, cell)| header_name(idx, &cell.to_string()))
        .collect();

    for data_row in rows {
        let row: RawRow = headers
            .iter()
            .zip(data_row.iter())
            .map(|(header, cell)| (header.clone(), cell_value(cell)))
            .collect();
        assembler.push(row)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn collect(path: &Path, name: &str, chunk_size: usize) -> (Result<SourceReport, IngestError>, Vec<NormalizedChunk>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let result = produce_chunks(path, name, FileFormat::Delimited, IngestKind::Pending, chunk_size, tx);
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        (result, chunks)
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("orders.CSV"), Some(FileFormat::Delimited));
        assert_eq!(detect_format("orders.xlsx"), Some(FileFormat::Spreadsheet));
        assert_eq!(detect_format("orders.xls"), Some(FileFormat::Spreadsheet));
        assert_eq!(detect_format("orders.pdf"), None);
        assert_eq!(detect_format("orders"), None);
    }

    #[test]
    fn test_clean_header() {
        assert_eq!(clean_header("\u{feff}PO  Number "), "PO Number");
        assert_eq!(clean_header("  Dispatch\tQty"), "Dispatch Qty");
    }

    #[test]
    fn test_csv_chunks_and_ordinals() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "PO Number,Product Code,Size,Pending Qty").unwrap();
        for i in 0..5 {
            writeln!(file, "PO{},PC1,S1,{}", i, i * 10).unwrap();
        }
        file.flush().unwrap();

        let (result, chunks) = collect(file.path(), "pending.csv", 2);
        let report = result.unwrap();
        assert_eq!(report, SourceReport { rows: 5, chunks: 3 });
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].first_ordinal, 0);
        assert_eq!(chunks[1].first_ordinal, 2);
        assert_eq!(chunks[2].first_ordinal, 4);
        assert_eq!(chunks[2].records[0].po_number, "PO4");
    }

    #[test]
    fn test_csv_skips_blank_rows_and_strips_bom() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "\u{feff}PO Number,  Pending   Qty \nPO1,5\n,\nPO2,7\n").unwrap();
        file.flush().unwrap();

        let (result, chunks) = collect(file.path(), "pending.csv", 100);
        assert_eq!(result.unwrap().rows, 2);
        let records = &chunks[0].records;
        assert_eq!(records[0].po_number, "PO1");
        assert_eq!(records[1].pending_quantity, 7.0);
        assert!(records[0].raw.contains_key("Pending Qty"));
    }

    #[test]
    fn test_csv_unnamed_columns_kept_in_raw() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "PO Number,,Qty,  \nPO1,rush,5,dock 3\n").unwrap();
        file.flush().unwrap();

        let (result, chunks) = collect(file.path(), "pending.csv", 100);
        assert_eq!(result.unwrap().rows, 1);
        let raw = &chunks[0].records[0].raw;
        assert_eq!(raw.len(), 4);
        assert_eq!(raw["column_2"], Value::String("rush".into()));
        assert_eq!(raw["column_4"], Value::String("dock 3".into()));
    }

    #[test]
    fn test_header_name() {
        assert_eq!(header_name(0, " PO  No "), "PO No");
        assert_eq!(header_name(2, "   "), "column_3");
    }

    #[test]
    fn test_csv_windows_1252_fallback() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Customer Name,Qty\nSoci\xe9t\xe9 Forge,3\n").unwrap();
        file.flush().unwrap();

        let (result, chunks) = collect(file.path(), "pending.csv", 100);
        assert!(result.is_ok());
        assert_eq!(chunks[0].records[0].customer_name, "Société Forge");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let (result, _) = collect(Path::new("/nonexistent/orders.csv"), "orders.csv", 10);
        assert!(matches!(result, Err(IngestError::Read { .. })));
    }

    #[test]
    fn test_closed_channel_aborts() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "PO\nPO1\nPO2").unwrap();
        file.flush().unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = produce_chunks(file.path(), "a.csv", FileFormat::Delimited, IngestKind::Pending, 1, tx);
        assert!(matches!(result, Err(IngestError::Aborted { .. })));
    }

    #[test]
    fn test_cell_value_conversion() {
        assert_eq!(cell_value(&Data::Empty), Value::String(String::new()));
        assert_eq!(cell_value(&Data::String(" x ".into())), Value::String("x".into()));
        assert_eq!(cell_value(&Data::Int(5)), Value::from(5));
        assert_eq!(cell_value(&Data::Float(2.5)), serde_json::json!(2.5));
        assert_eq!(cell_value(&Data::Bool(true)), Value::Bool(true));
    }
}
