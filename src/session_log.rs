use chrono::{DateTime, Local};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreResult, LoggerError};
use crate::types::PortId;
use crate::weights::WeightGrid;

/// Column header of a flushed session file
pub const HEADER: [&str; 4] = ["Logged Time", "weight", "port", "log"];

/// One accepted line together with the load grid at capture time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub weight_snapshot: WeightGrid,
    pub port: PortId,
    /// Unparsed line as received
    pub raw_line: String,
}

/// Append-only record of every accepted line. Flushing never clears it, so
/// each file is a superset of the previous one.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    records: Vec<LogRecord>,
    saved_files: Vec<String>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn saved_files(&self) -> &[String] {
        &self.saved_files
    }

    pub fn record_saved(&mut self, file_name: String) {
        self.saved_files.push(file_name);
    }
}

/// `YYYYMMDD_HHMMSS.txt`
pub fn session_file_name(now: DateTime<Local>) -> String {
    format!("{}.txt", now.format("%Y%m%d_%H%M%S"))
}

fn logged_time(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Write the header and one tab-separated row per record. The time column
/// is taken when the row is written, not when the line was captured.
pub fn write_records<W: Write>(mut out: W, records: &[LogRecord]) -> std::io::Result<()> {
    writeln!(out, "{}", HEADER.join("\t"))?;
    for record in records {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            logged_time(Local::now()),
            record.weight_snapshot,
            record.port,
            record.raw_line
        )?;
    }
    out.flush()
}

/// Write `records` to a new timestamped file in `dir` and return its path
pub fn flush_to_dir(dir: &Path, records: &[LogRecord]) -> CoreResult<PathBuf> {
    let path = dir.join(session_file_name(Local::now()));
    write_session_file(&path, records)?;
    info!("Saved {} log records to {}", records.len(), path.display());
    Ok(path)
}

pub fn write_session_file(path: &Path, records: &[LogRecord]) -> CoreResult<()> {
    let file = File::create(path).map_err(|e| {
        LoggerError::Persistence(format!("cannot create {}: {}", path.display(), e))
    })?;
    write_records(BufWriter::new(file), records).map_err(|e| {
        LoggerError::Persistence(format!("cannot write {}: {}", path.display(), e))
    })
}

/// One data row read back from a session file
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub logged_time: String,
    pub weight: String,
    pub port: PortId,
    pub line: String,
}

/// Read the rows of a flushed session file, skipping the header and any
/// row without four columns
pub fn read_rows<R: BufRead>(input: R) -> CoreResult<Vec<SessionRow>> {
    let mut rows = Vec::new();
    for (index, line) in input.lines().enumerate() {
        let line = line?;
        if index == 0 && line.starts_with(HEADER[0]) {
            continue;
        }
        let mut columns = line.splitn(4, '\t');
        if let (Some(time), Some(weight), Some(port), Some(log)) = (
            columns.next(),
            columns.next(),
            columns.next(),
            columns.next(),
        ) {
            rows.push(SessionRow {
                logged_time: time.to_string(),
                weight: weight.to_string(),
                port: PortId::new(port),
                line: log.to_string(),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn record(port: &str, line: &str) -> LogRecord {
        LogRecord {
            weight_snapshot: WeightGrid::default(),
            port: PortId::new(port),
            raw_line: line.to_string(),
        }
    }

    #[test]
    fn test_file_name_format() {
        let when = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(session_file_name(when), "20240309_070501.txt");
    }

    #[test]
    fn test_write_records_layout() {
        let records = vec![record("COM3", "1.0,0,0,0"), record("COM4", "2.5,1,2,3")];
        let mut out = Vec::new();
        write_records(&mut out, &records).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Logged Time\tweight\tport\tlog");

        let columns: Vec<&str> = lines[2].split('\t').collect();
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0].len(), "2024-01-01T00:00:00".len());
        assert_eq!(columns[1], "[0, 0, 0, 0, 0, 0, 0, 0, 0]");
        assert_eq!(columns[2], "COM4");
        assert_eq!(columns[3], "2.5,1,2,3");
    }

    #[test]
    fn test_rows_read_back() {
        let records = vec![record("COM5", "3.0,0,0,0")];
        let mut out = Vec::new();
        write_records(&mut out, &records).unwrap();

        let rows = read_rows(Cursor::new(out)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].port, PortId::new("COM5"));
        assert_eq!(rows[0].line, "3.0,0,0,0");
    }

    #[test]
    fn test_log_keeps_records_after_save() {
        let mut log = SessionLog::new();
        log.append(record("COM3", "1,2,3,4"));
        log.record_saved("a.txt".to_string());
        log.append(record("COM3", "5,6,7,8"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.saved_files(), &["a.txt".to_string()]);
    }

    #[test]
    fn test_flush_to_missing_dir_fails() {
        let dir = std::env::temp_dir().join("load_logger_rs_missing_dir/nested");
        let err = flush_to_dir(&dir, &[record("COM3", "1,2,3,4")]).unwrap_err();
        assert!(matches!(err, LoggerError::Persistence(_)));
    }
}
