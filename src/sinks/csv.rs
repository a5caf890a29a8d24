/*!
# CSV metrics sink

Scalar metrics are appended as long-format rows. The file starts with the header
`step,name,value`, followed by one row per recorded scalar:

```text
step,name,value
0,lr,0.0005
0,potential,1.2345
10,lr,0.00049
```
*/

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::Writer;

use super::{MetricsSink, Sink};
use crate::error::SinkError;

/// Metrics sink backed by a CSV file.
#[derive(Debug)]
pub struct CsvMetrics {
    path: PathBuf,
    writer: Option<Writer<File>>,
    rows: u64,
}

impl CsvMetrics {
    /// Creates (or truncates) `path` and writes the header row.
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut wtr = Writer::from_writer(file);
        wtr.write_record(["step", "name", "value"])?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(wtr),
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far, header excluded.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl Sink for CsvMetrics {
    fn flush(&mut self) -> Result<(), SinkError> {
        match self.writer.as_mut() {
            Some(wtr) => Ok(wtr.flush()?),
            None => Err(SinkError::Closed),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        match self.writer.take() {
            Some(mut wtr) => Ok(wtr.flush()?),
            None => Ok(()),
        }
    }
}

impl MetricsSink for CsvMetrics {
    fn add_scalar(&mut self, name: &str, step: u64, value: f64) -> Result<(), SinkError> {
        let wtr = self.writer.as_mut().ok_or(SinkError::Closed)?;
        wtr.write_record([step.to_string(), name.to_string(), value.to_string()])?;
        self.rows += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv::Reader;
    use std::fs;
    use tempfile::NamedTempFile;

    /// A closed sink without any record still has its header.
    #[test]
    fn test_header_only() {
        let file = NamedTempFile::new().expect("Could not create temp file");
        let mut sink = CsvMetrics::create(file.path()).unwrap();
        sink.close().unwrap();

        let contents = fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents.trim(), "step,name,value");
    }

    #[test]
    fn test_rows_in_write_order() -> Result<(), Box<dyn std::error::Error>> {
        let file = NamedTempFile::new()?;
        let mut sink = CsvMetrics::create(file.path())?;
        sink.add_scalar("lr", 0, 0.5)?;
        sink.add_scalar("potential", 0, -1.25)?;
        sink.add_scalar("lr", 10, 0.25)?;
        assert_eq!(sink.rows(), 3);
        sink.close()?;

        let mut rdr = Reader::from_path(file.path())?;
        let records: Vec<_> = rdr.records().collect::<Result<_, _>>()?;
        let expected = [
            ["0", "lr", "0.5"],
            ["0", "potential", "-1.25"],
            ["10", "lr", "0.25"],
        ];
        assert_eq!(records.len(), expected.len());
        for (record, exp) in records.iter().zip(expected.iter()) {
            let fields: Vec<&str> = record.iter().collect();
            assert_eq!(fields, exp.to_vec());
        }
        Ok(())
    }

    #[test]
    fn test_write_after_close_fails() {
        let file = NamedTempFile::new().expect("Could not create temp file");
        let mut sink = CsvMetrics::create(file.path()).unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.add_scalar("lr", 1, 0.1),
            Err(SinkError::Closed)
        ));
        // Closing twice is harmless.
        sink.close().unwrap();
    }

    #[test]
    fn test_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("metrics.csv");
        assert!(matches!(
            CsvMetrics::create(&path),
            Err(SinkError::Open { .. })
        ));
    }
}
