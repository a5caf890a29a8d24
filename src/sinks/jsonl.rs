//! Parameter-trajectory sink writing one JSON record per line.
//!
//! Each line is a [`SampleRecord`], so a trajectory can be resumed from with
//! [`crate::checkpoint::load_samples`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{SampleSink, Sink};
use crate::checkpoint::SampleRecord;
use crate::error::SinkError;
use crate::params::ParamStore;

#[derive(Debug)]
pub struct JsonlSamples {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    count: usize,
}

impl JsonlSamples {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Sink for JsonlSamples {
    fn flush(&mut self) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        Ok(writer.flush()?)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        match self.writer.take() {
            Some(mut writer) => {
                writer.flush()?;
                writer.get_ref().sync_all()?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl SampleSink for JsonlSamples {
    fn add_sample(&mut self, step: u64, params: &ParamStore) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let record = SampleRecord {
            step,
            params: params.clone(),
        };
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{load_samples, read_samples};
    use crate::params::ParamTensor;

    #[test]
    fn test_written_samples_can_be_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        let mut sink = JsonlSamples::create(&path).unwrap();
        for step in 0..3u64 {
            let mut params = ParamStore::new();
            params.insert("w", ParamTensor::new(vec![2], vec![step as f32, -(step as f32)]));
            sink.add_sample(step * 5, &params).unwrap();
        }
        assert_eq!(sink.count(), 3);
        sink.close().unwrap();

        let records = read_samples(&path).unwrap();
        assert_eq!(
            records.iter().map(|r| r.step).collect::<Vec<_>>(),
            vec![0, 5, 10]
        );
        let last = load_samples(&path, -1).unwrap();
        assert_eq!(last.get("w").unwrap().values, vec![2.0, -2.0]);
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSamples::create(&dir.path().join("s.jsonl")).unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.add_sample(0, &ParamStore::new()),
            Err(SinkError::Closed)
        ));
    }
}
