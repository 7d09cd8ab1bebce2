//! Durable side-channel store for background-mode fixes. The OS-level
//! background task writes; the engine polls `read_all` + `clear` at
//! 1 Hz while the host is foregrounded.

use anyhow::{Context, Result};
use model::GpsSample;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub trait SampleStore: Send + Sync {
    fn write(&self, sample: &GpsSample) -> Result<()>;

    fn read_all(&self) -> Result<Vec<GpsSample>>;

    fn clear(&self) -> Result<()>;
}

/// In-memory store for tests and single-process hosts.
#[derive(Default)]
pub struct MemorySampleStore {
    samples: Mutex<Vec<GpsSample>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleStore for MemorySampleStore {
    fn write(&self, sample: &GpsSample) -> Result<()> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<GpsSample>> {
        Ok(self.samples.lock().clone())
    }

    fn clear(&self) -> Result<()> {
        self.samples.lock().clear();
        Ok(())
    }
}

/// Line-delimited JSON flat file, one sample per line. Appends are
/// atomic enough for the single-writer model; the lock only guards
/// against a poll racing a write within this process.
pub struct JsonlSampleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSampleStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), lock: Mutex::new(()) }
    }
}

impl SampleStore for JsonlSampleStore {
    fn write(&self, sample: &GpsSample) -> Result<()> {
        let _g = self.lock.lock();
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut w = BufWriter::new(f);
        let s = serde_json::to_string(sample)?;
        writeln!(w, "{}", s)?;
        w.flush()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<GpsSample>> {
        let _g = self.lock.lock();
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("open {}", self.path.display())),
        };
        let rdr = BufReader::new(f);
        let mut samples = vec![];
        for line in rdr.lines() {
            let s = line?;
            if s.is_empty() {
                continue;
            }
            let sample: GpsSample = serde_json::from_str(&s)?;
            samples.push(sample);
        }
        Ok(samples)
    }

    fn clear(&self) -> Result<()> {
        let _g = self.lock.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t_ms: f64) -> GpsSample {
        GpsSample {
            latitude: 48.85,
            longitude: 2.35,
            timestamp_ms: t_ms,
            speed_mps: Some(2.5),
            accuracy_m: Some(5.0),
        }
    }

    #[test]
    fn memory_store_round_trips_and_clears() {
        let store = MemorySampleStore::new();
        store.write(&sample(1.0)).unwrap();
        store.write(&sample(2.0)).unwrap();
        assert_eq!(store.read_all().unwrap().len(), 2);
        store.clear().unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn jsonl_store_round_trips_and_clears() {
        let dir = std::env::temp_dir().join(format!("runstore-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonlSampleStore::new(dir.join("samples.ndjson"));
        store.clear().unwrap();

        store.write(&sample(1.0)).unwrap();
        store.write(&sample(2.0)).unwrap();
        let read = store.read_all().unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], sample(1.0));

        store.clear().unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn jsonl_store_reads_empty_when_file_missing() {
        let store = JsonlSampleStore::new("/nonexistent-dir/never-written.ndjson");
        assert!(store.read_all().unwrap().is_empty());
    }
}
